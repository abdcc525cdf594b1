use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskup::clock::{Clock, SystemClock};
use taskup::domain::{status_badge, NewTask, TaskId, TaskPatch, TaskView};
use taskup::observable::LoadState;
use taskup::persistence::{
    blobs_dir, config_file, ensure_data_dir, init_local_data_dir, load_config, save_config,
    session_file, tasks_file, Config,
};
use taskup::session::{LocalAuth, User};
use taskup::store::{JsonFileStore, LocalBlobStore};
use taskup::{EngineOptions, SessionRuntime, TaskEngine};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "taskup")]
#[command(about = "Time-boxed tasks with deadlines that expire on their own", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a local .taskup directory in the current directory
    Init,
    /// Sign in as a user
    Login {
        user: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Sign out
    Logout,
    /// Add a task
    Add {
        title: String,
        /// Start time (RFC 3339). Defaults to now.
        #[arg(long)]
        start: Option<String>,
        /// Time limit in minutes. Defaults to the configured limit.
        #[arg(short, long, conflicts_with = "no_deadline")]
        limit: Option<u32>,
        /// Create without a deadline
        #[arg(long)]
        no_deadline: bool,
        /// Image to attach
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// List tasks, newest first
    List,
    /// Complete or reopen a task
    Toggle { id: String },
    /// Change or clear a task's deadline
    Deadline {
        id: String,
        /// New limit in minutes, counted from now
        #[arg(short, long, conflicts_with = "clear", required_unless_present = "clear")]
        minutes: Option<u32>,
        #[arg(long)]
        clear: bool,
    },
    /// Attach an image to a task
    Image { id: String, path: PathBuf },
    /// Delete a task
    Rm { id: String },
    /// Follow the task list live, expiring deadlines and counting time
    Watch {
        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
}

/// Wiring shared by every command
struct Workspace {
    config: Config,
    auth: LocalAuth,
    engine: TaskEngine,
    store: Arc<JsonFileStore>,
}

fn init_tracing(config: &Config) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();
}

fn open() -> Result<Workspace> {
    let data_dir = ensure_data_dir()?;
    let config = load_config(config_file(&data_dir))?;
    init_tracing(&config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(
        JsonFileStore::open(tasks_file(&data_dir), Arc::clone(&clock))
            .context("Failed to open task file")?,
    );
    let engine = TaskEngine::new(store.clone(), clock)
        .with_blobs(Arc::new(LocalBlobStore::new(blobs_dir(&data_dir))))
        .with_options(EngineOptions::from(&config));

    Ok(Workspace {
        config,
        auth: LocalAuth::new(session_file(&data_dir)),
        engine,
        store,
    })
}

/// Start a session for the signed-in user and wait for the first snapshot
async fn session(ctx: &Workspace) -> Result<SessionRuntime> {
    let Some(user) = ctx.auth.current_user()? else {
        bail!("Not signed in. Run 'taskup login <user>' first.");
    };
    let session = ctx.engine.start_session(user).await;
    if !session.loaded().await {
        let state = session.state();
        session.shutdown().await;
        bail!("{}", describe(&state));
    }
    Ok(session)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| anyhow::anyhow!("Invalid time '{}'. Use RFC 3339: {}", value, e))
}

fn describe(state: &LoadState) -> String {
    match state {
        LoadState::Loading => "Loading tasks...".to_string(),
        LoadState::Ready(snapshot) => format!("{} tasks", snapshot.len()),
        LoadState::Failed(reason) => format!("Failed to load tasks: {}", reason),
    }
}

fn render(view: &TaskView) -> String {
    let mut out = format!(
        "{} active, {} completed\n",
        view.counts.active, view.counts.completed
    );
    if view.is_empty() {
        out.push_str("No tasks yet.\n");
    }
    for row in &view.rows {
        let remaining = row.remaining_formatted().unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{}  {:<10} {:>10}  {}  {}\n",
            row.task.id,
            status_badge(&row.task),
            remaining,
            row.elapsed_formatted(),
            row.task.title
        ));
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let data_dir = init_local_data_dir()?;
            save_config(config_file(&data_dir), &Config::default())?;
            println!("Initialized taskup directory: {}", data_dir.display());
            println!();
            println!("taskup will now use this local directory for task storage.");
            println!("Run 'taskup login <user>' to get started.");
            Ok(())
        }
        Commands::Login { user, email } => {
            let ctx = open()?;
            let mut user = User::new(user);
            if let Some(email) = email {
                user = user.with_email(email);
            }
            ctx.auth.sign_in(&user)?;
            println!("Signed in as {}", user.uid);
            Ok(())
        }
        Commands::Logout => {
            let ctx = open()?;
            ctx.auth.sign_out()?;
            println!("Signed out");
            Ok(())
        }
        Commands::Add {
            title,
            start,
            limit,
            no_deadline,
            image,
        } => {
            let ctx = open()?;
            let start = match start {
                Some(value) => parse_time(&value)?,
                None => Utc::now(),
            };
            let input = if no_deadline {
                NewTask::new(title, start)
            } else {
                NewTask::with_time_limit(title, start, ctx.config.time_limit(limit))
            };
            let session = session(&ctx).await?;

            let result = async {
                let id = session.create(&input).await?;
                if let Some(path) = image {
                    session.attach_image(&id, &path).await?;
                }
                Ok::<_, taskup::TaskError>(id)
            }
            .await;
            session.shutdown().await;

            let id = result?;
            match input.end_date {
                Some(end) => println!("Added {} (due {})", id, end.to_rfc3339()),
                None => println!("Added {}", id),
            }
            Ok(())
        }
        Commands::List => {
            let ctx = open()?;
            let session = session(&ctx).await?;
            let view = session.view();
            session.shutdown().await;
            if let Some(view) = view {
                print!("{}", render(&view));
            }
            Ok(())
        }
        Commands::Toggle { id } => {
            let ctx = open()?;
            let session = session(&ctx).await?;
            let result = session.toggle(&TaskId::new(id.clone())).await;
            session.shutdown().await;
            if result? {
                println!("Completed {}", id);
            } else {
                println!("Reopened {}", id);
            }
            Ok(())
        }
        Commands::Deadline { id, minutes, clear } => {
            let ctx = open()?;
            let session = session(&ctx).await?;
            let patch = match minutes {
                Some(minutes) if !clear => {
                    let limit = ctx.config.time_limit(Some(minutes));
                    TaskPatch::default().deadline(limit.deadline_from(Utc::now()))
                }
                _ => TaskPatch::default().clear_deadline(),
            };
            let result = session.update(&TaskId::new(id.clone()), patch).await;
            session.shutdown().await;
            result?;
            if clear {
                println!("Cleared deadline of {}", id);
            } else {
                println!("Updated deadline of {}", id);
            }
            Ok(())
        }
        Commands::Image { id, path } => {
            let ctx = open()?;
            let session = session(&ctx).await?;
            let result = session.attach_image(&TaskId::new(id), &path).await;
            session.shutdown().await;
            println!("Attached {}", result?);
            Ok(())
        }
        Commands::Rm { id } => {
            let ctx = open()?;
            let session = session(&ctx).await?;
            let result = session.remove(&TaskId::new(id.clone())).await;
            session.shutdown().await;
            result?;
            println!("Deleted {}", id);
            Ok(())
        }
        Commands::Watch { seconds } => {
            let ctx = open()?;
            watch(ctx, seconds.map(Duration::from_secs)).await
        }
    }
}

/// Run the engine against the session file and the task file until Ctrl-C
async fn watch(ctx: Workspace, limit: Option<Duration>) -> Result<()> {
    let Workspace {
        config,
        auth,
        engine,
        store,
    } = ctx;
    let cancel = engine.cancel_token();
    let signal = auth.signal()?;
    let poll = config.monitor_period();

    let background = CancellationToken::new();
    tokio::spawn(auth.watch(signal.clone(), poll, background.clone()));
    tokio::spawn(store.watch(poll, background.clone()));

    let stopper = cancel.clone();
    tokio::spawn(async move {
        match limit {
            Some(limit) => {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        stopper.cancel();
    });

    let mut last = String::new();
    engine
        .run(signal.subscribe(), move |session| {
            let rendered = match session {
                None => "Signed out. Run 'taskup login <user>' in another terminal.\n".to_string(),
                Some(session) => match session.view() {
                    Some(view) => render(&view),
                    None => describe(&session.state()),
                },
            };
            if rendered != last {
                print!("{}", rendered);
                last = rendered;
            }
        })
        .await;

    background.cancel();
    Ok(())
}
