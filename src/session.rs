use crate::domain::OwnerId;
use crate::error::{Result, TaskError};
use crate::persistence::{atomic_write, read_file, remove_file};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: OwnerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl User {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: OwnerId::new(uid),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Identity a store adapter works on behalf of
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    user: Option<User>,
}

impl SessionContext {
    /// No one signed in
    pub fn anonymous() -> Self {
        Self { user: None }
    }

    pub fn signed_in(user: User) -> Self {
        Self { user: Some(user) }
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        self.user.as_ref().map(|u| &u.uid)
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Owner for an operation that needs one
    pub fn require_owner(&self) -> Result<&OwnerId> {
        self.owner()
            .ok_or_else(|| TaskError::Auth("no user is signed in".to_string()))
    }
}

impl From<Option<User>> for SessionContext {
    fn from(user: Option<User>) -> Self {
        Self { user }
    }
}

/// Auth state feed. `None` means signed out.
#[derive(Debug, Clone)]
pub struct AuthSignal {
    tx: watch::Sender<Option<User>>,
}

impl Default for AuthSignal {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AuthSignal {
    pub fn new(initial: Option<User>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a sign-in. Re-publishing the current user is a no-op.
    pub fn sign_in(&self, user: User) {
        self.set(Some(user));
    }

    pub fn sign_out(&self) {
        self.set(None);
    }

    /// Publish a state, notifying listeners only if it changed
    pub fn set(&self, user: Option<User>) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == user {
                false
            } else {
                *current = user;
                true
            }
        });
        if changed {
            debug!(signed_in = self.tx.borrow().is_some(), "auth state changed");
        }
    }

    pub fn current(&self) -> Option<User> {
        self.tx.borrow().clone()
    }

    /// Listen for changes; the receiver starts at the current state
    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.tx.subscribe()
    }
}

/// File-backed auth provider used by the CLI
#[derive(Debug, Clone)]
pub struct LocalAuth {
    path: PathBuf,
}

impl LocalAuth {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Currently signed-in user, if any
    pub fn current_user(&self) -> Result<Option<User>> {
        let content = read_file(&self.path).map_err(|e| TaskError::Auth(format!("{:#}", e)))?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn sign_in(&self, user: &User) -> Result<()> {
        let json = serde_json::to_string_pretty(user)?;
        atomic_write(&self.path, &json).map_err(|e| TaskError::Auth(format!("{:#}", e)))?;
        info!(user = %user.uid, "signed in");
        Ok(())
    }

    pub fn sign_out(&self) -> Result<()> {
        remove_file(&self.path).map_err(|e| TaskError::Auth(format!("{:#}", e)))?;
        info!("signed out");
        Ok(())
    }

    /// Signal seeded with the current session file
    pub fn signal(&self) -> Result<AuthSignal> {
        Ok(AuthSignal::new(self.current_user()?))
    }

    /// Poll the session file and publish changes until cancelled
    pub async fn watch(self, signal: AuthSignal, poll_interval: Duration, cancel: CancellationToken) {
        info!(path = %self.path.display(), "session watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("session watcher stopped");
                    break;
                }
                _ = tokio::time::sleep(poll_interval) => {
                    match self.current_user() {
                        Ok(user) => signal.set(user),
                        Err(e) => warn!(error = %e, "could not read session file"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_session_context_owner() {
        let anon = SessionContext::anonymous();
        assert!(!anon.is_authenticated());
        assert!(matches!(anon.require_owner(), Err(TaskError::Auth(_))));

        let ctx = SessionContext::signed_in(User::new("alice"));
        assert_eq!(ctx.require_owner().unwrap().as_str(), "alice");
        assert_eq!(SessionContext::from(None), SessionContext::anonymous());
    }

    #[test]
    fn test_auth_signal_only_notifies_on_change() {
        let signal = AuthSignal::default();
        let mut rx = signal.subscribe();
        assert!(!rx.has_changed().unwrap());

        signal.sign_in(User::new("alice"));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        signal.sign_in(User::new("alice"));
        assert!(!rx.has_changed().unwrap());

        signal.sign_out();
        assert!(rx.has_changed().unwrap());
        assert_eq!(signal.current(), None);
    }

    #[test]
    fn test_local_auth_round_trip() {
        let temp_dir = tempdir().unwrap();
        let auth = LocalAuth::new(temp_dir.path().join("session.json"));
        assert_eq!(auth.current_user().unwrap(), None);

        let user = User::new("bob").with_email("bob@example.com");
        auth.sign_in(&user).unwrap();
        assert_eq!(auth.current_user().unwrap(), Some(user.clone()));
        assert_eq!(auth.signal().unwrap().current(), Some(user));

        auth.sign_out().unwrap();
        assert_eq!(auth.current_user().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_auth_watch_publishes_sign_out() {
        let temp_dir = tempdir().unwrap();
        let auth = LocalAuth::new(temp_dir.path().join("session.json"));
        auth.sign_in(&User::new("carol")).unwrap();

        let signal = auth.signal().unwrap();
        let mut rx = signal.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(auth.clone().watch(
            signal.clone(),
            Duration::from_millis(100),
            cancel.clone(),
        ));

        auth.sign_out().unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), None);

        cancel.cancel();
        handle.await.unwrap();
    }
}
