pub mod config;
pub mod files;

pub use config::{load_config, save_config, Config};
pub use files::{
    atomic_write, blobs_dir, config_file, ensure_data_dir, ensure_dir, get_data_dir,
    init_local_data_dir, read_file, remove_file, session_file, tasks_file,
};
