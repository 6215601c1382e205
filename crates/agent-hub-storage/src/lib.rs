pub mod atomic_write;
pub mod config;
pub mod event_log;
pub mod storage_paths;

pub use atomic_write::{archive_file, atomic_write, atomic_write_json, dry_run_enabled, safe_read, safe_read_json};
pub use config::ConfigStore;
pub use event_log::EventLog;
pub use storage_paths::{is_within_root, sanitize_task_id, WorkspaceLayout};
