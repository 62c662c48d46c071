pub mod action;
pub mod bot;
pub mod config;
pub mod error;
pub mod hub;
pub mod project;
pub mod registry;
pub mod state;
pub mod storage;
pub mod sync;

pub use action::{OrderedAction, ProposedAction, TaskKey};
pub use config::DaemonConfig;
pub use error::{SyncError, SyncResult};
pub use state::TaskState;
