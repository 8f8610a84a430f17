pub mod application;
pub mod command;
pub mod deployment;
pub mod diff;
pub mod environment;
pub mod event;
pub mod manifest;
pub mod sync_state;

pub use application::{Application, ApplicationKind, GitPath};
pub use command::{Command, CommandType};
pub use deployment::{
    Deployment, DeploymentStatus, DeploymentTrigger, Stage, StageName, StageStatus,
};
pub use environment::Environment;
pub use event::Event;
pub use manifest::{Manifest, ResourceKey};
pub use sync_state::{SyncState, SyncStatus};
