pub mod admission;
pub mod config;
pub mod error;
pub mod inventory;
pub mod job_pool;
pub mod materialize;
pub mod notify;
pub mod prompt;
pub mod reconcile;
pub mod registry;
pub mod stream;
pub mod supervisor;
pub mod terminate;
pub mod util;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use config::PoolConfig;
pub use error::JobError;
pub use inventory::{AdbInventory, DeviceFilter, DeviceInventory, StaticInventory};
pub use job_pool::JobPool;
pub use materialize::{ScriptMaterializer, ShellMaterializer};
pub use reconcile::ReconcileReport;
pub use stream::{Follow, OutputFollower, StreamItem};
pub use workspace::JobEntry;
