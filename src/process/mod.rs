//! Game process lifecycle.
//!
//! - [`ProcessSupervisor`] spawns instances and tracks each process through
//!   `Starting → Running → {Finished, Crashed, Killed}`.
//! - [`ProcessReaper`] kills process trees after checking that every PID
//!   still belongs to the program that was launched.
//! - [`platform`] hides the OS process table behind [`ProcessInspector`].
//! - [`InstanceResolver`] maps an instance id to its launch command.

pub mod instance;
pub mod platform;
pub mod reaper;
pub mod supervisor;
pub mod types;

pub use instance::{InstanceResolver, PrismInstanceResolver};
pub use platform::{ProcessInspector, create_inspector};
pub use reaper::{ProcessReaper, TreeKill};
pub use supervisor::ProcessSupervisor;
pub use types::{
    IdentityVerdict, LaunchSpec, LaunchedProcess, ProcessId, ProcessIdentity, ProcessStatus,
};
