//! Shared vocabulary of the anonmanager workspace.
//!
//! Everything here is used by at least two member crates: the typed fault
//! taxonomy, the host/namespace topology constants, the logical killswitch
//! rule specification, and the bounded external-command runner.

pub mod cmd;
pub mod fault;
pub mod topology;
pub mod types;

pub use fault::Fault;
pub use topology::{KillswitchRules, TorEndpoint};
pub use types::{AlertCategory, DistroFamily, FirewallBackendKind, Mode, WatchdogAlert};
