//! Tor lives inside the namespace, run as an unprivileged user by a
//! supervisor rather than the service manager — the service manager cannot
//! place a unit into a foreign network namespace, which is the whole point.

pub mod control;
pub mod supervisor;
pub mod torrc;

pub use control::ControlClient;
pub use supervisor::TorSupervisor;
