//! Everything anonmanager persists across invocations: the validated runtime
//! state file, the single-instance lock, and the atomic snapshot store that
//! makes the whole system reversible.

pub mod lock;
pub mod snapshot;
pub mod state;

pub use lock::ProcessLock;
pub use snapshot::{ResolvCapture, SaveRequest, SnapshotStore};
pub use state::{RuntimeState, StateStore};
