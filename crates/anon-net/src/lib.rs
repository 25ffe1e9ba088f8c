//! Host network mutations: the isolated namespace and its veth fabric,
//! the sysctl hardening matrix, the resolver lock, and MAC replacement.
//! Everything here goes through the bounded command runner and is paired
//! with an inverse used on teardown.

pub mod dns;
pub mod mac;
pub mod namespace;
pub mod sysctl;

pub use namespace::NamespaceManager;
