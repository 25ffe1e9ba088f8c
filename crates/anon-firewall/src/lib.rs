//! Killswitch engine.
//!
//! Both backends compile the same logical [`KillswitchRules`] into native
//! rules with identical semantics: outbound fails closed, Tor-owned traffic
//! and the namespace subnet pass, DNS and TCP are redirected into the
//! namespace, DoH resolvers are rejected fast, WebRTC is dropped.
//!
//! The backend is chosen once by the capability probe and never switched at
//! runtime. `engage` always starts from `disengage`, so repeated calls
//! converge; `disengage` succeeds even when nothing is installed. On a
//! partial engage failure the engine leaves the field to the orchestrator's
//! emergency restore rather than guessing at rollback.

mod iptables;
mod nft;

use anon_common::{Fault, FirewallBackendKind, KillswitchRules};
use anyhow::Result;
use async_trait::async_trait;

pub use iptables::{IptablesBackend, CHAIN_OUT as IPTABLES_OUTPUT_CHAIN};
pub use nft::NftBackend;

#[async_trait]
pub trait Killswitch: Send + Sync {
    /// Install the full fail-closed ruleset.
    async fn engage(&self, rules: &KillswitchRules) -> Result<()>;
    /// Install only the DNS redirection into the namespace Tor, leaving the
    /// filter policy alone. Partial mode runs on this.
    async fn engage_dns_only(&self, rules: &KillswitchRules) -> Result<()>;
    async fn disengage(&self) -> Result<()>;
    async fn is_active(&self) -> bool;
}

/// Attach the rule compiler to the probed backend.
pub fn backend_for(kind: FirewallBackendKind) -> Result<Box<dyn Killswitch>> {
    match kind {
        FirewallBackendKind::Nftables => Ok(Box::new(NftBackend)),
        FirewallBackendKind::Iptables | FirewallBackendKind::IptablesNft => {
            Ok(Box::new(IptablesBackend))
        }
        FirewallBackendKind::Unknown => {
            Err(Fault::UnsupportedHost("no usable firewall backend detected".into()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_is_an_unsupported_host() {
        let err = match backend_for(FirewallBackendKind::Unknown) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err.downcast_ref::<Fault>(), Some(Fault::UnsupportedHost(_))));
    }

    #[test]
    fn legacy_and_translation_layer_share_the_rule_language() {
        assert!(backend_for(FirewallBackendKind::Iptables).is_ok());
        assert!(backend_for(FirewallBackendKind::IptablesNft).is_ok());
        assert!(backend_for(FirewallBackendKind::Nftables).is_ok());
    }
}
