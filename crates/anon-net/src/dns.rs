//! Resolver lock: every lookup goes to loopback (and from there through the
//! Tor DNAT), and the file is made immutable so nothing rewrites it behind
//! our back. The symlink-aware inverse lives with the snapshot store.

use anon_common::cmd;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const LOCKED_CONTENT: &str = "nameserver 127.0.0.1\n";

/// Replace the resolver config with a loopback-only file and pin it.
pub async fn lock(resolv_path: &Path) -> Result<()> {
    let path_str = resolv_path.to_string_lossy();
    let _ = cmd::run_unchecked("chattr", &["-i", &path_str]).await;

    // An existing symlink must go, or the write lands in its target.
    if fs::symlink_metadata(resolv_path).is_ok() {
        fs::remove_file(resolv_path)
            .with_context(|| format!("failed to remove {}", resolv_path.display()))?;
    }
    fs::write(resolv_path, LOCKED_CONTENT)
        .with_context(|| format!("failed to write {}", resolv_path.display()))?;

    match cmd::run_unchecked("chattr", &["+i", &path_str]).await {
        Ok(out) if out.success() => info!("resolver locked and pinned immutable"),
        _ => warn!("resolver locked but could not be pinned immutable"),
    }
    Ok(())
}

/// Lift the immutable pin without touching the content; full content restore
/// is the snapshot store's job.
pub async fn clear_immutable(resolv_path: &Path) {
    let path_str = resolv_path.to_string_lossy();
    let _ = cmd::run_unchecked("chattr", &["-i", &path_str]).await;
}

/// First `nameserver` entry of a resolv.conf body.
pub fn first_nameserver(content: &str) -> Option<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("nameserver"))
        .map(str::trim)
}

/// Whether resolution currently points at loopback.
pub fn points_at_loopback(resolv_path: &Path) -> bool {
    fs::read_to_string(resolv_path)
        .ok()
        .and_then(|content| first_nameserver(&content).map(|ns| ns.starts_with("127.")))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_replaces_a_symlink_with_a_loopback_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("stub-resolv.conf");
        fs::write(&target, "nameserver 127.0.0.53\n").unwrap();
        let link = dir.path().join("resolv.conf");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        lock(&link).await.unwrap();

        let meta = fs::symlink_metadata(&link).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(fs::read_to_string(&link).unwrap(), "nameserver 127.0.0.1\n");
        // The original target is untouched.
        assert_eq!(fs::read_to_string(&target).unwrap(), "nameserver 127.0.0.53\n");
    }

    #[test]
    fn first_nameserver_skips_comments_and_options() {
        let content = "# generated\nsearch lan\noptions edns0\nnameserver 127.0.0.53\nnameserver 9.9.9.9\n";
        assert_eq!(first_nameserver(content), Some("127.0.0.53"));
        assert_eq!(first_nameserver("search lan\n"), None);
    }

    #[test]
    fn loopback_detection_matches_the_whole_127_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");

        fs::write(&path, "nameserver 127.0.0.1\n").unwrap();
        assert!(points_at_loopback(&path));

        fs::write(&path, "nameserver 127.0.0.53\n").unwrap();
        assert!(points_at_loopback(&path));

        fs::write(&path, "nameserver 1.1.1.1\nnameserver 127.0.0.1\n").unwrap();
        assert!(!points_at_loopback(&path));

        assert!(!points_at_loopback(&dir.path().join("missing")));
    }
}
