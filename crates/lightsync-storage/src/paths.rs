//! Cache location resolution

use directories::ProjectDirs;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Environment override for the cache root
pub const CACHE_DIR_ENV: &str = "LIGHTSYNC_CACHE_DIR";

/// Root directory for block caches and cursor databases.
///
/// `LIGHTSYNC_CACHE_DIR` wins when set and non-empty; otherwise the
/// platform's local data directory is used.
pub fn cache_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    ProjectDirs::from("org", "Lightsync", "Lightsync")
        .map(|dirs| dirs.data_local_dir().join("cache"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Per-wallet cache directory under `base`.
///
/// The alias is hashed so arbitrary identifiers (endpoints, labels) map to
/// safe directory names.
pub fn wallet_cache_dir(base: &std::path::Path, alias: &str) -> PathBuf {
    let hash = Sha256::digest(alias.as_bytes());
    base.join(format!("wallet_{}", hex::encode(&hash[..8])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_cache_dir_is_stable() {
        let base = PathBuf::from("/tmp/cache");
        let a = wallet_cache_dir(&base, "main");
        assert_eq!(a, wallet_cache_dir(&base, "main"));
        assert_ne!(a, wallet_cache_dir(&base, "other"));
        assert!(a.starts_with(&base));
    }
}
