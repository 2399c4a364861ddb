use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use super::EstimateCollection;

const ENTRY_FILE: &str = "estimates.json";
const MAX_SLUG_LEN: usize = 60;

/// One cached estimation run for a single listing address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Verbatim human-readable address the run was keyed by.
    pub address: String,
    pub saved_at: DateTime<Utc>,
    pub estimates: EstimateCollection,
}

/// Disk cache of rent estimates, one directory per listing address.
///
/// Presence of the entry file means "cache hit". Entries are overwritten
/// wholesale and never expire.
pub struct EstimateCache {
    root: PathBuf,
}

impl EstimateCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, address: &str) -> PathBuf {
        self.root.join(cache_key(address)).join(ENTRY_FILE)
    }

    pub fn load(&self, address: &str) -> Result<Option<EstimateCollection>> {
        let path = self.entry_path(address);
        if !path.exists() {
            debug!("No cached estimates at {:?}", path);
            return Ok(None);
        }

        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache entry {:?}", path))?;
        let entry: CacheEntry = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse cache entry {:?}", path))?;

        debug!(
            "Loaded cached estimates for {} (saved {})",
            entry.address, entry.saved_at
        );
        Ok(Some(entry.estimates))
    }

    pub fn store(&self, address: &str, estimates: &EstimateCollection) -> Result<()> {
        let path = self.entry_path(address);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {:?}", parent))?;
        }

        let entry = CacheEntry {
            address: address.to_string(),
            saved_at: Utc::now(),
            estimates: estimates.clone(),
        };
        let json = serde_json::to_string_pretty(&entry).context("Failed to serialize estimates")?;
        fs::write(&path, json).with_context(|| format!("Failed to write cache entry {:?}", path))?;

        info!("💾 Cached estimates for {} at {:?}", address, path);
        Ok(())
    }

    /// Delete the entry for an address. No-op when nothing is cached.
    pub fn remove(&self, address: &str) -> Result<()> {
        let dir = self.root.join(cache_key(address));
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to delete cache entry {:?}", dir))?;
            info!("🗑️  Cleared cached estimates for {}", address);
        }
        Ok(())
    }

    /// All cached entries, in directory order.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        if !self.root.exists() {
            return Ok(entries);
        }

        for dir in fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list cache directory {:?}", self.root))?
        {
            let path = dir?.path().join(ENTRY_FILE);
            if !path.exists() {
                continue;
            }
            let json = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read cache entry {:?}", path))?;
            let entry: CacheEntry = serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse cache entry {:?}", path))?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

/// Filesystem-safe key for a listing address.
///
/// The slug keeps the key readable; the hash of the verbatim string keeps
/// differently-formatted addresses for the same property distinct.
pub fn cache_key(address: &str) -> String {
    let decomposed: String = address.nfkd().filter(|c| !is_combining_mark(*c)).collect();

    let mut slug = String::new();
    let mut last_dash = true;
    for c in decomposed.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let slug = slug.trim_matches('-');

    format!("{}-{:016x}", slug, fnv1a(address.as_bytes()))
}

// 64-bit FNV-1a. Stable across runs, which DefaultHasher does not guarantee.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::Unit;
    use crate::rentometer::EstimateKind;

    fn temp_cache(name: &str) -> EstimateCache {
        let dir = std::env::temp_dir().join(format!("rentometer-cache-test-{}", name));
        let _ = fs::remove_dir_all(&dir);
        EstimateCache::new(dir)
    }

    #[test]
    fn test_cache_key_is_filesystem_safe() {
        let key = cache_key("276 Lakefield Pl, Moraga, CA 94556");
        assert!(key.starts_with("276-lakefield-pl-moraga-ca-94556-"));
        assert!(key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn test_cache_key_distinguishes_address_spellings() {
        let a = cache_key("276 Lakefield Pl, Moraga, CA 94556");
        let b = cache_key("276 LAKEFIELD PL / MORAGA / CA 94556");
        assert_ne!(a, b);
        assert_eq!(a, cache_key("276 Lakefield Pl, Moraga, CA 94556"));
    }

    #[test]
    fn test_store_load_round_trip() {
        let cache = temp_cache("round-trip");
        let address = "689 Auburn Street, Manchester, NH 03103";

        assert!(cache.load(address).unwrap().is_none());

        let mut estimates = EstimateCollection::new();
        estimates.record(
            EstimateKind::Average,
            Unit {
                beds: 3.0,
                baths: 1.0,
            },
            1494.0,
        );
        cache.store(address, &estimates).unwrap();

        let loaded = cache.load(address).unwrap().expect("entry should exist");
        assert_eq!(loaded, estimates);

        let entries = cache.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].address, address);

        cache.remove(address).unwrap();
        assert!(cache.load(address).unwrap().is_none());
        // removing twice is fine
        cache.remove(address).unwrap();

        let _ = fs::remove_dir_all(cache.root());
    }
}
