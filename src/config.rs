//! Database configuration (`spec.md` §6 "Configuration options (core only)").
//!
//! Generalizes the teacher's `OpenOptions` (which only carried `size` and
//! `file_type`) to the full option set named by the spec, keeping the same
//! chained-setter builder shape.

use std::path::PathBuf;

use crate::txn::{DurabilityMode, LockMode};

/// Minimum allowed page size, in bytes.
pub const MIN_PAGE_SIZE: usize = 512;

/// Default page size, in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub(crate) page_size: usize,
    pub(crate) min_cache_size: usize,
    pub(crate) max_cache_size: usize,
    pub(crate) durability_mode: DurabilityMode,
    pub(crate) lock_mode: LockMode,
    pub(crate) lock_timeout_nanos: i64,
    pub(crate) checkpoint_rate_nanos: u64,
    pub(crate) checkpoint_size_threshold: u64,
    pub(crate) direct_page_access: bool,
    pub(crate) base_file: Option<PathBuf>,
    pub(crate) file_type: [u8; 8],
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            min_cache_size: 1000,
            max_cache_size: 10_000,
            durability_mode: DurabilityMode::Sync,
            lock_mode: LockMode::UpgradableRead,
            lock_timeout_nanos: 1_000_000_000,
            checkpoint_rate_nanos: 1_000_000_000,
            checkpoint_size_threshold: 1 << 20,
            direct_page_access: false,
            base_file: None,
            file_type: *b"tupl-db\0",
        }
    }
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size. Must be a power of two, >= 512 bytes.
    pub fn page_size(&mut self, size: usize) -> &mut Self {
        self.page_size = size;
        self
    }

    pub fn min_cache_size(&mut self, n: usize) -> &mut Self {
        self.min_cache_size = n;
        self
    }

    pub fn max_cache_size(&mut self, n: usize) -> &mut Self {
        self.max_cache_size = n;
        self
    }

    pub fn durability_mode(&mut self, mode: DurabilityMode) -> &mut Self {
        self.durability_mode = mode;
        self
    }

    pub fn lock_mode(&mut self, mode: LockMode) -> &mut Self {
        self.lock_mode = mode;
        self
    }

    /// Default lock timeout for new transactions. Negative means infinite,
    /// zero means try-once.
    pub fn lock_timeout_nanos(&mut self, nanos: i64) -> &mut Self {
        self.lock_timeout_nanos = nanos;
        self
    }

    pub fn checkpoint_rate_nanos(&mut self, nanos: u64) -> &mut Self {
        self.checkpoint_rate_nanos = nanos;
        self
    }

    pub fn checkpoint_size_threshold(&mut self, bytes: u64) -> &mut Self {
        self.checkpoint_size_threshold = bytes;
        self
    }

    pub fn direct_page_access(&mut self, direct: bool) -> &mut Self {
        self.direct_page_access = direct;
        self
    }

    pub fn base_file<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.base_file = Some(path.into());
        self
    }

    pub fn file_type(&mut self, file_type: &[u8; 8]) -> &mut Self {
        self.file_type = *file_type;
        self
    }

    pub fn validate(&self) -> Result<(), crate::error::DbError> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(crate::error::DbError::IllegalPageSize(self.page_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(DatabaseConfig::default().validate().is_ok());
    }

    #[test]
    fn odd_page_size_rejected() {
        let mut cfg = DatabaseConfig::default();
        cfg.page_size(4097);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_chains() {
        let mut cfg = DatabaseConfig::default();
        cfg.page_size(8192).max_cache_size(500).direct_page_access(true);
        assert_eq!(cfg.page_size, 8192);
        assert_eq!(cfg.max_cache_size, 500);
        assert!(cfg.direct_page_access);
    }
}
