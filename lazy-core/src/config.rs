use std::path::PathBuf;

use crate::utils::{errors::PersistError, thread::default_parallelism};

/// Rows per constraint shard unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Where and how a session's shards are written and read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    pub dir: PathBuf,
    /// Prefix shared by every file of the session.
    pub session: String,
    pub batch_size: usize,
    /// Threads of the loader pool.
    pub parallelism: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            session: "session".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: default_parallelism(),
        }
    }
}

impl StorageConfig {
    pub fn new(dir: impl Into<PathBuf>, session: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            session: session.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn validate(&self) -> Result<(), PersistError> {
        if self.batch_size == 0 {
            return Err(PersistError::InvalidBatchSize);
        }
        if self.parallelism == 0 {
            return Err(PersistError::InvalidParallelism);
        }
        if self.session.is_empty() || self.session.contains(['/', '\\']) {
            return Err(PersistError::InvalidSession(self.session.clone()));
        }
        Ok(())
    }

    /// `<dir>/<session>.<suffix>`
    pub fn path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.session, suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StorageConfig::default();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.parallelism >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_settings() {
        let config = StorageConfig::new("/tmp", "s");
        assert!(matches!(
            config.clone().with_batch_size(0).validate(),
            Err(PersistError::InvalidBatchSize)
        ));
        assert!(matches!(
            config.clone().with_parallelism(0).validate(),
            Err(PersistError::InvalidParallelism)
        ));
        assert!(StorageConfig::new("/tmp", "a/b").validate().is_err());
        assert_eq!(config.path("ct.save"), PathBuf::from("/tmp/s.ct.save"));
    }
}
