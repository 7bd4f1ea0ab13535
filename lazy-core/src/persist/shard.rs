//! Fixed-size shards of a row array.
//!
//! Rows `[start, end)` of an array live in `<session>.<stem>.<start>.<end>.save`.
//! Each shard starts with its own range, so a reader can check it holds what
//! the file name promises without any master index.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use ark_serialize::{CanonicalDeserialize, CanonicalSerialize, SerializationError};
use rayon::prelude::*;
use tracing::debug;

use super::{write_atomic, SHARD_EXTENSION};
use crate::config::StorageConfig;
use crate::utils::errors::PersistError;

/// Half-open row range `[start, end)`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, CanonicalSerialize, CanonicalDeserialize,
)]
pub struct ShardRange {
    pub start: usize,
    pub end: usize,
}

impl ShardRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn file_name(&self, session: &str, stem: &str) -> String {
        format!(
            "{session}.{stem}.{}.{}.{SHARD_EXTENSION}",
            self.start, self.end
        )
    }

    /// Inverse of [`ShardRange::file_name`].
    pub fn parse_file_name(name: &str, session: &str, stem: &str) -> Option<Self> {
        let rest = name
            .strip_prefix(session)?
            .strip_prefix('.')?
            .strip_prefix(stem)?
            .strip_prefix('.')?
            .strip_suffix(SHARD_EXTENSION)?
            .strip_suffix('.')?;
        let (start, end) = rest.split_once('.')?;
        let range = Self::new(start.parse().ok()?, end.parse().ok()?);
        (range.start < range.end).then_some(range)
    }
}

/// Consecutive ranges of `batch_size` rows covering `[0, total)`; the last
/// range may be shorter.
pub fn partition(total: usize, batch_size: usize) -> Result<Vec<ShardRange>, PersistError> {
    if batch_size == 0 {
        return Err(PersistError::InvalidBatchSize);
    }
    Ok((0..total)
        .step_by(batch_size)
        .map(|start| ShardRange::new(start, (start + batch_size).min(total)))
        .collect())
}

/// Checks that sorted `ranges` tile `[0, total)` without gaps or overlaps.
pub fn check_coverage(ranges: &[ShardRange], total: usize) -> Result<(), PersistError> {
    let mut next = 0;
    for range in ranges {
        if range.is_empty() {
            return Err(PersistError::Coverage {
                total,
                reason: format!("empty shard [{}, {})", range.start, range.end),
            });
        }
        if range.start != next {
            let kind = if range.start > next { "gap" } else { "overlap" };
            return Err(PersistError::Coverage {
                total,
                reason: format!("{kind} at row {next}"),
            });
        }
        next = range.end;
    }
    if next != total {
        return Err(PersistError::Coverage {
            total,
            reason: format!("shards end at row {next}"),
        });
    }
    Ok(())
}

/// Ranges of every `<session>.<stem>.*.save` shard in `dir`, sorted.
pub fn discover_shards(dir: &Path, session: &str, stem: &str) -> Result<Vec<ShardRange>, PersistError> {
    let entries = std::fs::read_dir(dir).map_err(|e| PersistError::io(dir, e))?;
    let mut ranges = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PersistError::io(dir, e))?;
        if let Some(range) = entry
            .file_name()
            .to_str()
            .and_then(|name| ShardRange::parse_file_name(name, session, stem))
        {
            ranges.push(range);
        }
    }
    ranges.sort();
    Ok(ranges)
}

pub fn shard_path(config: &StorageConfig, stem: &str, range: ShardRange) -> PathBuf {
    config.dir.join(range.file_name(&config.session, stem))
}

/// Writes `rows` as one shard: its range, the row count, then the rows.
pub fn write_shard<T: CanonicalSerialize>(
    path: &Path,
    range: ShardRange,
    rows: &[T],
) -> Result<(), PersistError> {
    write_atomic(path, |writer| {
        range.serialize_compressed(&mut *writer)?;
        (rows.len() as u64).serialize_compressed(&mut *writer)?;
        for row in rows {
            row.serialize_compressed(&mut *writer)?;
        }
        Ok(())
    })
}

/// Decodes the shard at `path` straight into `dest`, which must have exactly
/// `range.len()` slots.
pub fn read_shard_into<T: CanonicalDeserialize>(
    path: &Path,
    range: ShardRange,
    dest: &mut [T],
) -> Result<(), PersistError> {
    let file = File::open(path).map_err(|e| PersistError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let decode = |source| PersistError::Decode {
        path: path.to_path_buf(),
        source,
    };

    let found = ShardRange::deserialize_compressed(&mut reader).map_err(decode)?;
    let len = u64::deserialize_compressed(&mut reader).map_err(decode)?;
    if found != range || len as usize != range.len() || dest.len() != range.len() {
        return Err(PersistError::ShardRangeMismatch {
            path: path.to_path_buf(),
            start: range.start,
            end: range.end,
            found_start: found.start,
            found_end: found.end,
        });
    }
    for slot in dest.iter_mut() {
        *slot = T::deserialize_compressed(&mut reader).map_err(decode)?;
    }
    let trailing = reader.read(&mut [0u8; 1]).map_err(|e| PersistError::io(path, e))?;
    if trailing > 0 {
        return Err(decode(SerializationError::InvalidData));
    }
    Ok(())
}

/// Splits `rows` into `config.batch_size` shards and writes them in parallel.
#[tracing::instrument(skip_all, name = "shard::write_sharded")]
pub fn write_sharded<T: CanonicalSerialize + Sync>(
    config: &StorageConfig,
    stem: &str,
    rows: &[T],
) -> Result<Vec<ShardRange>, PersistError> {
    config.validate()?;
    let ranges = partition(rows.len(), config.batch_size)?;
    loader_pool(config.parallelism)?.install(|| {
        ranges.par_iter().try_for_each(|range| {
            let path = shard_path(config, stem, *range);
            write_shard(&path, *range, &rows[range.start..range.end])?;
            debug!("wrote shard {}", path.display());
            Ok::<_, PersistError>(())
        })
    })?;
    tracing::info!(
        "wrote {} rows of {}.{} in {} shards",
        rows.len(),
        config.session,
        stem,
        ranges.len()
    );
    Ok(ranges)
}

/// Loads the `total` rows of a sharded array with a dedicated pool of
/// `config.parallelism` threads. Each worker decodes one shard into its own
/// disjoint chunk of the pre-allocated output. The first failure stops further
/// shards from being scheduled and is returned; no partial array escapes.
#[tracing::instrument(skip_all, name = "shard::load_concurrent")]
pub fn load_concurrent<T: CanonicalDeserialize + Default + Send>(
    config: &StorageConfig,
    stem: &str,
    total: usize,
) -> Result<Vec<T>, PersistError> {
    config.validate()?;
    // `total` usually comes from a header; nothing is sized from it before the
    // shards on disk are known to reach that far.
    let on_disk = if total == 0 {
        0
    } else {
        discover_shards(&config.dir, &config.session, stem)?
            .last()
            .map_or(0, |range| range.end)
    };
    if on_disk < total {
        let start = on_disk / config.batch_size * config.batch_size;
        let end = start.saturating_add(config.batch_size).min(total);
        return Err(PersistError::MissingShard(shard_path(
            config,
            stem,
            ShardRange::new(start, end),
        )));
    }
    let ranges = partition(total, config.batch_size)?;
    let mut rows: Vec<T> = Vec::new();
    rows.try_reserve_exact(total)
        .map_err(|_| PersistError::Allocation { rows: total })?;
    rows.resize_with(total, T::default);

    let completed = AtomicUsize::new(0);
    loader_pool(config.parallelism)?.install(|| {
        rows.par_chunks_mut(config.batch_size)
            .zip(ranges.par_iter())
            .try_for_each(|(chunk, range)| {
                let path = shard_path(config, stem, *range);
                read_shard_into(&path, *range, chunk)?;
                completed.fetch_add(1, Ordering::Relaxed);
                debug!("loaded shard {}", path.display());
                Ok::<_, PersistError>(())
            })
    })?;

    let completed = completed.into_inner();
    if completed != ranges.len() {
        return Err(PersistError::Coverage {
            total,
            reason: format!("{completed} of {} shards loaded", ranges.len()),
        });
    }
    Ok(rows)
}

fn loader_pool(parallelism: usize) -> Result<rayon::ThreadPool, PersistError> {
    Ok(rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism)
        .thread_name(|i| format!("shard-io-{i}"))
        .build()?)
}
