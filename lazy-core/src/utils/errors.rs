use std::path::PathBuf;

use ark_serialize::SerializationError;
use thiserror::Error;

use crate::r1cs::term::CoeffId;

/// Failures of the compaction and reconstruction engine.
///
/// Corruption errors mean an invariant of the compacted system was violated
/// upstream; there is no safe way to continue with the affected system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LazyR1CSError {
    #[error("coefficient id {0} was never allocated")]
    UnknownCoefficientId(CoeffId),
    #[error("coefficient {0} is not present in the frozen coefficient table")]
    UnknownCoefficientValue(String),
    #[error("coefficient table is full ({0} entries)")]
    CoefficientTableFull(usize),
    #[error("reserved coefficient id {0} holds an unexpected value")]
    ReservedCoefficientMismatch(CoeffId),
    #[error("coefficient value stored twice, under ids {0} and {1}")]
    DuplicateCoefficient(CoeffId, CoeffId),
    #[error("lazy range [{start}, {end}) overlaps the previous range ending at {previous_end}")]
    OverlappingLazyRange {
        start: usize,
        end: usize,
        previous_end: usize,
    },
    #[error("lazy range [{start}, {end}) exceeds the {total} constraints of the system")]
    LazyRangeOutOfBounds {
        start: usize,
        end: usize,
        total: usize,
    },
    #[error("shape {key} is registered with {registered} rows but an instance expands to {instance}")]
    ShapeKeyCollision {
        key: String,
        registered: usize,
        instance: usize,
    },
    #[error("shape {key} should expand to {expected} rows, synthesis produced {actual}")]
    TemplateSizeMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },
    #[error("shifting wire {wire} by {shift} leaves the wire index range")]
    WireOverflow { wire: u32, shift: i64 },
    #[error("unsupported permutation width {0}, supported widths are 3..=13")]
    UnsupportedWidth(usize),
    #[error("shape {0} is not registered")]
    UnregisteredShape(usize),
    #[error("constraint index {index} is out of range for {total} constraints")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("wire {0} has no witness value")]
    UnknownWire(u32),
    #[error("expected {expected} directly stored constraints, found {found}")]
    DirectRowCountMismatch { expected: usize, found: usize },
    #[error("reconstructed constraint {index} differs from the expanded system")]
    ReconstructionMismatch { index: usize },
}

impl LazyR1CSError {
    /// Whether the error signals a violated compaction invariant rather than a
    /// bad request from the caller.
    pub fn is_corruption(&self) -> bool {
        !matches!(
            self,
            LazyR1CSError::UnsupportedWidth(_)
                | LazyR1CSError::UnregisteredShape(_)
                | LazyR1CSError::IndexOutOfRange { .. }
                | LazyR1CSError::UnknownWire(_)
        )
    }
}

/// Failures of the segmented persistence layer.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shard {0} is missing")]
    MissingShard(PathBuf),
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: SerializationError,
    },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: SerializationError,
    },
    #[error("shard {path} holds rows [{found_start}, {found_end}) but [{start}, {end}) was expected")]
    ShardRangeMismatch {
        path: PathBuf,
        start: usize,
        end: usize,
        found_start: usize,
        found_end: usize,
    },
    #[error("shards do not cover [0, {total}): {reason}")]
    Coverage { total: usize, reason: String },
    #[error("invalid session header: {0}")]
    BadHeader(String),
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error("parallelism must be at least 1")]
    InvalidParallelism,
    #[error("invalid session name {0:?}")]
    InvalidSession(String),
    #[error("cannot allocate {rows} rows")]
    Allocation { rows: usize },
    #[error("failed to build the loader thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("loaded data is corrupt: {0}")]
    Corrupt(#[from] LazyR1CSError),
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            PersistError::MissingShard(path)
        } else {
            PersistError::Io { path, source }
        }
    }
}
