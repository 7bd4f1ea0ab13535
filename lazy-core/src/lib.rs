#![allow(clippy::needless_range_loop)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::too_long_first_doc_paragraph)]

//! Lazy constraint compaction for R1CS.
//!
//! Circuits that run the same permutation gadget thousands of times (MiMC,
//! Poseidon) produce millions of constraints that differ only by a wire offset.
//! This crate stores each such gadget shape once as a template, keeps a compact
//! index of where every repetition lives, rebuilds any constraint on demand by
//! shifting wires, and persists the result in independently loadable shards.

pub mod config;
pub mod persist;
pub mod r1cs;
pub mod shapes;
pub mod utils;

pub use config::StorageConfig;
pub use r1cs::{
    builder::{CircuitBuilder, CompiledR1CS, ConstraintSink},
    coeff_table::{CoeffResolver, CoeffTable, FrozenCoeffs},
    constraint::{Side, R1C},
    lazy::LazyR1CS,
    linear::LinearExpression,
    term::{CoeffId, Term, Visibility},
};
pub use shapes::{LazyInputs, ShapeKey, ShapeKind};
pub use utils::errors::{LazyR1CSError, PersistError};
