//! Poseidon permutation over widths 3..=13 with the x^5 S-box.

use ark_ff::PrimeField;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use super::{keccak_chain, pow5, SBOX_ROWS};
use crate::r1cs::{builder::ConstraintSink, linear::LinearExpression};
use crate::utils::errors::LazyR1CSError;

pub const MIN_WIDTH: usize = 3;
pub const MAX_WIDTH: usize = 13;
pub const FULL_ROUNDS: usize = 8;
/// Partial rounds indexed by `width - MIN_WIDTH`.
pub const PARTIAL_ROUNDS: [usize; 11] = [57, 56, 60, 60, 63, 64, 63, 60, 66, 60, 65];

/// One permutation call over `state`.
#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct PoseidonInputs {
    pub state: Vec<LinearExpression>,
    pub loc: usize,
    pub initial_wire: u32,
}

pub fn partial_rounds(width: usize) -> Result<usize, LazyR1CSError> {
    if !(MIN_WIDTH..=MAX_WIDTH).contains(&width) {
        return Err(LazyR1CSError::UnsupportedWidth(width));
    }
    Ok(PARTIAL_ROUNDS[width - MIN_WIDTH])
}

/// Rows of one permutation of width `width` with `non_constant` inputs.
///
/// The first full round only spends S-box rows on non-constant inputs; after
/// the first mix every position depends on a wire.
pub fn constraint_count(width: usize, non_constant: usize) -> Result<usize, LazyR1CSError> {
    let rp = partial_rounds(width)?;
    if non_constant == 0 {
        return Ok(0);
    }
    Ok(SBOX_ROWS * (non_constant + (FULL_ROUNDS - 1) * width + rp))
}

#[derive(Clone, Debug)]
pub struct PoseidonParams<F: PrimeField> {
    pub width: usize,
    pub partial_rounds: usize,
    /// `width` constants per round, full and partial rounds alike.
    pub round_constants: Vec<F>,
    pub mds: Vec<Vec<F>>,
}

impl<F: PrimeField> PoseidonParams<F> {
    pub fn new(width: usize) -> Result<Self, LazyR1CSError> {
        let partial_rounds = partial_rounds(width)?;
        let seed = format!("poseidon_t{width}");
        let round_constants = keccak_chain(seed.as_bytes(), width * (FULL_ROUNDS + partial_rounds));

        // Cauchy matrix with x_i = i and y_j = width + j.
        let mut mds: Vec<Vec<F>> = (0..width)
            .map(|i| {
                (0..width)
                    .map(|j| F::from((i + width + j) as u64))
                    .collect()
            })
            .collect();
        for row in mds.iter_mut() {
            ark_ff::batch_inversion(row);
        }

        Ok(Self {
            width,
            partial_rounds,
            round_constants,
            mds,
        })
    }
}

/// The permutation: half the full rounds, the partial rounds, then the other
/// half of the full rounds. Round constants are consumed in position order.
pub(crate) fn permutation<F: PrimeField, S: ConstraintSink<F>>(
    sink: &mut S,
    params: &PoseidonParams<F>,
    state: &[LinearExpression],
) -> Result<Vec<LinearExpression>, LazyR1CSError> {
    if state.len() != params.width {
        return Err(LazyR1CSError::UnsupportedWidth(state.len()));
    }
    let mut state = state.to_vec();
    let mut round_counter = 0;

    for _ in 0..FULL_ROUNDS / 2 {
        state = full_round(sink, params, state, &mut round_counter)?;
    }
    for _ in 0..params.partial_rounds {
        for position in 0..params.width {
            state[position] = add_round_constant(sink, params, &state[position], &mut round_counter)?;
        }
        state[0] = pow5(sink, &state[0])?;
        state = mix(sink, params, &state)?;
    }
    for _ in 0..FULL_ROUNDS / 2 {
        state = full_round(sink, params, state, &mut round_counter)?;
    }
    Ok(state)
}

fn full_round<F: PrimeField, S: ConstraintSink<F>>(
    sink: &mut S,
    params: &PoseidonParams<F>,
    mut state: Vec<LinearExpression>,
    round_counter: &mut usize,
) -> Result<Vec<LinearExpression>, LazyR1CSError> {
    for position in 0..params.width {
        let input = add_round_constant(sink, params, &state[position], round_counter)?;
        state[position] = pow5(sink, &input)?;
    }
    mix(sink, params, &state)
}

fn add_round_constant<F: PrimeField, S: ConstraintSink<F>>(
    sink: &mut S,
    params: &PoseidonParams<F>,
    x: &LinearExpression,
    round_counter: &mut usize,
) -> Result<LinearExpression, LazyR1CSError> {
    let constant = params
        .round_constants
        .get(*round_counter)
        .ok_or(LazyR1CSError::IndexOutOfRange {
            index: *round_counter,
            total: params.round_constants.len(),
        })?;
    *round_counter += 1;
    sink.add_constant(x, constant)
}

fn mix<F: PrimeField, S: ConstraintSink<F>>(
    sink: &mut S,
    params: &PoseidonParams<F>,
    state: &[LinearExpression],
) -> Result<Vec<LinearExpression>, LazyR1CSError> {
    params
        .mds
        .iter()
        .map(|row| {
            let mut acc = LinearExpression::zero();
            for (m, x) in row.iter().zip(state) {
                let term = sink.scale(x, m)?;
                acc = sink.add(&acc, &term)?;
            }
            Ok(acc)
        })
        .collect()
}
