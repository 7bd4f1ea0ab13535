//! MiMC encryption with the x^5 round function over the scalar field.

use ark_ff::PrimeField;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use super::{keccak_chain, pow5, SBOX_ROWS};
use crate::r1cs::{
    builder::ConstraintSink, coeff_table::CoeffResolver, linear::LinearExpression,
    term::Visibility,
};
use crate::utils::errors::LazyR1CSError;

pub const MIMC_ROUNDS: usize = 91;
pub const MIMC_SEED: &[u8] = b"seed";

/// Operand position of the message.
pub const MESSAGE_POSITION: usize = 0;
/// Operand position of the key, which is added in every round.
pub const KEY_POSITION: usize = 1;

/// One call of `E_hh(s0)`.
#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct MimcEncryptInputs {
    pub s0: LinearExpression,
    pub hh: LinearExpression,
    pub loc: usize,
    pub initial_wire: u32,
}

impl MimcEncryptInputs {
    /// `x_i + hh + c_i`, where `x_0 = s0` and `x_i` is the output wire of
    /// round `i - 1`.
    pub fn round_input<F: PrimeField>(
        &self,
        round: usize,
        constant: &F,
        coeffs: &mut impl CoeffResolver<F>,
    ) -> Result<LinearExpression, LazyR1CSError> {
        let x = if round == 0 {
            self.s0.clone()
        } else {
            let wire = (self.initial_wire as usize + SBOX_ROWS * round - 1) as u32;
            LinearExpression::wire(wire, Visibility::Internal)
        };
        x.add(&self.hh, coeffs)?.add_constant(constant, coeffs)
    }
}

pub fn round_constants<F: PrimeField>() -> Vec<F> {
    keccak_chain(MIMC_SEED, MIMC_ROUNDS)
}

/// Rows of one encryption with `non_constant` of its two operands unknown at
/// compile time.
pub fn constraint_count(non_constant: usize) -> usize {
    if non_constant == 0 {
        0
    } else {
        MIMC_ROUNDS * SBOX_ROWS
    }
}

/// `E_h(m)`: each round computes `x <- (x + h + c_i)^5`; the key is added once
/// more at the end.
pub(crate) fn encrypt<F: PrimeField, S: ConstraintSink<F>>(
    sink: &mut S,
    constants: &[F],
    m: &LinearExpression,
    h: &LinearExpression,
) -> Result<LinearExpression, LazyR1CSError> {
    let mut x = m.clone();
    for constant in constants {
        let t = sink.add(&x, h)?;
        let t = sink.add_constant(&t, constant)?;
        x = pow5(sink, &t)?;
    }
    sink.add(&x, h)
}
