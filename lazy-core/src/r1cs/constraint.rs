use ark_ff::PrimeField;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use super::coeff_table::CoeffResolver;
use super::linear::LinearExpression;
use crate::utils::errors::LazyR1CSError;

/// Operand position inside a rank-1 constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::EnumIter, strum_macros::Display)]
pub enum Side {
    L,
    R,
    O,
}

/// The assertion `l * r == o`. Rows are never edited in place; transformed
/// variants are built through [`R1C::with_side`].
#[derive(Clone, Default, Debug, PartialEq, Eq, Hash, CanonicalSerialize, CanonicalDeserialize)]
pub struct R1C {
    l: LinearExpression,
    r: LinearExpression,
    o: LinearExpression,
}

impl R1C {
    pub fn new(l: LinearExpression, r: LinearExpression, o: LinearExpression) -> Self {
        Self { l, r, o }
    }

    pub fn l(&self) -> &LinearExpression {
        &self.l
    }

    pub fn r(&self) -> &LinearExpression {
        &self.r
    }

    pub fn o(&self) -> &LinearExpression {
        &self.o
    }

    pub fn side(&self, side: Side) -> &LinearExpression {
        match side {
            Side::L => &self.l,
            Side::R => &self.r,
            Side::O => &self.o,
        }
    }

    pub fn with_side(mut self, side: Side, value: LinearExpression) -> Self {
        match side {
            Side::L => self.l = value,
            Side::R => self.r = value,
            Side::O => self.o = value,
        }
        self
    }

    pub fn is_satisfied<F: PrimeField>(
        &self,
        witness: &[F],
        coeffs: &impl CoeffResolver<F>,
    ) -> Result<bool, LazyR1CSError> {
        let l = self.l.evaluate(witness, coeffs)?;
        let r = self.r.evaluate(witness, coeffs)?;
        let o = self.o.evaluate(witness, coeffs)?;
        Ok(l * r == o)
    }
}
