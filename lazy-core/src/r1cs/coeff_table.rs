//! Content-addressed coefficient store. Every coefficient in the system lives
//! here exactly once and is referenced elsewhere by its [`CoeffId`].

use std::collections::HashMap;
use std::io::{Read, Write};

use ark_ff::PrimeField;
use ark_serialize::{
    CanonicalDeserialize, CanonicalSerialize, Compress, SerializationError, Valid, Validate,
};
use ark_std::{One, Zero};

use super::term::{
    CoeffId, COEFF_ID_MINUS_ONE, COEFF_ID_ONE, COEFF_ID_TWO, COEFF_ID_ZERO, MAX_COEFF_ID,
    NUM_RESERVED_COEFFS,
};
use crate::utils::errors::LazyR1CSError;

/// Access to coefficient values and ids. Implemented by the allocating
/// [`CoeffTable`] and by the read-only [`FrozenCoeffs`], so the algebra in
/// [`super::linear`] runs unchanged during lazification and during `fetch`.
pub trait CoeffResolver<F: PrimeField> {
    fn value(&self, id: CoeffId) -> Result<F, LazyR1CSError>;

    /// Id of `value`. May allocate.
    fn resolve(&mut self, value: &F) -> Result<CoeffId, LazyR1CSError>;
}

#[derive(Clone, Debug)]
pub struct CoeffTable<F: PrimeField> {
    coeffs: Vec<F>,
    ids: HashMap<F, CoeffId>,
}

impl<F: PrimeField> Default for CoeffTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PrimeField> PartialEq for CoeffTable<F> {
    fn eq(&self, other: &Self) -> bool {
        self.coeffs == other.coeffs
    }
}

impl<F: PrimeField> Eq for CoeffTable<F> {}

impl<F: PrimeField> CoeffTable<F> {
    pub fn new() -> Self {
        let coeffs = reserved_values::<F>().to_vec();
        let ids = coeffs
            .iter()
            .enumerate()
            .map(|(id, value)| (*value, id as CoeffId))
            .collect();
        Self { coeffs, ids }
    }

    /// Rebuilds a table from its value list, checking the reserved slots and
    /// that no value appears twice.
    pub fn from_values(coeffs: Vec<F>) -> Result<Self, LazyR1CSError> {
        let reserved = reserved_values::<F>();
        for (id, expected) in reserved.iter().enumerate() {
            if coeffs.get(id) != Some(expected) {
                return Err(LazyR1CSError::ReservedCoefficientMismatch(id as CoeffId));
            }
        }
        if coeffs.len() > MAX_COEFF_ID as usize + 1 {
            return Err(LazyR1CSError::CoefficientTableFull(coeffs.len()));
        }

        let mut ids = HashMap::with_capacity(coeffs.len());
        for (id, value) in coeffs.iter().enumerate() {
            if let Some(previous) = ids.insert(*value, id as CoeffId) {
                return Err(LazyR1CSError::DuplicateCoefficient(previous, id as CoeffId));
            }
        }
        Ok(Self { coeffs, ids })
    }

    /// Returns the id of `value`, allocating one if the value is new.
    pub fn id(&mut self, value: &F) -> Result<CoeffId, LazyR1CSError> {
        if let Some(id) = reserved_id(value) {
            return Ok(id);
        }
        if let Some(id) = self.ids.get(value) {
            return Ok(*id);
        }
        if self.coeffs.len() > MAX_COEFF_ID as usize {
            return Err(LazyR1CSError::CoefficientTableFull(self.coeffs.len()));
        }
        let id = self.coeffs.len() as CoeffId;
        self.coeffs.push(*value);
        self.ids.insert(*value, id);
        Ok(id)
    }

    /// Id of `value` if it was allocated before.
    pub fn get_id(&self, value: &F) -> Option<CoeffId> {
        reserved_id(value).or_else(|| self.ids.get(value).copied())
    }

    pub fn value(&self, id: CoeffId) -> Result<F, LazyR1CSError> {
        self.coeffs
            .get(id as usize)
            .copied()
            .ok_or(LazyR1CSError::UnknownCoefficientId(id))
    }

    pub fn values(&self) -> &[F] {
        &self.coeffs
    }

    pub fn len(&self) -> usize {
        self.coeffs.len()
    }

    pub fn frozen(&self) -> FrozenCoeffs<'_, F> {
        FrozenCoeffs(self)
    }
}

impl<F: PrimeField> CoeffResolver<F> for CoeffTable<F> {
    fn value(&self, id: CoeffId) -> Result<F, LazyR1CSError> {
        CoeffTable::value(self, id)
    }

    fn resolve(&mut self, value: &F) -> Result<CoeffId, LazyR1CSError> {
        self.id(value)
    }
}

/// Read-only view of a [`CoeffTable`]. Resolving a value that was never
/// allocated is an error instead of an allocation.
#[derive(Clone, Copy)]
pub struct FrozenCoeffs<'a, F: PrimeField>(pub &'a CoeffTable<F>);

impl<F: PrimeField> CoeffResolver<F> for FrozenCoeffs<'_, F> {
    fn value(&self, id: CoeffId) -> Result<F, LazyR1CSError> {
        self.0.value(id)
    }

    fn resolve(&mut self, value: &F) -> Result<CoeffId, LazyR1CSError> {
        self.0
            .get_id(value)
            .ok_or_else(|| LazyR1CSError::UnknownCoefficientValue(value.to_string()))
    }
}

fn reserved_values<F: PrimeField>() -> [F; NUM_RESERVED_COEFFS] {
    [F::zero(), F::one(), -F::one(), F::from(2u64)]
}

fn reserved_id<F: PrimeField>(value: &F) -> Option<CoeffId> {
    if value.is_zero() {
        Some(COEFF_ID_ZERO)
    } else if value.is_one() {
        Some(COEFF_ID_ONE)
    } else if *value == -F::one() {
        Some(COEFF_ID_MINUS_ONE)
    } else if *value == F::from(2u64) {
        Some(COEFF_ID_TWO)
    } else {
        None
    }
}

impl<F: PrimeField> CanonicalSerialize for CoeffTable<F> {
    fn serialize_with_mode<W: Write>(
        &self,
        writer: W,
        compress: Compress,
    ) -> Result<(), SerializationError> {
        self.coeffs.serialize_with_mode(writer, compress)
    }

    fn serialized_size(&self, compress: Compress) -> usize {
        self.coeffs.serialized_size(compress)
    }
}

impl<F: PrimeField> Valid for CoeffTable<F> {
    fn check(&self) -> Result<(), SerializationError> {
        if self.coeffs.len() != self.ids.len() {
            return Err(SerializationError::InvalidData);
        }
        Ok(())
    }
}

impl<F: PrimeField> CanonicalDeserialize for CoeffTable<F> {
    fn deserialize_with_mode<R: Read>(
        reader: R,
        compress: Compress,
        validate: Validate,
    ) -> Result<Self, SerializationError> {
        let coeffs = Vec::<F>::deserialize_with_mode(reader, compress, validate)?;
        CoeffTable::from_values(coeffs).map_err(|_| SerializationError::InvalidData)
    }
}
