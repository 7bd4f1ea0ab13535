use std::collections::HashMap;
use std::sync::Arc;

use ark_ff::PrimeField;

use super::{
    coeff_table::CoeffTable,
    constraint::R1C,
    linear::LinearExpression,
    term::{Visibility, COEFF_ID_ONE},
};
use crate::shapes::{
    mimc::{self, MimcEncryptInputs},
    poseidon::{self, PoseidonInputs, PoseidonParams},
    LazyInputs,
};
use crate::utils::errors::LazyR1CSError;

/// Destination of the multiplication rows a gadget emits. Gadget routines are
/// written once against this trait and run both by [`CircuitBuilder`] and by
/// template synthesis, so the two always agree on row order and wiring.
pub trait ConstraintSink<F: PrimeField> {
    fn coeffs(&mut self) -> &mut CoeffTable<F>;

    /// Allocates a fresh internal wire `w`, records `a * b = w` and returns `w`.
    fn mul_gate(
        &mut self,
        a: &LinearExpression,
        b: &LinearExpression,
    ) -> Result<LinearExpression, LazyR1CSError>;

    fn add(
        &mut self,
        a: &LinearExpression,
        b: &LinearExpression,
    ) -> Result<LinearExpression, LazyR1CSError> {
        a.add(b, self.coeffs())
    }

    fn add_constant(
        &mut self,
        a: &LinearExpression,
        value: &F,
    ) -> Result<LinearExpression, LazyR1CSError> {
        a.add_constant(value, self.coeffs())
    }

    fn scale(&mut self, a: &LinearExpression, lambda: &F) -> Result<LinearExpression, LazyR1CSError> {
        a.scale(lambda, self.coeffs())
    }

    fn sub(
        &mut self,
        a: &LinearExpression,
        b: &LinearExpression,
    ) -> Result<LinearExpression, LazyR1CSError> {
        let negated = self.scale(b, &-F::one())?;
        self.add(a, &negated)
    }

    fn constant_value(&mut self, a: &LinearExpression) -> Result<Option<F>, LazyR1CSError> {
        a.constant_value(&*self.coeffs())
    }

    /// `a * b`, folded into a scaling when either side is a compile-time
    /// constant.
    fn mul(
        &mut self,
        a: &LinearExpression,
        b: &LinearExpression,
    ) -> Result<LinearExpression, LazyR1CSError> {
        if let Some(lambda) = self.constant_value(a)? {
            return self.scale(b, &lambda);
        }
        if let Some(lambda) = self.constant_value(b)? {
            return self.scale(a, &lambda);
        }
        self.mul_gate(a, b)
    }
}

/// Output of the front end: the fully expanded system, the shape records of
/// every recognised gadget call and a satisfying witness indexed by wire.
#[derive(Clone, Debug)]
pub struct CompiledR1CS<F: PrimeField> {
    pub coeffs: CoeffTable<F>,
    pub constraints: Vec<R1C>,
    pub lazy_inputs: Vec<LazyInputs>,
    pub witness: Vec<F>,
}

/// Minimal circuit front end. Wires are numbered in allocation order across
/// all visibilities; wire 0 is the constant one.
pub struct CircuitBuilder<F: PrimeField> {
    coeffs: CoeffTable<F>,
    constraints: Vec<R1C>,
    lazy_inputs: Vec<LazyInputs>,
    witness: Vec<F>,
    record_lazy: bool,
    mimc_constants: Option<Arc<Vec<F>>>,
    poseidon_params: HashMap<usize, Arc<PoseidonParams<F>>>,
}

impl<F: PrimeField> Default for CircuitBuilder<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PrimeField> CircuitBuilder<F> {
    pub fn new() -> Self {
        Self {
            coeffs: CoeffTable::new(),
            constraints: Vec::new(),
            lazy_inputs: Vec::new(),
            witness: vec![F::one()],
            record_lazy: true,
            mimc_constants: None,
            poseidon_params: HashMap::new(),
        }
    }

    /// Emits gadget rows without shape records, producing a plain expanded
    /// system.
    pub fn without_lazy_records(mut self) -> Self {
        self.record_lazy = false;
        self
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    pub fn num_wires(&self) -> usize {
        self.witness.len()
    }

    fn alloc(&mut self, value: F, visibility: Visibility) -> Result<LinearExpression, LazyR1CSError> {
        let wire = u32::try_from(self.witness.len()).map_err(|_| LazyR1CSError::WireOverflow {
            wire: u32::MAX,
            shift: 1,
        })?;
        self.witness.push(value);
        Ok(LinearExpression::wire(wire, visibility))
    }

    pub fn public_input(&mut self, value: F) -> Result<LinearExpression, LazyR1CSError> {
        self.alloc(value, Visibility::Public)
    }

    pub fn secret_input(&mut self, value: F) -> Result<LinearExpression, LazyR1CSError> {
        self.alloc(value, Visibility::Secret)
    }

    pub fn constant(&mut self, value: F) -> Result<LinearExpression, LazyR1CSError> {
        LinearExpression::constant_of(&value, &mut self.coeffs)
    }

    /// Value of `le` under the witness computed so far.
    pub fn value_of(&self, le: &LinearExpression) -> Result<F, LazyR1CSError> {
        le.evaluate(&self.witness, &self.coeffs)
    }

    /// `left == right`, as `(left - right) * 1 = 0`.
    pub fn assert_equal(
        &mut self,
        left: &LinearExpression,
        right: &LinearExpression,
    ) -> Result<(), LazyR1CSError> {
        let a = self.sub(left, right)?;
        self.constraints.push(R1C::new(
            a,
            LinearExpression::constant(COEFF_ID_ONE),
            LinearExpression::zero(),
        ));
        Ok(())
    }

    /// `E_h(m)`, recorded as one MiMC shape instance.
    pub fn mimc_encrypt(
        &mut self,
        m: &LinearExpression,
        h: &LinearExpression,
    ) -> Result<LinearExpression, LazyR1CSError> {
        let constants = self.mimc_constants();
        let record = LazyInputs::MimcEncrypt(MimcEncryptInputs {
            s0: m.clone(),
            hh: h.clone(),
            loc: self.constraints.len(),
            initial_wire: self.next_wire()?,
        });
        self.record_gadget(record, |builder| mimc::encrypt(builder, &constants, m, h))
    }

    /// Miyaguchi–Preneel over the blocks of `data`: `h <- h + E_h(m) + m`,
    /// starting from `h = 0`.
    pub fn mimc_hash(&mut self, data: &[LinearExpression]) -> Result<LinearExpression, LazyR1CSError> {
        let mut h = LinearExpression::zero();
        for m in data {
            let encrypted = self.mimc_encrypt(m, &h)?;
            let sum = self.add(&h, &encrypted)?;
            h = self.add(&sum, m)?;
        }
        Ok(h)
    }

    /// One Poseidon permutation of `state`, recorded as one shape instance.
    pub fn poseidon_permutation(
        &mut self,
        state: &[LinearExpression],
    ) -> Result<Vec<LinearExpression>, LazyR1CSError> {
        let params = self.poseidon_params(state.len())?;
        let record = LazyInputs::Poseidon(PoseidonInputs {
            state: state.to_vec(),
            loc: self.constraints.len(),
            initial_wire: self.next_wire()?,
        });
        self.record_gadget(record, |builder| {
            poseidon::permutation(builder, &params, state)
        })
    }

    /// Sponge-free Poseidon hash: permutes `[0, inputs...]` and returns the
    /// first state element.
    pub fn poseidon_hash(&mut self, inputs: &[LinearExpression]) -> Result<LinearExpression, LazyR1CSError> {
        let mut state = Vec::with_capacity(inputs.len() + 1);
        state.push(LinearExpression::zero());
        state.extend_from_slice(inputs);
        let out = self.poseidon_permutation(&state)?;
        Ok(out.into_iter().next().unwrap_or_default())
    }

    pub fn finish(self) -> CompiledR1CS<F> {
        tracing::info!(
            "compiled {} constraints over {} wires, {} lazy records",
            self.constraints.len(),
            self.witness.len(),
            self.lazy_inputs.len()
        );
        CompiledR1CS {
            coeffs: self.coeffs,
            constraints: self.constraints,
            lazy_inputs: self.lazy_inputs,
            witness: self.witness,
        }
    }

    fn next_wire(&self) -> Result<u32, LazyR1CSError> {
        u32::try_from(self.witness.len()).map_err(|_| LazyR1CSError::WireOverflow {
            wire: u32::MAX,
            shift: 1,
        })
    }

    fn mimc_constants(&mut self) -> Arc<Vec<F>> {
        self.mimc_constants
            .get_or_insert_with(|| Arc::new(mimc::round_constants()))
            .clone()
    }

    fn poseidon_params(&mut self, width: usize) -> Result<Arc<PoseidonParams<F>>, LazyR1CSError> {
        if let Some(params) = self.poseidon_params.get(&width) {
            return Ok(params.clone());
        }
        let params = Arc::new(PoseidonParams::new(width)?);
        self.poseidon_params.insert(width, params.clone());
        Ok(params)
    }

    /// Runs a gadget and keeps its shape record if it emitted rows. Operands
    /// that cancel each other fold S-boxes the key cannot see; such a call
    /// keeps its rows as direct rows and is not recorded.
    fn record_gadget<T>(
        &mut self,
        record: LazyInputs,
        gadget: impl FnOnce(&mut Self) -> Result<T, LazyR1CSError>,
    ) -> Result<T, LazyR1CSError> {
        let key = record.shape_key(&self.coeffs)?;
        let expected = key.constraint_count()?;
        let start = self.constraints.len();
        let out = gadget(self)?;
        let emitted = self.constraints.len() - start;
        if emitted != expected {
            tracing::debug!(
                "{} call at row {} emitted {} rows instead of {}, kept as direct rows",
                key,
                start,
                emitted,
                expected
            );
            return Ok(out);
        }
        if self.record_lazy && emitted > 0 {
            self.lazy_inputs.push(record);
        }
        Ok(out)
    }
}

impl<F: PrimeField> ConstraintSink<F> for CircuitBuilder<F> {
    fn coeffs(&mut self) -> &mut CoeffTable<F> {
        &mut self.coeffs
    }

    fn mul_gate(
        &mut self,
        a: &LinearExpression,
        b: &LinearExpression,
    ) -> Result<LinearExpression, LazyR1CSError> {
        let value = self.value_of(a)? * self.value_of(b)?;
        let out = self.alloc(value, Visibility::Internal)?;
        self.constraints
            .push(R1C::new(a.clone(), b.clone(), out.clone()));
        Ok(out)
    }
}
