//! The compacted constraint system.
//!
//! Virtual indices `0..total` address the same rows as the expanded system.
//! Rows covered by a shape instance are not stored; [`LazyR1CS::fetch`]
//! rebuilds them from the instance's template.

use std::ops::Range;

use ark_ff::PrimeField;
use rayon::prelude::*;
use strum::IntoEnumIterator;
use tracing::info;

use super::{
    builder::CompiledR1CS,
    coeff_table::CoeffTable,
    constraint::{Side, R1C},
    linear::LinearExpression,
};
use crate::shapes::{LazyInputs, ShapeRegistry, ShapeTemplate};
use crate::utils::{errors::LazyR1CSError, thread::drop_in_background_thread};

/// Where the row at a virtual index comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    /// Index into the directly stored rows.
    Direct(u32),
    /// Row `local` of lazy instance `instance`.
    Lazy { instance: u32, local: u32 },
}

#[derive(Clone, Debug)]
pub struct LazyR1CS<F: PrimeField> {
    coeffs: CoeffTable<F>,
    direct: Vec<R1C>,
    instances: Vec<LazyInputs>,
    /// Template index of each instance.
    instance_shapes: Vec<u32>,
    registry: ShapeRegistry<F>,
    slots: Vec<Slot>,
}

impl<F: PrimeField> LazyR1CS<F> {
    pub fn lazify(compiled: CompiledR1CS<F>) -> Result<Self, LazyR1CSError> {
        Self::from_parts(compiled.coeffs, compiled.constraints, compiled.lazy_inputs)
    }

    /// Compacts an expanded system. Every range covered by a shape record is
    /// replaced by a reference to the record's template.
    #[tracing::instrument(skip_all, name = "LazyR1CS::lazify")]
    pub fn from_parts(
        mut coeffs: CoeffTable<F>,
        constraints: Vec<R1C>,
        mut lazy_inputs: Vec<LazyInputs>,
    ) -> Result<Self, LazyR1CSError> {
        let total = constraints.len();
        lazy_inputs.sort_by_key(LazyInputs::loc);

        let mut registry = ShapeRegistry::new();
        let mut instances = Vec::with_capacity(lazy_inputs.len());
        let mut instance_shapes = Vec::with_capacity(lazy_inputs.len());
        let mut ranges = Vec::with_capacity(lazy_inputs.len());
        for inputs in lazy_inputs {
            let count = inputs.constraint_count(&coeffs)?;
            if count == 0 {
                continue;
            }
            let range = checked_range(&inputs, count, total, ranges.last())?;
            let shape = registry.ensure(instances.len(), &inputs, &mut coeffs)?;
            inputs.resolve_input_slots(registry.get(shape)?, &mut coeffs)?;

            ranges.push(range);
            instances.push(inputs);
            instance_shapes.push(shape as u32);
        }

        let slots = build_slots(total, &ranges);
        let lazy_rows: usize = ranges.iter().map(|r| r.len()).sum();
        let mut direct = Vec::with_capacity(total - lazy_rows);
        let mut compacted = Vec::with_capacity(lazy_rows);
        for (row, slot) in constraints.into_iter().zip(&slots) {
            match slot {
                Slot::Direct(_) => direct.push(row),
                Slot::Lazy { .. } => compacted.push(row),
            }
        }
        drop_in_background_thread(compacted);

        let lazy = Self {
            coeffs,
            direct,
            instances,
            instance_shapes,
            registry,
            slots,
        };
        info!(
            "lazified {} constraints: {} direct, {} lazy over {} instances of {} shapes ({} template rows)",
            lazy.total_constraint_count(),
            lazy.direct_constraint_count(),
            lazy.lazy_constraint_count(),
            lazy.instance_count(),
            lazy.shape_count(),
            lazy.expanded_lazy_constraint_count()
        );
        Ok(lazy)
    }

    /// Reassembles a system from its persisted parts, re-validating ranges,
    /// shape keys and the direct row count. The slot array is rebuilt.
    #[tracing::instrument(skip_all, name = "LazyR1CS::from_persisted")]
    pub fn from_persisted(
        coeffs: CoeffTable<F>,
        direct: Vec<R1C>,
        instances: Vec<LazyInputs>,
        templates: Vec<ShapeTemplate<F>>,
        total: usize,
    ) -> Result<Self, LazyR1CSError> {
        let registry = ShapeRegistry::from_templates(templates)?;
        let mut instance_shapes = Vec::with_capacity(instances.len());
        let mut ranges: Vec<Range<usize>> = Vec::with_capacity(instances.len());
        for inputs in &instances {
            let key = inputs.shape_key(&coeffs)?;
            let shape = registry
                .index_of(&key)
                .ok_or(LazyR1CSError::ShapeKeyCollision {
                    key: key.to_string(),
                    registered: 0,
                    instance: key.constraint_count()?,
                })?;
            let template = registry.get(shape)?;
            let range = checked_range(inputs, template.rows.len(), total, ranges.last())?;
            inputs.resolve_input_slots(template, &mut coeffs.frozen())?;
            ranges.push(range);
            instance_shapes.push(shape as u32);
        }

        let lazy_rows: usize = ranges.iter().map(|r| r.len()).sum();
        if direct.len() != total - lazy_rows {
            return Err(LazyR1CSError::DirectRowCountMismatch {
                expected: total - lazy_rows,
                found: direct.len(),
            });
        }

        Ok(Self {
            coeffs,
            direct,
            instances,
            instance_shapes,
            registry,
            slots: build_slots(total, &ranges),
        })
    }

    /// The concrete row at `index`, identical to row `index` of the expanded
    /// system. Takes `&self` only and may be called concurrently.
    pub fn fetch(&self, index: usize) -> Result<R1C, LazyR1CSError> {
        let out_of_range = LazyR1CSError::IndexOutOfRange {
            index,
            total: self.slots.len(),
        };
        match self.slots.get(index).ok_or(out_of_range.clone())? {
            Slot::Direct(direct) => self
                .direct
                .get(*direct as usize)
                .cloned()
                .ok_or(out_of_range),
            Slot::Lazy { instance, local } => {
                self.fetch_lazy(*instance as usize, *local as usize)
            }
        }
    }

    fn fetch_lazy(&self, instance: usize, local: usize) -> Result<R1C, LazyR1CSError> {
        let inputs = &self.instances[instance];
        let template = self.registry.get(self.instance_shapes[instance] as usize)?;
        let row = template
            .rows
            .get(local)
            .ok_or(LazyR1CSError::IndexOutOfRange {
                index: local,
                total: template.rows.len(),
            })?;
        let shift = template.shift_for(inputs);
        let mut coeffs = self.coeffs.frozen();

        let mut operand: Option<LinearExpression> = None;
        let mut out = R1C::default();
        for side in Side::iter() {
            let value = if template.key.is_input_slot(local, side) {
                match &operand {
                    Some(operand) => operand.clone(),
                    None => {
                        let resolved = inputs.input_operand(template, local, &mut coeffs)?;
                        operand = Some(resolved.clone());
                        resolved
                    }
                }
            } else {
                row.side(side).shifted(shift)?
            };
            out = out.with_side(side, value);
        }
        Ok(out)
    }

    /// Rows in virtual index order.
    pub fn iter(&self) -> impl Iterator<Item = Result<R1C, LazyR1CSError>> + '_ {
        (0..self.slots.len()).map(move |index| self.fetch(index))
    }

    /// Every row, rebuilt in parallel.
    #[tracing::instrument(skip_all, name = "LazyR1CS::par_expand")]
    pub fn par_expand(&self) -> Result<Vec<R1C>, LazyR1CSError> {
        (0..self.slots.len())
            .into_par_iter()
            .map(|index| self.fetch(index))
            .collect()
    }

    /// Index of the first row `witness` violates, if any.
    #[tracing::instrument(skip_all, name = "LazyR1CS::is_satisfied")]
    pub fn is_satisfied(&self, witness: &[F]) -> Result<Option<usize>, LazyR1CSError> {
        (0..self.slots.len())
            .into_par_iter()
            .map(|index| {
                let satisfied = self.fetch(index)?.is_satisfied(witness, &self.coeffs)?;
                Ok((!satisfied).then_some(index))
            })
            .try_reduce(
                || None,
                |a, b| {
                    Ok(match (a, b) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    })
                },
            )
    }

    /// Checks that every rebuilt row equals the corresponding expanded row.
    pub fn verify_against(&self, expanded: &[R1C]) -> Result<(), LazyR1CSError> {
        if expanded.len() != self.slots.len() {
            return Err(LazyR1CSError::ReconstructionMismatch {
                index: expanded.len().min(self.slots.len()),
            });
        }
        expanded
            .par_iter()
            .enumerate()
            .try_for_each(|(index, expected)| {
                if self.fetch(index)? == *expected {
                    Ok(())
                } else {
                    Err(LazyR1CSError::ReconstructionMismatch { index })
                }
            })
    }

    /// Virtual indices `[loc, loc + count)` served by instance `instance`.
    pub fn instance_range(&self, instance: usize) -> Result<Range<usize>, LazyR1CSError> {
        let inputs = self
            .instances
            .get(instance)
            .ok_or(LazyR1CSError::IndexOutOfRange {
                index: instance,
                total: self.instances.len(),
            })?;
        let template = self.registry.get(self.instance_shapes[instance] as usize)?;
        Ok(inputs.loc()..inputs.loc() + template.rows.len())
    }

    pub fn total_constraint_count(&self) -> usize {
        self.slots.len()
    }

    /// Virtual indices served through templates.
    pub fn lazy_constraint_count(&self) -> usize {
        self.instance_shapes
            .iter()
            .map(|shape| self.registry.templates()[*shape as usize].rows.len())
            .sum()
    }

    /// Rows actually materialised in templates.
    pub fn expanded_lazy_constraint_count(&self) -> usize {
        self.registry.expanded_row_count()
    }

    pub fn direct_constraint_count(&self) -> usize {
        self.direct.len()
    }

    pub fn shape_count(&self) -> usize {
        self.registry.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn coeffs(&self) -> &CoeffTable<F> {
        &self.coeffs
    }

    pub fn direct_rows(&self) -> &[R1C] {
        &self.direct
    }

    pub fn instances(&self) -> &[LazyInputs] {
        &self.instances
    }

    pub fn registry(&self) -> &ShapeRegistry<F> {
        &self.registry
    }

    pub fn slot(&self, index: usize) -> Option<Slot> {
        self.slots.get(index).copied()
    }
}

/// `[loc, loc + count)`, checked against the stream length and the previous
/// instance's range.
fn checked_range(
    inputs: &LazyInputs,
    count: usize,
    total: usize,
    previous: Option<&Range<usize>>,
) -> Result<Range<usize>, LazyR1CSError> {
    let start = inputs.loc();
    let end = start.saturating_add(count);
    if end > total {
        return Err(LazyR1CSError::LazyRangeOutOfBounds { start, end, total });
    }
    if let Some(previous) = previous {
        if start < previous.end {
            return Err(LazyR1CSError::OverlappingLazyRange {
                start,
                end,
                previous_end: previous.end,
            });
        }
    }
    Ok(start..end)
}

/// Dense slot array for sorted, disjoint lazy `ranges`.
fn build_slots(total: usize, ranges: &[Range<usize>]) -> Vec<Slot> {
    let mut slots = Vec::with_capacity(total);
    let mut direct = 0u32;
    let mut push_direct = |slots: &mut Vec<Slot>, until: usize| {
        while slots.len() < until {
            slots.push(Slot::Direct(direct));
            direct += 1;
        }
    };
    for (instance, range) in ranges.iter().enumerate() {
        push_direct(&mut slots, range.start);
        slots.extend((0..range.len()).map(|local| Slot::Lazy {
            instance: instance as u32,
            local: local as u32,
        }));
    }
    push_direct(&mut slots, total);
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r1cs::{
        builder::{CircuitBuilder, ConstraintSink},
        test::{hash_chain_circuit, mixed_circuit, mixed_circuit_with, poseidon_pair_circuit},
        term::Visibility,
    };
    use crate::shapes::{mimc::MimcEncryptInputs, ShapeKind};
    use ark_bn254::Fr;
    use ark_std::One;

    #[test]
    fn two_permutations_share_one_template() {
        let compiled = poseidon_pair_circuit(false);
        let expanded = compiled.constraints.clone();
        let lazy = LazyR1CS::lazify(compiled).unwrap();

        assert_eq!(lazy.shape_count(), 1);
        assert_eq!(lazy.instance_count(), 2);
        assert_eq!(lazy.lazy_constraint_count(), 2 * 243);
        assert_eq!(lazy.expanded_lazy_constraint_count(), 243);
        assert_eq!(lazy.total_constraint_count(), expanded.len());
        assert_eq!(lazy.registry().templates()[0].key.kind(), ShapeKind::Poseidon);
        for instance in 0..2 {
            for index in lazy.instance_range(instance).unwrap() {
                assert_eq!(lazy.fetch(index).unwrap(), expanded[index], "row {index}");
            }
        }
        lazy.verify_against(&expanded).unwrap();
    }

    #[test]
    fn mimc_hash_chain_round_trips() {
        let compiled = hash_chain_circuit(6);
        let expanded = compiled.constraints.clone();
        let witness = compiled.witness.clone();
        let lazy = LazyR1CS::lazify(compiled).unwrap();

        // First block runs with a constant key, the rest with a wire key.
        assert_eq!(lazy.shape_count(), 2);
        assert_eq!(lazy.instance_count(), 6);
        assert_eq!(lazy.lazy_constraint_count(), 6 * 273);
        assert_eq!(lazy.par_expand().unwrap(), expanded);
        assert_eq!(lazy.is_satisfied(&witness).unwrap(), None);
    }

    #[test]
    fn mixed_system_keeps_direct_rows() {
        let compiled = mixed_circuit();
        let expanded = compiled.constraints.clone();
        let lazy = LazyR1CS::lazify(compiled).unwrap();

        assert!(lazy.direct_constraint_count() > 0);
        assert_eq!(
            lazy.direct_constraint_count() + lazy.lazy_constraint_count(),
            lazy.total_constraint_count()
        );
        assert_eq!(lazy.slot(0), Some(Slot::Direct(0)));
        let collected = lazy.iter().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(collected, expanded);
        assert_eq!(
            lazy.fetch(expanded.len()),
            Err(LazyR1CSError::IndexOutOfRange {
                index: expanded.len(),
                total: expanded.len()
            })
        );
    }

    #[test]
    fn tampered_witness_is_rejected() {
        let compiled = poseidon_pair_circuit(true);
        let mut witness = compiled.witness.clone();
        let lazy = LazyR1CS::lazify(compiled).unwrap();
        assert_eq!(lazy.is_satisfied(&witness).unwrap(), None);

        // Output wire of the third row of the second permutation.
        let row = lazy.instance_range(1).unwrap().start + 2;
        let wire = lazy.fetch(row).unwrap().o().terms()[0].wire() as usize;
        witness[wire] += Fr::one();
        assert_eq!(lazy.is_satisfied(&witness).unwrap(), Some(row));
    }

    #[test]
    fn shifted_wires_follow_the_instance() {
        let compiled = poseidon_pair_circuit(false);
        let lazy = LazyR1CS::lazify(compiled).unwrap();
        let template = &lazy.registry().templates()[0];
        let second = &lazy.instances()[1];
        let shift = second.initial_wire() as i64 - template.base_wire as i64;
        assert!(shift > 0);

        let LazyInputs::Poseidon(inputs) = second else {
            panic!("expected a Poseidon record");
        };
        let mut coeffs = lazy.coeffs().frozen();
        let start = lazy.instance_range(1).unwrap().start;
        let mut slots = 0;
        for (local, row) in template.rows.iter().enumerate() {
            let fetched = lazy.fetch(start + local).unwrap();
            for side in Side::iter() {
                if template.key.is_input_slot(local, side) {
                    // Input slots read this instance's own operands, unshifted.
                    let sbox = local / 3;
                    let expected = inputs.state[sbox]
                        .add_constant(&template.slot_constants[sbox], &mut coeffs)
                        .unwrap();
                    assert_eq!(fetched.side(side), &expected);
                    assert_ne!(fetched.side(side), &row.side(side).shifted(shift).unwrap());
                    slots += 1;
                    continue;
                }
                let expected = row.side(side).shifted(shift).unwrap();
                assert_eq!(fetched.side(side), &expected);
                for (t, f) in row.side(side).terms().iter().zip(fetched.side(side).terms()) {
                    if t.wire() != 0 {
                        assert_eq!(f.wire() as i64, t.wire() as i64 + shift);
                    }
                }
            }
        }
        // L and R of each first-round square, R of each fifth power.
        assert_eq!(slots, 3 * inputs.state.len());
    }

    #[test]
    fn fetch_matches_a_compile_without_records() {
        let plain = mixed_circuit_with(CircuitBuilder::new().without_lazy_records());
        assert!(plain.lazy_inputs.is_empty());
        let lazy = LazyR1CS::lazify(mixed_circuit()).unwrap();
        assert!(lazy.instance_count() > 0);
        assert_eq!(lazy.total_constraint_count(), plain.constraints.len());

        for (index, expected) in plain.constraints.iter().enumerate() {
            assert_eq!(&lazy.fetch(index).unwrap(), expected, "row {index}");
        }
        assert_eq!(lazy.par_expand().unwrap(), plain.constraints);
        assert_eq!(lazy.is_satisfied(&plain.witness).unwrap(), None);
    }

    #[test]
    fn overlapping_records_are_rejected() {
        let mut builder = CircuitBuilder::<Fr>::new();
        let a = builder.secret_input(Fr::from(3u64)).unwrap();
        let b = builder.secret_input(Fr::from(4u64)).unwrap();
        builder.mimc_encrypt(&a, &b).unwrap();
        builder.mimc_encrypt(&b, &a).unwrap();
        let mut compiled = builder.finish();

        let LazyInputs::MimcEncrypt(second) = &mut compiled.lazy_inputs[1] else {
            panic!("expected a MiMC record");
        };
        second.loc = 100;
        assert_eq!(
            LazyR1CS::lazify(compiled).unwrap_err(),
            LazyR1CSError::OverlappingLazyRange {
                start: 100,
                end: 373,
                previous_end: 273
            }
        );
    }

    #[test]
    fn out_of_bounds_record_is_rejected() {
        let mut builder = CircuitBuilder::<Fr>::new();
        let a = builder.secret_input(Fr::from(3u64)).unwrap();
        builder.mimc_encrypt(&a, &a).unwrap();
        let mut compiled = builder.finish();
        compiled.lazy_inputs.push(LazyInputs::MimcEncrypt(MimcEncryptInputs {
            s0: LinearExpression::wire(1, Visibility::Secret),
            hh: LinearExpression::wire(1, Visibility::Secret),
            loc: 200,
            initial_wire: 2,
        }));
        let err = LazyR1CS::lazify(compiled).unwrap_err();
        assert!(err.is_corruption());
        assert!(matches!(
            err,
            LazyR1CSError::OverlappingLazyRange { .. } | LazyR1CSError::LazyRangeOutOfBounds { .. }
        ));

        let mut builder = CircuitBuilder::<Fr>::new();
        let a = builder.secret_input(Fr::from(3u64)).unwrap();
        builder.mul(&a, &a).unwrap();
        let mut compiled = builder.finish();
        compiled.lazy_inputs.push(LazyInputs::MimcEncrypt(MimcEncryptInputs {
            s0: a.clone(),
            hh: a,
            loc: 0,
            initial_wire: 2,
        }));
        assert_eq!(
            LazyR1CS::lazify(compiled).unwrap_err(),
            LazyR1CSError::LazyRangeOutOfBounds {
                start: 0,
                end: 273,
                total: 1
            }
        );
    }

    #[test]
    fn slots_interleave_direct_and_lazy() {
        let slots = build_slots(7, &[1..3, 4..6]);
        assert_eq!(
            slots,
            vec![
                Slot::Direct(0),
                Slot::Lazy { instance: 0, local: 0 },
                Slot::Lazy { instance: 0, local: 1 },
                Slot::Direct(1),
                Slot::Lazy { instance: 1, local: 0 },
                Slot::Lazy { instance: 1, local: 1 },
                Slot::Direct(2),
            ]
        );
    }

    #[test]
    fn persisted_parts_rebuild_the_system() {
        let compiled = mixed_circuit();
        let expanded = compiled.constraints.clone();
        let lazy = LazyR1CS::lazify(compiled).unwrap();
        let rebuilt = LazyR1CS::from_persisted(
            lazy.coeffs().clone(),
            lazy.direct_rows().to_vec(),
            lazy.instances().to_vec(),
            lazy.registry().templates().to_vec(),
            lazy.total_constraint_count(),
        )
        .unwrap();
        rebuilt.verify_against(&expanded).unwrap();

        let mut short = lazy.direct_rows().to_vec();
        short.pop();
        assert!(matches!(
            LazyR1CS::from_persisted(
                lazy.coeffs().clone(),
                short,
                lazy.instances().to_vec(),
                lazy.registry().templates().to_vec(),
                lazy.total_constraint_count(),
            ),
            Err(LazyR1CSError::DirectRowCountMismatch { .. })
        ));
    }
}
