//! Catalogue of repeatable gadget shapes.
//!
//! A shape is identified by a [`ShapeKey`] built from its structural
//! parameters. The first instance of a key becomes the representative: its
//! constraints are synthesised once into a [`ShapeTemplate`], and every other
//! instance with the same key is rebuilt from that template by shifting
//! internal wires and re-deriving the rows that read instance operands.

pub mod mimc;
pub mod poseidon;

use std::collections::HashMap;
use std::io::{Read, Write};

use ark_ff::PrimeField;
use ark_serialize::{
    CanonicalDeserialize, CanonicalSerialize, Compress, SerializationError, Valid, Validate,
};
use itertools::Itertools;
use sha3::{Digest, Keccak256};

use crate::r1cs::{
    builder::ConstraintSink,
    coeff_table::{CoeffResolver, CoeffTable},
    constraint::{Side, R1C},
    linear::LinearExpression,
    term::Visibility,
};
use crate::utils::errors::LazyR1CSError;

pub use mimc::MimcEncryptInputs;
pub use poseidon::PoseidonInputs;

/// Rows emitted by one x^5 S-box.
pub const SBOX_ROWS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ShapeKind {
    #[strum(serialize = "mimc-enc")]
    MimcEncrypt,
    #[strum(serialize = "poseidon")]
    Poseidon,
}

impl ShapeKind {
    fn tag(&self) -> u8 {
        match self {
            ShapeKind::MimcEncrypt => 0,
            ShapeKind::Poseidon => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, SerializationError> {
        match tag {
            0 => Ok(ShapeKind::MimcEncrypt),
            1 => Ok(ShapeKind::Poseidon),
            _ => Err(SerializationError::InvalidData),
        }
    }
}

/// Everything that determines a template: gadget kind, operand count and the
/// operands that are compile-time constants together with their values.
/// Instances share a key iff their templates agree up to a wire shift.
#[derive(Clone, Debug, PartialEq, Eq, Hash, CanonicalSerialize, CanonicalDeserialize)]
pub struct ShapeKey<F: PrimeField> {
    kind: ShapeKind,
    width: usize,
    /// `(operand position, value)`, sorted by position.
    constants: Vec<(usize, F)>,
}

impl<F: PrimeField> ShapeKey<F> {
    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn constants(&self) -> &[(usize, F)] {
        &self.constants
    }

    pub fn is_constant_at(&self, position: usize) -> bool {
        self.constants.iter().any(|(p, _)| *p == position)
    }

    pub fn non_constant_count(&self) -> usize {
        self.width - self.constants.len()
    }

    /// Exact number of rows the shape expands to.
    pub fn constraint_count(&self) -> Result<usize, LazyR1CSError> {
        match self.kind {
            ShapeKind::MimcEncrypt => Ok(mimc::constraint_count(self.non_constant_count())),
            ShapeKind::Poseidon => {
                poseidon::constraint_count(self.width, self.non_constant_count())
            }
        }
    }

    /// Whether `side` of template row `local` reads the instance's own
    /// operands, in which case it is rebuilt per instance instead of shifted.
    pub fn is_input_slot(&self, local: usize, side: Side) -> bool {
        let reads_sbox_input = match local % SBOX_ROWS {
            0 => matches!(side, Side::L | Side::R),
            2 => side == Side::R,
            _ => false,
        };
        if !reads_sbox_input {
            return false;
        }
        let sbox = local / SBOX_ROWS;
        match self.kind {
            // The key operand enters every round unless it is a constant.
            ShapeKind::MimcEncrypt => sbox == 0 || !self.is_constant_at(mimc::KEY_POSITION),
            ShapeKind::Poseidon => sbox < self.non_constant_count(),
        }
    }
}

impl<F: PrimeField> std::fmt::Display for ShapeKey<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-t{}", self.kind, self.width)?;
        if !self.constants.is_empty() {
            write!(
                f,
                "[{}]",
                self.constants
                    .iter()
                    .map(|(p, v)| format!("{p}={v}"))
                    .join(",")
            )?;
        }
        Ok(())
    }
}

impl CanonicalSerialize for ShapeKind {
    fn serialize_with_mode<W: Write>(
        &self,
        writer: W,
        compress: Compress,
    ) -> Result<(), SerializationError> {
        self.tag().serialize_with_mode(writer, compress)
    }

    fn serialized_size(&self, compress: Compress) -> usize {
        self.tag().serialized_size(compress)
    }
}

impl Valid for ShapeKind {
    fn check(&self) -> Result<(), SerializationError> {
        Ok(())
    }
}

impl CanonicalDeserialize for ShapeKind {
    fn deserialize_with_mode<R: Read>(
        reader: R,
        compress: Compress,
        validate: Validate,
    ) -> Result<Self, SerializationError> {
        ShapeKind::from_tag(u8::deserialize_with_mode(reader, compress, validate)?)
    }
}

/// A shape record emitted by the front end for one gadget invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LazyInputs {
    MimcEncrypt(MimcEncryptInputs),
    Poseidon(PoseidonInputs),
}

impl LazyInputs {
    pub fn kind(&self) -> ShapeKind {
        match self {
            LazyInputs::MimcEncrypt(_) => ShapeKind::MimcEncrypt,
            LazyInputs::Poseidon(_) => ShapeKind::Poseidon,
        }
    }

    /// Virtual index of the first constraint the instance occupies.
    pub fn loc(&self) -> usize {
        match self {
            LazyInputs::MimcEncrypt(inputs) => inputs.loc,
            LazyInputs::Poseidon(inputs) => inputs.loc,
        }
    }

    /// Lowest internal wire the instance introduces.
    pub fn initial_wire(&self) -> u32 {
        match self {
            LazyInputs::MimcEncrypt(inputs) => inputs.initial_wire,
            LazyInputs::Poseidon(inputs) => inputs.initial_wire,
        }
    }

    pub fn operands(&self) -> Vec<&LinearExpression> {
        match self {
            LazyInputs::MimcEncrypt(inputs) => vec![&inputs.s0, &inputs.hh],
            LazyInputs::Poseidon(inputs) => inputs.state.iter().collect(),
        }
    }

    pub fn shape_key<F: PrimeField>(
        &self,
        coeffs: &CoeffTable<F>,
    ) -> Result<ShapeKey<F>, LazyR1CSError> {
        if let LazyInputs::Poseidon(inputs) = self {
            poseidon::partial_rounds(inputs.state.len())?;
        }
        let operands = self.operands();
        let mut constants = Vec::new();
        for (position, operand) in operands.iter().enumerate() {
            if let Some(value) = operand.constant_value(coeffs)? {
                constants.push((position, value));
            }
        }
        Ok(ShapeKey {
            kind: self.kind(),
            width: operands.len(),
            constants,
        })
    }

    pub fn constraint_count<F: PrimeField>(
        &self,
        coeffs: &CoeffTable<F>,
    ) -> Result<usize, LazyR1CSError> {
        self.shape_key(coeffs)?.constraint_count()
    }

    /// Runs the gadget symbolically from this instance's operands, allocating
    /// internal wires from [`LazyInputs::initial_wire`]. Returns the rows and
    /// the round constants that input-slot rows are rebuilt from.
    #[tracing::instrument(skip_all, name = "LazyInputs::synthesize")]
    pub fn synthesize<F: PrimeField>(
        &self,
        coeffs: &mut CoeffTable<F>,
    ) -> Result<(Vec<R1C>, Vec<F>), LazyR1CSError> {
        let mut sink = TemplateSink::new(coeffs, self.initial_wire());
        let slot_constants = match self {
            LazyInputs::MimcEncrypt(inputs) => {
                let constants = mimc::round_constants::<F>();
                mimc::encrypt(&mut sink, &constants, &inputs.s0, &inputs.hh)?;
                constants
            }
            LazyInputs::Poseidon(inputs) => {
                let params = poseidon::PoseidonParams::<F>::new(inputs.state.len())?;
                poseidon::permutation(&mut sink, &params, &inputs.state)?;
                params.round_constants[..params.width].to_vec()
            }
        };
        Ok((sink.rows, slot_constants))
    }

    /// This instance's S-box input for input-slot row `local`.
    pub fn input_operand<F: PrimeField>(
        &self,
        template: &ShapeTemplate<F>,
        local: usize,
        coeffs: &mut impl CoeffResolver<F>,
    ) -> Result<LinearExpression, LazyR1CSError> {
        let sbox = local / SBOX_ROWS;
        match self {
            LazyInputs::MimcEncrypt(inputs) => {
                let constant = template
                    .slot_constants
                    .get(sbox)
                    .ok_or(LazyR1CSError::IndexOutOfRange {
                        index: local,
                        total: template.rows.len(),
                    })?;
                inputs.round_input(sbox, constant, coeffs)
            }
            LazyInputs::Poseidon(inputs) => {
                let position = (0..inputs.state.len())
                    .filter(|p| !template.key.is_constant_at(*p))
                    .nth(sbox)
                    .ok_or(LazyR1CSError::IndexOutOfRange {
                        index: local,
                        total: template.rows.len(),
                    })?;
                let constant = template.slot_constants.get(position).ok_or(
                    LazyR1CSError::IndexOutOfRange {
                        index: local,
                        total: template.rows.len(),
                    },
                )?;
                inputs.state[position].add_constant(constant, coeffs)
            }
        }
    }

    /// Rebuilds every input-slot operand once, so that each coefficient a later
    /// `fetch` needs is present in `coeffs`.
    pub fn resolve_input_slots<F: PrimeField>(
        &self,
        template: &ShapeTemplate<F>,
        coeffs: &mut impl CoeffResolver<F>,
    ) -> Result<(), LazyR1CSError> {
        for local in (0..template.rows.len()).step_by(SBOX_ROWS) {
            if template.key.is_input_slot(local, Side::L) {
                self.input_operand(template, local, coeffs)?;
            }
        }
        Ok(())
    }
}

impl CanonicalSerialize for LazyInputs {
    fn serialize_with_mode<W: Write>(
        &self,
        mut writer: W,
        compress: Compress,
    ) -> Result<(), SerializationError> {
        self.kind().tag().serialize_with_mode(&mut writer, compress)?;
        match self {
            LazyInputs::MimcEncrypt(inputs) => inputs.serialize_with_mode(writer, compress),
            LazyInputs::Poseidon(inputs) => inputs.serialize_with_mode(writer, compress),
        }
    }

    fn serialized_size(&self, compress: Compress) -> usize {
        1 + match self {
            LazyInputs::MimcEncrypt(inputs) => inputs.serialized_size(compress),
            LazyInputs::Poseidon(inputs) => inputs.serialized_size(compress),
        }
    }
}

impl Valid for LazyInputs {
    fn check(&self) -> Result<(), SerializationError> {
        Ok(())
    }
}

impl CanonicalDeserialize for LazyInputs {
    fn deserialize_with_mode<R: Read>(
        mut reader: R,
        compress: Compress,
        validate: Validate,
    ) -> Result<Self, SerializationError> {
        let kind = ShapeKind::from_tag(u8::deserialize_with_mode(
            &mut reader,
            compress,
            validate,
        )?)?;
        Ok(match kind {
            ShapeKind::MimcEncrypt => LazyInputs::MimcEncrypt(
                MimcEncryptInputs::deserialize_with_mode(reader, compress, validate)?,
            ),
            ShapeKind::Poseidon => LazyInputs::Poseidon(PoseidonInputs::deserialize_with_mode(
                reader, compress, validate,
            )?),
        })
    }
}

/// The one-time expansion of a shape at its representative's wires.
#[derive(Clone, Debug, PartialEq, CanonicalSerialize, CanonicalDeserialize)]
pub struct ShapeTemplate<F: PrimeField> {
    pub key: ShapeKey<F>,
    /// Index of the representative among the system's lazy instances.
    pub representative: u32,
    /// Initial wire of the representative; shifts are measured from here.
    pub base_wire: u32,
    pub rows: Vec<R1C>,
    /// Round constants that input-slot rows add to the instance operands.
    pub slot_constants: Vec<F>,
}

impl<F: PrimeField> ShapeTemplate<F> {
    /// Wire shift that maps this template onto `inputs`.
    pub fn shift_for(&self, inputs: &LazyInputs) -> i64 {
        inputs.initial_wire() as i64 - self.base_wire as i64
    }
}

/// One template per distinct [`ShapeKey`].
#[derive(Clone, Debug, Default)]
pub struct ShapeRegistry<F: PrimeField> {
    templates: Vec<ShapeTemplate<F>>,
    by_key: HashMap<ShapeKey<F>, usize>,
}

impl<F: PrimeField> ShapeRegistry<F> {
    pub fn new() -> Self {
        Self {
            templates: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    /// Rebuilds the key index over persisted templates.
    pub fn from_templates(templates: Vec<ShapeTemplate<F>>) -> Result<Self, LazyR1CSError> {
        let mut by_key = HashMap::with_capacity(templates.len());
        for (index, template) in templates.iter().enumerate() {
            let expected = template.key.constraint_count()?;
            if expected != template.rows.len() {
                return Err(LazyR1CSError::TemplateSizeMismatch {
                    key: template.key.to_string(),
                    expected,
                    actual: template.rows.len(),
                });
            }
            if let Some(previous) = by_key.insert(template.key.clone(), index) {
                return Err(LazyR1CSError::ShapeKeyCollision {
                    key: template.key.to_string(),
                    registered: templates[previous].rows.len(),
                    instance: template.rows.len(),
                });
            }
        }
        Ok(Self { templates, by_key })
    }

    /// Index of the template for `inputs`, synthesising it on first sight.
    /// `instance` is the index `inputs` will have among the lazy instances.
    pub fn ensure(
        &mut self,
        instance: usize,
        inputs: &LazyInputs,
        coeffs: &mut CoeffTable<F>,
    ) -> Result<usize, LazyR1CSError> {
        let key = inputs.shape_key(coeffs)?;
        let expected = key.constraint_count()?;
        if let Some(index) = self.by_key.get(&key) {
            let registered = self.templates[*index].rows.len();
            if registered != expected {
                return Err(LazyR1CSError::ShapeKeyCollision {
                    key: key.to_string(),
                    registered,
                    instance: expected,
                });
            }
            return Ok(*index);
        }

        let (rows, slot_constants) = inputs.synthesize(coeffs)?;
        if rows.len() != expected {
            return Err(LazyR1CSError::TemplateSizeMismatch {
                key: key.to_string(),
                expected,
                actual: rows.len(),
            });
        }
        tracing::debug!("new shape {} with {} rows", key, rows.len());

        let index = self.templates.len();
        self.by_key.insert(key.clone(), index);
        self.templates.push(ShapeTemplate {
            key,
            representative: instance as u32,
            base_wire: inputs.initial_wire(),
            rows,
            slot_constants,
        });
        Ok(index)
    }

    pub fn index_of(&self, key: &ShapeKey<F>) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    pub fn get(&self, index: usize) -> Result<&ShapeTemplate<F>, LazyR1CSError> {
        self.templates
            .get(index)
            .ok_or(LazyR1CSError::UnregisteredShape(index))
    }

    pub fn templates(&self) -> &[ShapeTemplate<F>] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Rows materialised across all templates.
    pub fn expanded_row_count(&self) -> usize {
        self.templates.iter().map(|t| t.rows.len()).sum()
    }
}

/// Collects the rows of a symbolic gadget run, allocating internal wires
/// sequentially from the representative's initial wire.
pub(crate) struct TemplateSink<'a, F: PrimeField> {
    coeffs: &'a mut CoeffTable<F>,
    next_wire: u32,
    rows: Vec<R1C>,
}

impl<'a, F: PrimeField> TemplateSink<'a, F> {
    pub(crate) fn new(coeffs: &'a mut CoeffTable<F>, initial_wire: u32) -> Self {
        Self {
            coeffs,
            next_wire: initial_wire,
            rows: Vec::new(),
        }
    }
}

impl<F: PrimeField> ConstraintSink<F> for TemplateSink<'_, F> {
    fn coeffs(&mut self) -> &mut CoeffTable<F> {
        self.coeffs
    }

    fn mul_gate(
        &mut self,
        a: &LinearExpression,
        b: &LinearExpression,
    ) -> Result<LinearExpression, LazyR1CSError> {
        let wire = self.next_wire;
        self.next_wire = wire
            .checked_add(1)
            .ok_or(LazyR1CSError::WireOverflow { wire, shift: 1 })?;
        let out = LinearExpression::wire(wire, Visibility::Internal);
        self.rows.push(R1C::new(a.clone(), b.clone(), out.clone()));
        Ok(out)
    }
}

/// `x^5` as three multiplication rows, or a field computation when `x` is a
/// compile-time constant.
pub(crate) fn pow5<F: PrimeField, S: ConstraintSink<F>>(
    sink: &mut S,
    x: &LinearExpression,
) -> Result<LinearExpression, LazyR1CSError> {
    if let Some(value) = sink.constant_value(x)? {
        return LinearExpression::constant_of(&value.pow([5u64]), sink.coeffs());
    }
    let r = sink.mul_gate(x, x)?;
    let r2 = sink.mul_gate(&r, &r)?;
    sink.mul_gate(&r2, x)
}

/// Keccak-256 hash chain: `h_0 = H(seed)`, `h_{i+1} = H(h_i)`; the field
/// elements are `h_1, h_2, ...` read big-endian and reduced.
pub(crate) fn keccak_chain<F: PrimeField>(seed: &[u8], count: usize) -> Vec<F> {
    let mut digest = Keccak256::digest(seed);
    (0..count)
        .map(|_| {
            digest = Keccak256::digest(digest);
            F::from_be_bytes_mod_order(&digest)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r1cs::term::COEFF_ID_TWO;
    use ark_bn254::Fr;
    use ark_std::Zero;

    fn wire(w: u32) -> LinearExpression {
        LinearExpression::wire(w, Visibility::Secret)
    }

    fn poseidon(state: Vec<LinearExpression>, initial_wire: u32) -> LazyInputs {
        LazyInputs::Poseidon(PoseidonInputs {
            state,
            loc: 0,
            initial_wire,
        })
    }

    #[test]
    fn key_is_stable_across_instances() {
        let mut table = CoeffTable::<Fr>::new();
        let zero = LinearExpression::zero();
        let a = poseidon(vec![zero.clone(), wire(1), wire(2)], 10);
        let b = poseidon(vec![zero.clone(), wire(7), wire(9)], 500);
        assert_eq!(a.shape_key(&table).unwrap(), b.shape_key(&table).unwrap());

        let five = LinearExpression::constant_of(&Fr::from(5u64), &mut table).unwrap();
        let c = poseidon(vec![five, wire(7), wire(9)], 500);
        let d = poseidon(vec![wire(3), wire(7), wire(9)], 500);
        let e = poseidon(vec![zero, wire(7), wire(9), wire(10)], 500);
        let keys = [&a, &c, &d, &e].map(|i| i.shape_key(&table).unwrap());
        for i in 0..keys.len() {
            for j in i + 1..keys.len() {
                assert_ne!(keys[i], keys[j]);
            }
        }
        assert_eq!(keys[0].constants(), &[(0, Fr::zero())]);
    }

    #[test]
    fn unsupported_width_is_rejected() {
        let table = CoeffTable::<Fr>::new();
        let narrow = poseidon(vec![wire(1), wire(2)], 10);
        assert_eq!(
            narrow.shape_key(&table),
            Err(LazyR1CSError::UnsupportedWidth(2))
        );
        let wide = poseidon((1..=14).map(wire).collect(), 20);
        assert_eq!(wide.shape_key(&table), Err(LazyR1CSError::UnsupportedWidth(14)));
        assert!(!LazyR1CSError::UnsupportedWidth(14).is_corruption());
    }

    #[test]
    fn input_slots_follow_constant_positions() {
        let mut table = CoeffTable::<Fr>::new();
        let key = poseidon(vec![LinearExpression::zero(), wire(1), wire(2)], 10)
            .shape_key(&table)
            .unwrap();
        // Two non-constant inputs: S-boxes 0 and 1 read instance operands.
        for local in [0, 3] {
            assert!(key.is_input_slot(local, Side::L));
            assert!(key.is_input_slot(local, Side::R));
            assert!(!key.is_input_slot(local, Side::O));
            assert!(key.is_input_slot(local + 2, Side::R));
            assert!(!key.is_input_slot(local + 2, Side::L));
            assert!(!key.is_input_slot(local + 1, Side::L));
        }
        assert!(!key.is_input_slot(6, Side::L));

        let h = LinearExpression::constant_of(&Fr::from(3u64), &mut table).unwrap();
        let constant_key = LazyInputs::MimcEncrypt(MimcEncryptInputs {
            s0: wire(1),
            hh: h,
            loc: 0,
            initial_wire: 2,
        })
        .shape_key(&table)
        .unwrap();
        assert!(constant_key.is_input_slot(0, Side::L));
        assert!(!constant_key.is_input_slot(3, Side::L));

        let variable_key = LazyInputs::MimcEncrypt(MimcEncryptInputs {
            s0: wire(1),
            hh: wire(2),
            loc: 0,
            initial_wire: 3,
        })
        .shape_key(&table)
        .unwrap();
        assert!(variable_key.is_input_slot(3, Side::L));
        assert!(variable_key.is_input_slot(5, Side::R));
        assert!(!variable_key.is_input_slot(4, Side::R));
    }

    #[test]
    fn registry_synthesizes_once_per_key() {
        let mut table = CoeffTable::<Fr>::new();
        let mut registry = ShapeRegistry::new();
        let zero = LinearExpression::zero();
        let a = poseidon(vec![zero.clone(), wire(1), wire(2)], 3);
        let b = poseidon(vec![zero, wire(5), wire(6)], 1000);

        let first = registry.ensure(0, &a, &mut table).unwrap();
        let coeffs_after_first = table.len();
        let second = registry.ensure(1, &b, &mut table).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(table.len(), coeffs_after_first);

        let template = registry.get(first).unwrap();
        assert_eq!(template.representative, 0);
        assert_eq!(template.base_wire, 3);
        assert_eq!(template.rows.len(), template.key.constraint_count().unwrap());
        assert_eq!(template.shift_for(&b), 997);
        assert!(matches!(
            registry.get(5),
            Err(LazyR1CSError::UnregisteredShape(5))
        ));
    }

    #[test]
    fn from_templates_rejects_duplicate_keys() {
        let mut table = CoeffTable::<Fr>::new();
        let mut registry = ShapeRegistry::new();
        let a = poseidon(vec![LinearExpression::zero(), wire(1), wire(2)], 3);
        registry.ensure(0, &a, &mut table).unwrap();

        let templates = vec![registry.templates()[0].clone(), registry.templates()[0].clone()];
        assert!(matches!(
            ShapeRegistry::from_templates(templates),
            Err(LazyR1CSError::ShapeKeyCollision { .. })
        ));

        let mut truncated = registry.templates()[0].clone();
        truncated.rows.pop();
        assert!(matches!(
            ShapeRegistry::from_templates(vec![truncated]),
            Err(LazyR1CSError::TemplateSizeMismatch { .. })
        ));
    }

    #[test]
    fn pow5_folds_constants() {
        let mut table = CoeffTable::<Fr>::new();
        let mut sink = TemplateSink::new(&mut table, 10);
        let two = LinearExpression::constant(COEFF_ID_TWO);
        let folded = pow5(&mut sink, &two).unwrap();
        assert!(sink.rows.is_empty());
        let out = pow5(&mut sink, &wire(1)).unwrap();
        assert_eq!(sink.rows.len(), SBOX_ROWS);
        assert_eq!(out, LinearExpression::wire(12, Visibility::Internal));
        assert_eq!(
            folded.constant_value(&table).unwrap(),
            Some(Fr::from(32u64))
        );
        assert_eq!(folded.terms()[0].wire(), 0);
    }
}
