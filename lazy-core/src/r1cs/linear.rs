//! Linear expressions over wires in canonical form.
//!
//! A canonical [`LinearExpression`] is sorted by `(visibility, wire)`, holds each
//! wire at most once and never carries a zero coefficient. The empty expression
//! is the constant zero. Every operation below returns a new value; nothing
//! mutates an expression that somebody else may still hold.

use ark_ff::PrimeField;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::Zero;

use super::coeff_table::CoeffResolver;
use super::term::{
    CoeffId, Term, Visibility, COEFF_ID_MINUS_ONE, COEFF_ID_ONE, COEFF_ID_TWO, COEFF_ID_ZERO,
    ONE_WIRE,
};
use crate::utils::errors::LazyR1CSError;

#[derive(Clone, Default, PartialEq, Eq, Hash, CanonicalSerialize, CanonicalDeserialize)]
pub struct LinearExpression(Vec<Term>);

impl LinearExpression {
    /// Wraps `terms` as given. Call [`LinearExpression::reduce`] before
    /// comparing or persisting unless the terms are known to be canonical.
    pub fn new(terms: Vec<Term>) -> Self {
        LinearExpression(terms)
    }

    pub fn zero() -> Self {
        LinearExpression(vec![])
    }

    /// `coeff * 1`.
    pub fn constant(coeff_id: CoeffId) -> Self {
        if coeff_id == COEFF_ID_ZERO {
            Self::zero()
        } else {
            LinearExpression(vec![Term::constant(coeff_id)])
        }
    }

    pub fn constant_of<F: PrimeField>(
        value: &F,
        coeffs: &mut impl CoeffResolver<F>,
    ) -> Result<Self, LazyR1CSError> {
        Ok(Self::constant(coeffs.resolve(value)?))
    }

    /// `1 * wire`.
    pub fn wire(wire: u32, visibility: Visibility) -> Self {
        LinearExpression(vec![Term::new(COEFF_ID_ONE, wire, visibility)])
    }

    pub fn terms(&self) -> &[Term] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Terms ordered by visibility, then wire index.
    pub fn sorted(&self) -> Self {
        let mut terms = self.0.clone();
        terms.sort_by_key(Term::key);
        LinearExpression(terms)
    }

    pub fn is_canonical(&self) -> bool {
        self.0.iter().all(|t| t.coeff_id() != COEFF_ID_ZERO)
            && self.0.windows(2).all(|w| w[0].key() < w[1].key())
    }

    /// Sorts, folds terms on the same wire by field addition and drops zero
    /// coefficients.
    pub fn reduce<F: PrimeField>(
        self,
        coeffs: &mut impl CoeffResolver<F>,
    ) -> Result<Self, LazyR1CSError> {
        let mut terms = self.0;
        terms.sort_by_key(Term::key);

        let mut reduced: Vec<Term> = Vec::with_capacity(terms.len());
        let mut pending: Option<(Term, F)> = None;
        for term in terms {
            if let Some((head, sum)) = pending.as_mut() {
                if head.key() == term.key() {
                    *sum += coeffs.value(term.coeff_id())?;
                    continue;
                }
            }
            if let Some((head, sum)) = pending.take() {
                push_folded(&mut reduced, head, sum, coeffs)?;
            }
            pending = Some((term, coeffs.value(term.coeff_id())?));
        }
        if let Some((head, sum)) = pending {
            push_folded(&mut reduced, head, sum, coeffs)?;
        }
        Ok(LinearExpression(reduced))
    }

    /// `self + other`, reduced.
    pub fn add<F: PrimeField>(
        &self,
        other: &Self,
        coeffs: &mut impl CoeffResolver<F>,
    ) -> Result<Self, LazyR1CSError> {
        let mut terms = Vec::with_capacity(self.len() + other.len());
        terms.extend_from_slice(&self.0);
        terms.extend_from_slice(&other.0);
        LinearExpression(terms).reduce(coeffs)
    }

    /// `self + value`, reduced.
    pub fn add_constant<F: PrimeField>(
        &self,
        value: &F,
        coeffs: &mut impl CoeffResolver<F>,
    ) -> Result<Self, LazyR1CSError> {
        let constant = Self::constant_of(value, coeffs)?;
        self.add(&constant, coeffs)
    }

    /// `lambda * self`. Reserved coefficients are scaled without a table
    /// lookup; products that vanish are dropped.
    pub fn scale<F: PrimeField>(
        &self,
        lambda: &F,
        coeffs: &mut impl CoeffResolver<F>,
    ) -> Result<Self, LazyR1CSError> {
        if lambda.is_zero() {
            return Ok(Self::zero());
        }
        let mut terms = Vec::with_capacity(self.len());
        for term in &self.0 {
            let scaled = match term.coeff_id() {
                COEFF_ID_ZERO => continue,
                COEFF_ID_ONE => *lambda,
                COEFF_ID_MINUS_ONE => -*lambda,
                COEFF_ID_TWO => *lambda + lambda,
                id => coeffs.value(id)? * lambda,
            };
            if scaled.is_zero() {
                continue;
            }
            terms.push(term.with_coeff_id(coeffs.resolve(&scaled)?));
        }
        Ok(LinearExpression(terms))
    }

    /// The value of the expression if it is a compile-time constant, i.e. empty
    /// or a single term on the constant-one wire.
    pub fn constant_value<F: PrimeField>(
        &self,
        coeffs: &impl CoeffResolver<F>,
    ) -> Result<Option<F>, LazyR1CSError> {
        match self.0.as_slice() {
            [] => Ok(Some(F::zero())),
            [term] if term.is_constant() => Ok(Some(coeffs.value(term.coeff_id())?)),
            _ => Ok(None),
        }
    }

    /// Adds `shift` to every wire except the constant-one wire.
    pub fn shifted(&self, shift: i64) -> Result<Self, LazyR1CSError> {
        if shift == 0 {
            return Ok(self.clone());
        }
        self.0
            .iter()
            .map(|term| {
                if term.wire() == ONE_WIRE {
                    return Ok(*term);
                }
                let shifted = term.wire() as i64 + shift;
                u32::try_from(shifted)
                    .ok()
                    .filter(|w| *w != ONE_WIRE)
                    .map(|w| term.with_wire(w))
                    .ok_or(LazyR1CSError::WireOverflow {
                        wire: term.wire(),
                        shift,
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(LinearExpression)
    }

    /// Evaluates the expression against a dense witness indexed by wire.
    pub fn evaluate<F: PrimeField>(
        &self,
        witness: &[F],
        coeffs: &impl CoeffResolver<F>,
    ) -> Result<F, LazyR1CSError> {
        let mut acc = F::zero();
        for term in &self.0 {
            let value = witness
                .get(term.wire() as usize)
                .ok_or(LazyR1CSError::UnknownWire(term.wire()))?;
            acc += coeffs.value(term.coeff_id())? * value;
        }
        Ok(acc)
    }
}

fn push_folded<F: PrimeField>(
    out: &mut Vec<Term>,
    head: Term,
    sum: F,
    coeffs: &mut impl CoeffResolver<F>,
) -> Result<(), LazyR1CSError> {
    if !sum.is_zero() {
        out.push(head.with_coeff_id(coeffs.resolve(&sum)?));
    }
    Ok(())
}

impl std::fmt::Debug for LinearExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LE(")?;
        for (index, term) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, " + ")?;
            }
            write!(f, "{:?}", term)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r1cs::coeff_table::CoeffTable;
    use ark_bn254::Fr;
    use ark_std::One;

    fn secret(wire: u32) -> LinearExpression {
        LinearExpression::wire(wire, Visibility::Secret)
    }

    #[test]
    fn reduce_merges_and_drops_zero() {
        let mut table = CoeffTable::<Fr>::new();
        let three = table.id(&Fr::from(3u64)).unwrap();
        let raw = LinearExpression::new(vec![
            Term::new(COEFF_ID_ONE, 5, Visibility::Internal),
            Term::new(three, 2, Visibility::Secret),
            Term::new(COEFF_ID_MINUS_ONE, 5, Visibility::Internal),
            Term::constant(COEFF_ID_TWO),
            Term::new(COEFF_ID_ONE, 2, Visibility::Secret),
        ]);
        let reduced = raw.reduce(&mut table).unwrap();
        let four = table.get_id(&Fr::from(4u64)).unwrap();
        assert_eq!(
            reduced.terms(),
            &[
                Term::constant(COEFF_ID_TWO),
                Term::new(four, 2, Visibility::Secret)
            ]
        );
        assert!(reduced.is_canonical());
    }

    #[test]
    fn equality_is_canonical() {
        let mut table = CoeffTable::<Fr>::new();
        let a = secret(1).add(&secret(2), &mut table).unwrap();
        let b = secret(2).add(&secret(1), &mut table).unwrap();
        assert_eq!(a, b);
        let c = sub(&a, &secret(1), &mut table);
        assert_eq!(c, secret(2));
    }

    #[test]
    fn scale_uses_reserved_shortcuts() {
        let mut table = CoeffTable::<Fr>::new();
        let le = LinearExpression::new(vec![
            Term::constant(COEFF_ID_TWO),
            Term::new(COEFF_ID_MINUS_ONE, 3, Visibility::Secret),
            Term::new(COEFF_ID_ONE, 4, Visibility::Internal),
        ]);
        let scaled = le.scale(&Fr::from(5u64), &mut table).unwrap();
        let ten = table.get_id(&Fr::from(10u64)).unwrap();
        let minus_five = table.get_id(&-Fr::from(5u64)).unwrap();
        let five = table.get_id(&Fr::from(5u64)).unwrap();
        assert_eq!(
            scaled.terms(),
            &[
                Term::constant(ten),
                Term::new(minus_five, 3, Visibility::Secret),
                Term::new(five, 4, Visibility::Internal),
            ]
        );
        assert!(le.scale(&Fr::zero(), &mut table).unwrap().is_empty());
    }

    #[test]
    fn constant_value_detects_compile_time_constants() {
        let mut table = CoeffTable::<Fr>::new();
        assert_eq!(
            LinearExpression::zero().constant_value(&table).unwrap(),
            Some(Fr::zero())
        );
        let seven = LinearExpression::constant_of(&Fr::from(7u64), &mut table).unwrap();
        assert_eq!(seven.constant_value(&table).unwrap(), Some(Fr::from(7u64)));
        assert_eq!(secret(3).constant_value(&table).unwrap(), None);
        let mixed = seven.add(&secret(3), &mut table).unwrap();
        assert_eq!(mixed.constant_value(&table).unwrap(), None);
    }

    #[test]
    fn shift_skips_constant_wire() {
        let mut table = CoeffTable::<Fr>::new();
        let le = LinearExpression::wire(10, Visibility::Internal)
            .add_constant(&Fr::from(9u64), &mut table)
            .unwrap();
        let shifted = le.shifted(32).unwrap();
        assert_eq!(shifted.terms()[0], le.terms()[0]);
        assert_eq!(shifted.terms()[1].wire(), 42);
        assert_eq!(
            le.shifted(-10),
            Err(LazyR1CSError::WireOverflow {
                wire: 10,
                shift: -10
            })
        );
    }

    #[test]
    fn evaluate_against_witness() {
        let mut table = CoeffTable::<Fr>::new();
        let le = secret(1)
            .scale(&Fr::from(3u64), &mut table)
            .unwrap()
            .add_constant(&Fr::one(), &mut table)
            .unwrap();
        let witness = vec![Fr::one(), Fr::from(4u64)];
        assert_eq!(le.evaluate(&witness, &table).unwrap(), Fr::from(13u64));
        assert_eq!(
            secret(2).evaluate(&witness, &table),
            Err(LazyR1CSError::UnknownWire(2))
        );
    }

    fn sub(a: &LinearExpression, b: &LinearExpression, table: &mut CoeffTable<Fr>) -> LinearExpression {
        let neg = b.scale(&-Fr::one(), table).unwrap();
        a.add(&neg, table).unwrap()
    }
}
