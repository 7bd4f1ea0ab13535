//! A Term is a (coefficient id, wire, visibility) triple packed into one word.

use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

pub type CoeffId = u32;

pub const COEFF_ID_ZERO: CoeffId = 0;
pub const COEFF_ID_ONE: CoeffId = 1;
pub const COEFF_ID_MINUS_ONE: CoeffId = 2;
pub const COEFF_ID_TWO: CoeffId = 3;

/// Number of reserved coefficient ids.
pub const NUM_RESERVED_COEFFS: usize = 4;

/// Coefficient ids occupy 30 bits of a packed term.
pub const MAX_COEFF_ID: CoeffId = (1 << 30) - 1;

/// Index of the wire that always carries the value one.
pub const ONE_WIRE: u32 = 0;

const WIRE_MASK: u64 = 0xffff_ffff;
const COEFF_SHIFT: u32 = 32;
const COEFF_MASK: u64 = MAX_COEFF_ID as u64;
const VISIBILITY_SHIFT: u32 = 62;

/// Ordering matters: linear expressions are sorted by visibility first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
#[repr(u8)]
pub enum Visibility {
    Public = 0,
    Secret = 1,
    Internal = 2,
}

impl Visibility {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Visibility::Public,
            1 => Visibility::Secret,
            _ => Visibility::Internal,
        }
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, CanonicalSerialize, CanonicalDeserialize)]
pub struct Term(u64);

impl Term {
    pub fn new(coeff_id: CoeffId, wire: u32, visibility: Visibility) -> Self {
        debug_assert!(coeff_id <= MAX_COEFF_ID);
        Term(
            ((visibility as u64) << VISIBILITY_SHIFT)
                | ((coeff_id as u64 & COEFF_MASK) << COEFF_SHIFT)
                | wire as u64,
        )
    }

    /// `coeff * 1`, the form constants take inside a linear expression.
    pub fn constant(coeff_id: CoeffId) -> Self {
        Term::new(coeff_id, ONE_WIRE, Visibility::Public)
    }

    pub fn coeff_id(&self) -> CoeffId {
        ((self.0 >> COEFF_SHIFT) & COEFF_MASK) as CoeffId
    }

    pub fn wire(&self) -> u32 {
        (self.0 & WIRE_MASK) as u32
    }

    pub fn visibility(&self) -> Visibility {
        Visibility::from_bits(self.0 >> VISIBILITY_SHIFT)
    }

    pub fn unpack(&self) -> (CoeffId, u32, Visibility) {
        (self.coeff_id(), self.wire(), self.visibility())
    }

    /// Sort key of canonical linear expressions.
    pub fn key(&self) -> (Visibility, u32) {
        (self.visibility(), self.wire())
    }

    pub fn is_constant(&self) -> bool {
        self.wire() == ONE_WIRE && self.visibility() == Visibility::Public
    }

    pub fn with_coeff_id(self, coeff_id: CoeffId) -> Self {
        Term::new(coeff_id, self.wire(), self.visibility())
    }

    pub fn with_wire(self, wire: u32) -> Self {
        Term::new(self.coeff_id(), wire, self.visibility())
    }
}

impl std::fmt::Debug for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_constant() {
            write!(f, "c{}", self.coeff_id())
        } else {
            write!(
                f,
                "c{}*{}{}",
                self.coeff_id(),
                match self.visibility() {
                    Visibility::Public => "p",
                    Visibility::Secret => "s",
                    Visibility::Internal => "w",
                },
                self.wire()
            )
        }
    }
}
