//! Proving-key material split into one file per part, so that large vectors
//! can be written and read concurrently and loaded independently.

use std::path::PathBuf;

use ark_ec::pairing::Pairing;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize, SerializationError};
use strum::IntoEnumIterator;
use tracing::info;

use super::{read_file, write_atomic};
use crate::config::StorageConfig;
use crate::utils::errors::PersistError;

/// Pedersen commitment key used for committed witness wires.
#[derive(Clone, Debug, PartialEq, CanonicalSerialize, CanonicalDeserialize)]
pub struct CommitmentKey<E: Pairing> {
    pub basis: Vec<E::G1Affine>,
    pub basis_exp_sigma: Vec<E::G1Affine>,
}

/// Infinity flags of the `A` and `B` query vectors.
#[derive(Clone, Debug, Default, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct InfinityFlags {
    pub a: Vec<bool>,
    pub b: Vec<bool>,
}

impl InfinityFlags {
    pub fn count_a(&self) -> usize {
        self.a.iter().filter(|f| **f).count()
    }

    pub fn count_b(&self) -> usize {
        self.b.iter().filter(|f| **f).count()
    }
}

#[derive(Clone, Debug, PartialEq, CanonicalSerialize, CanonicalDeserialize)]
pub struct ProvingKey<E: Pairing> {
    pub alpha_g1: E::G1Affine,
    pub beta_g1: E::G1Affine,
    pub beta_g2: E::G2Affine,
    pub delta_g1: E::G1Affine,
    pub delta_g2: E::G2Affine,
    pub a: Vec<E::G1Affine>,
    pub b_g1: Vec<E::G1Affine>,
    pub b_g2: Vec<E::G2Affine>,
    pub k: Vec<E::G1Affine>,
    pub z: Vec<E::G1Affine>,
    pub infinity: InfinityFlags,
    pub commitment_key: CommitmentKey<E>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::EnumIter, strum_macros::Display)]
pub enum ProvingKeyPart {
    Alpha,
    Beta,
    Delta,
    A,
    B,
    B2,
    K,
    Z,
    E,
    CommitmentKey,
}

impl ProvingKeyPart {
    pub fn path(&self, config: &StorageConfig) -> PathBuf {
        config.path(&format!("pk.{self}.save"))
    }
}

impl<E: Pairing> ProvingKey<E> {
    fn write_part(&self, part: ProvingKeyPart, config: &StorageConfig) -> Result<(), PersistError> {
        let path = part.path(config);
        write_atomic(&path, |w| match part {
            ProvingKeyPart::Alpha => self.alpha_g1.serialize_compressed(w),
            ProvingKeyPart::Beta => {
                self.beta_g1.serialize_compressed(&mut *w)?;
                self.beta_g2.serialize_compressed(w)
            }
            ProvingKeyPart::Delta => {
                self.delta_g1.serialize_compressed(&mut *w)?;
                self.delta_g2.serialize_compressed(w)
            }
            ProvingKeyPart::A => self.a.serialize_compressed(w),
            ProvingKeyPart::B => self.b_g1.serialize_compressed(w),
            ProvingKeyPart::B2 => self.b_g2.serialize_compressed(w),
            ProvingKeyPart::K => self.k.serialize_compressed(w),
            ProvingKeyPart::Z => self.z.serialize_compressed(w),
            ProvingKeyPart::E => self.infinity.serialize_compressed(w),
            ProvingKeyPart::CommitmentKey => self.commitment_key.serialize_compressed(w),
        })
    }
}

/// Writes each part of `pk` to `<session>.pk.<part>.save`, all parts in
/// parallel.
#[tracing::instrument(skip_all, name = "proving_key::write_proving_key")]
pub fn write_proving_key<E: Pairing>(
    pk: &ProvingKey<E>,
    config: &StorageConfig,
) -> Result<(), PersistError> {
    use rayon::prelude::*;

    config.validate()?;
    std::fs::create_dir_all(&config.dir).map_err(|e| PersistError::io(&config.dir, e))?;
    ProvingKeyPart::iter()
        .collect::<Vec<_>>()
        .par_iter()
        .try_for_each(|part| pk.write_part(*part, config))?;
    info!(
        "saved proving key of session {}: {} A, {} B, {} K, {} Z points",
        config.session,
        pk.a.len(),
        pk.b_g1.len(),
        pk.k.len(),
        pk.z.len()
    );
    Ok(())
}

fn read_part<T: CanonicalDeserialize>(
    part: ProvingKeyPart,
    config: &StorageConfig,
) -> Result<T, PersistError> {
    read_file(&part.path(config), |r| T::deserialize_compressed(r))
}

fn read_pair<A: CanonicalDeserialize, B: CanonicalDeserialize>(
    part: ProvingKeyPart,
    config: &StorageConfig,
) -> Result<(A, B), PersistError> {
    read_file(&part.path(config), |r| {
        let a = A::deserialize_compressed(&mut *r)?;
        let b = B::deserialize_compressed(r)?;
        Ok::<_, SerializationError>((a, b))
    })
}

/// Loads every part of a proving key concurrently. Any failing part fails the
/// whole load.
#[tracing::instrument(skip_all, name = "proving_key::load_proving_key")]
pub fn load_proving_key<E: Pairing>(config: &StorageConfig) -> Result<ProvingKey<E>, PersistError> {
    config.validate()?;

    let mut alpha = None;
    let mut beta = None;
    let mut delta = None;
    let mut a = None;
    let mut b_g1 = None;
    let mut b_g2 = None;
    let mut k = None;
    let mut z = None;
    let mut infinity = None;
    let mut commitment_key = None;
    rayon::scope(|s| {
        s.spawn(|_| alpha = Some(read_part(ProvingKeyPart::Alpha, config)));
        s.spawn(|_| beta = Some(read_pair(ProvingKeyPart::Beta, config)));
        s.spawn(|_| delta = Some(read_pair(ProvingKeyPart::Delta, config)));
        s.spawn(|_| a = Some(read_part(ProvingKeyPart::A, config)));
        s.spawn(|_| b_g1 = Some(read_part(ProvingKeyPart::B, config)));
        s.spawn(|_| b_g2 = Some(read_part(ProvingKeyPart::B2, config)));
        s.spawn(|_| k = Some(read_part(ProvingKeyPart::K, config)));
        s.spawn(|_| z = Some(read_part(ProvingKeyPart::Z, config)));
        s.spawn(|_| infinity = Some(read_part(ProvingKeyPart::E, config)));
        s.spawn(|_| commitment_key = Some(read_part(ProvingKeyPart::CommitmentKey, config)));
    });

    // Every spawned task ran to completion once the scope returned.
    let missing = |part: ProvingKeyPart| PersistError::MissingShard(part.path(config));
    let (beta_g1, beta_g2) = beta.ok_or_else(|| missing(ProvingKeyPart::Beta))??;
    let (delta_g1, delta_g2) = delta.ok_or_else(|| missing(ProvingKeyPart::Delta))??;
    let pk = ProvingKey {
        alpha_g1: alpha.ok_or_else(|| missing(ProvingKeyPart::Alpha))??,
        beta_g1,
        beta_g2,
        delta_g1,
        delta_g2,
        a: a.ok_or_else(|| missing(ProvingKeyPart::A))??,
        b_g1: b_g1.ok_or_else(|| missing(ProvingKeyPart::B))??,
        b_g2: b_g2.ok_or_else(|| missing(ProvingKeyPart::B2))??,
        k: k.ok_or_else(|| missing(ProvingKeyPart::K))??,
        z: z.ok_or_else(|| missing(ProvingKeyPart::Z))??,
        infinity: infinity.ok_or_else(|| missing(ProvingKeyPart::E))??,
        commitment_key: commitment_key
            .ok_or_else(|| missing(ProvingKeyPart::CommitmentKey))??,
    };
    validate_lengths(&pk)?;
    Ok(pk)
}

fn validate_lengths<E: Pairing>(pk: &ProvingKey<E>) -> Result<(), PersistError> {
    if pk.b_g1.len() != pk.b_g2.len() {
        return Err(PersistError::BadHeader(format!(
            "proving key B has {} G1 and {} G2 points",
            pk.b_g1.len(),
            pk.b_g2.len()
        )));
    }
    if pk.infinity.a.len() < pk.a.len() || pk.infinity.b.len() < pk.b_g1.len() {
        return Err(PersistError::BadHeader(
            "proving key infinity flags are shorter than the A/B queries".to_string(),
        ));
    }
    Ok(())
}
