//! A whole [`LazyR1CS`] on disk: the coefficient table, a system file with the
//! header, shape instances and templates, and the directly stored rows split
//! into constraint shards.

use ark_ff::PrimeField;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use tracing::info;

use super::{
    shard::{load_concurrent, write_sharded, ShardRange},
    Persist, COEFF_TABLE_SUFFIX, CONSTRAINT_STEM, SYSTEM_SUFFIX,
};
use crate::config::StorageConfig;
use crate::r1cs::{coeff_table::CoeffTable, constraint::R1C, lazy::LazyR1CS};
use crate::shapes::{LazyInputs, ShapeTemplate};
use crate::utils::{errors::PersistError, profiling::log_memory_usage};

pub const MAGIC: u64 = u64::from_be_bytes(*b"LAZYR1CS");
pub const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct SystemHeader {
    pub magic: u64,
    pub version: u32,
    pub total_constraints: usize,
    pub direct_constraints: usize,
    pub coefficients: usize,
    /// Rows per constraint shard used by the writer.
    pub batch_size: usize,
}

impl SystemHeader {
    pub fn validate(&self) -> Result<(), PersistError> {
        if self.magic != MAGIC {
            return Err(PersistError::BadHeader(format!(
                "bad magic {:#018x}",
                self.magic
            )));
        }
        if self.version != FORMAT_VERSION {
            return Err(PersistError::BadHeader(format!(
                "unsupported version {} (expected {FORMAT_VERSION})",
                self.version
            )));
        }
        if self.direct_constraints > self.total_constraints {
            return Err(PersistError::BadHeader(format!(
                "{} direct rows exceed {} total rows",
                self.direct_constraints, self.total_constraints
            )));
        }
        if self.batch_size == 0 {
            return Err(PersistError::InvalidBatchSize);
        }
        Ok(())
    }
}

/// Contents of `<session>.save`.
#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
pub struct SystemFile<F: PrimeField> {
    pub header: SystemHeader,
    pub instances: Vec<LazyInputs>,
    pub templates: Vec<ShapeTemplate<F>>,
}

impl<F: PrimeField> Persist for CoeffTable<F> {}
impl<F: PrimeField> Persist for SystemFile<F> {}

/// Writes every file of `lazy` under `config` and returns the constraint
/// shard ranges.
#[tracing::instrument(skip_all, name = "system::write_lazy_r1cs")]
pub fn write_lazy_r1cs<F: PrimeField>(
    lazy: &LazyR1CS<F>,
    config: &StorageConfig,
) -> Result<Vec<ShardRange>, PersistError> {
    config.validate()?;
    std::fs::create_dir_all(&config.dir).map_err(|e| PersistError::io(&config.dir, e))?;

    let system = SystemFile {
        header: SystemHeader {
            magic: MAGIC,
            version: FORMAT_VERSION,
            total_constraints: lazy.total_constraint_count(),
            direct_constraints: lazy.direct_constraint_count(),
            coefficients: lazy.coeffs().len(),
            batch_size: config.batch_size,
        },
        instances: lazy.instances().to_vec(),
        templates: lazy.registry().templates().to_vec(),
    };

    let (tables, shards) = rayon::join(
        || {
            lazy.coeffs().save_to_file(&config.path(COEFF_TABLE_SUFFIX))?;
            system.save_to_file(&config.path(SYSTEM_SUFFIX))
        },
        || write_sharded(config, CONSTRAINT_STEM, lazy.direct_rows()),
    );
    tables?;
    let shards = shards?;
    info!(
        "saved session {} to {}: {} coefficients, {} instances, {} templates, {} constraint shards",
        config.session,
        config.dir.display(),
        system.header.coefficients,
        system.instances.len(),
        system.templates.len(),
        shards.len()
    );
    Ok(shards)
}

/// Reads the system header of a session without touching the other files.
pub fn read_header<F: PrimeField>(config: &StorageConfig) -> Result<SystemHeader, PersistError> {
    let system = SystemFile::<F>::from_file(&config.path(SYSTEM_SUFFIX))?;
    system.header.validate()?;
    Ok(system.header)
}

/// Loads a session written by [`write_lazy_r1cs`]. Constraint shards are read
/// with `config.parallelism` threads; the shard size comes from the header.
#[tracing::instrument(skip_all, name = "system::load_lazy_r1cs")]
pub fn load_lazy_r1cs<F: PrimeField>(config: &StorageConfig) -> Result<LazyR1CS<F>, PersistError> {
    config.validate()?;
    let system = SystemFile::<F>::from_file(&config.path(SYSTEM_SUFFIX))?;
    system.header.validate()?;
    let header = &system.header;

    let coeffs = CoeffTable::<F>::from_file(&config.path(COEFF_TABLE_SUFFIX))?;
    if coeffs.len() != header.coefficients {
        return Err(PersistError::BadHeader(format!(
            "coefficient table holds {} values, header says {}",
            coeffs.len(),
            header.coefficients
        )));
    }

    // Every instance owns exactly its key's row count, so the header's two
    // counts must differ by that sum before either sizes an allocation.
    let mut lazy_rows = 0usize;
    for inputs in &system.instances {
        lazy_rows = lazy_rows
            .checked_add(inputs.constraint_count(&coeffs)?)
            .ok_or_else(|| PersistError::BadHeader("lazy row count overflows".to_string()))?;
    }
    if header.total_constraints.checked_sub(lazy_rows) != Some(header.direct_constraints) {
        return Err(PersistError::BadHeader(format!(
            "{} total rows minus {} lazy rows does not leave {} direct rows",
            header.total_constraints, lazy_rows, header.direct_constraints
        )));
    }

    let shard_config = config.clone().with_batch_size(header.batch_size);
    let direct: Vec<R1C> =
        load_concurrent(&shard_config, CONSTRAINT_STEM, header.direct_constraints)?;
    log_memory_usage("after loading constraint shards");

    let lazy = LazyR1CS::from_persisted(
        coeffs,
        direct,
        system.instances,
        system.templates,
        header.total_constraints,
    )?;
    info!(
        "loaded session {}: {} constraints ({} direct, {} lazy)",
        config.session,
        lazy.total_constraint_count(),
        lazy.direct_constraint_count(),
        lazy.lazy_constraint_count()
    );
    Ok(lazy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::shard::{check_coverage, discover_shards, shard_path};
    use crate::r1cs::test::{hash_chain_circuit, mixed_circuit};
    use ark_bn254::Fr;

    #[test]
    fn system_round_trips_through_shards() {
        let dir = tempfile::tempdir().unwrap();
        let compiled = mixed_circuit();
        let expanded = compiled.constraints.clone();
        let witness = compiled.witness.clone();
        let lazy = LazyR1CS::lazify(compiled).unwrap();
        let config = StorageConfig::new(dir.path(), "mixed")
            .with_batch_size(3)
            .with_parallelism(2);

        let shards = write_lazy_r1cs(&lazy, &config).unwrap();
        let found = discover_shards(dir.path(), "mixed", CONSTRAINT_STEM).unwrap();
        assert_eq!(found, shards);
        check_coverage(&found, lazy.direct_constraint_count()).unwrap();

        // The reader's batch size is taken from the header.
        let reader = config.clone().with_batch_size(1000).with_parallelism(5);
        let loaded = load_lazy_r1cs::<Fr>(&reader).unwrap();
        assert_eq!(loaded.shape_count(), lazy.shape_count());
        assert_eq!(loaded.instance_count(), lazy.instance_count());
        assert_eq!(loaded.direct_constraint_count(), lazy.direct_constraint_count());
        loaded.verify_against(&expanded).unwrap();
        assert_eq!(loaded.is_satisfied(&witness).unwrap(), None);
        assert_eq!(read_header::<Fr>(&config).unwrap().batch_size, 3);
    }

    #[test]
    fn missing_constraint_shard_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let lazy = LazyR1CS::lazify(mixed_circuit()).unwrap();
        let config = StorageConfig::new(dir.path(), "gap").with_batch_size(2);
        let shards = write_lazy_r1cs(&lazy, &config).unwrap();

        let victim = shard_path(&config, CONSTRAINT_STEM, shards[0]);
        std::fs::remove_file(&victim).unwrap();
        assert!(matches!(
            load_lazy_r1cs::<Fr>(&config),
            Err(PersistError::MissingShard(path)) if path == victim
        ));
    }

    #[test]
    fn corrupted_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let lazy = LazyR1CS::lazify(hash_chain_circuit(3)).unwrap();
        let config = StorageConfig::new(dir.path(), "chain");
        write_lazy_r1cs(&lazy, &config).unwrap();

        let path = config.path(SYSTEM_SUFFIX);
        let mut system = SystemFile::<Fr>::from_file(&path).unwrap();
        system.header.version += 1;
        system.save_to_file(&path).unwrap();
        assert!(matches!(
            load_lazy_r1cs::<Fr>(&config),
            Err(PersistError::BadHeader(_))
        ));
    }

    #[test]
    fn inflated_header_counts_are_rejected_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let lazy = LazyR1CS::lazify(mixed_circuit()).unwrap();
        let config = StorageConfig::new(dir.path(), "mixed").with_batch_size(4);
        write_lazy_r1cs(&lazy, &config).unwrap();
        let path = config.path(SYSTEM_SUFFIX);
        let original = SystemFile::<Fr>::from_file(&path).unwrap();

        let mut system = original.clone();
        system.header.total_constraints = 1 << 40;
        system.header.direct_constraints = 1 << 40;
        system.save_to_file(&path).unwrap();
        assert!(matches!(
            load_lazy_r1cs::<Fr>(&config),
            Err(PersistError::BadHeader(_))
        ));

        // Consistent counts still cannot reach past the shards on disk.
        let mut system = original;
        system.header.total_constraints += 1 << 40;
        system.header.direct_constraints += 1 << 40;
        system.save_to_file(&path).unwrap();
        assert!(matches!(
            load_lazy_r1cs::<Fr>(&config),
            Err(PersistError::MissingShard(_))
        ));
    }

    #[test]
    fn tampered_template_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let lazy = LazyR1CS::lazify(hash_chain_circuit(3)).unwrap();
        let config = StorageConfig::new(dir.path(), "chain");
        write_lazy_r1cs(&lazy, &config).unwrap();

        let path = config.path(SYSTEM_SUFFIX);
        let mut system = SystemFile::<Fr>::from_file(&path).unwrap();
        system.templates[0].rows.pop();
        system.save_to_file(&path).unwrap();
        match load_lazy_r1cs::<Fr>(&config) {
            Err(PersistError::Corrupt(err)) => assert!(err.is_corruption()),
            other => panic!("unexpected result {:?}", other.map(|l| l.total_constraint_count())),
        }
    }
}
