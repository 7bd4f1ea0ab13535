//! Segmented on-disk representation of compacted systems and proving keys.
//!
//! Every file is self-describing and independently loadable. Files are
//! written to `<name>.tmp` first and renamed into place, so a reader never
//! observes a half-written shard.

pub mod proving_key;
pub mod shard;
pub mod system;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ark_serialize::{CanonicalDeserialize, CanonicalSerialize, SerializationError};

use crate::utils::errors::PersistError;

pub const COEFF_TABLE_SUFFIX: &str = "ct.save";
pub const SYSTEM_SUFFIX: &str = "save";
pub const CONSTRAINT_STEM: &str = "r1cs.Cons";
pub const SHARD_EXTENSION: &str = "save";

/// Values that live in a file of their own.
pub trait Persist: CanonicalSerialize + CanonicalDeserialize + Sized {
    /// Size of the compressed encoding.
    fn size(&self) -> usize {
        self.compressed_size()
    }

    fn save_to_file(&self, path: &Path) -> Result<(), PersistError> {
        write_atomic(path, |writer| self.serialize_compressed(writer))
    }

    fn from_file(path: &Path) -> Result<Self, PersistError> {
        read_file(path, |reader| Self::deserialize_compressed(reader))
    }
}

/// Writes through `encode` into `<path>.tmp`, syncs it and renames it to
/// `path`. The temporary file is removed if anything fails.
pub fn write_atomic(
    path: &Path,
    encode: impl FnOnce(&mut BufWriter<File>) -> Result<(), SerializationError>,
) -> Result<(), PersistError> {
    let tmp = tmp_path(path);
    let result = (|| {
        let file = File::create(&tmp).map_err(|e| PersistError::io(&tmp, e))?;
        let mut writer = BufWriter::new(file);
        encode(&mut writer).map_err(|source| PersistError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(|e| PersistError::io(&tmp, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| PersistError::io(&tmp, e.into_error()))?;
        file.sync_all().map_err(|e| PersistError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| PersistError::io(path, e))
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub fn read_file<T>(
    path: &Path,
    decode: impl FnOnce(&mut BufReader<File>) -> Result<T, SerializationError>,
) -> Result<T, PersistError> {
    let file = File::open(path).map_err(|e| PersistError::io(path, e))?;
    let mut reader = BufReader::new(file);
    decode(&mut reader).map_err(|source| PersistError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r1cs::coeff_table::CoeffTable;
    use ark_bn254::Fr;

    #[test]
    fn atomic_write_leaves_no_temporary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.ct.save");
        let mut table = CoeffTable::<Fr>::new();
        table.id(&Fr::from(77u64)).unwrap();

        table.save_to_file(&path).unwrap();
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
        assert_eq!(CoeffTable::<Fr>::from_file(&path).unwrap(), table);
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, table.size());
    }

    #[test]
    fn failed_encode_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.save");
        let err = write_atomic(&path, |_| Err(SerializationError::InvalidData)).unwrap_err();
        assert!(matches!(err, PersistError::Encode { .. }));
        assert!(!path.exists());
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.save");
        assert!(matches!(
            CoeffTable::<Fr>::from_file(&path),
            Err(PersistError::MissingShard(p)) if p == path
        ));
    }
}
