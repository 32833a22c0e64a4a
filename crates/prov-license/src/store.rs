//! Local license storage
//!
//! Issued licenses are kept as `<dir>/<activation-key>.lic` holding the raw
//! blob, so a device can be re-provisioned while the authority is offline.

use std::path::{Path, PathBuf};

use prov_core::{ActivationKey, License, ProvisionResult};
use tracing::debug;

pub const LICENSE_EXTENSION: &str = "lic";

#[derive(Debug, Clone)]
pub struct LicenseStore {
    dir: PathBuf,
}

impl LicenseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a license for `key` is stored in
    pub fn path_for(&self, key: &ActivationKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key.to_hex(), LICENSE_EXTENSION))
    }

    /// Store a license, replacing any previous file for its key
    pub fn save(&self, license: &License) -> ProvisionResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(license.key());
        let tmp = path.with_extension("lic.tmp");
        std::fs::write(&tmp, license.blob())?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "Stored license");
        Ok(path)
    }

    /// Load the stored license for `key`, if there is one
    pub fn load(&self, key: &ActivationKey) -> ProvisionResult<Option<License>> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(blob) if blob.is_empty() => Ok(None),
            Ok(blob) => Ok(Some(License::new(*key, blob)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = LicenseStore::new(dir.path().join("licenses"));
        let key = ActivationKey::from_bytes([3; 32]);
        assert!(store.load(&key).unwrap().is_none());

        let license = License::new(key, b"blob".to_vec()).unwrap();
        let path = store.save(&license).unwrap();
        assert!(path.ends_with(format!("{}.lic", key.to_hex())));
        assert_eq!(store.load(&key).unwrap(), Some(license));
        assert!(!path.with_extension("lic.tmp").exists());
    }

    #[test]
    fn test_missing_dir_has_no_license() {
        let dir = tempfile::tempdir().unwrap();
        let store = LicenseStore::new(dir.path().join("absent"));
        assert!(store.load(&ActivationKey::from_bytes([4; 32])).unwrap().is_none());
    }
}
