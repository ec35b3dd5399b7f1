//! Credential cache
//!
//! Entries are keyed by path, modification time and length; a file replaced
//! on disk is reloaded on the next lookup. The key also carries a digest of
//! the passphrase, so a hit needs the passphrase the entry was loaded with.
//!
//! Lookups take the read lock only; loading happens outside any lock.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use openssl::sha::sha256;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::credentials::CertificateContext;
use crate::{CryptoError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileStamp {
    path: PathBuf,
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| {
            CryptoError::Credential(format!("cannot stat {}: {e}", path.display()))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    certificate: FileStamp,
    key: Option<FileStamp>,
    passphrase: Option<[u8; 32]>,
    cipher_name: Option<String>,
}

impl CacheKey {
    /// Same files and cipher, regardless of file stamps
    fn same_source(&self, other: &CacheKey) -> bool {
        self.certificate.path == other.certificate.path
            && self.key.as_ref().map(|k| &k.path) == other.key.as_ref().map(|k| &k.path)
            && self.cipher_name == other.cipher_name
    }
}

#[derive(Default)]
pub struct CredentialCache {
    entries: RwLock<HashMap<CacheKey, Arc<CertificateContext>>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached equivalent of `CertificateContext::load` / `load_certificate`
    pub fn load(
        &self,
        certificate_path: &Path,
        key_path: Option<&Path>,
        passphrase: Option<&SecretString>,
        cipher_name: Option<&str>,
    ) -> Result<Arc<CertificateContext>> {
        let key = CacheKey {
            certificate: FileStamp::of(certificate_path)?,
            key: key_path.map(FileStamp::of).transpose()?,
            passphrase: key_path
                .and(passphrase)
                .map(|pass| sha256(pass.expose_secret().as_bytes())),
            cipher_name: cipher_name.map(str::to_string),
        };

        if let Some(hit) = self.read()?.get(&key) {
            return Ok(Arc::clone(hit));
        }

        let context = Arc::new(match key_path {
            Some(key_path) => {
                CertificateContext::load(certificate_path, key_path, passphrase, cipher_name)?
            }
            None => CertificateContext::load_certificate(certificate_path, cipher_name)?,
        });
        debug!(certificate = %certificate_path.display(), "Cached certificate context");

        let mut entries = self
            .entries
            .write()
            .map_err(|_| CryptoError::Credential("credential cache poisoned".to_string()))?;
        // at most one entry per source
        entries.retain(|cached, _| !cached.same_source(&key));
        let entry = entries.entry(key).or_insert(context);
        Ok(Arc::clone(entry))
    }

    pub fn len(&self) -> usize {
        self.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<CacheKey, Arc<CertificateContext>>>> {
        self.entries
            .read()
            .map_err(|_| CryptoError::Credential("credential cache poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestIdentity;
    use std::fs::File;
    use std::time::Duration;

    #[test]
    fn test_hit_returns_same_context() {
        let id = TestIdentity::generate("cached", 1, Some("hisp"));
        let cache = CredentialCache::new();
        let pass = id.passphrase();

        let first = cache
            .load(&id.cert_path, Some(id.key_path.as_path()), pass.as_ref(), None)
            .unwrap();
        let second = cache
            .load(&id.cert_path, Some(id.key_path.as_path()), pass.as_ref(), None)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_modified_file_is_reloaded() {
        let id = TestIdentity::generate("cached", 2, None);
        let cache = CredentialCache::new();
        let first = cache.load(&id.cert_path, None, None, None).unwrap();

        let later = SystemTime::now() + Duration::from_secs(60);
        File::options()
            .write(true)
            .open(&id.cert_path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let second = cache.load(&id.cert_path, None, None, None).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cipher_is_part_of_the_key() {
        let id = TestIdentity::generate("cached", 3, None);
        let cache = CredentialCache::new();
        let aes = cache.load(&id.cert_path, None, None, Some("aes128")).unwrap();
        let default = cache.load(&id.cert_path, None, None, None).unwrap();
        assert_eq!(aes.cipher_name(), Some("aes128"));
        assert_eq!(default.cipher_name(), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_wrong_passphrase_fails_after_cached_load() {
        let id = TestIdentity::generate("cached", 5, Some("hisp"));
        let cache = CredentialCache::new();
        let good = id.passphrase();
        let wrong = SecretString::new("WRONG".to_string());

        let first = cache
            .load(&id.cert_path, Some(id.key_path.as_path()), good.as_ref(), None)
            .unwrap();
        let err = cache
            .load(&id.cert_path, Some(id.key_path.as_path()), Some(&wrong), None)
            .unwrap_err();
        assert!(matches!(err, CryptoError::Credential(_)));
        assert!(cache
            .load(&id.cert_path, Some(id.key_path.as_path()), None, None)
            .is_err());

        let again = cache
            .load(&id.cert_path, Some(id.key_path.as_path()), good.as_ref(), None)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let id = TestIdentity::generate("cached", 4, Some("hisp"));
        let cache = CredentialCache::new();
        assert!(cache.load(&id.cert_path, Some(id.key_path.as_path()), None, None).is_err());
        assert!(cache.is_empty());
    }
}
