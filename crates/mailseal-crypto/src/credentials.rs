//! Certificate contexts
//!
//! A `CertificateContext` binds one X.509 certificate, its private key (when
//! this side needs to sign or decrypt), and the cipher name used when the
//! context is an encryption recipient. Contexts are immutable: reloading is the
//! only way to change what they hold.

use std::fmt;
use std::fs;
use std::path::Path;

use openssl::error::ErrorStack;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::{X509Ref, X509};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::cipher::SymmetricCipher;
use crate::{CryptoError, Result};

pub struct CertificateContext {
    certificate: X509,
    private_key: Option<PKey<Private>>,
    cipher_name: Option<String>,
}

impl CertificateContext {
    /// Load a certificate and its private key from disk.
    ///
    /// Both files may be PEM or DER. The passphrase is required when the key
    /// is encrypted; it is never used to prompt on a terminal.
    pub fn load(
        certificate_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        passphrase: Option<&SecretString>,
        cipher_name: Option<&str>,
    ) -> Result<Self> {
        let certificate_path = certificate_path.as_ref();
        let key_path = key_path.as_ref();

        let cert_bytes = read_file(certificate_path)?;
        let key_bytes = Zeroizing::new(read_file(key_path)?);

        let context = Self::from_pem(&cert_bytes, Some(&key_bytes), passphrase, cipher_name)?;
        debug!(
            certificate = %certificate_path.display(),
            subject = %context.subject(),
            "Loaded certificate context"
        );
        Ok(context)
    }

    /// Load only a certificate, for encrypting to a recipient whose private
    /// key lives elsewhere.
    pub fn load_certificate(
        certificate_path: impl AsRef<Path>,
        cipher_name: Option<&str>,
    ) -> Result<Self> {
        let certificate_path = certificate_path.as_ref();
        let cert_bytes = read_file(certificate_path)?;
        let context = Self::from_pem(&cert_bytes, None, None, cipher_name)?;
        debug!(
            certificate = %certificate_path.display(),
            subject = %context.subject(),
            "Loaded recipient certificate"
        );
        Ok(context)
    }

    /// Build a context from in-memory certificate and key material
    pub fn from_pem(
        certificate: &[u8],
        private_key: Option<&[u8]>,
        passphrase: Option<&SecretString>,
        cipher_name: Option<&str>,
    ) -> Result<Self> {
        let certificate = parse_certificate(certificate)?;

        let private_key = match private_key {
            Some(bytes) => {
                let key = parse_private_key(bytes, passphrase)?;
                let public = certificate
                    .public_key()
                    .map_err(|e| credential("certificate public key", e))?;
                if !public.public_eq(&key) {
                    return Err(CryptoError::Credential(
                        "private key does not match certificate".to_string(),
                    ));
                }
                Some(key)
            }
            None => None,
        };

        Ok(Self {
            certificate,
            private_key,
            cipher_name: cipher_name.map(str::to_string),
        })
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    pub(crate) fn private_key(&self) -> Result<&PKeyRef<Private>> {
        self.private_key.as_deref().ok_or_else(|| {
            CryptoError::Credential(format!(
                "no private key loaded for {}",
                self.subject()
            ))
        })
    }

    pub fn cipher_name(&self) -> Option<&str> {
        self.cipher_name.as_deref()
    }

    /// Resolve the configured cipher, falling back to the default
    pub fn cipher(&self) -> Result<SymmetricCipher> {
        let cipher = match self.cipher_name.as_deref() {
            Some(name) => name.parse()?,
            None => SymmetricCipher::default(),
        };
        if cipher.is_legacy() {
            warn!(cipher = %cipher, "Legacy cipher configured for encryption");
        }
        Ok(cipher)
    }

    /// Human-readable subject, e.g. `CN=mailer, O=Example`
    pub fn subject(&self) -> String {
        subject_of(&self.certificate)
    }

    /// True when `other` is byte-for-byte this context's certificate
    pub fn matches_certificate(&self, other: &X509Ref) -> bool {
        match (self.certificate.to_der(), other.to_der()) {
            (Ok(ours), Ok(theirs)) => ours == theirs,
            _ => false,
        }
    }
}

impl fmt::Debug for CertificateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateContext")
            .field("subject", &self.subject())
            .field("has_private_key", &self.has_private_key())
            .field("cipher_name", &self.cipher_name)
            .finish()
    }
}

/// Subject of any certificate, formatted like `CertificateContext::subject`
pub fn subject_of(certificate: &X509Ref) -> String {
    certificate
        .subject_name()
        .entries()
        .filter_map(|entry| {
            let key = entry.object().nid().short_name().ok()?;
            let value = entry.data().as_utf8().ok()?;
            Some(format!("{key}={value}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .map_err(|e| CryptoError::Credential(format!("cannot read {}: {e}", path.display())))
}

fn credential(what: &str, err: ErrorStack) -> CryptoError {
    CryptoError::Credential(format!("{what}: {err}"))
}

fn parse_certificate(bytes: &[u8]) -> Result<X509> {
    if looks_like_pem(bytes) {
        X509::from_pem(bytes).map_err(|e| credential("malformed PEM certificate", e))
    } else {
        X509::from_der(bytes).map_err(|e| credential("malformed DER certificate", e))
    }
}

fn parse_private_key(bytes: &[u8], passphrase: Option<&SecretString>) -> Result<PKey<Private>> {
    if !looks_like_pem(bytes) {
        return PKey::private_key_from_der(bytes)
            .map_err(|e| credential("malformed DER private key", e));
    }

    match passphrase {
        Some(passphrase) => PKey::private_key_from_pem_passphrase(
            bytes,
            passphrase.expose_secret().as_bytes(),
        )
        .map_err(|e| credential("cannot decrypt private key (wrong passphrase?)", e)),
        // An empty callback makes encrypted keys fail instead of prompting on a tty
        None => PKey::private_key_from_pem_callback(bytes, |_| Ok(0))
            .map_err(|e| credential("cannot load private key (passphrase required?)", e)),
    }
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes.windows(11).any(|w| w == b"-----BEGIN ")
}
