//! Mailseal Crypto - X.509 / PKCS#7 layer
//!
//! This crate provides:
//! - Certificate contexts (certificate + private key + cipher choice)
//! - PKCS#7 signed-data and enveloped-data over arbitrary payloads
//! - A read-mostly credential cache keyed by file path and mtime
//! - OS keychain lookup for key passphrases

pub mod cache;
pub mod cipher;
pub mod credentials;
pub mod envelope;
pub mod keychain;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use cache::CredentialCache;
pub use cipher::SymmetricCipher;
pub use credentials::{subject_of, CertificateContext};
pub use envelope::{
    clear_sign, decrypt, encrypt, sign, sign_detached, verify, verify_detached, EnvelopeKind,
    Pkcs7Envelope, Verification,
};
pub use keychain::{KeychainError, KeychainProvider};

/// Errors that can occur in certificate and PKCS#7 operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid signed envelope: {0}")]
    Verification(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
