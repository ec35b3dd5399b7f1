//! Hardware keychain integration for private key passphrases

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeychainError {
    #[error("Keychain not available")]
    NotAvailable,
    #[error("No passphrase stored for {0}")]
    NotFound(String),
    #[error("Platform error: {0}")]
    Platform(String),
}

pub struct KeychainProvider {
    service_name: String,
}

impl KeychainProvider {
    pub fn new(service_name: &str) -> Self {
        Self { service_name: service_name.to_string() }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn store_passphrase(&self, account: &str, passphrase: &SecretString) -> Result<(), KeychainError> {
        let entry = self.entry(account)?;
        entry
            .set_password(passphrase.expose_secret())
            .map_err(|e| KeychainError::Platform(e.to_string()))
    }

    pub fn retrieve_passphrase(&self, account: &str) -> Result<SecretString, KeychainError> {
        let entry = self.entry(account)?;
        entry.get_password().map(SecretString::new).map_err(|e| match e {
            keyring::Error::NoEntry => KeychainError::NotFound(account.to_string()),
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                KeychainError::NotAvailable
            }
            _ => KeychainError::Platform(e.to_string()),
        })
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, KeychainError> {
        keyring::Entry::new(&self.service_name, account)
            .map_err(|e| KeychainError::Platform(e.to_string()))
    }
}
