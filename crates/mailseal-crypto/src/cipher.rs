//! Symmetric content-encryption ciphers for enveloped-data
//!
//! PKCS#7 enveloped-data encrypts the payload under a random session key with
//! one of these block ciphers. The session key itself is wrapped with the
//! recipient's RSA public key.
//!
//! DES is what older deployments were configured with. It is still accepted so
//! that existing configuration keeps parsing, but it is never the default.

use std::fmt;
use std::str::FromStr;

use openssl::symm::Cipher;

use crate::CryptoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SymmetricCipher {
    Des,
    TripleDes,
    Aes128,
    Aes192,
    #[default]
    Aes256,
}

impl SymmetricCipher {
    /// Canonical OpenSSL name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Des => "des-cbc",
            Self::TripleDes => "des-ede3-cbc",
            Self::Aes128 => "aes-128-cbc",
            Self::Aes192 => "aes-192-cbc",
            Self::Aes256 => "aes-256-cbc",
        }
    }

    /// Ciphers kept only for interoperability with old configuration
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Des | Self::TripleDes)
    }

    pub(crate) fn to_openssl(self) -> Cipher {
        match self {
            Self::Des => Cipher::des_cbc(),
            Self::TripleDes => Cipher::des_ede3_cbc(),
            Self::Aes128 => Cipher::aes_128_cbc(),
            Self::Aes192 => Cipher::aes_192_cbc(),
            Self::Aes256 => Cipher::aes_256_cbc(),
        }
    }
}

impl FromStr for SymmetricCipher {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "des" | "des-cbc" => Ok(Self::Des),
            "des3" | "3des" | "des-ede3" | "des-ede3-cbc" => Ok(Self::TripleDes),
            "aes128" | "aes-128" | "aes-128-cbc" => Ok(Self::Aes128),
            "aes192" | "aes-192" | "aes-192-cbc" => Ok(Self::Aes192),
            "aes256" | "aes-256" | "aes-256-cbc" => Ok(Self::Aes256),
            other => Err(CryptoError::Encryption(format!(
                "unsupported cipher: {other}"
            ))),
        }
    }
}

impl fmt::Display for SymmetricCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
