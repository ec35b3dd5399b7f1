//! Sealing policies
//!
//! `SigningPolicy` decides which cryptographic steps run, `EnvelopeLayout`
//! decides the MIME shape of the result, and `FailurePolicy` decides what a
//! failed seal means for delivery.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::CoreError;

/// Which of sign / encrypt apply to a message. When both are on, the
/// plaintext is signed first and the signed envelope is then encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigningPolicy {
    pub sign_enabled: bool,
    pub crypt_enabled: bool,
}

impl SigningPolicy {
    pub const PASS_THROUGH: Self = Self::new(false, false);

    pub const fn new(sign_enabled: bool, crypt_enabled: bool) -> Self {
        Self {
            sign_enabled,
            crypt_enabled,
        }
    }

    pub const fn sign_only() -> Self {
        Self::new(true, false)
    }

    pub const fn encrypt_only() -> Self {
        Self::new(false, true)
    }

    pub const fn sign_and_encrypt() -> Self {
        Self::new(true, true)
    }

    /// False for pass-through
    pub fn is_active(&self) -> bool {
        self.sign_enabled || self.crypt_enabled
    }
}

impl fmt::Display for SigningPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match (self.sign_enabled, self.crypt_enabled) {
            (false, false) => "pass-through",
            (true, false) => "sign",
            (false, true) => "encrypt",
            (true, true) => "sign+encrypt",
        };
        f.write_str(label)
    }
}

/// MIME shape of a sealed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeLayout {
    /// `multipart/mixed` carrying one base64 `smime.p7m` attachment
    #[default]
    Attachment,
    /// The message itself is `application/pkcs7-mime` with a base64 body
    Opaque,
    /// Signed-only mail stays readable as `multipart/signed`; encrypted mail
    /// falls back to the opaque form
    ClearSigned,
}

impl FromStr for EnvelopeLayout {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attachment" => Ok(Self::Attachment),
            "opaque" => Ok(Self::Opaque),
            "clear-signed" | "clearsigned" | "detached" => Ok(Self::ClearSigned),
            other => Err(CoreError::Config(format!("unknown envelope layout: {other}"))),
        }
    }
}

/// What happens to a message that could not be sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Surface the error; the message is not delivered
    #[default]
    Abort,
    /// Deliver the draft unsealed and log a warning
    SendUnsealed,
}
