//! X.509 mail settings
//!
//! Every key is optional so an unset key can be told apart from an explicit
//! `false`. Per-call settings are merged over process defaults with
//! `reverse_merge`, which only fills gaps.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use mailseal_crypto::{CryptoError, KeychainProvider};
use secrecy::SecretString;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::policy::{EnvelopeLayout, FailurePolicy, SigningPolicy};
use crate::{CoreError, Result};

/// Keychain service passphrases are stored under
pub const KEYCHAIN_SERVICE: &str = "mailseal";

/// Where a private key passphrase comes from.
///
/// In configuration files: `"env:VAR"`, `"keychain:ACCOUNT"`, or anything
/// else as the literal passphrase.
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub enum PassphraseSource {
    Literal(Zeroizing<String>),
    Env(String),
    Keychain(String),
}

impl PassphraseSource {
    pub fn resolve(&self) -> Result<SecretString> {
        match self {
            Self::Literal(value) => Ok(SecretString::new(value.as_str().to_owned())),
            Self::Env(var) => env::var(var)
                .map(SecretString::new)
                .map_err(|_| CoreError::Config(format!("environment variable {var} is not set"))),
            Self::Keychain(account) => KeychainProvider::new(KEYCHAIN_SERVICE)
                .retrieve_passphrase(account)
                .map_err(|e| CryptoError::Credential(e.to_string()).into()),
        }
    }
}

impl From<String> for PassphraseSource {
    fn from(value: String) -> Self {
        if let Some(var) = value.strip_prefix("env:") {
            Self::Env(var.to_string())
        } else if let Some(account) = value.strip_prefix("keychain:") {
            Self::Keychain(account.to_string())
        } else {
            Self::Literal(Zeroizing::new(value))
        }
    }
}

impl fmt::Debug for PassphraseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(_) => f.write_str("Literal(<redacted>)"),
            Self::Env(var) => f.debug_tuple("Env").field(var).finish(),
            Self::Keychain(account) => f.debug_tuple("Keychain").field(account).finish(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct X509Settings {
    pub sign_enable: Option<bool>,
    pub sign_cert: Option<PathBuf>,
    pub sign_key: Option<PathBuf>,
    pub sign_passphrase: Option<PassphraseSource>,

    pub crypt_enable: Option<bool>,
    pub crypt_cert: Option<PathBuf>,
    pub crypt_key: Option<PathBuf>,
    pub crypt_passphrase: Option<PassphraseSource>,
    pub crypt_cipher: Option<String>,

    pub layout: Option<EnvelopeLayout>,
    pub on_failure: Option<FailurePolicy>,
}

impl X509Settings {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Load a JSON settings file. Relative certificate and key paths are
    /// taken relative to the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut settings = Self::from_json(&text)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        if let Some(base) = path.parent() {
            settings.rebase(base);
        }
        Ok(settings)
    }

    fn rebase(&mut self, base: &Path) {
        for path in [
            &mut self.sign_cert,
            &mut self.sign_key,
            &mut self.crypt_cert,
            &mut self.crypt_key,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Fill every unset key from `defaults`. Keys already set here, including
    /// an explicit `false`, are kept.
    pub fn reverse_merge(self, defaults: &X509Settings) -> X509Settings {
        X509Settings {
            sign_enable: self.sign_enable.or(defaults.sign_enable),
            sign_cert: self.sign_cert.or_else(|| defaults.sign_cert.clone()),
            sign_key: self.sign_key.or_else(|| defaults.sign_key.clone()),
            sign_passphrase: self
                .sign_passphrase
                .or_else(|| defaults.sign_passphrase.clone()),
            crypt_enable: self.crypt_enable.or(defaults.crypt_enable),
            crypt_cert: self.crypt_cert.or_else(|| defaults.crypt_cert.clone()),
            crypt_key: self.crypt_key.or_else(|| defaults.crypt_key.clone()),
            crypt_passphrase: self
                .crypt_passphrase
                .or_else(|| defaults.crypt_passphrase.clone()),
            crypt_cipher: self.crypt_cipher.or_else(|| defaults.crypt_cipher.clone()),
            layout: self.layout.or(defaults.layout),
            on_failure: self.on_failure.or(defaults.on_failure),
        }
    }

    /// Unset flags mean "off"
    pub fn policy(&self) -> SigningPolicy {
        SigningPolicy::new(
            self.sign_enable.unwrap_or(false),
            self.crypt_enable.unwrap_or(false),
        )
    }

    pub fn layout(&self) -> EnvelopeLayout {
        self.layout.unwrap_or_default()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.on_failure.unwrap_or_default()
    }

    pub fn sign_passphrase(&self) -> Result<Option<SecretString>> {
        self.sign_passphrase.as_ref().map(PassphraseSource::resolve).transpose()
    }

    pub fn crypt_passphrase(&self) -> Result<Option<SecretString>> {
        self.crypt_passphrase.as_ref().map(PassphraseSource::resolve).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_parse_configuration_keys() {
        let settings = X509Settings::from_json(
            r#"{
                "sign_enable": true,
                "sign_cert": "certs/server.crt",
                "sign_key": "certs/server.key",
                "sign_passphrase": "hisp",
                "crypt_enable": false,
                "crypt_cert": "certs/ca.crt",
                "crypt_cipher": "aes-256-cbc",
                "layout": "opaque"
            }"#,
        )
        .unwrap();

        assert_eq!(settings.policy(), SigningPolicy::sign_only());
        assert_eq!(settings.layout(), EnvelopeLayout::Opaque);
        assert_eq!(settings.failure_policy(), FailurePolicy::Abort);
        assert_eq!(
            settings.sign_passphrase().unwrap().unwrap().expose_secret(),
            "hisp"
        );
        assert!(settings.crypt_passphrase().unwrap().is_none());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = X509Settings::from_json(r#"{ "sign_enabled": true }"#).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_reverse_merge_only_fills_gaps() {
        let defaults = X509Settings::from_json(
            r#"{ "sign_enable": true, "crypt_enable": true, "crypt_cipher": "des",
                 "sign_cert": "default.crt" }"#,
        )
        .unwrap();
        let per_call =
            X509Settings::from_json(r#"{ "crypt_enable": false, "sign_cert": "call.crt" }"#)
                .unwrap();

        let merged = per_call.reverse_merge(&defaults);
        assert_eq!(merged.sign_enable, Some(true));
        // explicitly disabled per call stays disabled
        assert_eq!(merged.crypt_enable, Some(false));
        assert_eq!(merged.sign_cert, Some(PathBuf::from("call.crt")));
        assert_eq!(merged.crypt_cipher.as_deref(), Some("des"));
    }

    #[test]
    fn test_unset_flags_mean_pass_through() {
        assert_eq!(X509Settings::default().policy(), SigningPolicy::PASS_THROUGH);
    }

    #[test]
    fn test_passphrase_sources() {
        env::set_var("MAILSEAL_TEST_PASSPHRASE", "from-env");
        let source = PassphraseSource::from("env:MAILSEAL_TEST_PASSPHRASE".to_string());
        assert_eq!(source.resolve().unwrap().expose_secret(), "from-env");

        let missing = PassphraseSource::from("env:MAILSEAL_TEST_UNSET_VARIABLE".to_string());
        assert!(matches!(missing.resolve(), Err(CoreError::Config(_))));

        assert!(matches!(
            PassphraseSource::from("keychain:mailer".to_string()),
            PassphraseSource::Keychain(ref account) if account == "mailer"
        ));

        let literal = PassphraseSource::from("hunter2".to_string());
        assert_eq!(format!("{literal:?}"), "Literal(<redacted>)");
    }

    #[test]
    fn test_relative_paths_follow_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x509.json");
        fs::write(
            &path,
            r#"{ "sign_cert": "certs/server.crt", "crypt_cert": "/etc/ssl/ca.crt" }"#,
        )
        .unwrap();

        let settings = X509Settings::from_file(&path).unwrap();
        assert_eq!(
            settings.sign_cert,
            Some(dir.path().join("certs/server.crt"))
        );
        assert_eq!(settings.crypt_cert, Some(PathBuf::from("/etc/ssl/ca.crt")));
    }
}
