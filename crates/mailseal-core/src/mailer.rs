//! Mailer facade
//!
//! Holds the process-wide X.509 defaults and a credential cache. Every call
//! takes its own settings, which are reverse-merged over the defaults, so a
//! per-message override never leaks into the next message.

use std::sync::Arc;

use mailseal_crypto::{CertificateContext, CredentialCache, CryptoError};
use tracing::{debug, warn};

use crate::config::X509Settings;
use crate::engine::{EnvelopeEngine, RawMessage, RecoveredBody};
use crate::message::MailMessage;
use crate::policy::FailurePolicy;
use crate::Result;

pub struct Mailer {
    defaults: X509Settings,
    cache: CredentialCache,
}

impl Mailer {
    pub fn new(defaults: X509Settings) -> Self {
        Self {
            defaults,
            cache: CredentialCache::new(),
        }
    }

    pub fn defaults(&self) -> &X509Settings {
        &self.defaults
    }

    /// Effective settings for one call
    pub fn settings(&self, overrides: X509Settings) -> X509Settings {
        overrides.reverse_merge(&self.defaults)
    }

    /// Seal `draft` with the merged settings.
    ///
    /// With `on_failure = send-unsealed` any error is logged and the draft is
    /// returned unchanged; otherwise the error is returned and the message
    /// must not be delivered.
    pub fn seal_with(&self, draft: &MailMessage, overrides: X509Settings) -> Result<MailMessage> {
        let settings = self.settings(overrides);
        match self.seal_inner(draft, &settings) {
            Ok(sealed) => Ok(sealed),
            Err(e) if settings.failure_policy() == FailurePolicy::SendUnsealed => {
                warn!(error = %e, "Sealing failed, delivering message unsealed");
                Ok(draft.clone())
            }
            Err(e) => Err(e),
        }
    }

    fn seal_inner(&self, draft: &MailMessage, settings: &X509Settings) -> Result<MailMessage> {
        let policy = settings.policy();
        let signer = policy
            .sign_enabled
            .then(|| self.signer(settings))
            .transpose()?;
        let recipient = policy
            .crypt_enabled
            .then(|| self.recipient(settings))
            .transpose()?;

        EnvelopeEngine::new(settings.layout()).seal(
            draft,
            policy,
            signer.as_deref(),
            recipient.as_deref(),
        )
    }

    /// Open `raw`. The decryption key is the configured `crypt_cert` /
    /// `crypt_key` pair when both are set.
    pub fn open_with(
        &self,
        raw: &RawMessage,
        overrides: X509Settings,
        expected_signer: Option<&CertificateContext>,
    ) -> Result<RecoveredBody> {
        let settings = self.settings(overrides);
        let recipient = match (&settings.crypt_cert, &settings.crypt_key) {
            (Some(_), Some(_)) => Some(self.recipient(&settings)?),
            _ => {
                debug!("No decryption key configured");
                None
            }
        };

        EnvelopeEngine::new(settings.layout()).open(raw, recipient.as_deref(), expected_signer)
    }

    /// Signing context from `sign_cert` / `sign_key`
    pub fn signer(&self, settings: &X509Settings) -> Result<Arc<CertificateContext>> {
        let certificate = settings.sign_cert.as_deref().ok_or_else(|| {
            CryptoError::Credential("sign_cert is not configured".to_string())
        })?;
        let key = settings.sign_key.as_deref().ok_or_else(|| {
            CryptoError::Credential("sign_key is not configured".to_string())
        })?;
        let passphrase = settings.sign_passphrase()?;
        Ok(self
            .cache
            .load(certificate, Some(key), passphrase.as_ref(), None)?)
    }

    /// Encryption context from `crypt_cert`, with `crypt_key` when present
    pub fn recipient(&self, settings: &X509Settings) -> Result<Arc<CertificateContext>> {
        let certificate = settings.crypt_cert.as_deref().ok_or_else(|| {
            CryptoError::Credential("crypt_cert is not configured".to_string())
        })?;
        let passphrase = match settings.crypt_key {
            Some(_) => settings.crypt_passphrase()?,
            None => None,
        };
        Ok(self.cache.load(
            certificate,
            settings.crypt_key.as_deref(),
            passphrase.as_ref(),
            settings.crypt_cipher.as_deref(),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PassphraseSource;
    use crate::policy::EnvelopeLayout;
    use crate::CoreError;
    use mailseal_crypto::testing::TestIdentity;

    fn draft() -> MailMessage {
        MailMessage::new()
            .with_header("From", "a@x")
            .with_header("To", "b@x")
            .with_header("Subject", "hi")
            .with_body("hello")
    }

    fn settings_for(id: &TestIdentity) -> X509Settings {
        X509Settings {
            sign_cert: Some(id.cert_path.clone()),
            sign_key: Some(id.key_path.clone()),
            sign_passphrase: Some(PassphraseSource::from("hisp".to_string())),
            crypt_cert: Some(id.cert_path.clone()),
            crypt_key: Some(id.key_path.clone()),
            crypt_passphrase: Some(PassphraseSource::from("hisp".to_string())),
            ..X509Settings::default()
        }
    }

    #[test]
    fn test_defaults_seal_and_open() {
        let id = TestIdentity::generate("mailer", 41, Some("hisp"));
        let mut defaults = settings_for(&id);
        defaults.sign_enable = Some(true);
        defaults.crypt_enable = Some(true);
        let mailer = Mailer::new(defaults);

        let sealed = mailer.seal_with(&draft(), X509Settings::default()).unwrap();
        assert_ne!(sealed, draft());

        let raw = RawMessage::parse(&sealed.to_bytes()).unwrap();
        let opened = mailer.open_with(&raw, X509Settings::default(), None).unwrap();
        assert_eq!(opened.body, b"hello");
        assert!(opened.decrypted);
        assert_eq!(opened.verified, Some(true));
    }

    #[test]
    fn test_overrides_apply_per_call() {
        let id = TestIdentity::generate("mailer", 42, Some("hisp"));
        let mut defaults = settings_for(&id);
        defaults.sign_enable = Some(true);
        let mailer = Mailer::new(defaults);

        let overrides = X509Settings {
            sign_enable: Some(false),
            ..X509Settings::default()
        };
        assert_eq!(mailer.seal_with(&draft(), overrides).unwrap(), draft());

        let overrides = X509Settings {
            layout: Some(EnvelopeLayout::Opaque),
            ..X509Settings::default()
        };
        let sealed = mailer.seal_with(&draft(), overrides).unwrap();
        assert_eq!(sealed.content_type().mimetype, "application/pkcs7-mime");

        // the override did not stick
        assert_eq!(mailer.defaults().layout(), EnvelopeLayout::Attachment);
    }

    #[test]
    fn test_abort_surfaces_errors() {
        let mailer = Mailer::new(X509Settings {
            sign_enable: Some(true),
            ..X509Settings::default()
        });
        let err = mailer
            .seal_with(&draft(), X509Settings::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::Crypto(CryptoError::Credential(_))));
    }

    #[test]
    fn test_send_unsealed_returns_draft() {
        let mailer = Mailer::new(X509Settings {
            crypt_enable: Some(true),
            crypt_cert: Some("/nonexistent/recipient.crt".into()),
            on_failure: Some(FailurePolicy::SendUnsealed),
            ..X509Settings::default()
        });
        let sealed = mailer.seal_with(&draft(), X509Settings::default()).unwrap();
        assert_eq!(sealed, draft());
    }

    #[test]
    fn test_wrong_passphrase_override_is_not_served_from_cache() {
        let id = TestIdentity::generate("mailer", 44, Some("hisp"));
        let mut defaults = settings_for(&id);
        defaults.sign_enable = Some(true);
        let mailer = Mailer::new(defaults);

        mailer.seal_with(&draft(), X509Settings::default()).unwrap();

        let overrides = X509Settings {
            sign_passphrase: Some(PassphraseSource::from("WRONG".to_string())),
            ..X509Settings::default()
        };
        let err = mailer.seal_with(&draft(), overrides).unwrap_err();
        assert!(matches!(err, CoreError::Crypto(CryptoError::Credential(_))));
    }

    #[test]
    fn test_credentials_are_cached() {
        let id = TestIdentity::generate("mailer", 43, Some("hisp"));
        let mailer = Mailer::new(settings_for(&id));

        let first = mailer.signer(mailer.defaults()).unwrap();
        let second = mailer.signer(mailer.defaults()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
