//! Mailseal Core - S/MIME envelopes for mail messages
//!
//! Sits between whatever composes a message and whatever delivers it.
//! `EnvelopeEngine::seal` turns a draft into a signed and/or encrypted
//! message; `EnvelopeEngine::open` reverses that on the receiving side.
//! `Mailer` adds configuration, credential caching and the failure policy.

pub mod config;
pub mod engine;
pub mod mailer;
pub mod message;
pub mod mime;
pub mod policy;

pub use config::{PassphraseSource, X509Settings};
pub use engine::{EnvelopeEngine, RawMessage, RecoveredBody};
pub use mailer::Mailer;
pub use message::{Header, MailMessage};
pub use policy::{EnvelopeLayout, FailurePolicy, SigningPolicy};

/// Core errors
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] mailseal_crypto::CryptoError),

    #[error("Malformed S/MIME envelope: {0}")]
    MalformedEnvelope(String),

    #[error("MIME error: {0}")]
    Mime(#[from] mailparse::MailParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
