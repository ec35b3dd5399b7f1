//! PKCS#7 envelopes: sign, encrypt, decrypt, verify
//!
//! Envelopes travel as DER. On the way in they are also accepted as PEM or as
//! base64 text, which is how they appear inside a mail body.
//!
//! Signature mismatch is not an error: `verify` reports it through
//! `Verification::verified` so the caller decides what to do with the mail.
//! Only input that is not a signed-data structure at all is an error.

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::nid::Nid;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;
use tracing::{debug, warn};

use crate::credentials::CertificateContext;
use crate::{CryptoError, Result};

/// PKCS#7 content types this crate produces and consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Signed,
    Enveloped,
    Other,
}

impl EnvelopeKind {
    /// Value of the `smime-type` Content-Type parameter
    pub fn smime_type(&self) -> &'static str {
        match self {
            Self::Signed => "signed-data",
            Self::Enveloped => "enveloped-data",
            Self::Other => "data",
        }
    }
}

/// A DER-encoded PKCS#7 ContentInfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkcs7Envelope {
    der: Vec<u8>,
    kind: EnvelopeKind,
}

impl Pkcs7Envelope {
    fn from_pkcs7(pkcs7: &Pkcs7) -> std::result::Result<Self, openssl::error::ErrorStack> {
        Ok(Self {
            der: pkcs7.to_der()?,
            kind: kind_of(pkcs7),
        })
    }

    /// Recognise an envelope in DER, PEM or base64 form.
    ///
    /// Returns `None` when the bytes do not hold a PKCS#7 structure.
    pub fn decode(input: &[u8]) -> Option<Self> {
        let pkcs7 = if input.first() == Some(&0x30) {
            Pkcs7::from_der(input).ok()?
        } else if input.windows(17).any(|w| w == b"-----BEGIN PKCS7-") {
            Pkcs7::from_pem(input).ok()?
        } else {
            let compact: Vec<u8> = input
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            if compact.is_empty() {
                return None;
            }
            let der = STANDARD.decode(compact).ok()?;
            Pkcs7::from_der(&der).ok()?
        };
        Self::from_pkcs7(&pkcs7).ok()
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn into_der(self) -> Vec<u8> {
        self.der
    }

    /// Standard base64 without line breaks
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.der)
    }

    fn parse(&self) -> std::result::Result<Pkcs7, openssl::error::ErrorStack> {
        Pkcs7::from_der(&self.der)
    }
}

/// Outcome of checking a signed-data envelope
#[derive(Debug, Clone)]
pub struct Verification {
    /// The signed content, recovered whether or not the signature holds
    pub content: Vec<u8>,
    pub verified: bool,
    /// First signer certificate found in the envelope
    pub signer: Option<X509>,
}

/// Sign `plaintext`, embedding it and the signer certificate in signed-data
pub fn sign(plaintext: &[u8], signer: &CertificateContext) -> Result<Pkcs7Envelope> {
    let envelope = sign_with_flags(plaintext, signer, Pkcs7Flags::BINARY)?;
    debug!(signer = %signer.subject(), bytes = envelope.der.len(), "Signed payload");
    Ok(envelope)
}

/// Sign `content` without embedding it
pub fn sign_detached(content: &[u8], signer: &CertificateContext) -> Result<Pkcs7Envelope> {
    let envelope = sign_with_flags(content, signer, Pkcs7Flags::BINARY | Pkcs7Flags::DETACHED)?;
    debug!(signer = %signer.subject(), "Produced detached signature");
    Ok(envelope)
}

/// Sign `entity` and write it as a `multipart/signed` S/MIME message.
///
/// The entity is copied verbatim as the first part; the detached signature
/// follows as an `application/x-pkcs7-signature` attachment.
pub fn clear_sign(entity: &[u8], signer: &CertificateContext) -> Result<Vec<u8>> {
    let flags = Pkcs7Flags::BINARY | Pkcs7Flags::DETACHED;
    let envelope = sign_with_flags(entity, signer, flags)?;
    let pkcs7 = envelope
        .parse()
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    pkcs7
        .to_smime(entity, flags | Pkcs7Flags::CRLFEOL)
        .map_err(|e| CryptoError::Signing(format!("cannot write S/MIME: {e}")))
}

fn sign_with_flags(
    input: &[u8],
    signer: &CertificateContext,
    flags: Pkcs7Flags,
) -> Result<Pkcs7Envelope> {
    let key = signer.private_key()?;
    let extra_certs = Stack::<X509>::new().map_err(|e| CryptoError::Signing(e.to_string()))?;
    let pkcs7 = Pkcs7::sign(signer.certificate(), key, &extra_certs, input, flags)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    Pkcs7Envelope::from_pkcs7(&pkcs7).map_err(|e| CryptoError::Signing(e.to_string()))
}

/// Encrypt `payload` for the recipient certificate
pub fn encrypt(payload: &[u8], recipient: &CertificateContext) -> Result<Pkcs7Envelope> {
    let cipher = recipient.cipher()?;

    let mut certs = Stack::<X509>::new().map_err(|e| CryptoError::Encryption(e.to_string()))?;
    certs
        .push(recipient.certificate().to_owned())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let pkcs7 = Pkcs7::encrypt(&certs, payload, cipher.to_openssl(), Pkcs7Flags::BINARY)
        .map_err(|e| CryptoError::Encryption(format!("{cipher}: {e}")))?;
    let envelope =
        Pkcs7Envelope::from_pkcs7(&pkcs7).map_err(|e| CryptoError::Encryption(e.to_string()))?;

    debug!(
        recipient = %recipient.subject(),
        cipher = %cipher,
        bytes = envelope.der.len(),
        "Encrypted payload"
    );
    Ok(envelope)
}

/// Decrypt enveloped-data addressed to the recipient's certificate
pub fn decrypt(envelope: &[u8], recipient: &CertificateContext) -> Result<Vec<u8>> {
    let envelope = Pkcs7Envelope::decode(envelope)
        .ok_or_else(|| CryptoError::Decryption("not a PKCS#7 structure".to_string()))?;
    if envelope.kind != EnvelopeKind::Enveloped {
        return Err(CryptoError::Decryption(format!(
            "expected enveloped-data, found {}",
            envelope.kind.smime_type()
        )));
    }

    let key = recipient.private_key()?;
    let pkcs7 = envelope
        .parse()
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    let plaintext = pkcs7
        .decrypt(key, recipient.certificate(), Pkcs7Flags::empty())
        .map_err(|e| {
            CryptoError::Decryption(format!("not addressed to {}: {e}", recipient.subject()))
        })?;

    debug!(recipient = %recipient.subject(), bytes = plaintext.len(), "Decrypted envelope");
    Ok(plaintext)
}

/// Verify signed-data with embedded content.
///
/// When `expected_signer` is given the embedded signer certificate must also
/// be that context's certificate.
pub fn verify(
    envelope: &[u8],
    expected_signer: Option<&CertificateContext>,
) -> Result<Verification> {
    verify_inner(envelope, None, expected_signer)
}

/// Verify a detached signature over `content`
pub fn verify_detached(
    signature: &[u8],
    content: &[u8],
    expected_signer: Option<&CertificateContext>,
) -> Result<Verification> {
    verify_inner(signature, Some(content), expected_signer)
}

fn verify_inner(
    envelope: &[u8],
    detached: Option<&[u8]>,
    expected_signer: Option<&CertificateContext>,
) -> Result<Verification> {
    let envelope = Pkcs7Envelope::decode(envelope)
        .ok_or_else(|| CryptoError::Verification("not a PKCS#7 structure".to_string()))?;
    if envelope.kind != EnvelopeKind::Signed {
        return Err(CryptoError::Verification(format!(
            "expected signed-data, found {}",
            envelope.kind.smime_type()
        )));
    }
    let pkcs7 = envelope
        .parse()
        .map_err(|e| CryptoError::Verification(e.to_string()))?;

    let no_certs = Stack::<X509>::new().map_err(|e| CryptoError::Verification(e.to_string()))?;
    let store = X509StoreBuilder::new()
        .map_err(|e| CryptoError::Verification(e.to_string()))?
        .build();

    let signers = pkcs7
        .signers(&no_certs, Pkcs7Flags::empty())
        .map_err(|e| CryptoError::Verification(format!("no usable signer: {e}")))?;

    // Chain validation is out of scope; NOVERIFY checks only the signature.
    let base = Pkcs7Flags::BINARY | Pkcs7Flags::NOVERIFY;

    let mut content = Vec::new();
    pkcs7
        .verify(
            &no_certs,
            &store,
            detached,
            Some(&mut content),
            base | Pkcs7Flags::NOSIGS,
        )
        .map_err(|e| CryptoError::Verification(format!("cannot extract content: {e}")))?;

    let mut verified = match pkcs7.verify(&no_certs, &store, detached, None, base) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Signature does not match content");
            false
        }
    };

    if let Some(expected) = expected_signer {
        if !signers.iter().any(|cert| expected.matches_certificate(cert)) {
            warn!(expected = %expected.subject(), "Envelope signed by an unexpected certificate");
            verified = false;
        }
    }

    let signer = signers.iter().next().map(|cert| cert.to_owned());
    Ok(Verification {
        content,
        verified,
        signer,
    })
}

fn kind_of(pkcs7: &Pkcs7) -> EnvelopeKind {
    match pkcs7.type_().map(|object| object.nid()) {
        Some(Nid::PKCS7_SIGNED) => EnvelopeKind::Signed,
        Some(Nid::PKCS7_ENVELOPED) => EnvelopeKind::Enveloped,
        _ => EnvelopeKind::Other,
    }
}
