//! Envelope engine
//!
//! `seal` signs and/or encrypts the body of a draft and re-wraps it as
//! S/MIME. `open` recognises the S/MIME shapes a message can arrive in and
//! undoes them, always decrypting before verifying.

use std::borrow::Cow;

use mailparse::ParsedMail;
use mailseal_crypto::{
    self as crypto, subject_of, CertificateContext, CryptoError, EnvelopeKind, Pkcs7Envelope,
    Verification,
};
use tracing::{debug, info};

use crate::message::{decoded_body, raw_body, MailMessage};
use crate::mime::{self, SIGNED_MARKER, SMIME_FILENAME};
use crate::policy::{EnvelopeLayout, SigningPolicy};
use crate::{CoreError, Result};

/// A message as received from the transport
#[derive(Debug, Clone)]
pub enum RawMessage {
    /// Envelope bytes with no MIME structure around them
    Bare(Vec<u8>),
    Structured(MailMessage),
}

impl RawMessage {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Ok(Self::Structured(MailMessage::parse(raw)?))
    }
}

impl From<MailMessage> for RawMessage {
    fn from(message: MailMessage) -> Self {
        Self::Structured(message)
    }
}

/// Result of opening a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredBody {
    /// The recovered MIME entity, content headers included
    pub entity: Vec<u8>,
    /// Body of `entity` with its transfer encoding removed
    pub body: Vec<u8>,
    pub decrypted: bool,
    /// `None` when the message carried no signature
    pub verified: Option<bool>,
    /// Subject of the signing certificate
    pub signer: Option<String>,
}

impl RecoveredBody {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// A signature was present and did not check out
    pub fn signature_failed(&self) -> bool {
        self.verified == Some(false)
    }

    fn from_entity(entity: Vec<u8>) -> Self {
        let body = mailparse::parse_mail(&entity)
            .ok()
            .and_then(|parsed| decoded_body(&parsed).ok())
            .unwrap_or_else(|| entity.clone());
        Self {
            entity,
            body,
            decrypted: false,
            verified: None,
            signer: None,
        }
    }

    fn from_verification(verification: Verification) -> Self {
        Self {
            verified: Some(verification.verified),
            signer: verification.signer.as_deref().map(subject_of),
            ..Self::from_entity(verification.content)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeEngine {
    layout: EnvelopeLayout,
}

impl EnvelopeEngine {
    pub fn new(layout: EnvelopeLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> EnvelopeLayout {
        self.layout
    }

    /// Seal a draft for delivery.
    ///
    /// Content-Type and Content-Transfer-Encoding are replaced; every other
    /// header keeps its value and position. The signature covers
    /// `MailMessage::entity`, and signing happens before encryption.
    pub fn seal(
        &self,
        draft: &MailMessage,
        policy: SigningPolicy,
        signer: Option<&CertificateContext>,
        recipient: Option<&CertificateContext>,
    ) -> Result<MailMessage> {
        if !policy.is_active() {
            debug!("Sealing disabled, draft passes through");
            return Ok(draft.clone());
        }

        let entity = draft.entity();
        let content = if self.layout == EnvelopeLayout::ClearSigned && policy.sign_enabled {
            let signed = crypto::clear_sign(&entity, required(signer, "signing")?)?;
            if policy.crypt_enabled {
                let envelope = crypto::encrypt(&signed, required(recipient, "encryption")?)?;
                pkcs7_part(&envelope)
            } else {
                MailMessage::parse(&signed)?
            }
        } else {
            let envelope = seal_payload(&entity, policy, signer, recipient)?;
            match self.layout {
                EnvelopeLayout::Attachment => {
                    MailMessage::multipart("mixed", vec![pkcs7_part(&envelope)])
                }
                EnvelopeLayout::Opaque | EnvelopeLayout::ClearSigned => pkcs7_part(&envelope),
            }
        };

        let mut finished = draft.clone();
        finished.replace_content(&content);
        info!(policy = %policy, layout = ?self.layout, "Sealed message");
        Ok(finished)
    }

    /// Open a received message.
    ///
    /// `recipient` is needed only for encrypted mail. A signature that does
    /// not verify is reported through `RecoveredBody::verified`, not as an
    /// error. Messages with no S/MIME structure come back unchanged.
    pub fn open(
        &self,
        raw: &RawMessage,
        recipient: Option<&CertificateContext>,
        expected_signer: Option<&CertificateContext>,
    ) -> Result<RecoveredBody> {
        let recovered = match raw {
            RawMessage::Bare(bytes) => {
                debug!(bytes = bytes.len(), "Opening bare envelope");
                open_envelope(bytes, recipient, expected_signer)?
            }
            RawMessage::Structured(message) => {
                let wire = message.to_bytes();
                let parsed = mailparse::parse_mail(&wire)?;
                match open_parsed(&parsed, recipient, expected_signer)? {
                    Some(recovered) => recovered,
                    None => {
                        debug!("No S/MIME structure, body passes through");
                        RecoveredBody {
                            body: message.body().to_vec(),
                            ..RecoveredBody::from_entity(message.entity())
                        }
                    }
                }
            }
        };

        info!(
            decrypted = recovered.decrypted,
            verified = ?recovered.verified,
            signer = recovered.signer.as_deref().unwrap_or("-"),
            "Opened message"
        );
        Ok(recovered)
    }
}

fn required<'a>(
    context: Option<&'a CertificateContext>,
    purpose: &str,
) -> Result<&'a CertificateContext> {
    context.ok_or_else(|| {
        CryptoError::Credential(format!("{purpose} is enabled but no certificate is configured"))
            .into()
    })
}

fn seal_payload(
    entity: &[u8],
    policy: SigningPolicy,
    signer: Option<&CertificateContext>,
    recipient: Option<&CertificateContext>,
) -> Result<Pkcs7Envelope> {
    let mut envelope = None;
    if policy.sign_enabled {
        envelope = Some(crypto::sign(entity, required(signer, "signing")?)?);
    }
    if policy.crypt_enabled {
        let payload = envelope.as_ref().map_or(entity, Pkcs7Envelope::as_der);
        envelope = Some(crypto::encrypt(payload, required(recipient, "encryption")?)?);
    }
    envelope.ok_or_else(|| {
        CoreError::Config("policy enables neither signing nor encryption".to_string())
    })
}

/// `application/pkcs7-mime` entity carrying the envelope as a base64
/// `smime.p7m` attachment
fn pkcs7_part(envelope: &Pkcs7Envelope) -> MailMessage {
    MailMessage::new()
        .with_header(
            "Content-Type",
            format!(
                "application/pkcs7-mime; smime-type={}; name=\"{SMIME_FILENAME}\"",
                envelope.kind().smime_type()
            ),
        )
        .with_header("Content-Transfer-Encoding", "base64")
        .with_header(
            "Content-Disposition",
            format!("attachment; filename=\"{SMIME_FILENAME}\""),
        )
        .with_body(mime::base64_lines(envelope.as_der()))
}

/// `None` means the message is not S/MIME
fn open_parsed(
    parsed: &ParsedMail<'_>,
    recipient: Option<&CertificateContext>,
    expected_signer: Option<&CertificateContext>,
) -> Result<Option<RecoveredBody>> {
    if is_clear_signed(parsed) {
        debug!("Detected clear-signed message");
        return open_clear_signed(parsed, expected_signer).map(Some);
    }

    if let Some(part) = envelope_part(parsed) {
        debug!(content_type = %part.ctype.mimetype, "Detected PKCS#7 part");
        let der = part.get_body_raw()?;
        return open_envelope(&der, recipient, expected_signer).map(Some);
    }

    if parsed.subparts.is_empty() {
        let body = parsed.get_body_raw()?;
        if Pkcs7Envelope::decode(&body).is_some() {
            debug!("Body decodes as PKCS#7");
            return open_envelope(&body, recipient, expected_signer).map(Some);
        }
    }

    Ok(None)
}

fn is_marker(text: &[u8]) -> bool {
    mime::trim_ascii(text) == SIGNED_MARKER.as_bytes()
}

fn is_marker_part(part: &ParsedMail<'_>) -> bool {
    part.get_body_raw().is_ok_and(|body| is_marker(&body))
}

fn is_clear_signed(parsed: &ParsedMail<'_>) -> bool {
    let mimetype = parsed.ctype.mimetype.as_str();
    if mimetype == "multipart/signed" {
        return true;
    }
    if !mimetype.starts_with("multipart/") {
        return false;
    }

    let marked_preamble = match parsed.ctype.params.get("boundary") {
        Some(boundary) => {
            raw_body(parsed).is_ok_and(|body| is_marker(mime::preamble(body, boundary)))
        }
        None => false,
    };
    marked_preamble || parsed.subparts.first().is_some_and(is_marker_part)
}

/// The first part that is neither the signature nor the marker text is the
/// signed content and is checked as detached content. With no such part the
/// signature must embed its content.
fn open_clear_signed(
    parsed: &ParsedMail<'_>,
    expected_signer: Option<&CertificateContext>,
) -> Result<RecoveredBody> {
    let signature = parsed
        .subparts
        .iter()
        .find(|part| mime::is_pkcs7_signature(&part.ctype.mimetype))
        .ok_or_else(|| {
            CoreError::MalformedEnvelope(
                "signed message has no application/pkcs7-signature part".to_string(),
            )
        })?;
    let signature_der = signature.get_body_raw()?;

    let content = parsed
        .subparts
        .iter()
        .find(|part| !mime::is_pkcs7_signature(&part.ctype.mimetype) && !is_marker_part(part));

    let verification = match content {
        Some(part) => crypto::verify_detached(&signature_der, part.raw_bytes, expected_signer)?,
        None => crypto::verify(&signature_der, expected_signer)?,
    };
    Ok(RecoveredBody::from_verification(verification))
}

fn envelope_part<'a, 'b>(parsed: &'b ParsedMail<'a>) -> Option<&'b ParsedMail<'a>> {
    if mime::is_pkcs7_mime(&parsed.ctype.mimetype) {
        return Some(parsed);
    }
    parsed
        .subparts
        .iter()
        .find(|part| mime::is_pkcs7_mime(&part.ctype.mimetype) || names_smime_file(part))
}

fn names_smime_file(part: &ParsedMail<'_>) -> bool {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .is_some_and(|name| name.eq_ignore_ascii_case(SMIME_FILENAME))
}

fn open_envelope(
    bytes: &[u8],
    recipient: Option<&CertificateContext>,
    expected_signer: Option<&CertificateContext>,
) -> Result<RecoveredBody> {
    let envelope = Pkcs7Envelope::decode(bytes)
        .ok_or_else(|| CryptoError::Decryption("body is not a PKCS#7 structure".to_string()))?;

    match envelope.kind() {
        EnvelopeKind::Enveloped => {
            let recipient = recipient.ok_or_else(|| {
                CryptoError::Credential(
                    "message is encrypted but no recipient key is configured".to_string(),
                )
            })?;
            let plaintext = crypto::decrypt(envelope.as_der(), recipient)?;
            let mut recovered = open_plaintext(plaintext, expected_signer)?;
            recovered.decrypted = true;
            Ok(recovered)
        }
        EnvelopeKind::Signed => Ok(RecoveredBody::from_verification(crypto::verify(
            envelope.as_der(),
            expected_signer,
        )?)),
        EnvelopeKind::Other => Err(CoreError::MalformedEnvelope(
            "PKCS#7 structure is neither signed-data nor enveloped-data".to_string(),
        )),
    }
}

/// Decrypted payload: signed-data, a clear-signed entity, or the entity itself
fn open_plaintext(
    plaintext: Vec<u8>,
    expected_signer: Option<&CertificateContext>,
) -> Result<RecoveredBody> {
    if let Some(inner) = Pkcs7Envelope::decode(&plaintext) {
        if inner.kind() == EnvelopeKind::Signed {
            debug!("Decrypted payload is signed-data");
            return Ok(RecoveredBody::from_verification(crypto::verify(
                inner.as_der(),
                expected_signer,
            )?));
        }
    }

    if let Ok(parsed) = mailparse::parse_mail(&plaintext) {
        if is_clear_signed(&parsed) {
            debug!("Decrypted payload is clear-signed");
            return open_clear_signed(&parsed, expected_signer);
        }
    }

    Ok(RecoveredBody::from_entity(plaintext))
}
