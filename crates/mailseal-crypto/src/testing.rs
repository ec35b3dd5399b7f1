//! Throwaway identities for tests
//!
//! Generates a self-signed RSA certificate and key and writes both to a
//! temporary directory that lives as long as the identity.

use std::fs;
use std::path::PathBuf;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::symm::Cipher;
use openssl::x509::{X509Builder, X509NameBuilder};
use secrecy::SecretString;
use tempfile::TempDir;

use crate::credentials::CertificateContext;

pub struct TestIdentity {
    _dir: TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    passphrase: Option<String>,
}

impl TestIdentity {
    /// Create an identity. Serials must differ between identities used in the
    /// same test so recipient lookups by issuer and serial stay unambiguous.
    pub fn generate(common_name: &str, serial: u32, passphrase: Option<&str>) -> Self {
        let rsa = Rsa::generate(2048).expect("rsa keygen");
        let pkey = PKey::from_rsa(rsa).expect("pkey");

        let mut name = X509NameBuilder::new().expect("name builder");
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)
            .expect("common name");
        let name = name.build();

        let mut builder = X509Builder::new().expect("x509 builder");
        builder.set_version(2).expect("version");
        let serial = BigNum::from_u32(serial)
            .and_then(|bn| bn.to_asn1_integer())
            .expect("serial");
        builder.set_serial_number(&serial).expect("set serial");
        builder.set_subject_name(&name).expect("subject");
        builder.set_issuer_name(&name).expect("issuer");
        builder.set_pubkey(&pkey).expect("pubkey");
        let not_before = Asn1Time::days_from_now(0).expect("not before");
        let not_after = Asn1Time::days_from_now(30).expect("not after");
        builder.set_not_before(&not_before).expect("set not before");
        builder.set_not_after(&not_after).expect("set not after");
        builder.sign(&pkey, MessageDigest::sha256()).expect("self-sign");
        let cert = builder.build();

        let cert_pem = cert.to_pem().expect("cert pem");
        let key_pem = match passphrase {
            Some(pass) => pkey
                .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), pass.as_bytes())
                .expect("encrypted key pem"),
            None => pkey.private_key_to_pem_pkcs8().expect("key pem"),
        };

        let dir = tempfile::tempdir().expect("tempdir");
        let cert_path = dir.path().join(format!("{common_name}.crt"));
        let key_path = dir.path().join(format!("{common_name}.key"));
        fs::write(&cert_path, &cert_pem).expect("write cert");
        fs::write(&key_path, &key_pem).expect("write key");

        Self {
            _dir: dir,
            cert_path,
            key_path,
            cert_pem,
            key_pem,
            passphrase: passphrase.map(str::to_string),
        }
    }

    pub fn passphrase(&self) -> Option<SecretString> {
        self.passphrase.clone().map(SecretString::new)
    }

    /// Full context (certificate + key), default cipher
    pub fn context(&self) -> CertificateContext {
        CertificateContext::load(
            &self.cert_path,
            &self.key_path,
            self.passphrase().as_ref(),
            None,
        )
        .expect("load test identity")
    }

    /// Certificate-only context, as a sender would hold for a recipient
    pub fn recipient(&self) -> CertificateContext {
        CertificateContext::load_certificate(&self.cert_path, None).expect("load test certificate")
    }
}
