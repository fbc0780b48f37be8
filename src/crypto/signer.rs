//! # ECDSA invoice signing (secp256k1)
//!
//! The private key is read once when the signer is built and lives only as
//! long as the signer; `SigningKey` zeroizes itself on drop and the PEM text
//! is held in a `Zeroizing` buffer while parsing. Nothing here logs key
//! material.

use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use k256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroizing;

use super::certificate::SigningCertificate;
use crate::core::config::ComplianceSettings;
use crate::core::error::{ComplianceError, ComplianceResult};
use crate::models::{InvoiceHash, InvoiceKind};

/// Output of one signing operation, embedded in the invoice and its QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBundle {
    /// DER-encoded ECDSA signature over the invoice digest.
    #[serde(with = "super::base64_bytes")]
    pub signature: Vec<u8>,
    /// SubjectPublicKeyInfo DER of the signing key.
    #[serde(with = "super::base64_bytes")]
    pub public_key: Vec<u8>,
    /// Issuer signature of the signing certificate (simplified invoices).
    #[serde(default, with = "super::base64_bytes::option")]
    pub certificate_signature: Option<Vec<u8>>,
}

pub struct InvoiceSigner {
    key: SigningKey,
    public_key_der: Vec<u8>,
    certificate: Option<SigningCertificate>,
}

impl InvoiceSigner {
    /// Loads the key and certificate named in the settings.
    pub fn from_settings(settings: &ComplianceSettings) -> ComplianceResult<Self> {
        let certificate = SigningCertificate::from_file(&settings.certificate_path)?;
        Self::from_key_file(&settings.private_key_path, Some(certificate))
    }

    pub fn from_key_file(path: &Path, certificate: Option<SigningCertificate>) -> ComplianceResult<Self> {
        let pem = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            ComplianceError::Signing(format!("cannot read private key {}: {}", path.display(), e))
        })?);
        Self::from_pem(&pem, certificate)
    }

    /// Accepts SEC1 (`EC PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) PEM.
    pub fn from_pem(pem: &str, certificate: Option<SigningCertificate>) -> ComplianceResult<Self> {
        let secret = k256::SecretKey::from_sec1_pem(pem)
            .or_else(|_| k256::SecretKey::from_pkcs8_pem(pem))
            .map_err(|_| ComplianceError::Signing("private key is not a secp256k1 PEM key".to_string()))?;
        Self::from_signing_key(SigningKey::from(&secret), certificate)
    }

    pub fn from_signing_key(key: SigningKey, certificate: Option<SigningCertificate>) -> ComplianceResult<Self> {
        let public_key = k256::PublicKey::from(key.verifying_key());
        let public_key_der = public_key
            .to_public_key_der()
            .map_err(|e| ComplianceError::Signing(format!("cannot encode public key: {}", e)))?
            .as_bytes()
            .to_vec();

        Ok(InvoiceSigner {
            key,
            public_key_der,
            certificate,
        })
    }

    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    pub fn certificate(&self) -> Option<&SigningCertificate> {
        self.certificate.as_ref()
    }

    /// Signs a 32-byte invoice digest.
    pub fn sign(&self, digest: &[u8], kind: InvoiceKind) -> ComplianceResult<SignatureBundle> {
        if digest.len() != InvoiceHash::LEN {
            return Err(ComplianceError::Signing(format!(
                "digest must be {} bytes, got {}",
                InvoiceHash::LEN,
                digest.len()
            )));
        }

        let signature: Signature = self
            .key
            .try_sign(digest)
            .map_err(|e| ComplianceError::Signing(format!("ECDSA signing failed: {}", e)))?;

        let certificate_signature = if kind.embeds_certificate_signature() {
            self.certificate.as_ref().map(|c| c.signature().to_vec())
        } else {
            None
        };

        Ok(SignatureBundle {
            signature: signature.to_der().as_bytes().to_vec(),
            public_key: self.public_key_der.clone(),
            certificate_signature,
        })
    }
}

impl std::fmt::Debug for InvoiceSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvoiceSigner")
            .field("key", &"<redacted>")
            .field("certificate", &self.certificate)
            .finish()
    }
}

/// Checks a bundle's signature against a digest using the embedded public key.
pub fn verify_signature(digest: &[u8], bundle: &SignatureBundle) -> ComplianceResult<()> {
    let verifying_key = VerifyingKey::from_public_key_der(&bundle.public_key)
        .map_err(|_| ComplianceError::Signing("invalid public key".to_string()))?;
    let signature = Signature::from_der(&bundle.signature)
        .map_err(|_| ComplianceError::Signing("invalid signature encoding".to_string()))?;

    verifying_key
        .verify(digest, &signature)
        .map_err(|_| ComplianceError::Signing("signature verification failed".to_string()))
}
