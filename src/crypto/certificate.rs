use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::Path;

use crate::core::error::{ComplianceError, ComplianceResult};

const TAG_SEQUENCE: u8 = 0x30;
const TAG_BIT_STRING: u8 = 0x03;

/// Pre-provisioned X.509 signing certificate. Only the pieces the QR code
/// needs are extracted; the certificate is never issued or validated here.
#[derive(Clone)]
pub struct SigningCertificate {
    der: Vec<u8>,
    signature: Vec<u8>,
}

impl SigningCertificate {
    pub fn from_file(path: &Path) -> ComplianceResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ComplianceError::Signing(format!("cannot read certificate {}: {}", path.display(), e))
        })?;
        Self::from_pem(&text)
    }

    /// Accepts a PEM block or bare base64 DER.
    pub fn from_pem(text: &str) -> ComplianceResult<Self> {
        let body: String = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with("-----"))
            .collect();
        let der = STANDARD
            .decode(body.as_bytes())
            .map_err(|e| ComplianceError::Signing(format!("certificate is not valid base64: {}", e)))?;
        Self::from_der(der)
    }

    pub fn from_der(der: Vec<u8>) -> ComplianceResult<Self> {
        let signature = extract_signature(&der)?;
        Ok(SigningCertificate { der, signature })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The issuer's signature over the certificate (`signatureValue`).
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

impl std::fmt::Debug for SigningCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCertificate")
            .field("der_len", &self.der.len())
            .finish()
    }
}

// Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, signatureValue BIT STRING }
fn extract_signature(der: &[u8]) -> ComplianceResult<Vec<u8>> {
    let (tag, body, _) = read_tlv(der)?;
    if tag != TAG_SEQUENCE {
        return Err(malformed("certificate is not a DER SEQUENCE"));
    }

    let (_, _, rest) = read_tlv(body)?;
    let (_, _, rest) = read_tlv(rest)?;
    let (tag, bits, _) = read_tlv(rest)?;
    if tag != TAG_BIT_STRING {
        return Err(malformed("signatureValue is not a BIT STRING"));
    }

    match bits.split_first() {
        Some((&0, signature)) if !signature.is_empty() => Ok(signature.to_vec()),
        _ => Err(malformed("signatureValue is empty or has unused bits")),
    }
}

/// Returns (tag, contents, remaining input).
fn read_tlv(input: &[u8]) -> ComplianceResult<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first().ok_or_else(|| malformed("truncated DER"))?;
    let (&first, mut rest) = rest.split_first().ok_or_else(|| malformed("truncated DER length"))?;

    let len = if first & 0x80 == 0 {
        first as usize
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 || rest.len() < count {
            return Err(malformed("unsupported DER length"));
        }
        let len = rest[..count].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        rest = &rest[count..];
        len
    };

    if rest.len() < len {
        return Err(malformed("DER element overruns input"));
    }
    Ok((tag, &rest[..len], &rest[len..]))
}

fn malformed(message: &str) -> ComplianceError {
    ComplianceError::Signing(format!("malformed certificate: {}", message))
}
