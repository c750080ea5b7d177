//! Card verifiable certificates
//!
//! Certificates follow the BSI TR-03110 layout:
//!
//! ```text
//! 7F21 CV certificate
//!   7F4E body (signed)
//!     5F29 profile identifier
//!     42   certification authority reference (CAR)
//!     7F49 public key { 06 algorithm OID, 86 uncompressed point }
//!     5F20 certificate holder reference (CHR)
//!     5F25 effective date, 5F24 expiration date
//!   5F37 ECDSA signature, plain r || s
//! ```
//!
//! Keys are secp256k1 and signatures cover the encoded body hashed with
//! SHA-256. Validity dates are carried but not checked; terminals are
//! commonly deployed without a trusted clock.

use bytes::Bytes;
use iso7816_tlv::{
    TlvError,
    ber::{Tag, Tlv, Value},
};
use k256::{
    PublicKey, SecretKey,
    ecdsa::{
        Signature, SigningKey, VerifyingKey,
        signature::{Signer, Verifier},
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use thiserror::Error;
use tracing::trace;

use super::{CertificateChain, ChainVerifier, TrustAnchor, VerifiedIdentity};
use crate::error::ChainValidationError;

const TAG_CERTIFICATE: &[u8] = &[0x7F, 0x21];
const TAG_BODY: &[u8] = &[0x7F, 0x4E];
const TAG_PROFILE: &[u8] = &[0x5F, 0x29];
const TAG_CAR: &[u8] = &[0x42];
const TAG_PUBLIC_KEY: &[u8] = &[0x7F, 0x49];
const TAG_OID: &[u8] = &[0x06];
const TAG_POINT: &[u8] = &[0x86];
const TAG_CHR: &[u8] = &[0x5F, 0x20];
const TAG_EFFECTIVE: &[u8] = &[0x5F, 0x25];
const TAG_EXPIRATION: &[u8] = &[0x5F, 0x24];
const TAG_SIGNATURE: &[u8] = &[0x5F, 0x37];

/// id-TA-ECDSA-SHA-256 (0.4.0.127.0.7.2.2.2.2.3)
pub const ALGORITHM_ECDSA_SHA256: &[u8] =
    &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x02, 0x02, 0x03];

/// Errors encoding a certificate
#[derive(Debug, Error)]
pub enum CertificateError {
    /// TLV encoding failed
    #[error("Certificate encoding failed: {0}")]
    Encoding(TlvError),
}

impl From<TlvError> for CertificateError {
    fn from(error: TlvError) -> Self {
        Self::Encoding(error)
    }
}

pub(crate) fn is_certificate(tlv: &Tlv) -> bool {
    has_tag(tlv, TAG_CERTIFICATE)
}

fn has_tag(tlv: &Tlv, tag: &[u8]) -> bool {
    tlv.tag().to_bytes() == tag
}

fn find<'a>(tlvs: &'a [Tlv], tag: &[u8]) -> Option<&'a Tlv> {
    tlvs.iter().find(|tlv| has_tag(tlv, tag))
}

fn children(tlv: &Tlv) -> Result<&[Tlv], &'static str> {
    match tlv.value() {
        Value::Constructed(children) => Ok(children),
        Value::Primitive(_) => Err("expected constructed data object"),
    }
}

fn primitive<'a>(
    tlvs: &'a [Tlv],
    tag: &[u8],
    missing: &'static str,
) -> Result<&'a [u8], &'static str> {
    match find(tlvs, tag).map(Tlv::value) {
        Some(Value::Primitive(bytes)) => Ok(bytes),
        Some(Value::Constructed(_)) => Err("expected primitive data object"),
        None => Err(missing),
    }
}

/// Size of the BER tag and length octets at the start of `bytes`
fn header_len(bytes: &[u8]) -> Option<usize> {
    let mut len = 1;
    if bytes.first()? & 0x1F == 0x1F {
        while bytes.get(len)? & 0x80 != 0 {
            len += 1;
        }
        len += 1;
    }
    match *bytes.get(len)? {
        short if short & 0x80 == 0 => Some(len + 1),
        long => Some(len + 1 + usize::from(long & 0x7F)),
    }
}

/// The body exactly as encoded in `certificate`, which is what was signed
fn raw_body(certificate: &[u8]) -> Option<&[u8]> {
    let mut rest = certificate.get(header_len(certificate)?..)?;
    while !rest.is_empty() {
        let (tlv, remaining) = Tlv::parse(rest);
        let consumed = rest.len() - remaining.len();
        if has_tag(&tlv.ok()?, TAG_BODY) {
            return rest.get(..consumed);
        }
        rest = remaining;
    }
    None
}

fn reference(bytes: &[u8]) -> Result<String, &'static str> {
    if !bytes.is_ascii() {
        return Err("non-ASCII reference");
    }
    String::from_utf8(bytes.to_vec()).map_err(|_| "non-ASCII reference")
}

/// A decoded CV certificate
#[derive(Debug, Clone)]
pub struct CvCertificate {
    body: Vec<u8>,
    authority: String,
    holder: String,
    algorithm: Vec<u8>,
    point: Vec<u8>,
    signature: Vec<u8>,
}

impl CvCertificate {
    /// Decode a single encoded certificate
    pub fn decode(bytes: &[u8]) -> Result<Self, &'static str> {
        let tlv = Tlv::from_bytes(bytes).map_err(|_| "undecodable TLV")?;
        if !is_certificate(&tlv) {
            return Err("not a CV certificate");
        }
        let parts = children(&tlv)?;

        let body = find(parts, TAG_BODY).ok_or("missing certificate body")?;
        let raw = raw_body(bytes).ok_or("missing certificate body")?;
        let signature = primitive(parts, TAG_SIGNATURE, "missing signature")?;

        let fields = children(body)?;
        let authority = reference(primitive(fields, TAG_CAR, "missing authority reference")?)?;
        let holder = reference(primitive(fields, TAG_CHR, "missing holder reference")?)?;
        let key = children(find(fields, TAG_PUBLIC_KEY).ok_or("missing public key")?)?;
        let algorithm = primitive(key, TAG_OID, "missing key algorithm")?;
        let point = primitive(key, TAG_POINT, "missing public point")?;

        Ok(Self {
            body: raw.to_vec(),
            authority,
            holder,
            algorithm: algorithm.to_vec(),
            point: point.to_vec(),
            signature: signature.to_vec(),
        })
    }

    /// Issue a certificate binding `holder` to `subject`, signed by `signer`
    pub fn issue(
        authority: &str,
        holder: &str,
        subject: &PublicKey,
        signer: &SecretKey,
    ) -> Result<Bytes, CertificateError> {
        let point = subject.to_encoded_point(false);
        let body = constructed(
            TAG_BODY,
            vec![
                primitive_tlv(TAG_PROFILE, vec![0x00])?,
                primitive_tlv(TAG_CAR, authority.as_bytes().to_vec())?,
                constructed(
                    TAG_PUBLIC_KEY,
                    vec![
                        primitive_tlv(TAG_OID, ALGORITHM_ECDSA_SHA256.to_vec())?,
                        primitive_tlv(TAG_POINT, point.as_bytes().to_vec())?,
                    ],
                )?,
                primitive_tlv(TAG_CHR, holder.as_bytes().to_vec())?,
                primitive_tlv(TAG_EFFECTIVE, vec![2, 6, 0, 1, 0, 1])?,
                primitive_tlv(TAG_EXPIRATION, vec![3, 6, 1, 2, 3, 1])?,
            ],
        )?;

        let body_bytes = body.to_vec();
        let signature: Signature = SigningKey::from(signer).sign(&body_bytes);
        let certificate = constructed(
            TAG_CERTIFICATE,
            vec![body, primitive_tlv(TAG_SIGNATURE, signature.to_bytes().to_vec())?],
        )?;

        Ok(certificate.to_vec().into())
    }

    /// Certification authority reference
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Certificate holder reference
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// The certified public key
    pub fn public_key(&self) -> Result<PublicKey, k256::elliptic_curve::Error> {
        PublicKey::from_sec1_bytes(&self.point)
    }

    /// Check the signature against the issuer's key
    pub fn is_signed_by(&self, issuer: &PublicKey) -> bool {
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        VerifyingKey::from(issuer).verify(&self.body, &signature).is_ok()
    }
}

fn primitive_tlv(tag: &[u8], value: Vec<u8>) -> Result<Tlv, TlvError> {
    Tlv::new(Tag::try_from(tag.iter().fold(0u64, |acc, &b| acc << 8 | u64::from(b)))?, Value::Primitive(value))
}

fn constructed(tag: &[u8], children: Vec<Tlv>) -> Result<Tlv, TlvError> {
    Tlv::new(Tag::try_from(tag.iter().fold(0u64, |acc, &b| acc << 8 | u64::from(b)))?, Value::Constructed(children))
}

/// Verifies chains of CV certificates up to the trust anchor
///
/// The last certificate on the card must be issued by the anchor, and each
/// certificate before it by the one that follows.
#[derive(Debug, Default, Clone, Copy)]
pub struct CvcVerifier;

impl ChainVerifier for CvcVerifier {
    fn validate(
        &self,
        anchor: &TrustAnchor,
        chain: &CertificateChain,
    ) -> Result<VerifiedIdentity, ChainValidationError> {
        if chain.is_empty() {
            return Err(ChainValidationError::EmptyChain);
        }

        let certificates = chain
            .certificates()
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                CvCertificate::decode(raw)
                    .map_err(|reason| ChainValidationError::Malformed { index, reason })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut authority = anchor.holder().to_owned();
        let mut key = *anchor.public_key();
        let mut path = format!("/{authority}");

        for certificate in certificates.iter().rev() {
            let holder = certificate.holder().to_owned();
            if certificate.authority() != authority {
                return Err(ChainValidationError::UnknownAuthority {
                    holder,
                    expected: authority,
                    found: certificate.authority().to_owned(),
                });
            }
            if certificate.algorithm != ALGORITHM_ECDSA_SHA256 {
                return Err(ChainValidationError::UnsupportedAlgorithm { holder });
            }
            if !certificate.is_signed_by(&key) {
                return Err(ChainValidationError::BadSignature { holder });
            }
            key = certificate
                .public_key()
                .map_err(|_| ChainValidationError::InvalidKey {
                    holder: holder.clone(),
                })?;

            trace!(%holder, %authority, "Certificate verified");
            path.push('/');
            path.push_str(&holder);
            authority = holder;
        }

        Ok(VerifiedIdentity::new(key, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SecretKey {
        SecretKey::random(&mut rand_v8::thread_rng())
    }

    struct Pki {
        anchor: TrustAnchor,
        device_key: SecretKey,
        chain: Vec<u8>,
    }

    fn pki() -> Pki {
        let root = key();
        let issuer = key();
        let device_key = key();

        let issuer_cert =
            CvCertificate::issue("PTROOT00001", "PTCA000001", &issuer.public_key(), &root).unwrap();
        let device_cert =
            CvCertificate::issue("PTCA000001", "PTDEV00042", &device_key.public_key(), &issuer)
                .unwrap();

        let mut chain = device_cert.to_vec();
        chain.extend_from_slice(&issuer_cert);

        Pki {
            anchor: TrustAnchor::new("PTROOT00001", root.public_key()),
            device_key,
            chain,
        }
    }

    #[test]
    fn test_decode_issued_certificate() {
        let signer = key();
        let subject = key();
        let raw =
            CvCertificate::issue("CAR0001", "CHR0001", &subject.public_key(), &signer).unwrap();

        let certificate = CvCertificate::decode(&raw).unwrap();
        assert_eq!(certificate.authority(), "CAR0001");
        assert_eq!(certificate.holder(), "CHR0001");
        assert_eq!(certificate.public_key().unwrap(), subject.public_key());
        assert!(certificate.is_signed_by(&signer.public_key()));
        assert!(!certificate.is_signed_by(&subject.public_key()));
    }

    fn long_form(tag: &[u8], content: &[u8]) -> Vec<u8> {
        let len = u16::try_from(content.len()).unwrap().to_be_bytes();
        let mut encoded = tag.to_vec();
        encoded.extend_from_slice(&[0x82, len[0], len[1]]);
        encoded.extend_from_slice(content);
        encoded
    }

    #[test]
    fn test_signature_covers_body_as_encoded() {
        let signer = key();
        let subject = key();
        let issued =
            CvCertificate::issue("CAR0001", "CHR0001", &subject.public_key(), &signer).unwrap();

        // Same fields, but every length in long form
        let outer = Tlv::from_bytes(&issued).unwrap();
        let parts = children(&outer).unwrap();
        let fields: Vec<u8> = children(find(parts, TAG_BODY).unwrap())
            .unwrap()
            .iter()
            .flat_map(Tlv::to_vec)
            .collect();
        let body = long_form(TAG_BODY, &fields);
        let signature: Signature = SigningKey::from(&signer).sign(&body);
        let mut content = body;
        content.extend_from_slice(&long_form(TAG_SIGNATURE, &signature.to_bytes()));
        let encoded = long_form(TAG_CERTIFICATE, &content);

        let certificate = CvCertificate::decode(&encoded).unwrap();
        assert_eq!(certificate.holder(), "CHR0001");
        assert!(certificate.is_signed_by(&signer.public_key()));
    }

    #[test]
    fn test_valid_chain() {
        let pki = pki();
        let chain = CertificateChain::parse(&pki.chain).unwrap();
        assert_eq!(chain.len(), 2);

        let identity = CvcVerifier.validate(&pki.anchor, &chain).unwrap();
        assert_eq!(identity.path(), "/PTROOT00001/PTCA000001/PTDEV00042");
        assert_eq!(identity.public_key(), &pki.device_key.public_key());
    }

    #[test]
    fn test_untrusted_anchor() {
        let pki = pki();
        let chain = CertificateChain::parse(&pki.chain).unwrap();

        let other = TrustAnchor::new("PTROOT00001", key().public_key());
        assert!(matches!(
            CvcVerifier.validate(&other, &chain),
            Err(ChainValidationError::BadSignature { holder }) if holder == "PTCA000001"
        ));

        let renamed = TrustAnchor::new("OTHERROOT", *pki.anchor.public_key());
        assert!(matches!(
            CvcVerifier.validate(&renamed, &chain),
            Err(ChainValidationError::UnknownAuthority { .. })
        ));
    }

    #[test]
    fn test_tampered_body() {
        let pki = pki();
        let mut raw = pki.chain.clone();
        // Flip a byte inside the device public point
        let point_offset = raw
            .windows(2)
            .position(|w| w == [0x86, 0x41])
            .unwrap();
        raw[point_offset + 10] ^= 0x01;

        let chain = CertificateChain::parse(&raw).unwrap();
        let result = CvcVerifier.validate(&pki.anchor, &chain);
        assert!(matches!(
            result,
            Err(ChainValidationError::BadSignature { .. } | ChainValidationError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_missing_issuer() {
        let pki = pki();
        let device_only = CertificateChain::parse(&pki.chain).unwrap().certificates()[0].clone();
        let chain = CertificateChain::parse(&device_only).unwrap();

        assert!(matches!(
            CvcVerifier.validate(&pki.anchor, &chain),
            Err(ChainValidationError::UnknownAuthority { expected, found, .. })
                if expected == "PTROOT00001" && found == "PTCA000001"
        ));
    }

    #[test]
    fn test_chain_parse_rejects_garbage() {
        assert!(CertificateChain::parse(&[]).is_err());
        assert!(CertificateChain::parse(&[0x00, 0x00, 0xFF]).is_err());
        assert!(CertificateChain::parse(&[0x30, 0x03, 0x01, 0x02, 0x03]).is_err());

        let pki = pki();
        let truncated = &pki.chain[..pki.chain.len() - 5];
        assert!(CertificateChain::parse(truncated).is_err());
    }

    #[test]
    fn test_chain_parse_skips_filler() {
        let pki = pki();
        let mut padded = pki.chain.clone();
        padded.extend_from_slice(&[0x00; 32]);

        let chain = CertificateChain::parse(&padded).unwrap();
        assert_eq!(chain.len(), 2);
    }
}
