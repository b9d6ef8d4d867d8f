//! Artifact integrity verification.
//!
//! Downloaded artifacts are checked against the digest declared in the feed
//! before anything is promoted out of the staging directory:
//! - SHA-256 or SHA-512 digest, computed as bytes stream to disk
//! - Constant-time comparison to prevent timing attacks
//! - Optional Ed25519 publisher signature over the digest bytes

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{ConfigError, EligibilityError, IntegrityError};

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The digest a feed declares for an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDigest {
    pub algorithm: DigestAlgorithm,
    pub value: Vec<u8>,
}

impl ExpectedDigest {
    /// Parse `algorithm:value`, e.g. `sha512:9f86d0...`.
    pub fn parse(s: &str) -> Result<Self, EligibilityError> {
        let (algorithm, value) = s
            .split_once(':')
            .ok_or_else(|| EligibilityError::InvalidDigest(format!("expected algorithm:value, got {s:?}")))?;
        Self::from_parts(algorithm, value)
    }

    /// Build from a separate algorithm name and encoded value.
    ///
    /// The value may be hex or standard base64.
    pub fn from_parts(algorithm: &str, value: &str) -> Result<Self, EligibilityError> {
        let algorithm = DigestAlgorithm::from_name(algorithm).ok_or_else(|| {
            EligibilityError::InvalidDigest(format!("unsupported algorithm {algorithm:?}"))
        })?;
        let value = decode_digest_value(value.trim(), algorithm.output_len()).ok_or_else(|| {
            EligibilityError::InvalidDigest(format!(
                "value is not a {}-byte hex or base64 {} digest",
                algorithm.output_len(),
                algorithm
            ))
        })?;
        Ok(Self { algorithm, value })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.value)
    }
}

impl fmt::Display for ExpectedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

fn decode_digest_value(value: &str, len: usize) -> Option<Vec<u8>> {
    if value.len() == len * 2 {
        if let Ok(bytes) = hex::decode(value) {
            return Some(bytes);
        }
    }
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .ok()
        .filter(|bytes| bytes.len() == len)
}

/// Running digest over bytes as they pass through the downloader.
#[derive(Clone)]
pub enum DigestAccumulator {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestAccumulator {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Self::Sha256(_) => DigestAlgorithm::Sha256,
            Self::Sha512(_) => DigestAlgorithm::Sha512,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> ComputedDigest {
        let algorithm = self.algorithm();
        let value = match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        };
        ComputedDigest { algorithm, value }
    }
}

impl fmt::Debug for DigestAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DigestAccumulator").field(&self.algorithm()).finish()
    }
}

/// Digest actually computed over an artifact's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedDigest {
    pub algorithm: DigestAlgorithm,
    pub value: Vec<u8>,
}

impl ComputedDigest {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.value)
    }
}

/// Compute the digest of a file on disk.
///
/// Reads the file in chunks so large artifacts are never held in memory.
pub fn compute_file_digest(
    path: &Path,
    algorithm: DigestAlgorithm,
) -> Result<ComputedDigest, std::io::Error> {
    let mut file = File::open(path)?;
    let mut acc = DigestAccumulator::new(algorithm);
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        acc.update(&buffer[..bytes_read]);
    }

    Ok(acc.finalize())
}

/// Verifies downloaded artifacts for integrity and, optionally, authenticity.
///
/// # Example
///
/// ```ignore
/// use app_updater::verify::{DigestAccumulator, ExpectedDigest, IntegrityVerifier};
///
/// let expected = ExpectedDigest::parse("sha256:...")?;
/// let mut acc = DigestAccumulator::new(expected.algorithm);
/// acc.update(b"artifact bytes");
/// IntegrityVerifier::new().verify_digest(&expected, &acc.finalize())?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct IntegrityVerifier {
    /// Trusted publisher keys. Empty means signatures are not checked.
    publisher_keys: Vec<VerifyingKey>,
}

impl IntegrityVerifier {
    /// Digest-only verifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier that also requires a valid publisher signature.
    pub fn with_publisher_keys(publisher_keys: Vec<VerifyingKey>) -> Self {
        Self { publisher_keys }
    }

    pub fn requires_signature(&self) -> bool {
        !self.publisher_keys.is_empty()
    }

    /// Compare a computed digest with the declared one in constant time.
    pub fn verify_digest(
        &self,
        expected: &ExpectedDigest,
        actual: &ComputedDigest,
    ) -> Result<(), IntegrityError> {
        let matches = expected.algorithm == actual.algorithm
            && actual.value.ct_eq(&expected.value).unwrap_u8() == 1;

        if !matches {
            tracing::error!(
                algorithm = %expected.algorithm,
                expected = %expected.to_hex(),
                actual = %actual.to_hex(),
                "Artifact digest mismatch"
            );
            return Err(IntegrityError::DigestMismatch {
                algorithm: expected.algorithm.to_string(),
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }

        tracing::debug!(digest = %actual.to_hex(), "Artifact digest verified");
        Ok(())
    }

    /// Check the byte count against the declared size, if any.
    pub fn verify_size(&self, expected: Option<u64>, actual: u64) -> Result<(), IntegrityError> {
        match expected {
            Some(expected) if expected != actual => {
                tracing::error!(expected, actual, "Artifact size mismatch");
                Err(IntegrityError::SizeMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    /// Verify the publisher signature over the raw digest bytes.
    ///
    /// A no-op when no publisher keys are configured.
    pub fn verify_signature(
        &self,
        digest: &ComputedDigest,
        signature: Option<&[u8]>,
    ) -> Result<(), IntegrityError> {
        if self.publisher_keys.is_empty() {
            return Ok(());
        }

        let signature = signature.ok_or(IntegrityError::SignatureMissing)?;
        let bytes: [u8; 64] = signature.try_into().map_err(|_| {
            IntegrityError::SignatureInvalid(format!(
                "expected 64 signature bytes, got {}",
                signature.len()
            ))
        })?;
        let signature = Signature::from_bytes(&bytes);

        if self
            .publisher_keys
            .iter()
            .any(|key| key.verify(&digest.value, &signature).is_ok())
        {
            tracing::debug!("Publisher signature verified");
            Ok(())
        } else {
            Err(IntegrityError::SignatureInvalid(
                "no trusted publisher key matches".to_string(),
            ))
        }
    }

    /// Full check of a finished download: size, digest, then signature.
    pub fn verify(
        &self,
        expected: &ExpectedDigest,
        expected_size: Option<u64>,
        signature: Option<&[u8]>,
        actual: &ComputedDigest,
        actual_size: u64,
    ) -> Result<(), IntegrityError> {
        self.verify_size(expected_size, actual_size)?;
        self.verify_digest(expected, actual)?;
        self.verify_signature(actual, signature)
    }
}

/// Parse an Ed25519 public key from string format.
///
/// Supports `ed25519:<hex>` and `ed25519:<base64>` encodings of the
/// 32 key bytes.
pub fn parse_publisher_key(s: &str) -> Result<VerifyingKey, ConfigError> {
    let encoded = s
        .trim()
        .strip_prefix("ed25519:")
        .ok_or_else(|| ConfigError::Invalid("key must start with 'ed25519:'".to_string()))?;

    let key_data = match hex::decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ConfigError::Invalid(format!("invalid key encoding: {e}")))?,
    };

    let key_bytes: [u8; 32] = key_data
        .try_into()
        .map_err(|_| ConfigError::Invalid("Ed25519 public key must be 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| ConfigError::Invalid(format!("invalid Ed25519 public key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn digest_of(algorithm: DigestAlgorithm, data: &[u8]) -> ComputedDigest {
        let mut acc = DigestAccumulator::new(algorithm);
        acc.update(data);
        acc.finalize()
    }

    #[test]
    fn test_parse_hex_digest() {
        let d = ExpectedDigest::parse(
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .unwrap();
        assert_eq!(d.algorithm, DigestAlgorithm::Sha256);
        assert_eq!(d.value.len(), 32);
    }

    #[test]
    fn test_parse_base64_digest() {
        let raw = digest_of(DigestAlgorithm::Sha512, b"hello");
        let encoded = base64::engine::general_purpose::STANDARD.encode(&raw.value);
        let d = ExpectedDigest::from_parts("sha512", &encoded).unwrap();
        assert_eq!(d.value, raw.value);
    }

    #[test]
    fn test_parse_digest_rejects_garbage() {
        assert!(ExpectedDigest::parse("deadbeef").is_err());
        assert!(ExpectedDigest::parse("md5:d41d8cd98f00b204e9800998ecf8427e").is_err());
        assert!(ExpectedDigest::parse("sha512:deadbeef").is_err());
    }

    #[test]
    fn test_verify_digest_match_and_mismatch() {
        let verifier = IntegrityVerifier::new();
        let actual = digest_of(DigestAlgorithm::Sha256, b"payload");
        let expected = ExpectedDigest {
            algorithm: DigestAlgorithm::Sha256,
            value: actual.value.clone(),
        };
        assert!(verifier.verify_digest(&expected, &actual).is_ok());

        let tampered = digest_of(DigestAlgorithm::Sha256, b"payl0ad");
        assert!(matches!(
            verifier.verify_digest(&expected, &tampered),
            Err(IntegrityError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_digest_algorithm_mismatch() {
        let verifier = IntegrityVerifier::new();
        let actual = digest_of(DigestAlgorithm::Sha512, b"payload");
        let expected = ExpectedDigest {
            algorithm: DigestAlgorithm::Sha256,
            value: vec![0; 32],
        };
        assert!(verifier.verify_digest(&expected, &actual).is_err());
    }

    #[test]
    fn test_verify_size() {
        let verifier = IntegrityVerifier::new();
        assert!(verifier.verify_size(None, 10).is_ok());
        assert!(verifier.verify_size(Some(10), 10).is_ok());
        assert_eq!(
            verifier.verify_size(Some(10), 11),
            Err(IntegrityError::SizeMismatch {
                expected: 10,
                actual: 11
            })
        );
    }

    #[test]
    fn test_compute_file_digest_matches_stream() {
        let mut file = NamedTempFile::new().unwrap();
        let content = vec![7u8; HASH_BUFFER_SIZE * 3 + 17];
        file.write_all(&content).unwrap();
        file.flush().unwrap();

        let from_file = compute_file_digest(file.path(), DigestAlgorithm::Sha512).unwrap();
        assert_eq!(from_file, digest_of(DigestAlgorithm::Sha512, &content));
    }

    #[test]
    fn test_signature_verification() {
        let signing_key = SigningKey::from_bytes(&[1u8; 32]);
        let verifier = IntegrityVerifier::with_publisher_keys(vec![signing_key.verifying_key()]);
        let digest = digest_of(DigestAlgorithm::Sha512, b"release");

        let signature = signing_key.sign(&digest.value).to_bytes();
        assert!(verifier.verify_signature(&digest, Some(&signature)).is_ok());

        let other = SigningKey::from_bytes(&[2u8; 32]).sign(&digest.value).to_bytes();
        assert!(matches!(
            verifier.verify_signature(&digest, Some(&other)),
            Err(IntegrityError::SignatureInvalid(_))
        ));

        assert_eq!(
            verifier.verify_signature(&digest, None),
            Err(IntegrityError::SignatureMissing)
        );
    }

    #[test]
    fn test_signature_skipped_without_keys() {
        let verifier = IntegrityVerifier::new();
        let digest = digest_of(DigestAlgorithm::Sha256, b"x");
        assert!(verifier.verify_signature(&digest, None).is_ok());
    }

    #[test]
    fn test_parse_publisher_key() {
        let key = SigningKey::from_bytes(&[3u8; 32]).verifying_key();
        let hex_form = format!("ed25519:{}", hex::encode(key.as_bytes()));
        assert_eq!(parse_publisher_key(&hex_form).unwrap(), key);

        let b64_form = format!(
            "ed25519:{}",
            base64::engine::general_purpose::STANDARD.encode(key.as_bytes())
        );
        assert_eq!(parse_publisher_key(&b64_form).unwrap(), key);

        assert!(parse_publisher_key("rsa:abcd").is_err());
        assert!(parse_publisher_key("ed25519:00000000").is_err());
    }
}
