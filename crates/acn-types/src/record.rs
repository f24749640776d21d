//! Agent records and proof-of-representation verification.
//!
//! An [`AgentRecord`] is a signed claim that an agent `address` is controlled
//! by `public_key` and represented on the network by the peer holding
//! `peer_public_key`. The signing scheme:
//!
//! 1. Length-prefix (u32, big-endian) each of `address`, `public_key`,
//!    `peer_public_key`, `not_before` and `not_after` (dates as `YYYY-MM-DD`).
//! 2. Compute SHA-256 over the concatenation.
//! 3. Sign the digest with the agent's Ed25519 key.
//!
//! Verification ([`verify`]) is a pure function of the record, the context
//! (expected address and asserting peer) and the current UTC date.

use crate::error::{AcnError, AcnResult};
use chrono::{NaiveDate, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Ledger identifiers whose keys this node can verify.
pub const SUPPORTED_LEDGERS: &[&str] = &["ed25519"];

/// Ledger used when issuing records.
pub const DEFAULT_LEDGER: &str = "ed25519";

/// Number of digest bytes that make up an agent address.
const ADDRESS_BYTES: usize = 20;

/// A signed proof-of-representation for one agent address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Service the agent belongs to (free-form).
    pub service_id: String,
    pub ledger_id: String,
    pub address: String,
    /// Hex-encoded agent public key.
    pub public_key: String,
    /// Hex-encoded public key of the representing peer.
    pub peer_public_key: String,
    /// Hex-encoded Ed25519 signature over [`AgentRecord::digest`].
    pub signature: String,
    pub not_before: NaiveDate,
    pub not_after: NaiveDate,
}

impl AgentRecord {
    /// Issue a record for the agent owning `agent_key`, represented by the
    /// peer whose hex public key is `peer_public_key`.
    pub fn issue(
        service_id: impl Into<String>,
        agent_key: &SigningKey,
        peer_public_key: impl Into<String>,
        not_before: NaiveDate,
        not_after: NaiveDate,
    ) -> Self {
        let verifying_key = agent_key.verifying_key();
        let mut record = Self {
            service_id: service_id.into(),
            ledger_id: DEFAULT_LEDGER.to_string(),
            address: derive_address(&verifying_key),
            public_key: public_key_hex(&verifying_key),
            peer_public_key: peer_public_key.into(),
            signature: String::new(),
            not_before,
            not_after,
        };
        let signature = agent_key.sign(&record.digest());
        record.signature = hex::encode(signature.to_bytes());
        record
    }

    /// Digest covered by the signature.
    pub fn digest(&self) -> [u8; 32] {
        let not_before = self.not_before.format("%Y-%m-%d").to_string();
        let not_after = self.not_after.format("%Y-%m-%d").to_string();
        let mut hasher = Sha256::new();
        for field in [
            self.address.as_str(),
            self.public_key.as_str(),
            self.peer_public_key.as_str(),
            not_before.as_str(),
            not_after.as_str(),
        ] {
            hasher.update((field.len() as u32).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.finalize().into()
    }

    /// Whether `day` falls inside `[not_before, not_after]`.
    pub fn is_valid_on(&self, day: NaiveDate) -> bool {
        self.not_before <= day && day <= self.not_after
    }
}

/// Verify a record against the current UTC date.
///
/// `expected_address` is the address the context requires (for example the
/// destination of an envelope). `expected_peer_key` is the hex key of the
/// peer asserting representation; `None` accepts the record's own
/// `peer_public_key`, as when validating a lookup answer.
pub fn verify(
    record: &AgentRecord,
    expected_address: Option<&str>,
    expected_peer_key: Option<&str>,
) -> AcnResult<()> {
    verify_at(
        record,
        expected_address,
        expected_peer_key,
        Utc::now().date_naive(),
    )
}

/// [`verify`] with an explicit date.
pub fn verify_at(
    record: &AgentRecord,
    expected_address: Option<&str>,
    expected_peer_key: Option<&str>,
    today: NaiveDate,
) -> AcnResult<()> {
    if !SUPPORTED_LEDGERS.contains(&record.ledger_id.as_str()) {
        return Err(AcnError::UnsupportedLedger(record.ledger_id.clone()));
    }

    if let Some(expected) = expected_address {
        if record.address != expected {
            return Err(AcnError::WrongAgentAddress {
                expected: expected.to_string(),
                found: record.address.clone(),
            });
        }
    }

    if let Some(expected) = expected_peer_key {
        if !record.peer_public_key.eq_ignore_ascii_case(expected) {
            return Err(AcnError::WrongPublicKey {
                expected: expected.to_string(),
                found: record.peer_public_key.clone(),
            });
        }
    }

    let verifying_key = parse_public_key(&record.public_key)?;
    if derive_address(&verifying_key) != record.address {
        return Err(AcnError::InvalidProof(format!(
            "address {} is not derived from public key {}",
            record.address, record.public_key
        )));
    }
    let sig_bytes: [u8; 64] = hex::decode(&record.signature)
        .map_err(|e| AcnError::InvalidProof(format!("signature is not hex: {e}")))?
        .as_slice()
        .try_into()
        .map_err(|_| {
            AcnError::InvalidProof("invalid signature length (expected 64 bytes)".into())
        })?;
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(&record.digest(), &signature)
        .map_err(|e| AcnError::InvalidProof(format!("signature verification failed: {e}")))?;

    if !record.is_valid_on(today) {
        return Err(AcnError::InvalidProof(format!(
            "record valid from {} to {}, today is {}",
            record.not_before, record.not_after, today
        )));
    }

    Ok(())
}

/// Agent address for a public key: hex of the first 20 bytes of its SHA-256.
pub fn derive_address(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..ADDRESS_BYTES])
}

pub fn public_key_hex(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

/// Parse a hex-encoded Ed25519 public key.
pub fn parse_public_key(encoded: &str) -> AcnResult<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(encoded)
        .map_err(|e| AcnError::InvalidProof(format!("public key is not hex: {e}")))?
        .as_slice()
        .try_into()
        .map_err(|_| AcnError::InvalidProof("invalid public key length (expected 32 bytes)".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| AcnError::InvalidProof(format!("invalid public key: {e}")))
}

/// Parse a hex-encoded Ed25519 secret key.
pub fn parse_signing_key(encoded: &str) -> AcnResult<SigningKey> {
    let bytes = Zeroizing::new(
        hex::decode(encoded.trim())
            .map_err(|e| AcnError::Config(format!("private key is not hex: {e}")))?,
    );
    let secret: &[u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| AcnError::Config("invalid private key length (expected 32 bytes)".into()))?;
    Ok(SigningKey::from_bytes(secret))
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn fixture() -> (AgentRecord, SigningKey) {
        let agent = generate_signing_key();
        let peer = generate_signing_key();
        let record = AgentRecord::issue(
            "acn",
            &agent,
            public_key_hex(&peer.verifying_key()),
            day("2026-01-01"),
            day("2026-12-31"),
        );
        (record, peer)
    }

    #[test]
    fn test_valid_record_accepted() {
        let (record, peer) = fixture();
        let peer_key = public_key_hex(&peer.verifying_key());
        assert!(verify_at(
            &record,
            Some(&record.address),
            Some(&peer_key),
            day("2026-06-15")
        )
        .is_ok());
    }

    #[test]
    fn test_validity_bounds_inclusive() {
        let (record, _) = fixture();
        assert!(verify_at(&record, None, None, day("2026-01-01")).is_ok());
        assert!(verify_at(&record, None, None, day("2026-12-31")).is_ok());
        let err = verify_at(&record, None, None, day("2027-01-01")).unwrap_err();
        assert!(matches!(err, AcnError::InvalidProof(_)));
        let err = verify_at(&record, None, None, day("2025-12-31")).unwrap_err();
        assert!(matches!(err, AcnError::InvalidProof(_)));
    }

    #[test]
    fn test_tampered_signature_byte_is_invalid_proof() {
        let (mut record, _) = fixture();
        let mut sig = hex::decode(&record.signature).unwrap();
        sig[10] ^= 0x01;
        record.signature = hex::encode(sig);
        let err = verify_at(&record, None, None, day("2026-06-15")).unwrap_err();
        assert!(matches!(err, AcnError::InvalidProof(_)), "got {err:?}");
    }

    #[test]
    fn test_unsupported_ledger_checked_first() {
        let (mut record, _) = fixture();
        record.ledger_id = "bitcoin".into();
        let err = verify_at(&record, Some("someone-else"), None, day("2026-06-15")).unwrap_err();
        assert!(matches!(err, AcnError::UnsupportedLedger(_)));
    }

    #[test]
    fn test_wrong_address() {
        let (record, _) = fixture();
        let err = verify_at(&record, Some("deadbeef"), None, day("2026-06-15")).unwrap_err();
        assert!(matches!(err, AcnError::WrongAgentAddress { .. }));
    }

    #[test]
    fn test_wrong_peer_key_checked_before_signature() {
        let (mut record, _) = fixture();
        record.signature = "00".into();
        let other = public_key_hex(&generate_signing_key().verifying_key());
        let err = verify_at(&record, None, Some(&other), day("2026-06-15")).unwrap_err();
        assert!(matches!(err, AcnError::WrongPublicKey { .. }));
    }

    #[test]
    fn test_changed_field_breaks_signature() {
        let (mut record, _) = fixture();
        record.not_after = day("2030-01-01");
        let err = verify_at(&record, None, None, day("2026-06-15")).unwrap_err();
        assert!(matches!(err, AcnError::InvalidProof(_)));
    }

    #[test]
    fn test_address_must_derive_from_key() {
        let (mut record, _) = fixture();
        let stranger = generate_signing_key();
        record.public_key = public_key_hex(&stranger.verifying_key());
        let err = verify_at(&record, None, None, day("2026-06-15")).unwrap_err();
        assert!(matches!(err, AcnError::InvalidProof(_)));
    }

    #[test]
    fn test_signing_key_hex_roundtrip() {
        let key = generate_signing_key();
        let parsed = parse_signing_key(&hex::encode(key.to_bytes())).unwrap();
        assert_eq!(parsed.verifying_key(), key.verifying_key());
        assert!(matches!(
            parse_signing_key("abcd"),
            Err(AcnError::Config(_))
        ));
    }
}
