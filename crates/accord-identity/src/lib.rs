//! ACCORD Identity - participant registry and signature verification.
//!
//! This is the only component that interprets signatures. Everything
//! downstream of it receives already-verified messages and may treat the
//! declared sender as authoritative.
//!
//! Key formats are opaque to the rest of the broker; the reference
//! implementation here uses a per-participant keyed MAC over the canonical
//! message encoding. Deployments backed by an external identity subsystem
//! implement [`SignatureVerifier`] against it instead.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use accord_types::{ParticipantId, Signature};

/// Outcome of verifying a message against a declared sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    Valid,
    UnknownSender,
    BadSignature,
    /// Declared human binding differs from the registered one.
    BindingMismatch,
    ExpiredKey,
}

impl VerifyOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyOutcome::Valid)
    }
}

/// The verification seam consumed by the broker. May be remote.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Verify `signature` over the canonical `message` for the declared
    /// sender, optionally asserting a human-identifier binding.
    async fn verify(
        &self,
        sender: &ParticipantId,
        human_id: Option<&str>,
        message: &[u8],
        signature: &Signature,
    ) -> VerifyOutcome;
}

/// Registration status of a participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    Active,
    Suspended(String),
    Revoked(String),
}

/// A registered participant endpoint.
#[derive(Clone, Debug)]
pub struct RegisteredParticipant {
    pub id: ParticipantId,
    /// Optional bound human identifier.
    pub human_id: Option<String>,
    pub status: ParticipantStatus,
    pub registered_at: DateTime<Utc>,
    key: MacKey,
}

#[derive(Clone)]
struct MacKey {
    secret: [u8; 32],
    expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "MacKey(expires_at: {:?})", self.expires_at)
    }
}

/// In-process participant directory with keyed-MAC verification.
pub struct ParticipantDirectory {
    participants: RwLock<HashMap<ParticipantId, RegisteredParticipant>>,
}

impl ParticipantDirectory {
    pub fn new() -> Self {
        Self {
            participants: RwLock::new(HashMap::new()),
        }
    }

    /// Register a participant with its verification secret.
    pub fn register(
        &self,
        id: ParticipantId,
        secret: &[u8],
        human_id: Option<String>,
        key_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), IdentityError> {
        let mut participants = self
            .participants
            .write()
            .map_err(|_| IdentityError::LockError)?;
        participants.insert(
            id.clone(),
            RegisteredParticipant {
                id,
                human_id,
                status: ParticipantStatus::Active,
                registered_at: Utc::now(),
                key: MacKey {
                    secret: *blake3::hash(secret).as_bytes(),
                    expires_at: key_expires_at,
                },
            },
        );
        Ok(())
    }

    pub fn suspend(&self, id: &ParticipantId, reason: &str) -> Result<(), IdentityError> {
        self.set_status(id, ParticipantStatus::Suspended(reason.to_string()))
    }

    pub fn revoke(&self, id: &ParticipantId, reason: &str) -> Result<(), IdentityError> {
        self.set_status(id, ParticipantStatus::Revoked(reason.to_string()))
    }

    fn set_status(&self, id: &ParticipantId, status: ParticipantStatus) -> Result<(), IdentityError> {
        let mut participants = self
            .participants
            .write()
            .map_err(|_| IdentityError::LockError)?;
        match participants.get_mut(id) {
            Some(participant) => {
                participant.status = status;
                Ok(())
            }
            None => Err(IdentityError::NotFound(id.0.clone())),
        }
    }

    /// Sign a canonical message on behalf of a registered participant.
    /// Test and in-process convenience; real initiators sign client-side.
    pub fn sign(&self, id: &ParticipantId, message: &[u8]) -> Result<Signature, IdentityError> {
        let participants = self
            .participants
            .read()
            .map_err(|_| IdentityError::LockError)?;
        let participant = participants
            .get(id)
            .ok_or_else(|| IdentityError::NotFound(id.0.clone()))?;
        Ok(Signature::new(
            mac_bytes(&participant.key.secret, message).to_vec(),
        ))
    }

    fn check(
        &self,
        sender: &ParticipantId,
        human_id: Option<&str>,
        message: &[u8],
        signature: &Signature,
    ) -> VerifyOutcome {
        let participants = match self.participants.read() {
            Ok(guard) => guard,
            Err(_) => return VerifyOutcome::UnknownSender,
        };
        let participant = match participants.get(sender) {
            Some(p) => p,
            None => return VerifyOutcome::UnknownSender,
        };
        if participant.status != ParticipantStatus::Active {
            return VerifyOutcome::UnknownSender;
        }
        if let Some(expires_at) = participant.key.expires_at {
            if Utc::now() > expires_at {
                return VerifyOutcome::ExpiredKey;
            }
        }
        if let Some(declared) = human_id {
            if participant.human_id.as_deref() != Some(declared) {
                return VerifyOutcome::BindingMismatch;
            }
        }
        let expected = mac_bytes(&participant.key.secret, message);
        if signature.0.as_slice() != expected {
            return VerifyOutcome::BadSignature;
        }
        VerifyOutcome::Valid
    }
}

impl Default for ParticipantDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignatureVerifier for ParticipantDirectory {
    async fn verify(
        &self,
        sender: &ParticipantId,
        human_id: Option<&str>,
        message: &[u8],
        signature: &Signature,
    ) -> VerifyOutcome {
        self.check(sender, human_id, message, signature)
    }
}

/// Verifier that accepts every message. Test setups only.
pub struct AcceptAllVerifier;

#[async_trait]
impl SignatureVerifier for AcceptAllVerifier {
    async fn verify(
        &self,
        _sender: &ParticipantId,
        _human_id: Option<&str>,
        _message: &[u8],
        _signature: &Signature,
    ) -> VerifyOutcome {
        VerifyOutcome::Valid
    }
}

fn mac_bytes(secret: &[u8; 32], message: &[u8]) -> [u8; 32] {
    *blake3::keyed_hash(secret, message).as_bytes()
}

/// Identity-related errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("participant not found: {0}")]
    NotFound(String),

    #[error("lock error")]
    LockError,
}
