#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **evm-auth** – Pluggable digest and signature primitives for the Event
//! Virtual Machine.
//!
//! The EVM core never hard-codes a hash or signature algorithm (spec
//! Non-goals: no cryptographic primitive implementation). Instead it depends
//! on the [`evm_types::Digest`] trait plus the [`Signer`] and [`Verifier`]
//! traits defined here. This crate bundles a default SHA-256 digest and a
//! default Ed25519 signer/verifier pair, the same way the workspace's
//! capability-token crate used to bundle a default HS256 JWT implementation
//! behind trait boundaries it did not hard-code elsewhere.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use evm_types::digest::Digest;
use evm_types::id::ServerName;
use sha2::{Digest as _, Sha256};

/// SHA-256, the default digest algorithm (spec §4.A: "defaulting to
/// SHA-256").
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Digest;

impl Digest for Sha256Digest {
    fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        Sha256::digest(bytes).to_vec()
    }

    fn algorithm_name(&self) -> &'static str {
        "sha256"
    }
}

/// Produces a detached signature over a byte string using the local
/// server's signing key.
pub trait Signer {
    /// Sign `bytes`, returning the base64-encoded signature.
    fn sign(&self, bytes: &[u8]) -> String;

    /// The algorithm:key-id pair this signer publishes under, e.g.
    /// `"ed25519:1"`.
    fn key_id(&self) -> &str;

    /// The server name this signer signs on behalf of.
    fn server_name(&self) -> &ServerName;
}

/// Errors raised while verifying a signature.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    /// No public key is known for the given server/key-id pair.
    #[error("no known key for {0}:{1}")]
    UnknownKey(String, String),
    /// The signature was not valid base64.
    #[error("signature is not valid base64")]
    BadEncoding,
    /// The signature bytes were not a valid Ed25519 signature.
    #[error("malformed signature")]
    Malformed,
    /// The signature did not verify against the claimed content.
    #[error("signature verification failed")]
    Invalid,
}

/// Verifies a detached signature against a known set of server public keys.
/// Invoked by the durable-event stage (spec §4.F.2) when `opts.verify` is
/// set; failure faults `GENERAL` with this error surfaced through the fault
/// taxonomy.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Verify `signature` (base64) over `bytes`, claimed to be from
    /// `server` under `key_id`.
    async fn verify(
        &self,
        server: &ServerName,
        key_id: &str,
        bytes: &[u8],
        signature: &str,
    ) -> Result<(), VerifyError>;
}

/// An Ed25519 signer holding the local server's signing key.
pub struct Ed25519Signer {
    server: ServerName,
    key_id: String,
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Construct a signer for `server` from a raw 32-byte seed, publishing
    /// under `key_id` (e.g. `"ed25519:1"`, sans the server prefix).
    pub fn new(server: ServerName, key_id: impl Into<String>, seed: [u8; 32]) -> Self {
        Self {
            server,
            key_id: key_id.into(),
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// The public key counterpart, to be published for others to verify
    /// against.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, bytes: &[u8]) -> String {
        let sig = self.signing_key.sign(bytes);
        base64::engine::general_purpose::STANDARD.encode(sig.to_bytes())
    }

    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn server_name(&self) -> &ServerName {
        &self.server
    }
}

/// An Ed25519 verifier backed by a fixed table of known public keys. Key
/// distribution (fetching a remote server's keys) is an external
/// collaborator concern; this type only checks a signature against keys it
/// has already been given.
#[derive(Default)]
pub struct Ed25519Verifier {
    keys: HashMap<(String, String), VerifyingKey>,
}

impl Ed25519Verifier {
    /// An empty verifier with no known keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a known public key for `server` under `key_id`.
    pub fn add_key(&mut self, server: ServerName, key_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert((server.0, key_id.into()), key);
    }
}

#[async_trait]
impl Verifier for Ed25519Verifier {
    async fn verify(
        &self,
        server: &ServerName,
        key_id: &str,
        bytes: &[u8],
        signature: &str,
    ) -> Result<(), VerifyError> {
        let key = self
            .keys
            .get(&(server.0.clone(), key_id.to_string()))
            .ok_or_else(|| VerifyError::UnknownKey(server.0.clone(), key_id.to_string()))?;
        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(signature)
            .map_err(|_| VerifyError::BadEncoding)?;
        let sig_bytes: [u8; 64] = sig_bytes.try_into().map_err(|_| VerifyError::Malformed)?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify(bytes, &sig).map_err(|_| VerifyError::Invalid)
    }
}

/// Re-exports the common set most downstream crates need.
pub mod prelude {
    pub use crate::{Ed25519Signer, Ed25519Verifier, Sha256Digest, Signer, VerifyError, Verifier};
}
