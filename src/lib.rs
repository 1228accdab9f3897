//! Concurrent load generator for Ethereum-compatible ledger nodes.
//!
//! The crate drives sustained transaction throughput against a node by running
//! many independent worker instances. Each instance owns a freshly generated
//! pair of accounts, funds them from a master account and then bounces a small
//! amount back and forth between them, waiting for every hop to confirm.
//! Outcomes flow over a bounded channel into a single [`Recorder`], which turns
//! them into periodic and final throughput reports.
//!
//! # Architecture
//!
//! - **Client**: the [`LedgerClient`] / [`Connector`] capability set, with a
//!   JSON-RPC implementation and an in-process simulated ledger
//! - **Worker**: one [`Instance`] per account pair, bootstrapped by a
//!   [`Funder`] and paced by a [`ConfirmationWatcher`]
//! - **Recorder**: the single consumer that owns every aggregate counter
//! - **Server**: the [`LoadTest`] orchestrator tying the pieces together
//!
//! # Quick Start
//!
//! ```
//! use ledger_load::{Event, EventKind, Recorder, ReportIntervals};
//! use std::time::Duration;
//!
//! let mut recorder = Recorder::new(ReportIntervals::default());
//! recorder.observe(Event::new(0, EventKind::InstanceStarted));
//! recorder.observe(Event::new(0, EventKind::TxSucceeded { latency: Duration::from_millis(120) }));
//! recorder.observe(Event::new(0, EventKind::InstanceStopped));
//!
//! assert!(recorder.is_finished());
//! assert_eq!(recorder.final_report().succeeded, 1);
//! ```

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod monitor;
pub mod recorder;
pub mod server;
pub mod sim;
pub mod watcher;
pub mod worker;

pub use bootstrap::{FundingReceipt, Funder, MasterAccount};
pub use client::{
    BlockHeader, BlockId, ClientError, Connector, LedgerClient, NonceTag, TxStatus,
};
pub use config::{NodeConfig, ReportIntervals, RunConfig, TerminationPolicy};
pub use error::Error;
pub use event::{Event, EventKind};
pub use recorder::{Recorder, Report, ReportKind};
pub use server::{LoadTest, RunSummary};
pub use watcher::ConfirmationWatcher;
pub use worker::{AccountPair, Instance, InstanceSummary};

use alloy_consensus::{SignableTransaction, Signed, TxLegacy};
use alloy_primitives::{keccak256, Address, Bytes, Signature, TxKind, B256, U256};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// Gas limit of a plain value transfer.
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;

// ============================================================================
// Account & Key Management
// ============================================================================

/// An account with its signing key for transaction signing.
#[derive(Clone)]
pub struct Account {
    /// The secp256k1 signing key.
    pub signing_key: SigningKey,
    /// The Ethereum address derived from the public key.
    pub address: Address,
}

impl Account {
    /// Creates a new account from a signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = public_key_to_address(&verifying_key);
        Self { signing_key, address }
    }

    /// Generates a fresh ephemeral account from the operating system RNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Parses a hex encoded private key, with or without a `0x` prefix.
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, Error> {
        let bytes = alloy_primitives::hex::decode(hex_key.trim())
            .map_err(|e| Error::InvalidPrivateKey(e.to_string()))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| Error::InvalidPrivateKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Signs a 32-byte prehash, producing a recoverable signature.
    pub fn sign_hash(&self, hash: B256) -> Result<Signature, k256::ecdsa::Error> {
        let (sig, recovery_id) = self.signing_key.sign_prehash_recoverable(hash.as_slice())?;
        Ok(Signature::from_signature_and_parity(sig, recovery_id.is_y_odd()))
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .finish()
    }
}

/// Derives an Ethereum address from a secp256k1 public key.
fn public_key_to_address(verifying_key: &VerifyingKey) -> Address {
    let public_key_bytes = verifying_key.to_encoded_point(false);
    // Skip the 0x04 prefix byte, hash the rest.
    let hash = keccak256(&public_key_bytes.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

// ============================================================================
// Transfer Signing
// ============================================================================

/// Builds and signs a legacy EIP-155 value transfer.
pub fn sign_transfer(
    signer: &Account,
    chain_id: u64,
    to: Address,
    value: U256,
    gas_price: u128,
    nonce: u64,
) -> Result<Signed<TxLegacy>, k256::ecdsa::Error> {
    let tx = TxLegacy {
        chain_id: Some(chain_id),
        nonce,
        gas_price,
        gas_limit: TRANSFER_GAS_LIMIT,
        to: TxKind::Call(to),
        value,
        input: Bytes::new(),
    };
    let signature = signer.sign_hash(tx.signature_hash())?;
    Ok(tx.into_signed(signature))
}

/// Recovers the sender of a signed transfer.
/// Returns None if signature verification fails.
pub fn recover_signer(signed: &Signed<TxLegacy>) -> Option<Address> {
    signed
        .signature()
        .recover_address_from_prehash(&signed.tx().signature_hash())
        .ok()
}

// ============================================================================
// Tests
// ============================================================================
