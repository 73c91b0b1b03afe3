//! Action Signing
//!
//! Hyperliquid L1 actions are EIP-712 agent signatures: the action is
//! MessagePack-encoded, extended with the big-endian nonce and a vault flag,
//! and keccak-hashed into a `connectionId`. The typed struct
//! `Agent { source, connectionId }` is then signed against a fixed domain.
//! The nonce is the millisecond timestamp and doubles as the replay guard.

use crate::error::{CoreError, CoreResult};
use crate::exchange::hyperliquid::messages::WireSignature;
use alloy::primitives::{keccak256, Address, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol;
use alloy::sol_types::{eip712_domain, SolStruct};
use serde::Serialize;
use std::str::FromStr;

sol! {
    struct Agent {
        string source;
        bytes32 connectionId;
    }
}

/// Signs exchange actions with a local private key.
pub struct ActionSigner {
    signer: PrivateKeySigner,
    /// Agent source: "a" on mainnet, "b" on testnet.
    source: &'static str,
}

impl ActionSigner {
    pub fn new(private_key_hex: &str, testnet: bool) -> CoreResult<Self> {
        let signer = PrivateKeySigner::from_str(private_key_hex.trim_start_matches("0x"))
            .map_err(|e| CoreError::Auth(format!("invalid private key: {}", e)))?;
        Ok(Self {
            signer,
            source: if testnet { "b" } else { "a" },
        })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Hash of msgpack(action) ++ nonce_be ++ vault flag.
    pub fn connection_id<A: Serialize>(
        &self,
        action: &A,
        nonce: u64,
        vault: Option<Address>,
    ) -> CoreResult<B256> {
        let mut bytes = rmp_serde::to_vec_named(action)
            .map_err(|e| CoreError::Validation(format!("action encode failed: {}", e)))?;
        bytes.extend_from_slice(&nonce.to_be_bytes());
        match vault {
            None => bytes.push(0x00),
            Some(address) => {
                bytes.push(0x01);
                bytes.extend_from_slice(address.as_slice());
            }
        }
        Ok(keccak256(&bytes))
    }

    /// Produce the `{r, s, v}` signature for a signed action envelope.
    pub fn sign_action<A: Serialize>(
        &self,
        action: &A,
        nonce: u64,
        vault: Option<Address>,
    ) -> CoreResult<WireSignature> {
        let connection_id = self.connection_id(action, nonce, vault)?;

        let agent = Agent {
            source: self.source.to_string(),
            connectionId: connection_id,
        };
        let domain = eip712_domain! {
            name: "Exchange",
            version: "1",
            chain_id: 1337,
            verifying_contract: Address::ZERO,
        };
        let digest = agent.eip712_signing_hash(&domain);

        let signature = self
            .signer
            .sign_hash_sync(&digest)
            .map_err(|e| CoreError::Auth(format!("signing failed: {}", e)))?;

        Ok(WireSignature {
            r: format!("0x{:064x}", signature.r()),
            s: format!("0x{:064x}", signature.s()),
            v: 27 + u64::from(signature.v()),
        })
    }
}

impl std::fmt::Debug for ActionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSigner")
            .field("address", &self.signer.address())
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::hyperliquid::messages::{CancelAction, WireCancel};

    const TEST_KEY: &str = "0x0123456789012345678901234567890123456789012345678901234567890123";

    #[test]
    fn test_rejects_bad_key() {
        assert!(matches!(
            ActionSigner::new("not-a-key", false),
            Err(CoreError::Auth(_))
        ));
    }

    #[test]
    fn test_connection_id_depends_on_nonce() {
        let signer = ActionSigner::new(TEST_KEY, true).unwrap();
        let action = CancelAction::new(vec![WireCancel { a: None, o: None }]);

        let first = signer.connection_id(&action, 1_700_000_000_000, None).unwrap();
        let second = signer.connection_id(&action, 1_700_000_000_001, None).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_vault_flag_changes_hash() {
        let signer = ActionSigner::new(TEST_KEY, true).unwrap();
        let action = CancelAction::new(vec![WireCancel { a: None, o: None }]);

        let without = signer.connection_id(&action, 1, None).unwrap();
        let with = signer
            .connection_id(&action, 1, Some(Address::ZERO))
            .unwrap();
        assert_ne!(without, with);
    }

    #[test]
    fn test_signature_shape() {
        let signer = ActionSigner::new(TEST_KEY, false).unwrap();
        let action = CancelAction::new(vec![WireCancel { a: Some(1), o: Some(42) }]);

        let signature = signer.sign_action(&action, 1_700_000_000_000, None).unwrap();
        assert!(signature.r.starts_with("0x"));
        assert_eq!(signature.r.len(), 66);
        assert_eq!(signature.s.len(), 66);
        assert!(signature.v == 27 || signature.v == 28);
    }

    #[test]
    fn test_signing_is_deterministic() {
        let signer = ActionSigner::new(TEST_KEY, false).unwrap();
        let action = CancelAction::new(vec![WireCancel { a: Some(1), o: Some(42) }]);

        let first = signer.sign_action(&action, 7, None).unwrap();
        let second = signer.sign_action(&action, 7, None).unwrap();
        assert_eq!(first.r, second.r);
        assert_eq!(first.s, second.s);
        assert_eq!(first.v, second.v);
    }
}
