//! Terms hashing and signing.
//!
//! Protocols never hold key material; they go through the [`Signer`] trait
//! so tests can count invocations and deployments can swap the backing
//! identity. The production implementation wraps an in-process wallet.
//!
//! # Security
//! The private key is only used during wallet creation and then
//! immediately zeroized. It is never stored in the signer struct.

use crate::error::{AccordError, Result};
use ethers::signers::{LocalWallet, Signer as EthersSigner};
use ethers::types::H256;
use ethers::utils::keccak256;
use zeroize::Zeroize;

/// Keccak-256 of the serialized terms, "0x"-prefixed lowercase hex.
/// Both parties hash the same bytes, so the hash doubles as the
/// agreement's ledger key.
pub fn terms_hash(tsandcs: &str) -> String {
    format!("0x{}", hex::encode(keccak256(tsandcs.as_bytes())))
}

/// Signs 32-byte hashes on behalf of this node.
pub trait Signer: Send + Sync {
    /// "0x"-prefixed account address of the signing identity.
    fn address(&self) -> String;

    /// Sign a "0x"-prefixed 32-byte hash. Returns the "0x"-prefixed
    /// signature hex.
    fn sign_hash(&self, hash: &str) -> Result<String>;
}

/// In-process wallet signer.
#[derive(Clone)]
pub struct WalletSigner {
    inner: LocalWallet,
}

impl WalletSigner {
    /// Create a signer from a private key hex string. The key is zeroized
    /// from memory after wallet creation.
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let key_hex = private_key.trim_start_matches("0x");
        let mut secure_key = key_hex.to_string();

        let wallet = secure_key
            .parse::<LocalWallet>()
            .map_err(|e| AccordError::Wallet(format!("Invalid private key: {e}")));
        secure_key.zeroize();

        Ok(Self { inner: wallet? })
    }

    /// Create a signer from the `ACCORD_PRIVATE_KEY` (or `PRIVATE_KEY`)
    /// environment variable. The variable's value is zeroized after use.
    pub fn from_env() -> Result<Self> {
        let mut private_key = std::env::var("ACCORD_PRIVATE_KEY")
            .or_else(|_| std::env::var("PRIVATE_KEY"))
            .map_err(|_| {
                AccordError::Wallet(
                    "ACCORD_PRIVATE_KEY or PRIVATE_KEY environment variable not set".to_string(),
                )
            })?;

        let result = Self::from_private_key(&private_key);
        private_key.zeroize();
        result
    }
}

impl Signer for WalletSigner {
    fn address(&self) -> String {
        format!("0x{}", hex::encode(self.inner.address().as_bytes()))
    }

    fn sign_hash(&self, hash: &str) -> Result<String> {
        let bytes = hex::decode(hash.trim_start_matches("0x"))
            .map_err(|e| AccordError::Signature(format!("hash is not hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(AccordError::Signature(format!(
                "hash must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let signature = self
            .inner
            .sign_hash(H256::from_slice(&bytes))
            .map_err(|e| AccordError::Signature(format!("Failed to sign hash: {e}")))?;
        Ok(format!("0x{signature}"))
    }
}

impl std::fmt::Debug for WalletSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSigner")
            .field("address", &self.address())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    // Test private key (DO NOT use in production!)
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn signer_reports_the_expected_address() {
        let signer = WalletSigner::from_private_key(TEST_KEY).unwrap();
        // This is the well-known address for this test key
        assert_eq!(
            signer.address(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn terms_hash_is_keccak_of_the_bytes() {
        // keccak256 of the empty string
        assert_eq!(
            terms_hash(""),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(terms_hash("abc"), terms_hash("abc"));
        assert_ne!(terms_hash("abc"), terms_hash("abd"));
    }

    #[test]
    fn sign_hash_produces_a_signature() {
        let signer = WalletSigner::from_private_key(TEST_KEY).unwrap();
        let sig = signer.sign_hash(&terms_hash("some terms")).unwrap();
        assert!(sig.starts_with("0x"));
        assert!(sig.len() > 2);
    }

    #[test]
    fn sign_hash_rejects_non_32_byte_input() {
        let signer = WalletSigner::from_private_key(TEST_KEY).unwrap();
        assert!(signer.sign_hash("0xdead").is_err());
        assert!(signer.sign_hash("not hex").is_err());
    }
}
