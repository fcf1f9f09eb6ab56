use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use super::canonical;
use super::transaction::Transaction;

/// Previous-hash sentinel carried by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "1";

/// Proof carried by the genesis block
pub const GENESIS_PROOF: u64 = 100;

/// Represents a block in the chain
///
/// Blocks are never modified once appended. The content hash is derived
/// from the fields on demand rather than stored next to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Creation time in fractional Unix seconds (advisory only)
    #[schema(example = 1700000000.123456)]
    pub timestamp: f64,

    /// List of transactions included in this block
    pub transactions: Vec<Transaction>,

    /// Proof of work linking this block to its predecessor's proof
    pub proof: u64,

    /// Hash of the previous block
    pub previous_hash: String,
}

impl Block {
    /// Creates a new block
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `previous_hash` - The hash of the previous block
    /// * `transactions` - The list of transactions to include in the block
    /// * `proof` - The proof of work
    /// * `timestamp` - Creation time in fractional Unix seconds
    ///
    /// # Returns
    ///
    /// A new Block instance
    pub fn new(
        index: u64,
        previous_hash: impl Into<String>,
        transactions: Vec<Transaction>,
        proof: u64,
        timestamp: f64,
    ) -> Self {
        Block {
            index,
            timestamp,
            transactions,
            proof,
            previous_hash: previous_hash.into(),
        }
    }

    /// Creates the genesis block (first block in the chain)
    pub fn genesis() -> Self {
        Block::new(0, GENESIS_PREVIOUS_HASH, Vec::new(), GENESIS_PROOF, now())
    }

    /// Calculates the content hash of the block
    ///
    /// # Returns
    ///
    /// The SHA-256 digest of the canonical encoding as lowercase hex
    pub fn content_hash(&self) -> String {
        let block_data = serde_json::json!({
            "index": self.index,
            "previous_hash": self.previous_hash,
            "proof": self.proof,
            "timestamp": self.timestamp,
            "transactions": self.transactions,
        });

        let encoded = canonical::encode(&block_data)
            .expect("writing a JSON value into memory cannot fail");

        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        format!("{:x}", hasher.finalize())
    }

    /// Returns the creation time as a UTC date, if it is representable
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros((self.timestamp * 1_000_000.0).round() as i64)
    }
}

/// Current time in fractional Unix seconds with microsecond resolution
pub fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let transactions = vec![
            Transaction::new("A", "B", 10.0).unwrap(),
            Transaction::new("B", "C", 2.5).unwrap(),
        ];

        Block::new(1, "previous_hash", transactions, 35293, 1700000000.5)
    }

    #[test]
    fn test_new_block() {
        let block = sample_block();

        assert_eq!(block.index, 1);
        assert_eq!(block.proof, 35293);
        assert_eq!(block.previous_hash, "previous_hash");
        assert_eq!(block.transactions.len(), 2);
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();

        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, "1");
        assert_eq!(genesis.proof, 100);
        assert!(genesis.transactions.is_empty());
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let block = sample_block();
        let hash = block.content_hash();

        assert_eq!(hash, block.content_hash());
        assert_eq!(hash, block.clone().content_hash());
        assert_eq!(hash.len(), 64); // SHA-256 hash is 64 characters in hex
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_content_hash_covers_every_field() {
        let block = sample_block();
        let hash = block.content_hash();

        let mut other = block.clone();
        other.index = 2;
        assert_ne!(hash, other.content_hash());

        let mut other = block.clone();
        other.proof += 1;
        assert_ne!(hash, other.content_hash());

        let mut other = block.clone();
        other.timestamp += 1.0;
        assert_ne!(hash, other.content_hash());

        let mut other = block.clone();
        other.previous_hash.push('0');
        assert_ne!(hash, other.content_hash());

        let mut other = block.clone();
        other.transactions[1].amount = 3.0;
        assert_ne!(hash, other.content_hash());

        let mut other = block;
        other.transactions.swap(0, 1);
        assert_ne!(hash, other.content_hash());
    }

    #[test]
    fn test_content_hash_matches_canonical_text() {
        let block = Block::new(
            1,
            "1",
            vec![Transaction::new("A", "B", 10.0).unwrap()],
            7,
            1.5,
        );

        let text = r#"{"index": 1, "previous_hash": "1", "proof": 7, "timestamp": 1.5, "transactions": [{"amount": 10.0, "recipient": "B", "sender": "A"}]}"#;
        let expected = format!("{:x}", Sha256::digest(text.as_bytes()));

        assert_eq!(block.content_hash(), expected);
    }

    #[test]
    fn test_hash_survives_wire_round_trip() {
        let block = Block::new(3, "abc", Vec::new(), 9, now());
        let wire = serde_json::to_string(&block).unwrap();
        let decoded: Block = serde_json::from_str(&wire).unwrap();

        assert_eq!(decoded, block);
        assert_eq!(decoded.content_hash(), block.content_hash());
    }

    #[test]
    fn test_created_at() {
        let block = Block::new(0, "1", Vec::new(), 100, 1700000000.25);
        let created = block.created_at().unwrap();

        assert_eq!(created.timestamp(), 1700000000);
        assert_eq!(created.timestamp_subsec_millis(), 250);
    }
}
