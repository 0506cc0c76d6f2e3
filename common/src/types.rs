//! Core chain types: block identities, blocks, transactions and store kinds

use crate::crypto::{blake2b_256, blake2b_256_parts, merkle_root};
use crate::hash::{BlockHash, Hash, ProducerId, TxHash};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

pub type BlockNumber = u64;

/// Identity of a block: its content hash plus its height.
///
/// Equality and hashing use the hash alone. Ordering is by number and then
/// by hash, so a `BTreeSet<BlockId>` iterates in chain order.
#[derive(Clone, Copy, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct BlockId {
    #[n(0)]
    pub hash: BlockHash,
    #[n(1)]
    pub number: BlockNumber,
}

impl BlockId {
    pub const fn new(hash: BlockHash, number: BlockNumber) -> Self {
        Self { hash, number }
    }
}

impl PartialEq for BlockId {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for BlockId {}

impl std::hash::Hash for BlockId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number.cmp(&other.number).then_with(|| self.hash.cmp(&other.hash))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({}@{})", self.hash.short(), self.number)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash.short(), self.number)
    }
}

/// Kind of transaction, used to prioritise validation
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub enum TxKind {
    /// Plain value transfer
    #[n(0)]
    Transfer,

    /// Invokes contract code
    #[n(1)]
    ContractCall,
}

impl TxKind {
    pub fn tag(&self) -> u8 {
        match self {
            TxKind::Transfer => 0,
            TxKind::ContractCall => 1,
        }
    }
}

/// A transaction. The payload is opaque to the engine; only the executor
/// interprets it.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
pub struct Transaction {
    #[n(0)]
    pub kind: TxKind,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(kind: TxKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Blake2b-256 over the kind tag followed by the payload
    pub fn id(&self) -> TxHash {
        blake2b_256_parts(&[&[self.kind.tag()], &self.payload])
    }
}

/// Block header. The block hash covers exactly these fields.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
pub struct BlockHeader {
    #[n(0)]
    pub parent: BlockId,
    #[n(1)]
    pub number: BlockNumber,
    /// Unix time in milliseconds
    #[n(2)]
    pub timestamp: u64,
    #[n(3)]
    pub producer: ProducerId,
    #[n(4)]
    pub merkle_root: Hash<32>,
}

impl BlockHeader {
    pub fn hash(&self) -> BlockHash {
        let bytes = minicbor::to_vec(self).expect("infallible");
        blake2b_256(&bytes)
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
pub struct Block {
    #[n(0)]
    pub header: BlockHeader,
    /// Producer signature, checked by the finality oracle
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub signature: Vec<u8>,
    #[n(2)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block, deriving the merkle root from the transactions
    pub fn new(
        parent: BlockId,
        timestamp: u64,
        producer: ProducerId,
        signature: Vec<u8>,
        transactions: Vec<Transaction>,
    ) -> Self {
        let tx_ids: Vec<TxHash> = transactions.iter().map(Transaction::id).collect();
        let header = BlockHeader {
            parent,
            number: parent.number + 1,
            timestamp,
            producer,
            merkle_root: merkle_root(&tx_ids),
        };
        Self {
            header,
            signature,
            transactions,
        }
    }

    /// The genesis block: number zero, no transactions, parented on the zero hash
    pub fn genesis(timestamp: u64, producer: ProducerId) -> Self {
        let header = BlockHeader {
            parent: BlockId::new(BlockHash::default(), 0),
            number: 0,
            timestamp,
            producer,
            merkle_root: Hash::default(),
        };
        Self {
            header,
            signature: Vec::new(),
            transactions: Vec::new(),
        }
    }

    pub fn id(&self) -> BlockId {
        BlockId::new(self.header.hash(), self.header.number)
    }

    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    pub fn parent(&self) -> BlockId {
        self.header.parent
    }

    /// Does the declared merkle root match the transactions carried?
    pub fn merkle_root_matches(&self) -> bool {
        let tx_ids: Vec<TxHash> = self.transactions.iter().map(Transaction::id).collect();
        merkle_root(&tx_ids) == self.header.merkle_root
    }
}

/// The closed set of logical stores that transaction execution may touch.
/// Each kind maps to its own durable keyspace.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    #[n(0)]
    Account,
    #[n(1)]
    Contract,
    #[n(2)]
    Code,
    #[n(3)]
    ContractStorage,
    #[n(4)]
    Properties,
}

impl StoreKind {
    pub const ALL: [StoreKind; 5] = [
        StoreKind::Account,
        StoreKind::Contract,
        StoreKind::Code,
        StoreKind::ContractStorage,
        StoreKind::Properties,
    ];

    /// Name of the durable keyspace backing this kind
    pub fn keyspace_name(&self) -> &'static str {
        match self {
            StoreKind::Account => "account",
            StoreKind::Contract => "contract",
            StoreKind::Code => "code",
            StoreKind::ContractStorage => "contract-storage",
            StoreKind::Properties => "properties",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyspace_name())
    }
}

/// Result of executing one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx: TxHash,
    pub cost: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    fn genesis_id() -> BlockId {
        BlockId::new(BlockHash::default(), 0)
    }

    #[test]
    fn block_id_equality_ignores_number() {
        let hash = BlockHash::new([7; 32]);
        assert_eq!(BlockId::new(hash, 3), BlockId::new(hash, 4));

        let mut set = HashSet::new();
        set.insert(BlockId::new(hash, 3));
        assert!(set.contains(&BlockId::new(hash, 99)));
    }

    #[test]
    fn block_id_orders_by_number_first() {
        let low = BlockId::new(BlockHash::new([0xff; 32]), 1);
        let high = BlockId::new(BlockHash::new([0x00; 32]), 2);
        let set: BTreeSet<_> = [high, low].into_iter().collect();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![low, high]);
    }

    #[test]
    fn transaction_id_depends_on_kind() {
        let transfer = Transaction::new(TxKind::Transfer, b"pay".to_vec());
        let call = Transaction::new(TxKind::ContractCall, b"pay".to_vec());
        assert_ne!(transfer.id(), call.id());
    }

    #[test]
    fn new_block_has_matching_merkle_root() {
        let txs = vec![
            Transaction::new(TxKind::Transfer, b"a".to_vec()),
            Transaction::new(TxKind::Transfer, b"b".to_vec()),
        ];
        let block = Block::new(genesis_id(), 1_000, ProducerId::default(), vec![], txs);
        assert_eq!(block.number(), 1);
        assert!(block.merkle_root_matches());
    }

    #[test]
    fn tampered_transactions_break_merkle_root() {
        let txs = vec![Transaction::new(TxKind::Transfer, b"a".to_vec())];
        let mut block = Block::new(genesis_id(), 1_000, ProducerId::default(), vec![], txs);
        block.transactions.push(Transaction::new(TxKind::Transfer, b"extra".to_vec()));
        assert!(!block.merkle_root_matches());
    }

    #[test]
    fn block_hash_covers_header_only() {
        let block = Block::new(genesis_id(), 1_000, ProducerId::default(), vec![1], vec![]);
        let mut resigned = block.clone();
        resigned.signature = vec![2];
        assert_eq!(block.id(), resigned.id());

        let mut later = block.clone();
        later.header.timestamp += 1;
        assert_ne!(block.id(), later.id());
    }

    #[test]
    fn block_survives_cbor_encoding() {
        let txs = vec![Transaction::new(TxKind::ContractCall, vec![1, 2, 3])];
        let block = Block::new(genesis_id(), 5, ProducerId::new([3; 32]), vec![9, 9], txs);
        let bytes = minicbor::to_vec(&block).unwrap();
        let decoded: Block = minicbor::decode(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.id(), block.id());
    }
}
