//! Ledger primitives shared by the scheduler, the fetcher and the collaborators.

use std::fmt;
use std::str::FromStr;

/// Ordinal position of a block in the chain.
pub type BlockIndex = u64;

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 32]);

        impl $name {
            /// The all-zero value, used as "unknown".
            pub const NULL: $name = $name([0u8; 32]);

            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn is_null(&self) -> bool {
                self.0 == [0u8; 32]
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(s, &mut bytes)?;
                Ok(Self(bytes))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hash_newtype!(
    /// Content hash identifying a block. [`BlockId::NULL`] means "unknown".
    BlockId
);
hash_newtype!(
    /// Transaction hash.
    TransactionId
);
hash_newtype!(
    /// Marker published when an output is spent.
    KeyImage
);
hash_newtype!(
    /// One-time address of a transaction output.
    OutputKey
);
hash_newtype!(
    /// Pedersen commitment to an output amount.
    Commitment
);

/// A requested range `[start_index, start_index + requested_size)` of the chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChunkRequest {
    pub start_index: BlockIndex,
    pub requested_size: u64,
}

impl ChunkRequest {
    pub fn new(start_index: BlockIndex, requested_size: u64) -> Self {
        debug_assert!(requested_size > 0, "chunk requests must not be empty");

        Self {
            start_index,
            requested_size,
        }
    }

    /// One past the last requested index.
    pub fn end_index(&self) -> BlockIndex {
        self.start_index.saturating_add(self.requested_size)
    }
}

impl fmt::Display for ChunkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start_index, self.end_index())
    }
}

/// The block ids of a fetched chunk, in chain order starting at `start_index`.
///
/// `prefix_block_id` is the id of block `start_index - 1` (null when the chunk starts at
/// genesis or the daemon did not return it). An empty chunk whose `start_index` equals the
/// chain height means there are no new blocks yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkContext {
    pub prefix_block_id: BlockId,
    pub start_index: BlockIndex,
    pub block_ids: Vec<BlockId>,
}

impl ChunkContext {
    pub fn empty(start_index: BlockIndex, prefix_block_id: BlockId) -> Self {
        Self {
            prefix_block_id,
            start_index,
            block_ids: Vec::new(),
        }
    }

    pub fn len(&self) -> u64 {
        self.block_ids.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// One past the last block in this chunk.
    pub fn end_index(&self) -> BlockIndex {
        self.start_index.saturating_add(self.len())
    }

    pub fn last_block_id(&self) -> Option<BlockId> {
        self.block_ids.last().copied()
    }

    /// The id this chunk records for `index`, if the chunk covers it.
    pub fn block_id(&self, index: BlockIndex) -> Option<BlockId> {
        let offset = index.checked_sub(self.start_index)?;
        self.block_ids.get(usize::try_from(offset).ok()?).copied()
    }
}

/// An output the view scan has to test for ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateOutput {
    pub onetime_address: OutputKey,
    pub amount_commitment: Commitment,
    pub encrypted_amount: u64,
    pub view_tag: Option<u8>,
    /// Global index of the output in the ledger.
    pub ledger_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionScanInput {
    pub tx_id: TransactionId,
    pub is_coinbase: bool,
    pub unlock_time: u64,
    /// Raw `tx_extra`, carrying the ephemeral pubkeys and any memo the sender attached.
    pub memo: Vec<u8>,
    pub outputs: Vec<CandidateOutput>,
    /// Key images this transaction spends.
    pub key_images: Vec<KeyImage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockScanInput {
    pub index: BlockIndex,
    pub block_id: BlockId,
    pub prev_id: BlockId,
    pub timestamp: u64,
    /// Coinbase first, then the block's transactions in order.
    pub transactions: Vec<TransactionScanInput>,
}
