//! The block-fetching interface the scanner is injected with.
//!
//! The scanner does not speak the daemon's wire protocol. It hands a [`GetBlocksRequest`]
//! to a [`ProvidesBlocks`] implementation and expects back a decoded
//! [`GetBlocksResponse`], shaped like the daemon's `get_blocks` answer: one entry per
//! block plus, per block, the global output indices of every transaction.

use core::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::{FetchError, ResponseShapeError};
use crate::primitives::{
    BlockId, BlockIndex, BlockScanInput, CandidateOutput, ChunkContext, ChunkRequest, Commitment,
    KeyImage, OutputKey, TransactionId, TransactionScanInput,
};

/// Parameters of a single `get_blocks` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GetBlocksRequest {
    pub start_height: u64,
    pub max_block_count: u64,
    pub prune: bool,
    /// Ask the daemon to answer with an empty list instead of an error when
    /// `start_height` is above its tip.
    pub high_height_ok: bool,
    pub trusted_daemon: bool,
}

impl GetBlocksRequest {
    /// Chunks not starting at genesis also fetch the block before them, so the chunk's
    /// prefix id can be checked against what the wallet recorded.
    pub fn for_chunk(request: &ChunkRequest, high_height_ok: bool, trusted_daemon: bool) -> Self {
        let (start_height, max_block_count) = match request.start_index {
            0 => (0, request.requested_size),
            start => (start - 1, request.requested_size.saturating_add(1)),
        };

        Self {
            start_height,
            max_block_count,
            prune: true,
            high_height_ok,
            trusted_daemon,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksResponse {
    pub start_height: u64,
    /// Number of blocks in the daemon's chain.
    pub current_height: u64,
    /// Some daemons leave this out; it is then null.
    #[serde(default)]
    pub top_block_hash: BlockId,
    #[serde(default)]
    pub blocks: Vec<BlockEntry>,
    #[serde(default)]
    pub output_indices: Vec<BlockOutputIndices>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub block_id: BlockId,
    pub prev_id: BlockId,
    pub timestamp: u64,
    pub miner_tx: TransactionEntry,
    #[serde(default)]
    pub txs: Vec<TransactionEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub tx_id: TransactionId,
    #[serde(default)]
    pub unlock_time: u64,
    #[serde(default, with = "hex_bytes")]
    pub extra: Vec<u8>,
    #[serde(default)]
    pub outputs: Vec<OutputEntry>,
    #[serde(default)]
    pub key_images: Vec<KeyImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub onetime_address: OutputKey,
    pub amount_commitment: Commitment,
    #[serde(default)]
    pub encrypted_amount: u64,
    #[serde(default)]
    pub view_tag: Option<u8>,
}

/// Global output indices of one block: one list per transaction, coinbase first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOutputIndices {
    pub indices: Vec<Vec<u64>>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Fetches blocks from a daemon.
///
/// Implementations must be safe to call again for the same request; the scanner retries
/// failed calls. The answer may legitimately differ in length between calls when the tip
/// moves.
pub trait ProvidesBlocks: Send + Sync + 'static {
    fn get_blocks(
        &self,
        request: GetBlocksRequest,
    ) -> impl Send + Future<Output = Result<GetBlocksResponse, FetchError>>;
}

/// Adapts an async closure into a [`ProvidesBlocks`].
pub struct FetchFn<F>(pub F);

impl<F, Fut> ProvidesBlocks for FetchFn<F>
where
    F: Fn(GetBlocksRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GetBlocksResponse, FetchError>> + Send,
{
    fn get_blocks(
        &self,
        request: GetBlocksRequest,
    ) -> impl Send + Future<Output = Result<GetBlocksResponse, FetchError>> {
        (self.0)(request)
    }
}

/// A response decoded into the pieces the scanner needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChunk {
    pub context: ChunkContext,
    pub blocks: Vec<BlockScanInput>,
    pub chain_height: u64,
    pub top_block_id: BlockId,
}

/// Check that a response can be parsed for `request`.
pub fn validate_response(
    request: &GetBlocksRequest,
    response: &GetBlocksResponse,
) -> Result<(), ResponseShapeError> {
    if response.blocks.len() != response.output_indices.len() {
        return Err(ResponseShapeError::OutputIndicesCount {
            blocks: response.blocks.len(),
            output_indices: response.output_indices.len(),
        });
    }

    // Daemons answer above-tip requests with `high_height_ok` with an empty list and
    // whatever start they like.
    if response.blocks.is_empty() {
        return Ok(());
    }

    if response.start_height != request.start_height {
        return Err(ResponseShapeError::StartHeight {
            expected: request.start_height,
            actual: response.start_height,
        });
    }

    if response.blocks.len() as u64 > request.max_block_count {
        return Err(ResponseShapeError::TooManyBlocks {
            max: request.max_block_count,
            actual: response.blocks.len(),
        });
    }

    let mut previous: Option<BlockId> = None;

    for (offset, (block, indices)) in response
        .blocks
        .iter()
        .zip(&response.output_indices)
        .enumerate()
    {
        let index = response.start_height + offset as u64;
        let transactions = 1 + block.txs.len();

        if indices.indices.len() != transactions {
            return Err(ResponseShapeError::TransactionIndicesCount {
                index,
                transactions,
                output_indices: indices.indices.len(),
            });
        }

        let txs = std::iter::once(&block.miner_tx).chain(&block.txs);
        for (tx_position, (tx, tx_indices)) in txs.zip(&indices.indices).enumerate() {
            if tx.outputs.len() != tx_indices.len() {
                return Err(ResponseShapeError::OutputCount {
                    index,
                    tx_position,
                    outputs: tx.outputs.len(),
                    output_indices: tx_indices.len(),
                });
            }
        }

        if let Some(previous) = previous {
            if block.prev_id != previous {
                return Err(ResponseShapeError::Discontinuity { index });
            }
        }
        previous = Some(block.block_id);
    }

    Ok(())
}

/// Turn a validated response into the chunk's context and per-block scan input.
pub fn parse_response(chunk: &ChunkRequest, response: GetBlocksResponse) -> ParsedChunk {
    let GetBlocksResponse {
        current_height,
        top_block_hash,
        blocks,
        output_indices,
        ..
    } = response;

    let mut entries = blocks.into_iter().zip(output_indices);

    // The block before the chunk was only fetched for its id.
    let mut prefix_block_id = BlockId::NULL;
    if chunk.start_index > 0 {
        if let Some((prefix, _)) = entries.next() {
            prefix_block_id = prefix.block_id;
        }
    }

    let blocks: Vec<BlockScanInput> = entries
        .enumerate()
        .map(|(offset, (block, indices))| {
            block_scan_input(chunk.start_index + offset as u64, block, indices)
        })
        .collect();

    let context = ChunkContext {
        prefix_block_id,
        start_index: chunk.start_index,
        block_ids: blocks.iter().map(|block| block.block_id).collect(),
    };

    ParsedChunk {
        context,
        blocks,
        chain_height: current_height,
        top_block_id: top_block_hash,
    }
}

fn block_scan_input(
    index: BlockIndex,
    block: BlockEntry,
    indices: BlockOutputIndices,
) -> BlockScanInput {
    let BlockEntry {
        block_id,
        prev_id,
        timestamp,
        miner_tx,
        txs,
    } = block;

    let transactions = std::iter::once((true, miner_tx))
        .chain(txs.into_iter().map(|tx| (false, tx)))
        .zip(indices.indices)
        .map(|((is_coinbase, tx), tx_indices)| TransactionScanInput {
            tx_id: tx.tx_id,
            is_coinbase,
            unlock_time: tx.unlock_time,
            memo: tx.extra,
            outputs: tx
                .outputs
                .into_iter()
                .zip(tx_indices)
                .map(|(output, ledger_index)| CandidateOutput {
                    onetime_address: output.onetime_address,
                    amount_commitment: output.amount_commitment,
                    encrypted_amount: output.encrypted_amount,
                    view_tag: output.view_tag,
                    ledger_index,
                })
                .collect(),
            key_images: tx.key_images,
        })
        .collect();

    BlockScanInput {
        index,
        block_id,
        prev_id,
        timestamp,
        transactions,
    }
}
