//! Example: Refresh a toy enote store against an in-memory daemon whose chain keeps growing.
//!
//! Usage: RUST_LOG=monero_ledger_scanner=debug cargo run --example simulated_refresh -- [height]

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use monero_ledger_scanner::error::FetchError;
use monero_ledger_scanner::primitives::{
    BlockId, BlockIndex, BlockScanInput, ChunkContext, Commitment, OutputKey, TransactionId,
};
use monero_ledger_scanner::rpc::{
    BlockEntry, BlockOutputIndices, FetchFn, GetBlocksRequest, GetBlocksResponse, OutputEntry,
    TransactionEntry,
};
use monero_ledger_scanner::{
    AsyncLedgerScanner, ChunkConsumer, EnoteFindingContext, RefreshConfig, ScannerConfig,
    refresh_ledger,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_HEIGHT: u64 = 5_000;
const GROWTH_PER_ROUND: u64 = 40;
const ROUNDS: usize = 3;

fn id(tag: u8, index: BlockIndex) -> [u8; 32] {
    let mut bytes = [tag; 32];
    bytes[..8].copy_from_slice(&(index + 1).to_le_bytes());
    bytes
}

fn block(index: BlockIndex) -> (BlockEntry, BlockOutputIndices) {
    let miner_tx = TransactionEntry {
        tx_id: TransactionId::from_bytes(id(0x07, index)),
        unlock_time: index + 60,
        extra: vec![],
        outputs: vec![OutputEntry {
            onetime_address: OutputKey::from_bytes(id(0x0a, index)),
            amount_commitment: Commitment::from_bytes(id(0x0c, index)),
            encrypted_amount: index,
            view_tag: Some((index % 16) as u8),
        }],
        key_images: vec![],
    };

    let entry = BlockEntry {
        block_id: BlockId::from_bytes(id(0x01, index)),
        prev_id: index
            .checked_sub(1)
            .map(|prev| BlockId::from_bytes(id(0x01, prev)))
            .unwrap_or(BlockId::NULL),
        timestamp: 1_500_000_000 + index * 120,
        miner_tx,
        txs: vec![],
    };

    (entry, BlockOutputIndices { indices: vec![vec![index]] })
}

async fn get_blocks(
    height: Arc<AtomicU64>,
    request: GetBlocksRequest,
) -> Result<GetBlocksResponse, FetchError> {
    tokio::time::sleep(Duration::from_millis(5)).await;

    let height = height.load(Ordering::SeqCst);
    if request.start_height >= height && !request.high_height_ok {
        return Err(FetchError::Rejected("start height above the chain tip".to_owned()));
    }

    let end = request
        .start_height
        .saturating_add(request.max_block_count)
        .min(height);
    let (blocks, output_indices): (Vec<_>, Vec<_>) =
        (request.start_height..end).map(block).unzip();

    Ok(GetBlocksResponse {
        start_height: request.start_height,
        current_height: height,
        top_block_hash: BlockId::from_bytes(id(0x01, height - 1)),
        blocks,
        output_indices,
    })
}

/// Owns every output whose view tag is zero.
struct ViewTagFinder;

impl EnoteFindingContext for ViewTagFinder {
    type ChunkData = Vec<(BlockIndex, u64)>;
    type Error = Infallible;

    fn view_scan_chunk(
        &self,
        _context: &ChunkContext,
        blocks: &[BlockScanInput],
    ) -> Result<Self::ChunkData, Infallible> {
        Ok(blocks
            .iter()
            .flat_map(|block| {
                block
                    .transactions
                    .iter()
                    .flat_map(|tx| &tx.outputs)
                    .filter(|output| output.view_tag == Some(0))
                    .map(|output| (block.index, output.ledger_index))
            })
            .collect())
    }
}

#[derive(Default)]
struct Store {
    block_ids: Vec<BlockId>,
    owned: BTreeMap<u64, BlockIndex>,
}

impl ChunkConsumer<Vec<(BlockIndex, u64)>> for Store {
    type Error = Infallible;

    fn refresh_index(&self) -> BlockIndex {
        0
    }

    fn top_block_index(&self) -> Option<BlockIndex> {
        (self.block_ids.len() as u64).checked_sub(1)
    }

    fn block_id(&self, index: BlockIndex) -> Option<BlockId> {
        self.block_ids.get(index as usize).copied()
    }

    fn consume_chunk(
        &mut self,
        context: &ChunkContext,
        owned: Vec<(BlockIndex, u64)>,
    ) -> Result<(), Infallible> {
        self.block_ids.truncate(context.start_index as usize);
        self.block_ids.extend(&context.block_ids);
        self.owned
            .retain(|_, block_index| *block_index < context.start_index);
        for (block_index, ledger_index) in owned {
            self.owned.insert(ledger_index, block_index);
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let initial_height = match std::env::args().nth(1) {
        Some(height) => height.parse()?,
        None => DEFAULT_HEIGHT,
    };
    anyhow::ensure!(initial_height > 0, "the chain needs at least a genesis block");

    let height = Arc::new(AtomicU64::new(initial_height));
    let daemon = {
        let height = Arc::clone(&height);
        FetchFn(move |request: GetBlocksRequest| get_blocks(Arc::clone(&height), request))
    };

    let config = ScannerConfig {
        pending_chunk_queue_size: 4,
        max_chunk_size_hint: 250,
        ..Default::default()
    };
    let mut scanner = AsyncLedgerScanner::new(daemon, ViewTagFinder, config)?;
    let mut store = Store::default();

    for round in 1..=ROUNDS {
        let outcome = refresh_ledger(&mut scanner, &mut store, &RefreshConfig::default()).await?;

        println!(
            "Refresh {round}: scanned {} blocks from {} in {} chunks, height {}, {} owned outputs",
            outcome.blocks_consumed,
            outcome.start_index,
            outcome.chunks_consumed,
            outcome.chain_height,
            store.owned.len()
        );

        height.fetch_add(GROWTH_PER_ROUND, Ordering::SeqCst);
    }

    Ok(())
}
