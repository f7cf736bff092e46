//! Wallet refresh on top of the scanner: pick a start index, feed every chunk to the
//! consumer in order and back off further when the chain reorganized below the start.

use crate::config::{ConfigError, RefreshConfig};
use crate::error::ScannerError;
use crate::primitives::{BlockId, BlockIndex, ChunkContext};
use crate::rpc::ProvidesBlocks;
use crate::scanner::{AsyncLedgerScanner, PulledChunk};
use crate::view_scan::EnoteFindingContext;

/// The balance cache a refresh feeds.
pub trait ChunkConsumer<D> {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lowest block index the consumer cares about.
    fn refresh_index(&self) -> BlockIndex;

    /// Highest block index with a recorded id, if any.
    fn top_block_index(&self) -> Option<BlockIndex>;

    fn block_id(&self, index: BlockIndex) -> Option<BlockId>;

    /// Record a chunk. Chunks arrive in block order; a chunk starting below the top
    /// recorded index replaces everything from its start.
    fn consume_chunk(&mut self, context: &ChunkContext, data: D) -> Result<(), Self::Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scanner(#[from] ScannerError),
    #[error("Failed to consume chunk")]
    Consumer(#[source] anyhow::Error),
    #[error("Gave up after {attempts} partial scans")]
    TooManyPartialScans { attempts: usize },
    #[error("Chain reorganized below the refresh index (scan started at {start_index})")]
    ReorgBelowRefreshIndex { start_index: BlockIndex },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Where the successful attempt started.
    pub start_index: BlockIndex,
    pub chain_height: u64,
    pub top_block_id: BlockId,
    pub chunks_consumed: usize,
    pub blocks_consumed: u64,
    pub reorg_backoffs: u32,
    pub attempts: usize,
}

/// How far below the first unrecorded block to start after `backoffs` detected reorgs.
pub fn reorg_avoidance_depth(backoffs: u32, increment: u64) -> u64 {
    match backoffs {
        0 => 0,
        n => 10u64.saturating_pow(n - 1).saturating_mul(increment),
    }
}

pub fn refresh_start_index<D>(consumer: &impl ChunkConsumer<D>, depth: u64) -> BlockIndex {
    let refresh_index = consumer.refresh_index();
    let next_unrecorded = consumer
        .top_block_index()
        .map_or(refresh_index, |top| top.saturating_add(1));

    next_unrecorded.saturating_sub(depth).max(refresh_index)
}

enum Attempt {
    Complete { chain_height: u64, top_block_id: BlockId },
    /// The first chunk doesn't connect to what the consumer recorded below the start.
    ReorgBeforeStart,
    /// A chunk doesn't connect to the chunk delivered before it.
    ReorgMidScan { index: BlockIndex },
    /// The daemon reported blocks above `index` but served none of them.
    NoProgress { index: BlockIndex },
}

#[derive(Default)]
struct Consumed {
    chunks: usize,
    blocks: u64,
}

/// Bring `consumer` up to the chain tip.
///
/// Fetch and scan errors abort the refresh; retrying it is up to the caller.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn refresh_ledger<P, E, C>(
    scanner: &mut AsyncLedgerScanner<P, E>,
    consumer: &mut C,
    config: &RefreshConfig,
) -> Result<RefreshOutcome, RefreshError>
where
    P: ProvidesBlocks,
    E: EnoteFindingContext,
    C: ChunkConsumer<E::ChunkData>,
{
    config.validate()?;

    let mut reorg_backoffs = 0;
    let mut consumed = Consumed::default();

    for attempt in 1..=config.max_partialscan_attempts {
        let depth = reorg_avoidance_depth(reorg_backoffs, config.reorg_avoidance_increment);
        let start_index = refresh_start_index(&*consumer, depth);

        tracing::debug!(attempt, start_index, depth, "Starting scan attempt");

        match scan_attempt(scanner, consumer, start_index, &mut consumed).await? {
            Attempt::Complete {
                chain_height,
                top_block_id,
            } => {
                tracing::debug!(
                    chain_height,
                    chunks = consumed.chunks,
                    blocks = consumed.blocks,
                    "Refresh complete"
                );

                return Ok(RefreshOutcome {
                    start_index,
                    chain_height,
                    top_block_id,
                    chunks_consumed: consumed.chunks,
                    blocks_consumed: consumed.blocks,
                    reorg_backoffs,
                    attempts: attempt,
                });
            }
            Attempt::ReorgBeforeStart => {
                if start_index <= consumer.refresh_index() {
                    return Err(RefreshError::ReorgBelowRefreshIndex { start_index });
                }

                reorg_backoffs += 1;
                tracing::warn!(
                    start_index,
                    reorg_backoffs,
                    "Chain reorganized below the scan start, backing off"
                );
            }
            Attempt::ReorgMidScan { index } => {
                tracing::warn!(index, "Chain reorganized while scanning, rescanning");
            }
            Attempt::NoProgress { index } => {
                tracing::warn!(index, "Daemon returned no blocks below its tip, rescanning");
            }
        }
    }

    Err(RefreshError::TooManyPartialScans {
        attempts: config.max_partialscan_attempts,
    })
}

async fn scan_attempt<P, E, C>(
    scanner: &mut AsyncLedgerScanner<P, E>,
    consumer: &mut C,
    start_index: BlockIndex,
    consumed: &mut Consumed,
) -> Result<Attempt, RefreshError>
where
    P: ProvidesBlocks,
    E: EnoteFindingContext,
    C: ChunkConsumer<E::ChunkData>,
{
    let max_chunk_size_hint = scanner.config().max_chunk_size_hint;
    scanner
        .begin_scanning_from_index(start_index, max_chunk_size_hint)
        .await?;

    // id of the block just below the next chunk, once known
    let mut last_block_id: Option<BlockId> = None;
    let mut first_chunk = true;

    loop {
        let chunk = match scanner.pull_next_chunk().await? {
            PulledChunk::Chunk(chunk) => chunk,
            PulledChunk::EndOfChain(context) => {
                return Ok(Attempt::Complete {
                    chain_height: scanner.chain_state().num_blocks_in_chain,
                    top_block_id: context.prefix_block_id,
                });
            }
        };

        let context = chunk.context();

        if first_chunk {
            first_chunk = false;

            let recorded = context
                .start_index
                .checked_sub(1)
                .and_then(|index| consumer.block_id(index));

            if recorded.is_some_and(|id| id != context.prefix_block_id) {
                return Ok(Attempt::ReorgBeforeStart);
            }
        } else if last_block_id.is_some_and(|id| id != context.prefix_block_id) {
            return Ok(Attempt::ReorgMidScan {
                index: context.start_index,
            });
        }

        // an empty chunk below the tip makes the scanner restart at the same index
        if context.is_empty() && !scanner.is_finished() {
            return Ok(Attempt::NoProgress {
                index: context.start_index,
            });
        }

        if let Some(id) = context.last_block_id() {
            last_block_id = Some(id);
        }

        let (context, data) = chunk.into_parts();
        let data = data.wait().await?;
        let blocks = context.len();

        consumer
            .consume_chunk(&context, data)
            .map_err(|err| RefreshError::Consumer(anyhow::Error::new(err)))?;

        consumed.chunks += 1;
        consumed.blocks += blocks;
    }
}
