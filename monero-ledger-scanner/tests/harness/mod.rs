//! An in-memory chain served by a simulated daemon, a view-scan stand-in and an enote
//! store, so the scanner can be driven end to end without a network.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use monero_ledger_scanner::error::FetchError;
use monero_ledger_scanner::primitives::{
    BlockId, BlockIndex, BlockScanInput, ChunkContext, Commitment, KeyImage, OutputKey,
    TransactionId,
};
use monero_ledger_scanner::rpc::{
    BlockEntry, BlockOutputIndices, GetBlocksRequest, GetBlocksResponse, OutputEntry,
    ProvidesBlocks, TransactionEntry,
};
use monero_ledger_scanner::{
    AsyncLedgerScanner, ChunkConsumer, EnoteFindingContext, PulledChunk, ScannerConfig,
};
use rand::Rng;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scanner config with near-instant retries.
pub fn config(pending_chunk_queue_size: usize, max_chunk_size_hint: u64) -> ScannerConfig {
    ScannerConfig {
        pending_chunk_queue_size,
        max_chunk_size_hint,
        retry_initial_interval_ms: 1,
        retry_max_interval_ms: 2,
        ..Default::default()
    }
}

pub type Scanner = AsyncLedgerScanner<SimulatedDaemon, SimulatedFinder>;

pub fn scanner_for(daemon: &SimulatedDaemon, config: ScannerConfig) -> Scanner {
    scanner_with_finder(daemon, SimulatedFinder::default(), config)
}

pub fn scanner_with_finder(
    daemon: &SimulatedDaemon,
    finder: SimulatedFinder,
    config: ScannerConfig,
) -> Scanner {
    AsyncLedgerScanner::new(daemon.clone(), finder, config).expect("valid scanner config")
}

pub fn block_id(index: BlockIndex, fork: u8) -> BlockId {
    let mut bytes = [fork; 32];
    bytes[..8].copy_from_slice(&index.to_le_bytes());
    BlockId::from_bytes(bytes)
}

fn derived<const TAG: u8>(index: BlockIndex, fork: u8) -> [u8; 32] {
    let mut bytes = [TAG; 32];
    bytes[..8].copy_from_slice(&index.to_le_bytes());
    bytes[8] = fork;
    bytes
}

/// Outputs in blocks whose index is a multiple of this belong to the wallet.
pub const OWNED_EVERY: u64 = 5;

/// Blocks whose index is a multiple of this carry a transaction spending a key image.
pub const SPEND_EVERY: u64 = 3;

#[derive(Debug, Clone, Copy)]
pub enum ChainEvent {
    Grow(u64),
    /// Replace every block from `from` up with blocks of another fork.
    Reorg { from: BlockIndex, fork: u8 },
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Transport,
    Malformed,
    Rejected,
}

impl Failure {
    fn error(self) -> FetchError {
        match self {
            Failure::Transport => FetchError::Transport(anyhow::anyhow!("connection reset")),
            Failure::Malformed => FetchError::Malformed("truncated response".to_owned()),
            Failure::Rejected => FetchError::Rejected("unsupported protocol version".to_owned()),
        }
    }
}

#[derive(Debug)]
struct Chain {
    /// Fork tag of every block.
    forks: Vec<u8>,
}

impl Chain {
    fn height(&self) -> u64 {
        self.forks.len() as u64
    }

    fn id(&self, index: BlockIndex) -> BlockId {
        block_id(index, self.forks[index as usize])
    }

    fn apply(&mut self, event: ChainEvent) {
        match event {
            ChainEvent::Grow(blocks) => {
                let fork = self.forks.last().copied().unwrap_or(1);
                self.forks.extend(std::iter::repeat_n(fork, blocks as usize));
            }
            ChainEvent::Reorg { from, fork } => {
                for tag in self.forks.iter_mut().skip(from as usize) {
                    *tag = fork;
                }
            }
        }
    }

    fn block(&self, index: BlockIndex) -> (BlockEntry, BlockOutputIndices) {
        let fork = self.forks[index as usize];
        let output = |tag_index: u64| OutputEntry {
            onetime_address: OutputKey::from_bytes(derived::<0x0a>(tag_index, fork)),
            amount_commitment: Commitment::from_bytes(derived::<0x0c>(tag_index, fork)),
            encrypted_amount: tag_index,
            view_tag: Some((index % OWNED_EVERY) as u8),
        };

        let miner_tx = TransactionEntry {
            tx_id: TransactionId::from_bytes(derived::<0x07>(index, fork)),
            unlock_time: index + 60,
            extra: vec![0x01],
            outputs: vec![output(2 * index)],
            key_images: vec![],
        };
        let mut indices = vec![vec![2 * index]];

        let mut txs = vec![];
        if index % SPEND_EVERY == 0 {
            txs.push(TransactionEntry {
                tx_id: TransactionId::from_bytes(derived::<0x08>(index, fork)),
                unlock_time: 0,
                extra: vec![0x02, 0x09],
                outputs: vec![output(2 * index + 1)],
                key_images: vec![KeyImage::from_bytes(derived::<0x0b>(index, fork))],
            });
            indices.push(vec![2 * index + 1]);
        }

        let entry = BlockEntry {
            block_id: self.id(index),
            prev_id: index
                .checked_sub(1)
                .map(|prev| self.id(prev))
                .unwrap_or(BlockId::NULL),
            timestamp: 1_500_000_000 + index * 120,
            miner_tx,
            txs,
        };

        (entry, BlockOutputIndices { indices })
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// Failures still to be served, per request start height.
    failures: HashMap<u64, Vec<Failure>>,
    /// One-off caps on the number of blocks served, per request start height.
    short_reads: HashMap<u64, u64>,
    /// Caps that hold for every request at a start height.
    persistent_short_reads: HashMap<u64, u64>,
    /// Extra latency for every request at a start height.
    slow: HashMap<u64, Duration>,
    /// Applied once the given number of calls has been answered.
    events: Vec<(usize, ChainEvent)>,
}

struct DaemonState {
    chain: Mutex<Chain>,
    faults: Mutex<Faults>,
    max_latency_ms: u64,
    calls: Mutex<Vec<GetBlocksRequest>>,
    answered: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A daemon answering `get_blocks` from an in-memory chain.
#[derive(Clone)]
pub struct SimulatedDaemon {
    state: Arc<DaemonState>,
}

impl SimulatedDaemon {
    pub fn new(height: u64) -> Self {
        Self::with_latency(height, 0)
    }

    /// Every answer is delayed by a random 0..=`max_latency_ms`.
    pub fn with_latency(height: u64, max_latency_ms: u64) -> Self {
        Self {
            state: Arc::new(DaemonState {
                chain: Mutex::new(Chain {
                    forks: vec![1; height as usize],
                }),
                faults: Mutex::new(Faults::default()),
                max_latency_ms,
                calls: Mutex::new(vec![]),
                answered: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn height(&self) -> u64 {
        self.state.chain.lock().unwrap().height()
    }

    pub fn block_id(&self, index: BlockIndex) -> BlockId {
        self.state.chain.lock().unwrap().id(index)
    }

    pub fn apply(&self, event: ChainEvent) {
        self.state.chain.lock().unwrap().apply(event);
    }

    /// Fail the next `times` requests starting at `start_height`.
    pub fn fail(&self, start_height: u64, times: usize, failure: Failure) {
        self.state
            .faults
            .lock()
            .unwrap()
            .failures
            .entry(start_height)
            .or_default()
            .extend(std::iter::repeat_n(failure, times));
    }

    /// Serve at most `blocks` blocks for the next request starting at `start_height`.
    pub fn short_read(&self, start_height: u64, blocks: u64) {
        self.state
            .faults
            .lock()
            .unwrap()
            .short_reads
            .insert(start_height, blocks);
    }

    /// Serve at most `blocks` blocks for every request starting at `start_height`.
    pub fn keep_short_reading(&self, start_height: u64, blocks: u64) {
        self.state
            .faults
            .lock()
            .unwrap()
            .persistent_short_reads
            .insert(start_height, blocks);
    }

    pub fn slow(&self, start_height: u64, latency: Duration) {
        self.state
            .faults
            .lock()
            .unwrap()
            .slow
            .insert(start_height, latency);
    }

    /// Apply `event` once `calls` requests have been answered.
    pub fn after_calls(&self, calls: usize, event: ChainEvent) {
        self.state.faults.lock().unwrap().events.push((calls, event));
    }

    /// Requests in the order they arrived.
    pub fn calls(&self) -> Vec<GetBlocksRequest> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_at(&self, start_height: u64) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.start_height == start_height)
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    async fn serve(
        state: Arc<DaemonState>,
        request: GetBlocksRequest,
    ) -> Result<GetBlocksResponse, FetchError> {
        let in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        state.calls.lock().unwrap().push(request.clone());

        let slow = state
            .faults
            .lock()
            .unwrap()
            .slow
            .get(&request.start_height)
            .copied()
            .unwrap_or_default();
        let latency = match state.max_latency_ms {
            0 => Duration::ZERO,
            max => Duration::from_millis(rand::thread_rng().gen_range(0..=max)),
        };
        tokio::time::sleep(slow + latency).await;

        let response = Self::answer(&state, &request);

        let answered = state.answered.fetch_add(1, Ordering::SeqCst) + 1;
        let due: Vec<ChainEvent> = {
            let mut faults = state.faults.lock().unwrap();
            let (due, pending): (Vec<_>, Vec<_>) = faults
                .events
                .drain(..)
                .partition(|(after, _)| *after <= answered);
            faults.events = pending;
            due.into_iter().map(|(_, event)| event).collect()
        };
        for event in due {
            state.chain.lock().unwrap().apply(event);
        }

        state.in_flight.fetch_sub(1, Ordering::SeqCst);

        response
    }

    fn answer(
        state: &DaemonState,
        request: &GetBlocksRequest,
    ) -> Result<GetBlocksResponse, FetchError> {
        let short_read = {
            let mut faults = state.faults.lock().unwrap();

            if let Some(failures) = faults.failures.get_mut(&request.start_height) {
                if !failures.is_empty() {
                    return Err(failures.remove(0).error());
                }
            }

            faults
                .short_reads
                .remove(&request.start_height)
                .or_else(|| {
                    faults
                        .persistent_short_reads
                        .get(&request.start_height)
                        .copied()
                })
        };

        let chain = state.chain.lock().unwrap();
        let height = chain.height();
        let top_block_hash = match height {
            0 => BlockId::NULL,
            height => chain.id(height - 1),
        };

        if request.start_height >= height && !request.high_height_ok {
            return Err(FetchError::Rejected("start height above the chain tip".to_owned()));
        }

        let count = short_read
            .unwrap_or(request.max_block_count)
            .min(request.max_block_count);
        let end = request.start_height.saturating_add(count).min(height);

        let (blocks, output_indices): (Vec<_>, Vec<_>) = (request.start_height..end)
            .map(|index| chain.block(index))
            .unzip();

        Ok(GetBlocksResponse {
            start_height: request.start_height,
            current_height: height,
            top_block_hash,
            blocks,
            output_indices,
        })
    }
}

impl ProvidesBlocks for SimulatedDaemon {
    fn get_blocks(
        &self,
        request: GetBlocksRequest,
    ) -> impl Send + Future<Output = Result<GetBlocksResponse, FetchError>> {
        Self::serve(Arc::clone(&self.state), request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedOutput {
    pub block_index: BlockIndex,
    pub ledger_index: u64,
    pub onetime_address: OutputKey,
}

/// What the simulated view scan finds in a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkFindings {
    pub scanned_blocks: Vec<BlockIndex>,
    pub owned: Vec<OwnedOutput>,
    pub key_images: Vec<(BlockIndex, KeyImage)>,
}

#[derive(Debug, thiserror::Error)]
#[error("Block {0} could not be scanned")]
pub struct CorruptBlock(pub BlockIndex);

#[derive(Default)]
struct FinderState {
    delay: Duration,
    fail_on: Mutex<HashSet<BlockIndex>>,
    panic_on: Mutex<HashSet<BlockIndex>>,
    scanned_chunks: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Stand-in for the wallet's view scan: owns every output whose view tag is zero.
#[derive(Clone, Default)]
pub struct SimulatedFinder {
    state: Arc<FinderState>,
}

impl SimulatedFinder {
    /// Every scan blocks its thread for `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Arc::new(FinderState {
                delay,
                ..Default::default()
            }),
        }
    }

    /// Fail scanning any chunk containing `index`.
    pub fn fail_on(&self, index: BlockIndex) {
        self.state.fail_on.lock().unwrap().insert(index);
    }

    pub fn panic_on(&self, index: BlockIndex) {
        self.state.panic_on.lock().unwrap().insert(index);
    }

    pub fn scanned_chunks(&self) -> usize {
        self.state.scanned_chunks.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

impl EnoteFindingContext for SimulatedFinder {
    type ChunkData = ChunkFindings;
    type Error = CorruptBlock;

    fn view_scan_chunk(
        &self,
        _context: &ChunkContext,
        blocks: &[BlockScanInput],
    ) -> Result<ChunkFindings, CorruptBlock> {
        let state = &self.state;
        let in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if !state.delay.is_zero() {
            std::thread::sleep(state.delay);
        }

        let result = scan(state, blocks);

        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        state.scanned_chunks.fetch_add(1, Ordering::SeqCst);

        result
    }
}

fn scan(state: &FinderState, blocks: &[BlockScanInput]) -> Result<ChunkFindings, CorruptBlock> {
    let mut findings = ChunkFindings::default();

    for block in blocks {
        if state.panic_on.lock().unwrap().contains(&block.index) {
            panic!("view scan blew up at block {}", block.index);
        }
        if state.fail_on.lock().unwrap().contains(&block.index) {
            return Err(CorruptBlock(block.index));
        }

        findings.scanned_blocks.push(block.index);

        for tx in &block.transactions {
            findings
                .key_images
                .extend(tx.key_images.iter().map(|key_image| (block.index, *key_image)));

            for output in &tx.outputs {
                if output.view_tag == Some(0) {
                    findings.owned.push(OwnedOutput {
                        block_index: block.index,
                        ledger_index: output.ledger_index,
                        onetime_address: output.onetime_address,
                    });
                }
            }
        }
    }

    Ok(findings)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Chunk starting at {start_index} leaves a hole after {next_index}")]
    Hole {
        start_index: BlockIndex,
        next_index: BlockIndex,
    },
    #[error("Chunk starting at {start_index} is below the refresh index {refresh_index}")]
    BelowRefreshIndex {
        start_index: BlockIndex,
        refresh_index: BlockIndex,
    },
}

/// Balance cache fed by refreshes: block ids from the refresh index up plus the wallet's
/// owned outputs and seen key images.
#[derive(Debug, Clone, Default)]
pub struct EnoteStore {
    pub refresh_index: BlockIndex,
    /// Pinned id of the block just below the refresh index.
    pub checkpoint: Option<BlockId>,
    pub block_ids: Vec<BlockId>,
    pub owned: BTreeMap<u64, OwnedOutput>,
    pub key_images: BTreeMap<KeyImage, BlockIndex>,
    pub consumed: Vec<BlockIndex>,
}

impl EnoteStore {
    pub fn new(refresh_index: BlockIndex) -> Self {
        Self {
            refresh_index,
            ..Default::default()
        }
    }

    pub fn with_checkpoint(mut self, id: BlockId) -> Self {
        self.checkpoint = Some(id);
        self
    }

    pub fn next_index(&self) -> BlockIndex {
        self.refresh_index + self.block_ids.len() as u64
    }
}

impl ChunkConsumer<ChunkFindings> for EnoteStore {
    type Error = StoreError;

    fn refresh_index(&self) -> BlockIndex {
        self.refresh_index
    }

    fn top_block_index(&self) -> Option<BlockIndex> {
        self.next_index().checked_sub(1).filter(|_| !self.block_ids.is_empty())
    }

    fn block_id(&self, index: BlockIndex) -> Option<BlockId> {
        if index + 1 == self.refresh_index {
            return self.checkpoint;
        }

        let offset = index.checked_sub(self.refresh_index)?;
        self.block_ids.get(offset as usize).copied()
    }

    fn consume_chunk(
        &mut self,
        context: &ChunkContext,
        findings: ChunkFindings,
    ) -> Result<(), StoreError> {
        let start_index = context.start_index;

        if start_index < self.refresh_index {
            return Err(StoreError::BelowRefreshIndex {
                start_index,
                refresh_index: self.refresh_index,
            });
        }
        if start_index > self.next_index() {
            return Err(StoreError::Hole {
                start_index,
                next_index: self.next_index(),
            });
        }

        // a rescan replaces everything from its start
        self.block_ids
            .truncate((start_index - self.refresh_index) as usize);
        self.owned.retain(|_, output| output.block_index < start_index);
        self.key_images.retain(|_, index| *index < start_index);

        self.block_ids.extend(&context.block_ids);
        for output in findings.owned {
            self.owned.insert(output.ledger_index, output);
        }
        for (index, key_image) in findings.key_images {
            self.key_images.insert(key_image, index);
        }
        self.consumed.push(start_index);

        Ok(())
    }
}

/// Outputs the wallet owns in blocks `from..to`.
pub fn expected_owned(from: BlockIndex, to: BlockIndex) -> usize {
    (from..to)
        .filter(|index| index % OWNED_EVERY == 0)
        .map(|index| if index % SPEND_EVERY == 0 { 2 } else { 1 })
        .sum()
}

/// Pull every chunk and wait for its data. Returns the chunks and the end-of-chain
/// context.
pub async fn scan_to_end(
    scanner: &mut Scanner,
) -> anyhow::Result<(Vec<(ChunkContext, ChunkFindings)>, ChunkContext)> {
    let mut chunks = vec![];

    loop {
        match scanner.pull_next_chunk().await? {
            PulledChunk::Chunk(chunk) => {
                let context = chunk.context().clone();
                let findings = chunk.data().await?;
                chunks.push((context, findings));
            }
            PulledChunk::EndOfChain(context) => return Ok((chunks, context)),
        }
    }
}

/// Assert that `chunks` cover `from..to` contiguously, in order, with matching prefixes.
pub fn assert_contiguous(
    chunks: &[(ChunkContext, ChunkFindings)],
    from: BlockIndex,
    to: BlockIndex,
) {
    let mut next = from;
    let mut previous: Option<BlockId> = None;

    for (context, findings) in chunks {
        assert_eq!(context.start_index, next, "chunk out of order");
        if let Some(previous) = previous {
            assert_eq!(context.prefix_block_id, previous, "chunk prefix mismatch");
        }
        assert_eq!(
            findings.scanned_blocks,
            (context.start_index..context.end_index()).collect::<Vec<_>>()
        );

        next = context.end_index();
        if let Some(last) = context.last_block_id() {
            previous = Some(last);
        }
    }

    assert_eq!(next, to, "chunks don't reach the expected end");
}
