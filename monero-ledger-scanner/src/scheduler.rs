//! Launches chunk tasks and keeps them in start-index order until the driver takes them.
//!
//! Locking strategy
//! ----------------
//! All shared bookkeeping (the pending queue, its two saturation counters, the scan
//! cursor, the chain state and the epoch) lives behind one `std::sync::Mutex`. Critical
//! sections never await. Tasks only touch the bookkeeping of the epoch they were launched
//! in, so a task that outlives a restart can't disturb the next epoch.

mod gap;
mod queue;
mod task;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::chain_state::ChainState;
use crate::config::ScannerConfig;
use crate::deferred::{Deferred, deferred};
use crate::error::InternalInconsistency;
use crate::primitives::{BlockIndex, ChunkContext, ChunkRequest};
use crate::rpc::ProvidesBlocks;
use crate::view_scan::EnoteFindingContext;

use queue::PendingChunkQueue;
use task::ChunkTask;

/// A chunk's context together with how it relates to the chain tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkOutcome {
    pub(crate) context: ChunkContext,
    pub(crate) is_terminal: bool,
}

/// A launched chunk as held by the queue. Whoever removes it from the queue owns it.
#[derive(Debug)]
pub(crate) struct PendingChunk<D> {
    pub(crate) request: ChunkRequest,
    pub(crate) context: Deferred<ChunkOutcome>,
    pub(crate) data: Deferred<D>,
    stop_context: CancellationToken,
    stop_data: CancellationToken,
    handle: JoinHandle<()>,
}

impl<D> PendingChunk<D> {
    fn request_stop(&self) {
        self.stop_context.cancel();
        self.stop_data.cancel();
    }
}

struct State<D> {
    epoch: u64,
    queue: PendingChunkQueue<PendingChunk<D>>,
    chain_state: ChainState,
    /// First invariant violation a task ran into; reported by the driver's next pull.
    fault: Option<InternalInconsistency>,
}

pub(crate) struct Scheduler<P, E: EnoteFindingContext> {
    provider: P,
    finder: E,
    config: ScannerConfig,
    /// Bounds the number of chunks inside the view scan at once.
    scan_permits: Semaphore,
    /// Woken whenever a chunk is queued or leaves a phase.
    changed: Notify,
    state: Mutex<State<E::ChunkData>>,
}

impl<P, E> Scheduler<P, E>
where
    P: ProvidesBlocks,
    E: EnoteFindingContext,
{
    pub(crate) fn new(provider: P, finder: E, config: ScannerConfig) -> Self {
        let capacity = config.pending_chunk_queue_size;

        Self {
            provider,
            finder,
            scan_permits: Semaphore::new(capacity),
            changed: Notify::new(),
            state: Mutex::new(State {
                epoch: 0,
                queue: PendingChunkQueue::new(capacity),
                chain_state: ChainState::default(),
                fault: None,
            }),
            config,
        }
    }

    pub(crate) fn config(&self) -> &ScannerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State<E::ChunkData>> {
        // every critical section leaves the state consistent, so a panic elsewhere
        // doesn't make it unusable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn chain_state(&self) -> ChainState {
        self.lock().chain_state
    }

    pub(crate) fn take_fault(&self) -> Option<InternalInconsistency> {
        self.lock().fault.take()
    }

    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Begin a new epoch scanning from `start_index`. Returns the epoch.
    ///
    /// Must only be called once the queue has been drained.
    pub(crate) fn reset(&self, start_index: BlockIndex, max_chunk_size_hint: u64) -> u64 {
        let mut state = self.lock();

        state.epoch += 1;
        state.chain_state = ChainState::default();
        state.fault = None;
        for chunk in &state.queue.reset(start_index, max_chunk_size_hint) {
            chunk.request_stop();
        }

        state.epoch
    }

    /// Launch chunks until a concurrency limit or the known chain tip is reached.
    pub(crate) fn launch_until_full(self: &Arc<Self>, epoch: u64) {
        {
            let mut state = self.lock();
            self.launch_until_full_locked(&mut state, epoch);
        }

        self.changed.notify_waiters();
    }

    fn launch_until_full_locked(self: &Arc<Self>, state: &mut State<E::ChunkData>, epoch: u64) {
        while state.epoch == epoch && state.queue.should_launch_next(&state.chain_state) {
            let request = state.queue.next_request();

            if let Err(fault) = self.launch_locked(state, epoch, request) {
                state.fault.get_or_insert(fault);
                break;
            }
        }
    }

    /// Queue a request outside the regular cursor order. Rejected while shutting down.
    fn push_locked(
        self: &Arc<Self>,
        state: &mut State<E::ChunkData>,
        epoch: u64,
        request: ChunkRequest,
    ) -> bool {
        if state.epoch != epoch || !state.queue.is_ready() {
            return false;
        }

        match self.launch_locked(state, epoch, request) {
            Ok(()) => true,
            Err(fault) => {
                state.fault.get_or_insert(fault);
                false
            }
        }
    }

    fn launch_locked(
        self: &Arc<Self>,
        state: &mut State<E::ChunkData>,
        epoch: u64,
        request: ChunkRequest,
    ) -> Result<(), InternalInconsistency> {
        if state.queue.contains(request.start_index) {
            return Err(InternalInconsistency::DuplicateStartIndex {
                start_index: request.start_index,
            });
        }

        let (context_resolver, context) = deferred(request.start_index);
        let (data_resolver, data) = deferred(request.start_index);
        let stop_context = CancellationToken::new();
        let stop_data = CancellationToken::new();

        let task = ChunkTask {
            epoch,
            request,
            context: context_resolver,
            data: data_resolver,
            stop_context: stop_context.clone(),
            stop_data: stop_data.clone(),
        };

        let span = tracing::debug_span!(
            "chunk",
            start_index = request.start_index,
            requested_size = request.requested_size
        );
        let handle = tokio::spawn(Arc::clone(self).run_chunk_task(task).instrument(span));

        tracing::debug!(
            start_index = request.start_index,
            requested_size = request.requested_size,
            scan_cursor = state.queue.scan_cursor(),
            "Launched chunk"
        );

        state.queue.insert(
            request.start_index,
            PendingChunk {
                request,
                context,
                data,
                stop_context,
                stop_data,
                handle,
            },
        )
    }

    pub(crate) fn pop_first(&self) -> Option<PendingChunk<E::ChunkData>> {
        self.lock().queue.pop_first()
    }

    /// Whether chunks of the current epoch are still fetching or scanning.
    pub(crate) fn has_chunks_in_flight(&self) -> bool {
        let state = self.lock();
        state.queue.pending_fetches > 0 || state.queue.pending_scans > 0
    }

    /// Stop launches, ask every queued chunk to stop and wait until each task has ended.
    pub(crate) async fn close_and_clear_pending_queue(&self) {
        let mut drained = 0;

        loop {
            let chunks = {
                let mut state = self.lock();
                state.queue.shut_down();
                state.queue.take_all()
            };

            if chunks.is_empty() {
                break;
            }

            drained += chunks.len();
            for chunk in &chunks {
                chunk.request_stop();
            }

            // a task can't be interrupted mid-fetch or mid-scan, only asked to stop at its
            // next checkpoint
            let handles = chunks.into_iter().map(|chunk| chunk.handle);
            for result in futures::future::join_all(handles).await {
                if let Err(err) = result {
                    tracing::debug!(error = %err, "Chunk task ended abnormally during drain");
                }
            }
        }

        if drained > 0 {
            tracing::debug!(drained, "Drained pending chunk queue");
        }
    }

    /// Non-blocking variant of [`Self::close_and_clear_pending_queue`] for teardown paths
    /// that can't await. Tasks are asked to stop but keep running until their next
    /// checkpoint.
    pub(crate) fn close(&self) {
        let chunks = {
            let mut state = self.lock();
            state.queue.shut_down();
            state.queue.take_all()
        };

        for chunk in &chunks {
            chunk.request_stop();
        }
    }
}
