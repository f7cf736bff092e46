//! The scanning driver.
//!
//! [`AsyncLedgerScanner`] launches fetch+scan tasks for consecutive chunks of the chain and
//! hands them to its single consumer strictly in block order, however the tasks complete.
//! Scanning ends with an explicit empty chunk at the chain tip, or restarts on its own if
//! the chain grew while it was being scanned.

use std::sync::Arc;

use crate::chain_state::ChainState;
use crate::config::{ConfigError, ScannerConfig};
use crate::deferred::Deferred;
use crate::error::{InternalInconsistency, ScannerError};
use crate::primitives::{BlockIndex, ChunkContext};
use crate::rpc::ProvidesBlocks;
use crate::scheduler::{PendingChunk, Scheduler};
use crate::view_scan::EnoteFindingContext;

/// A chunk handed out by [`AsyncLedgerScanner::pull_next_chunk`].
///
/// The context is known; the scan result may still be in progress.
#[derive(Debug)]
pub struct LedgerChunk<D> {
    context: ChunkContext,
    is_terminal: bool,
    data: Deferred<D>,
}

impl<D> LedgerChunk<D> {
    pub fn context(&self) -> &ChunkContext {
        &self.context
    }

    /// Whether this chunk reached the chain tip known when it was fetched.
    pub fn is_terminal(&self) -> bool {
        self.is_terminal
    }

    pub fn is_data_ready(&mut self) -> bool {
        self.data.is_resolved()
    }

    /// Wait for the scan result.
    pub async fn data(self) -> Result<D, ScannerError> {
        self.data.wait().await
    }

    pub fn into_parts(self) -> (ChunkContext, Deferred<D>) {
        (self.context, self.data)
    }
}

#[derive(Debug)]
pub enum PulledChunk<D> {
    Chunk(LedgerChunk<D>),
    /// Everything up to the tip has been delivered. The context is empty, its prefix is the
    /// top block and it starts at the chain height, or where scanning began if that was
    /// above the tip.
    EndOfChain(ChunkContext),
}

impl<D> PulledChunk<D> {
    pub fn context(&self) -> &ChunkContext {
        match self {
            PulledChunk::Chunk(chunk) => chunk.context(),
            PulledChunk::EndOfChain(context) => context,
        }
    }

    pub fn is_end_of_chain(&self) -> bool {
        matches!(self, PulledChunk::EndOfChain(_))
    }
}

pub struct AsyncLedgerScanner<P: ProvidesBlocks, E: EnoteFindingContext> {
    scheduler: Arc<Scheduler<P, E>>,
    started: bool,
    finished: bool,
    last_delivered_index: BlockIndex,
    max_chunk_size_hint: u64,
}

impl<P, E> AsyncLedgerScanner<P, E>
where
    P: ProvidesBlocks,
    E: EnoteFindingContext,
{
    pub fn new(provider: P, finder: E, config: ScannerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let max_chunk_size_hint = config.max_chunk_size_hint;

        Ok(Self {
            scheduler: Arc::new(Scheduler::new(provider, finder, config)),
            started: false,
            finished: false,
            last_delivered_index: 0,
            max_chunk_size_hint,
        })
    }

    pub fn config(&self) -> &ScannerConfig {
        self.scheduler.config()
    }

    pub fn chain_state(&self) -> ChainState {
        self.scheduler.chain_state()
    }

    /// Whether the last delivered chunk ended at or above the chain tip.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The index the next delivered chunk starts at.
    pub fn last_delivered_index(&self) -> BlockIndex {
        self.last_delivered_index
    }

    /// Drain any in-flight work and start scanning from `start_index`.
    ///
    /// Safe to call at any time, e.g. after the caller noticed a reorg.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn begin_scanning_from_index(
        &mut self,
        start_index: BlockIndex,
        max_chunk_size_hint: u64,
    ) -> Result<(), ScannerError> {
        self.scheduler.close_and_clear_pending_queue().await;

        let epoch = self.scheduler.reset(start_index, max_chunk_size_hint);

        self.started = true;
        self.finished = false;
        self.last_delivered_index = start_index;
        self.max_chunk_size_hint = max_chunk_size_hint;

        tracing::debug!(epoch, "Began scanning");

        self.scheduler.launch_until_full(epoch);

        match self.scheduler.take_fault() {
            Some(fault) => Err(self.fail(fault.into()).await),
            None => Ok(()),
        }
    }

    /// Take the next chunk in block order, waiting until its context is known.
    ///
    /// Any error stops scanning; call [`Self::begin_scanning_from_index`] to resume.
    pub async fn pull_next_chunk(&mut self) -> Result<PulledChunk<E::ChunkData>, ScannerError> {
        if !self.started {
            return Err(InternalInconsistency::NotStarted.into());
        }

        let next = self.next_pending().await;
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                return match self.end_of_chain() {
                    Ok(context) => Ok(PulledChunk::EndOfChain(context)),
                    Err(fault) => Err(self.fail(fault.into()).await),
                };
            }
            Err(err) => return Err(self.fail(err).await),
        };

        let PendingChunk {
            request,
            context,
            data,
            ..
        } = chunk;

        if request.start_index != self.last_delivered_index {
            let fault = InternalInconsistency::OutOfOrderChunk {
                expected: self.last_delivered_index,
                actual: request.start_index,
            };
            return Err(self.fail(fault.into()).await);
        }

        let outcome = match context.wait().await {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.fail(err).await),
        };

        self.last_delivered_index = outcome.context.end_index();

        tracing::trace!(
            start_index = request.start_index,
            blocks = outcome.context.len(),
            is_terminal = outcome.is_terminal,
            "Delivering chunk"
        );

        if outcome.is_terminal {
            self.reached_terminal_chunk().await?;
        }

        Ok(PulledChunk::Chunk(LedgerChunk {
            context: outcome.context,
            is_terminal: outcome.is_terminal,
            data,
        }))
    }

    /// Pop the lowest pending chunk. Waits while the queue is empty but chunks still in
    /// flight may queue more; `None` once nothing can.
    async fn next_pending(&self) -> Result<Option<PendingChunk<E::ChunkData>>, ScannerError> {
        loop {
            let changed = self.scheduler.changed().notified();
            let mut changed = std::pin::pin!(changed);
            // register before looking so a wakeup in between isn't lost
            changed.as_mut().enable();

            if let Some(fault) = self.scheduler.take_fault() {
                return Err(fault.into());
            }

            if let Some(chunk) = self.scheduler.pop_first() {
                return Ok(Some(chunk));
            }

            if self.finished || !self.scheduler.has_chunks_in_flight() {
                return Ok(None);
            }

            changed.await;
        }
    }

    fn end_of_chain(&self) -> Result<ChunkContext, InternalInconsistency> {
        if !self.finished {
            return Err(InternalInconsistency::QueueEmptyBeforeFinish);
        }

        let chain_state = self.scheduler.chain_state();

        if !chain_state.is_height_known() {
            return Err(InternalInconsistency::UnknownChainHeight);
        }
        if chain_state.top_block_id.is_null() {
            return Err(InternalInconsistency::UnknownTopBlock);
        }
        // scanning may have begun above the tip, then the tip probe is where it ends
        if self.last_delivered_index < chain_state.num_blocks_in_chain {
            return Err(InternalInconsistency::FinishedAtWrongHeight {
                delivered: self.last_delivered_index,
                chain_height: chain_state.num_blocks_in_chain,
            });
        }

        Ok(ChunkContext::empty(
            self.last_delivered_index,
            chain_state.top_block_id,
        ))
    }

    async fn reached_terminal_chunk(&mut self) -> Result<(), ScannerError> {
        self.scheduler.close_and_clear_pending_queue().await;

        let chain_height = self.scheduler.chain_state().num_blocks_in_chain;

        if self.last_delivered_index >= chain_height {
            if self.last_delivered_index > chain_height {
                tracing::debug!(
                    last_delivered_index = self.last_delivered_index,
                    chain_height,
                    "Scan started above the chain tip"
                );
            } else {
                tracing::debug!(chain_height, "Scanned up to the chain tip");
            }

            self.finished = true;
            return Ok(());
        }

        tracing::debug!(
            last_delivered_index = self.last_delivered_index,
            chain_height,
            "Chain moved while scanning, restarting"
        );

        self.begin_scanning_from_index(self.last_delivered_index, self.max_chunk_size_hint)
            .await
    }

    /// Stop scanning after an error.
    async fn fail(&mut self, err: ScannerError) -> ScannerError {
        self.scheduler.close_and_clear_pending_queue().await;
        self.started = false;

        tracing::debug!(error = ?err, "Stopped scanning");

        err
    }
}

impl<P, E> Drop for AsyncLedgerScanner<P, E>
where
    P: ProvidesBlocks,
    E: EnoteFindingContext,
{
    fn drop(&mut self) {
        self.scheduler.close();
    }
}
