use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::gap::{GapFill, plan_gap_fill};
use super::{ChunkOutcome, Scheduler};
use crate::deferred::Resolver;
use crate::error::{InternalInconsistency, ScannerError};
use crate::primitives::{BlockId, BlockScanInput, ChunkContext, ChunkRequest};
use crate::retry::{FetchFailure, get_blocks_with_retry};
use crate::rpc::{ParsedChunk, ProvidesBlocks, parse_response};
use crate::view_scan::EnoteFindingContext;

/// Everything a chunk task needs, moved into the spawned task.
pub(crate) struct ChunkTask<D> {
    pub(crate) epoch: u64,
    pub(crate) request: ChunkRequest,
    pub(crate) context: Resolver<ChunkOutcome>,
    pub(crate) data: Resolver<D>,
    pub(crate) stop_context: CancellationToken,
    pub(crate) stop_data: CancellationToken,
}

impl<P, E> Scheduler<P, E>
where
    P: ProvidesBlocks,
    E: EnoteFindingContext,
{
    /// Fetch, publish the context, scan, publish the data.
    pub(crate) async fn run_chunk_task(self: Arc<Self>, task: ChunkTask<E::ChunkData>) {
        let ChunkTask {
            epoch,
            request,
            context,
            data,
            stop_context,
            stop_data,
        } = task;
        let start_index = request.start_index;

        let response = match get_blocks_with_retry(&self.provider, &request, &self.config).await {
            Ok((_, response)) => response,
            Err(FetchFailure { attempts, error }) => {
                tracing::warn!(attempts, error = ?error, "Giving up on chunk");

                self.abandon_fetch(epoch);
                context.resolve(Err(ScannerError::Fetch {
                    start_index,
                    attempts,
                    source: error,
                }));
                // the data resolver is dropped unresolved, there is nothing to scan
                return;
            }
        };

        let ParsedChunk {
            context: chunk_context,
            blocks,
            chain_height,
            top_block_id,
        } = parse_response(&request, response);

        tracing::trace!(
            blocks = chunk_context.len(),
            chain_height,
            "Fetched chunk"
        );

        let is_terminal =
            match self.complete_fetch(epoch, &request, &chunk_context, chain_height, top_block_id) {
                Ok(Some(is_terminal)) => is_terminal,
                Ok(None) => {
                    context.resolve(Err(ScannerError::Canceled { start_index }));
                    return;
                }
                Err(fault) => {
                    context.resolve(Err(fault.into()));
                    return;
                }
            };

        context.resolve(Ok(ChunkOutcome {
            context: chunk_context.clone(),
            is_terminal,
        }));

        if stop_context.is_cancelled() {
            tracing::trace!("Skipping scan of canceled chunk");

            self.finish_scan(epoch, is_terminal);
            data.resolve(Err(ScannerError::Canceled { start_index }));
            return;
        }

        let scanned = self.view_scan(&stop_data, chunk_context, blocks).await;

        self.finish_scan(epoch, is_terminal);
        data.resolve(scanned);
    }

    /// Move a fetched chunk into the scan phase. Returns whether it is terminal, or `None`
    /// if the chunk belongs to an earlier epoch.
    fn complete_fetch(
        self: &Arc<Self>,
        epoch: u64,
        request: &ChunkRequest,
        context: &ChunkContext,
        chain_height: u64,
        top_block_id: BlockId,
    ) -> Result<Option<bool>, InternalInconsistency> {
        let is_terminal = {
            let mut state = self.lock();

            if state.epoch != epoch {
                return Ok(None);
            }

            state.queue.pending_fetches = state.queue.pending_fetches.saturating_sub(1);

            let is_terminal = state
                .chain_state
                .update(context, chain_height, top_block_id)?;

            state.queue.pending_scans += 1;

            // the gap chunk has to be queued before this chunk's context is published, so
            // the driver can't pop past it
            match plan_gap_fill(
                is_terminal,
                request.requested_size,
                context,
                self.config.is_single_flight(),
            ) {
                GapFill::Nothing => {}
                GapFill::Push(gap) => {
                    tracing::debug!(
                        gap_start = gap.start_index,
                        gap_size = gap.requested_size,
                        "Chunk came back short, filling the gap"
                    );
                    self.push_locked(&mut state, epoch, gap);
                }
                GapFill::RewindCursor(index) => {
                    tracing::debug!(
                        gap_start = index,
                        "Chunk came back short, rewinding the scan cursor"
                    );
                    state.queue.rewind_cursor(index);
                }
            }

            if is_terminal {
                tracing::debug!(
                    end_index = context.end_index(),
                    chain_height,
                    "Chunk reached the chain tip"
                );
            } else {
                self.launch_until_full_locked(&mut state, epoch);
            }

            is_terminal
        };

        self.changed.notify_waiters();

        Ok(Some(is_terminal))
    }

    fn abandon_fetch(self: &Arc<Self>, epoch: u64) {
        {
            let mut state = self.lock();

            if state.epoch == epoch {
                state.queue.pending_fetches = state.queue.pending_fetches.saturating_sub(1);
                self.launch_until_full_locked(&mut state, epoch);
            }
        }

        self.changed.notify_waiters();
    }

    fn finish_scan(self: &Arc<Self>, epoch: u64, is_terminal: bool) {
        {
            let mut state = self.lock();

            if state.epoch == epoch {
                state.queue.pending_scans = state.queue.pending_scans.saturating_sub(1);

                if !is_terminal {
                    self.launch_until_full_locked(&mut state, epoch);
                }
            }
        }

        self.changed.notify_waiters();
    }

    async fn view_scan(
        self: &Arc<Self>,
        stop: &CancellationToken,
        context: ChunkContext,
        blocks: Vec<BlockScanInput>,
    ) -> Result<E::ChunkData, ScannerError> {
        let start_index = context.start_index;

        let _permit = tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(ScannerError::Canceled { start_index }),
            permit = self.scan_permits.acquire() => {
                permit.map_err(|_| ScannerError::Canceled { start_index })?
            }
        };

        let scheduler = Arc::clone(self);
        let scan = tokio::task::spawn_blocking(move || {
            scheduler.finder.view_scan_chunk(&context, &blocks)
        });

        match scan.await {
            Ok(Ok(data)) => {
                tracing::trace!("Scanned chunk");
                Ok(data)
            }
            Ok(Err(err)) => {
                tracing::warn!(error = ?err, "Failed to scan chunk");
                Err(ScannerError::Scan {
                    start_index,
                    source: anyhow::Error::new(err),
                })
            }
            Err(err) => {
                tracing::warn!(error = %err, "View scan task panicked");
                Err(ScannerError::Scan {
                    start_index,
                    source: anyhow::anyhow!("View scan task panicked: {err}"),
                })
            }
        }
    }
}
