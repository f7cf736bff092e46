use std::collections::BTreeMap;

use crate::chain_state::ChainState;
use crate::error::InternalInconsistency;
use crate::primitives::{BlockIndex, ChunkRequest};

/// Pending chunks keyed by start index, plus the bookkeeping deciding when to launch more.
///
/// Chunks may be inserted in any order (gap fills land wherever they land) but always
/// come out lowest start index first.
#[derive(Debug)]
pub(crate) struct PendingChunkQueue<T> {
    capacity: usize,
    ready: bool,
    scan_cursor: BlockIndex,
    max_chunk_size_hint: u64,
    /// Chunks between launch and publishing their context.
    pub(crate) pending_fetches: usize,
    /// Chunks between publishing their context and publishing their data.
    pub(crate) pending_scans: usize,
    chunks: BTreeMap<BlockIndex, T>,
}

impl<T> PendingChunkQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ready: false,
            scan_cursor: 0,
            max_chunk_size_hint: 1,
            pending_fetches: 0,
            pending_scans: 0,
            chunks: BTreeMap::new(),
        }
    }

    /// Start a new scanning epoch. Any chunks left over are returned to the caller.
    pub(crate) fn reset(&mut self, start_index: BlockIndex, max_chunk_size_hint: u64) -> Vec<T> {
        self.ready = true;
        self.scan_cursor = start_index;
        self.max_chunk_size_hint = max_chunk_size_hint.max(1);
        self.pending_fetches = 0;
        self.pending_scans = 0;

        self.take_all()
    }

    /// Stop launches and reject pushes until the next reset.
    pub(crate) fn shut_down(&mut self) {
        self.ready = false;
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn scan_cursor(&self) -> BlockIndex {
        self.scan_cursor
    }

    pub(crate) fn rewind_cursor(&mut self, index: BlockIndex) {
        self.scan_cursor = index;
    }

    pub(crate) fn should_launch_next(&self, chain_state: &ChainState) -> bool {
        if !self.ready {
            return false;
        }

        // everything up to the known tip is already scheduled
        if chain_state.is_height_known() && self.scan_cursor >= chain_state.num_blocks_in_chain {
            return false;
        }

        self.pending_fetches < self.capacity && self.pending_scans < self.capacity
    }

    /// Take the request at the cursor and advance the cursor past it.
    pub(crate) fn next_request(&mut self) -> ChunkRequest {
        let request = ChunkRequest::new(self.scan_cursor, self.max_chunk_size_hint);
        self.scan_cursor = request.end_index();

        request
    }

    pub(crate) fn contains(&self, start_index: BlockIndex) -> bool {
        self.chunks.contains_key(&start_index)
    }

    /// Insert a launched chunk, counting it as fetching.
    pub(crate) fn insert(
        &mut self,
        start_index: BlockIndex,
        chunk: T,
    ) -> Result<(), InternalInconsistency> {
        if self.chunks.contains_key(&start_index) {
            return Err(InternalInconsistency::DuplicateStartIndex { start_index });
        }

        self.chunks.insert(start_index, chunk);
        self.pending_fetches += 1;

        Ok(())
    }

    pub(crate) fn pop_first(&mut self) -> Option<T> {
        self.chunks.pop_first().map(|(_, chunk)| chunk)
    }

    pub(crate) fn take_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.chunks).into_values().collect()
    }
}
