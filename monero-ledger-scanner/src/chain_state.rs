use crate::error::InternalInconsistency;
use crate::primitives::{BlockId, ChunkContext};

/// The scanner's best knowledge of the chain tip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainState {
    /// 0 means unknown.
    pub num_blocks_in_chain: u64,
    /// Null means unknown.
    pub top_block_id: BlockId,
}

impl ChainState {
    pub fn is_height_known(&self) -> bool {
        self.num_blocks_in_chain != 0
    }

    /// Record what a just-completed fetch reported and classify its chunk.
    ///
    /// The last fetch to complete wins, even if it reports a lower height than an earlier
    /// one. Returns whether the chunk reached the reported chain tip.
    pub fn update(
        &mut self,
        context: &ChunkContext,
        reported_height: u64,
        reported_top_block_id: BlockId,
    ) -> Result<bool, InternalInconsistency> {
        self.num_blocks_in_chain = reported_height;
        self.top_block_id = reported_top_block_id;

        let is_terminal = context.is_empty() || context.end_index() >= reported_height;
        if !is_terminal {
            return Ok(false);
        }

        if let Some(last_block_id) = context.last_block_id() {
            self.top_block_id = last_block_id;
        }

        if self.num_blocks_in_chain == 0 {
            return Err(InternalInconsistency::UnknownChainHeight);
        }
        if self.top_block_id.is_null() {
            return Err(InternalInconsistency::UnknownTopBlock);
        }

        Ok(true)
    }
}
