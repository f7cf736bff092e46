use crate::primitives::{BlockScanInput, ChunkContext};

/// Finds the wallet's enotes in a chunk of blocks.
///
/// The scanner treats this as one opaque, CPU-bound call per chunk and runs it on the
/// blocking thread pool. Implementations are free to parallelize internally.
pub trait EnoteFindingContext: Send + Sync + 'static {
    /// Whatever the balance cache needs from a scanned chunk.
    type ChunkData: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn view_scan_chunk(
        &self,
        context: &ChunkContext,
        blocks: &[BlockScanInput],
    ) -> Result<Self::ChunkData, Self::Error>;
}
