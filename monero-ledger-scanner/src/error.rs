//! Error taxonomy of the scanner.

use crate::primitives::BlockIndex;

/// Errors returned by an injected block fetcher.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network or transport failure. Retried.
    #[error("Transport error")]
    Transport(#[source] anyhow::Error),
    /// The daemon answered but the response is unusable. Retried.
    #[error("Malformed response: {0}")]
    Malformed(String),
    /// The daemon refused the request in a way retrying won't fix.
    #[error("Daemon rejected the request: {0}")]
    Rejected(String),
}

impl FetchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Rejected(_))
    }
}

impl From<ResponseShapeError> for FetchError {
    fn from(err: ResponseShapeError) -> Self {
        FetchError::Malformed(err.to_string())
    }
}

/// Reasons a `get_blocks` response fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseShapeError {
    #[error("Response has {blocks} blocks but {output_indices} output index lists")]
    OutputIndicesCount { blocks: usize, output_indices: usize },
    #[error("Block {index} has {transactions} transactions but {output_indices} output index lists")]
    TransactionIndicesCount {
        index: BlockIndex,
        transactions: usize,
        output_indices: usize,
    },
    #[error("Transaction {tx_position} in block {index} has {outputs} outputs but {output_indices} output indices")]
    OutputCount {
        index: BlockIndex,
        tx_position: usize,
        outputs: usize,
        output_indices: usize,
    },
    #[error("Response starts at height {actual}, requested {expected}")]
    StartHeight { expected: u64, actual: u64 },
    #[error("Response has {actual} blocks, at most {max} were requested")]
    TooManyBlocks { max: u64, actual: usize },
    #[error("Block {index} does not reference the block before it")]
    Discontinuity { index: BlockIndex },
}

/// The scheduler's own bookkeeping is inconsistent. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InternalInconsistency {
    #[error("Expected chunk starting at {expected} but the next pending chunk starts at {actual}")]
    OutOfOrderChunk { expected: BlockIndex, actual: BlockIndex },
    #[error("Terminal chunk observed without a known chain height")]
    UnknownChainHeight,
    #[error("Terminal chunk observed without a known top block id")]
    UnknownTopBlock,
    #[error("Pending queue is empty but scanning has not finished")]
    QueueEmptyBeforeFinish,
    #[error("Scanning finished at {delivered} but the chain height is {chain_height}")]
    FinishedAtWrongHeight {
        delivered: BlockIndex,
        chain_height: u64,
    },
    #[error("A chunk starting at {start_index} is already pending")]
    DuplicateStartIndex { start_index: BlockIndex },
    #[error("Scanning has not been started")]
    NotStarted,
}

/// Errors surfaced by the scanner to its caller.
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("Failed to fetch chunk starting at {start_index} after {attempts} attempt(s)")]
    Fetch {
        start_index: BlockIndex,
        attempts: usize,
        #[source]
        source: FetchError,
    },
    #[error("Failed to scan chunk starting at {start_index}")]
    Scan {
        start_index: BlockIndex,
        #[source]
        source: anyhow::Error,
    },
    #[error("Chunk starting at {start_index} was canceled")]
    Canceled { start_index: BlockIndex },
    #[error("Chunk task starting at {start_index} ended without a result")]
    Abandoned { start_index: BlockIndex },
    #[error("Internal inconsistency")]
    Internal(#[from] InternalInconsistency),
}

impl ScannerError {
    /// Fatal errors indicate a scheduler defect rather than an environment fault.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScannerError::Internal(_))
    }
}
