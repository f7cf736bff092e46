pub mod chain_state;
pub mod config;
pub mod deferred;
pub mod error;
pub mod primitives;
pub mod refresh;
pub mod retry;
pub mod rpc;
pub mod scanner;
mod scheduler;
pub mod view_scan;

pub use config::{Config, RefreshConfig, ScannerConfig};
pub use error::{FetchError, ScannerError};
pub use refresh::{ChunkConsumer, RefreshError, RefreshOutcome, refresh_ledger};
pub use scanner::{AsyncLedgerScanner, LedgerChunk, PulledChunk};
pub use view_scan::EnoteFindingContext;
