//! Bounded retries with exponential backoff.

use std::{fmt::Debug, time::Duration};

use backoff::backoff::Backoff as _;

use crate::config::ScannerConfig;
use crate::error::FetchError;
use crate::primitives::ChunkRequest;
use crate::rpc::{GetBlocksRequest, GetBlocksResponse, ProvidesBlocks, validate_response};

pub struct Backoff(backoff::ExponentialBackoff);

impl Backoff {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        let inner = backoff::ExponentialBackoff {
            initial_interval,
            current_interval: initial_interval,
            max_interval,
            max_elapsed_time: None,
            ..Default::default()
        };
        Self(inner)
    }

    pub fn from_config(config: &ScannerConfig) -> Self {
        Self::new(config.retry_initial_interval(), config.retry_max_interval())
    }

    pub async fn sleep_on_error(&mut self, err: &impl Debug, msg: &'static str) {
        // `max_elapsed_time` is unset so the backoff never runs out
        let retry_after = self.0.next_backoff().unwrap_or(self.0.max_interval);

        tracing::warn!(
            error = ?err,
            retry_after_ms = retry_after.as_millis() as u64,
            "{msg}"
        );

        tokio::time::sleep(retry_after).await;
    }
}

/// A fetch that gave up.
#[derive(Debug)]
pub struct FetchFailure {
    pub attempts: usize,
    pub error: FetchError,
}

/// Fetch the blocks for `chunk`, retrying transient failures and malformed responses up
/// to `max_get_blocks_attempts` times in total.
pub async fn get_blocks_with_retry<P>(
    provider: &P,
    chunk: &ChunkRequest,
    config: &ScannerConfig,
) -> Result<(GetBlocksRequest, GetBlocksResponse), FetchFailure>
where
    P: ProvidesBlocks,
{
    let request = GetBlocksRequest::for_chunk(chunk, config.high_height_ok, config.trusted_daemon);
    let mut backoff = Backoff::from_config(config);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let error = match provider.get_blocks(request.clone()).await {
            Ok(response) => match validate_response(&request, &response) {
                Ok(()) => return Ok((request, response)),
                Err(shape) => FetchError::from(shape),
            },
            Err(err) => err,
        };

        if error.is_permanent() || attempt >= config.max_get_blocks_attempts {
            return Err(FetchFailure {
                attempts: attempt,
                error,
            });
        }

        tracing::trace!(
            start_index = chunk.start_index,
            attempt,
            max_attempts = config.max_get_blocks_attempts,
            "Retrying get_blocks"
        );
        backoff
            .sleep_on_error(&error, "Failed to fetch blocks, retrying")
            .await;
    }
}
