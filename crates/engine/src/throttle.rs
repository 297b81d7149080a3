//! Download bandwidth limiting.
//!
//! Each download stream gets its own token bucket of `burst` bytes refilled
//! at `bytes_per_second`. Pieces larger than the bucket are split so every
//! request for capacity can eventually be granted.

use crate::download::ByteStream;
use crate::error::EngineError;
use coffer_core::config::ThrottleConfig;
use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// A byte-rate limiter for one outgoing stream.
#[derive(Clone)]
pub struct Throttle {
    limiter: Arc<DefaultDirectRateLimiter>,
    burst: NonZeroU32,
}

impl Throttle {
    pub fn new(bytes_per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_second(bytes_per_second).allow_burst(burst);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            burst,
        }
    }

    /// A fresh limiter for the configured rate, or `None` when throttling is off.
    pub fn from_config(config: &ThrottleConfig) -> Option<Self> {
        let rate = config.bytes_per_second?;
        let burst = config.burst()?;
        Some(Self::new(rate, burst))
    }

    /// Largest piece handed out at once.
    pub fn burst(&self) -> NonZeroU32 {
        self.burst
    }

    /// Delay the pieces of `stream` so their total rate stays under the limit.
    ///
    /// Bytes and errors pass through unchanged and in order.
    pub fn wrap(self, stream: ByteStream) -> ByteStream {
        let max_piece = self.burst.get() as usize;
        let stream = async_stream::try_stream! {
            let mut stream = stream;
            while let Some(piece) = stream.next().await {
                let mut piece = piece?;
                while !piece.is_empty() {
                    let part = piece.split_to(piece.len().min(max_piece));
                    if let Some(cells) = NonZeroU32::new(part.len() as u32) {
                        self.limiter
                            .until_n_ready(cells)
                            .await
                            .map_err(|e| EngineError::Internal(format!("throttle: {e}")))?;
                    }
                    yield part;
                }
            }
        };
        Box::pin(stream)
    }
}

/// Apply the configured throttle to a download stream, if any.
pub fn throttled(stream: ByteStream, config: &ThrottleConfig) -> ByteStream {
    match Throttle::from_config(config) {
        Some(throttle) => throttle.wrap(stream),
        None => stream,
    }
}
