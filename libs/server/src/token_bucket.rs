use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TokenBucketConfig;

/// Refill-at-interval admission limiter. The bucket starts full; a background
/// task adds `refresh_amount` tokens every `interval`, capped at
/// `max_tokens`. `admit` never blocks and never errors.
pub struct TokenBucket {
    tokens: Mutex<u64>,
    max_tokens: u64,
}

impl TokenBucket {
    /// Creates the bucket and spawns its refill task, which runs until
    /// `cancel` fires.
    pub fn start(config: TokenBucketConfig, cancel: CancellationToken) -> Arc<Self> {
        let bucket = Arc::new(Self {
            tokens: Mutex::new(config.max_tokens),
            max_tokens: config.max_tokens,
        });

        let refill = Arc::clone(&bucket);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            interval.tick().await; // throw away first immediate tick
            loop {
                tokio::select! {
                    _ = interval.tick() => refill.add(config.refresh_amount),
                    _ = cancel.cancelled() => {
                        debug!("token bucket refill stopped");
                        return;
                    }
                }
            }
        });

        bucket
    }

    /// Takes one token if any are left. Callable from any worker.
    pub fn admit(&self) -> bool {
        let mut tokens = self.tokens.lock().expect("token bucket lock");
        if *tokens > 0 {
            *tokens -= 1;
            true
        } else {
            false
        }
    }

    fn add(&self, amount: u64) {
        let mut tokens = self.tokens.lock().expect("token bucket lock");
        *tokens = tokens.saturating_add(amount).min(self.max_tokens);
    }
}
