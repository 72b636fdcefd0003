//! Reconnection with exponential backoff.
//!
//! Transient failures double the delay up to a cap; a completed handshake
//! resets it. Fatal failures (bad token, session conflict) stop the loop
//! and surface to the caller.

use crate::errors::TunnelError;
use crate::events::{Event, EventBus};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Delay schedule: non-decreasing, capped, resettable.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    /// The delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current;
        let grown = self.current.as_secs_f64() * self.config.multiplier;
        self.current = Duration::from_secs_f64(grown).min(self.config.max_delay);
        delay
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        match self.config.max_attempts {
            Some(max) => self.attempt >= max,
            None => false,
        }
    }
}

/// Drive `connect` until it fails fatally, retries are exhausted, or the
/// token is cancelled. `connect` resolving `Ok(())` means a session was
/// established and later ended normally: the backoff resets, so the next
/// wait is the initial delay again.
pub async fn retry_loop<F, Fut>(
    config: ReconnectConfig,
    cancel: CancellationToken,
    events: EventBus,
    mut connect: F,
) -> TunnelError
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), TunnelError>>,
{
    let mut backoff = Backoff::new(config);

    loop {
        if cancel.is_cancelled() {
            return TunnelError::Cancelled;
        }

        match connect().await {
            Ok(()) => {
                info!("session ended, reconnecting");
                backoff.reset();
                events.publish(Event::Disconnected {
                    reason: "session ended".to_string(),
                });
            }
            Err(TunnelError::Cancelled) => return TunnelError::Cancelled,
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "fatal tunnel error, giving up");
                return e;
            }
            Err(e) => {
                warn!(error = %e, "connection attempt failed");
                events.publish(Event::Error {
                    message: e.to_string(),
                });
                if backoff.exhausted() {
                    return e;
                }
            }
        }

        let delay = backoff.next_delay();
        events.publish(Event::Reconnecting {
            delay,
            attempt: backoff.attempt(),
        });
        info!(delay = ?delay, attempt = backoff.attempt(), "waiting before reconnect");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return TunnelError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick_config() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(quick_config());

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(80));
        // Capped from here on.
        assert_eq!(backoff.next_delay(), Duration::from_millis(80));
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        let mut backoff = Backoff::new(quick_config());
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= quick_config().max_delay);
            previous = delay;
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(quick_config());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let err = retry_loop(
            quick_config(),
            CancellationToken::new(),
            EventBus::new(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TunnelError::AlreadyConnected)
                }
            },
        )
        .await;

        assert!(matches!(err, TunnelError::AlreadyConnected));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_continues_on_transient_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let err = retry_loop(
            ReconnectConfig {
                max_attempts: Some(3),
                ..quick_config()
            },
            CancellationToken::new(),
            EventBus::new(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TunnelError::Connection("refused".into()))
                }
            },
        )
        .await;

        assert!(matches!(err, TunnelError::Connection(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_successful_session_resets_backoff() {
        // Fail twice, succeed once, fail fatally; the post-success delay
        // restarts at the initial value.
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let bus = EventBus::new();
        let mut delays = bus.subscribe();

        let _err = retry_loop(
            quick_config(),
            CancellationToken::new(),
            bus,
            move || {
                let counter = counter.clone();
                async move {
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        0 | 1 => Err(TunnelError::Connection("down".into())),
                        2 => Ok(()),
                        _ => Err(TunnelError::InvalidToken),
                    }
                }
            },
        )
        .await;

        let mut seen = Vec::new();
        while let Ok(event) = delays.try_recv() {
            if let Event::Reconnecting { delay, .. } = event {
                seen.push(delay);
            }
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(10), // reset after the successful session
            ]
        );
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                retry_loop(
                    ReconnectConfig {
                        initial_delay: Duration::from_secs(3600),
                        ..quick_config()
                    },
                    cancel,
                    EventBus::new(),
                    || async { Err(TunnelError::Connection("down".into())) },
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, TunnelError::Cancelled));
    }
}
