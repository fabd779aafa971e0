#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::gateway::Gateway;
use super::hub::Outbound;
use super::protocol::ServerMessage;
use crate::error::Error;
use crate::metrics::Counter;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale, drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if no message arrives within this duration.
/// Keeps idle sockets from holding semaphore permits forever.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Per-connection token bucket
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: Instant::now(),
            warned: false,
        }
    }

    /// Takes one token. Returns `Err(first)` when limited, where `first`
    /// is set only for the first rejection of a burst.
    fn try_acquire(&mut self, now: Instant) -> Result<(), bool> {
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = (self.tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            Ok(())
        } else {
            let first = !self.warned;
            self.warned = true;
            Err(first)
        }
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(socket: WebSocket, gateway: Arc<Gateway>, _permit: OwnedSemaphorePermit) {
    let conn_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", conn_id);

    let metrics = gateway.metrics().clone();
    metrics.inc(Counter::Connections);
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);
    gateway.connect(&conn_id, tx);

    // Spawn task to send messages to client
    let send_conn_id = conn_id.clone();
    let send_metrics = metrics.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(json) => {
                    send_metrics.inc(Counter::MessagesSent);
                    if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!("Send task finished for connection: {}", send_conn_id);
    });

    let mut limiter = RateLimiter::new();

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()) => next,
            _ = &mut send_task => {
                debug!("Outbound side of {} closed", conn_id);
                break;
            }
        };
        let msg = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for connection {}", conn_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc(Counter::MessagesReceived);

                if let Err(first) = limiter.try_acquire(Instant::now()) {
                    if first {
                        warn!("Rate limit exceeded for connection {}", conn_id);
                        let err = Error::BadRequest(format!(
                            "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"
                        ));
                        gateway.hub().send(&conn_id, &ServerMessage::error(None, &err));
                    }
                    continue;
                }

                let start = Instant::now();
                gateway.handle_text(&conn_id, text.as_str()).await;
                metrics.observe_message_handling(start.elapsed());
            }
            Message::Close(_) => {
                info!("Client {} closed connection", conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            Message::Binary(_) => {
                warn!("Unexpected binary frame from client {}", conn_id);
            }
        }
    }

    if let Err(e) = gateway.disconnect(&conn_id).await {
        error!("Error cleaning up connection {}: {}", conn_id, e);
    }
    // the hub held the last sender, so the send task drains and exits
    if !send_task.is_finished() {
        let _ = send_task.await;
    }
    info!("Connection handler finished for: {}", conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_burst_then_limits() {
        let mut limiter = RateLimiter::new();
        let now = limiter.last_refill;
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            assert!(limiter.try_acquire(now).is_ok());
        }
        assert_eq!(limiter.try_acquire(now), Err(true));
        assert_eq!(limiter.try_acquire(now), Err(false));
    }

    #[test]
    fn rate_limiter_refills_over_time() {
        let mut limiter = RateLimiter::new();
        let start = limiter.last_refill;
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            limiter.try_acquire(start).unwrap();
        }
        assert!(limiter.try_acquire(start).is_err());

        // 10ms at 100 tokens/s is exactly one token
        let later = start + Duration::from_millis(10);
        assert!(limiter.try_acquire(later).is_ok());
        assert!(limiter.try_acquire(later).is_err());
    }
}
