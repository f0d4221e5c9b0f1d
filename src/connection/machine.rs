// src/connection/machine.rs

//! The connection worker: one long-running task per room that owns the
//! socket lifecycle.
//!
//! Each cycle authenticates (reusing a cached, unexpired token), opens the
//! channel, hands the open session to the room core, and pumps frames until
//! the channel dies. The exit reason decides the next state: a clean stop, a
//! server rejection (slow reconnect schedule), or a plain retry with
//! exponential backoff. Backoff sleeps stay interruptible by shutdown and
//! manual-reconnect signals.

use crate::auth;
use crate::connection::backoff::Backoff;
use crate::connection::{CLOSE_WITHOUT_RETRY, PING_FRAME, PONG_FRAME, REJECTION_CLOSE_CODES};
use crate::connection::websocket;
use crate::core::errors::RoomError;
use crate::core::room::{Connection, RoomShared};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, info, warn};

/// Why a connection cycle ended.
#[derive(Debug, PartialEq)]
enum CycleEnd {
    /// `disconnect()` or drop; stop for good.
    Shutdown,
    /// The server closed with the no-retry sentinel.
    CloseWithoutRetry,
    /// The server rejected the session; retry on the slow schedule.
    Rejected { code: u16, reason: String },
    /// Manual `reconnect()`; retry immediately with a fresh backoff.
    ManualReconnect,
    /// Anything else; retry on the normal schedule.
    Retry,
}

/// The per-room connection worker.
pub(crate) struct ConnectionWorker {
    shared: Arc<RoomShared>,
    token_cache: Option<auth::AccessToken>,
    backoff: Backoff,
    slow_schedule: bool,
}

impl ConnectionWorker {
    pub(crate) fn new(shared: Arc<RoomShared>) -> Self {
        Self {
            shared,
            token_cache: None,
            backoff: Backoff::new(),
            slow_schedule: false,
        }
    }

    /// The main run loop: connection cycles separated by interruptible
    /// backoff sleeps.
    pub(crate) async fn run(mut self) {
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        let mut reconnect_rx = self.shared.reconnect_tx.subscribe();
        info!(
            "Connection worker started for room '{}'",
            self.shared.config.room_id
        );

        loop {
            let end = tokio::select! {
                end = self.handle_connection_cycle(&mut reconnect_rx) => end,
                _ = shutdown_rx.recv() => CycleEnd::Shutdown,
            };

            let shared = self.shared.clone();
            shared.with_core(|core, pending| core.on_channel_closed(pending));

            match end {
                CycleEnd::Shutdown => {
                    info!("Connection worker shutting down");
                    shared.with_core(|core, pending| {
                        core.set_connection_state(Connection::Closed, pending);
                    });
                    return;
                }
                CycleEnd::CloseWithoutRetry => {
                    info!("Server ended the session; not reconnecting");
                    shared.with_core(|core, pending| {
                        core.set_connection_state(Connection::Closed, pending);
                    });
                    return;
                }
                CycleEnd::Rejected { code, reason } => {
                    warn!("Session rejected by server (code {code}): {reason}");
                    shared.with_core(|core, pending| {
                        core.set_connection_state(Connection::Failed, pending);
                        pending.errors.push(RoomError::Rejected { code, reason });
                    });
                    shared.with_core(|core, pending| {
                        core.set_connection_state(Connection::Unavailable, pending);
                    });
                    self.slow_schedule = true;
                }
                CycleEnd::ManualReconnect => {
                    info!("Manual reconnect requested; reconnecting immediately");
                    shared.with_core(|core, pending| {
                        core.set_connection_state(Connection::Unavailable, pending);
                    });
                    self.backoff.reset();
                    self.slow_schedule = false;
                    continue;
                }
                CycleEnd::Retry => {
                    shared.with_core(|core, pending| {
                        core.set_connection_state(Connection::Unavailable, pending);
                    });
                }
            }

            let schedule = if self.slow_schedule {
                self.shared.config.backoff.slow_retry_delays()
            } else {
                self.shared.config.backoff.retry_delays()
            };
            let delay = self.backoff.next_delay(&schedule);
            info!("Will try to reconnect in {delay:?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    info!("Connection worker shutting down during backoff");
                    self.shared.with_core(|core, pending| {
                        core.set_connection_state(Connection::Closed, pending);
                    });
                    return;
                }
                _ = reconnect_rx.recv() => {
                    info!("Reconnect signal received during backoff; connecting now");
                    self.backoff.reset();
                    self.slow_schedule = false;
                }
            }
        }
    }

    /// One cycle: authenticate, connect, pump until the channel dies.
    async fn handle_connection_cycle(
        &mut self,
        reconnect_rx: &mut broadcast::Receiver<()>,
    ) -> CycleEnd {
        self.shared.with_core(|core, pending| {
            core.set_connection_state(Connection::Authenticating, pending);
        });

        let token = match &self.token_cache {
            Some(token) if !token.is_expired_now() => {
                debug!("Reusing cached token");
                token.clone()
            }
            _ => match auth::authenticate(&self.shared.config).await {
                Ok(token) => {
                    self.token_cache = Some(token.clone());
                    token
                }
                Err(err) => {
                    warn!("Authentication failed: {err}");
                    self.shared.with_core(|_core, pending| {
                        pending.errors.push(err.clone());
                    });
                    return CycleEnd::Retry;
                }
            },
        };

        let session = token.session_info();
        self.shared.with_core(|core, pending| {
            core.set_connection_state(Connection::Connecting(session.clone()), pending);
        });

        let stream = match websocket::connect(&self.shared.config.server, &token.raw).await {
            Ok(stream) => stream,
            Err(err) => {
                // Transport errors are logged, not surfaced.
                warn!("Failed to open channel: {err}");
                return CycleEnd::Retry;
            }
        };
        info!("Channel open (actor {})", session.actor);

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        self.shared.with_core(|core, pending| {
            core.on_channel_open(session.clone(), out_tx, pending);
        });
        self.backoff.reset();
        self.slow_schedule = false;

        let mut heartbeat = tokio::time::interval(self.shared.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the interval's immediate first tick.
        heartbeat.tick().await;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            // A disarmed pong timer sleeps into the far future; the branch
            // precondition keeps it from ever firing.
            let pong_at = pong_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
            let pong_armed = pong_deadline.is_some();

            tokio::select! {
                inbound = read.next() => match inbound {
                    None => {
                        warn!("Channel stream ended");
                        return CycleEnd::Retry;
                    }
                    Some(Err(err)) => {
                        warn!("Channel error: {err}");
                        return CycleEnd::Retry;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text == PONG_FRAME {
                            pong_deadline = None;
                        } else {
                            self.shared.with_core(|core, pending| {
                                core.handle_frame(&text, pending);
                            });
                        }
                    }
                    Some(Ok(Message::Close(frame))) => return classify_close(frame),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = write.send(Message::Pong(payload)).await {
                            warn!("Failed to answer ping: {err}");
                            return CycleEnd::Retry;
                        }
                    }
                    Some(Ok(other)) => debug!("Ignoring unexpected channel message: {other:?}"),
                },

                outbound = out_rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(err) = write.send(Message::Text(frame)).await {
                            warn!("Failed to send frame: {err}");
                            return CycleEnd::Retry;
                        }
                    }
                    // The core dropped the sender; treat like a dead channel.
                    None => return CycleEnd::Retry,
                },

                _ = heartbeat.tick() => {
                    if let Err(err) = write.send(Message::Text(PING_FRAME.into())).await {
                        warn!("Failed to send heartbeat: {err}");
                        return CycleEnd::Retry;
                    }
                    pong_deadline = Some(Instant::now() + self.shared.config.pong_timeout);
                }

                _ = tokio::time::sleep_until(pong_at), if pong_armed => {
                    warn!("Pong timeout; tearing down the channel");
                    return CycleEnd::Retry;
                }

                _ = reconnect_rx.recv() => return CycleEnd::ManualReconnect,
            }
        }
    }
}

fn classify_close(frame: Option<CloseFrame<'_>>) -> CycleEnd {
    let Some(frame) = frame else {
        return CycleEnd::Retry;
    };
    let code = u16::from(frame.code);
    if code == CLOSE_WITHOUT_RETRY {
        CycleEnd::CloseWithoutRetry
    } else if REJECTION_CLOSE_CODES.contains(&code) {
        CycleEnd::Rejected {
            code,
            reason: frame.reason.to_string(),
        }
    } else {
        debug!("Channel closed with code {code}");
        CycleEnd::Retry
    }
}
