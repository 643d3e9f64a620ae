//! Signaling channel to the relay
//!
//! A persistent duplex WebSocket carrying one JSON envelope per message.
//! Inbound envelopes are delivered exactly once, in arrival order, as
//! [`SignalingEvent`]s. Channel closure or errors are reported but never
//! mutate session state themselves; that policy lives in the session
//! machine.

pub mod envelope;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{AppError, Result};
use envelope::Envelope;

/// Events surfaced by the signaling channel
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The channel is open; the owner should identify
    Open,
    /// An inbound envelope from the relay
    Envelope(Envelope),
    /// The channel closed
    Closed,
    /// A channel-level error
    Error(String),
}

/// Outbound envelope sink, kept as a seam so the session machine can be
/// tested without a live relay.
pub trait EnvelopeSink: Send + Sync {
    /// Queue an envelope for transmission. When the channel is not open the
    /// envelope is dropped with a logged error; there is no outbound queue.
    fn send(&self, envelope: Envelope);

    /// Whether the channel is currently open
    fn is_open(&self) -> bool;
}

/// Duplex WebSocket channel to the signaling relay
pub struct SignalingChannel {
    out_tx: mpsc::UnboundedSender<Envelope>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SignalingChannel {
    /// Connect to the relay and start the reader/writer tasks.
    ///
    /// Emits [`SignalingEvent::Open`] once the socket is established, then
    /// one event per inbound envelope until the socket closes.
    pub async fn connect(
        url: &str,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Result<Self> {
        info!(%url, "connecting to signaling relay");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| AppError::SignalingError(format!("Failed to connect to relay: {}", e)))?;

        let (mut ws_tx, mut ws_rx) = stream.split();
        let open = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();

        let _ = events.send(SignalingEvent::Open);

        // Writer: serialize and transmit queued envelopes
        let writer_open = open.clone();
        let writer_cancel = cancel.clone();
        let writer_events = events.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    outbound = out_rx.recv() => {
                        let Some(envelope) = outbound else { break };
                        let text = match serde_json::to_string(&envelope) {
                            Ok(text) => text,
                            Err(e) => {
                                error!("failed to encode envelope: {}", e);
                                continue;
                            }
                        };
                        debug!(kind = envelope.kind(), "sending envelope");
                        if let Err(e) = ws_tx.send(Message::Text(text)).await {
                            warn!("signaling send failed: {}", e);
                            writer_open.store(false, Ordering::SeqCst);
                            let _ = writer_events.send(SignalingEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
            }
        });

        // Reader: decode inbound envelopes in arrival order
        let reader_open = open.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    inbound = ws_rx.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<Envelope>(&text) {
                                    Ok(envelope) => {
                                        debug!(kind = envelope.kind(), "received envelope");
                                        if events.send(SignalingEvent::Envelope(envelope)).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "ignoring malformed relay message");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("signaling channel closed");
                                reader_open.store(false, Ordering::SeqCst);
                                let _ = events.send(SignalingEvent::Closed);
                                break;
                            }
                            Some(Ok(_)) => {} // ping/pong/binary: nothing to dispatch
                            Some(Err(e)) => {
                                warn!("signaling channel error: {}", e);
                                reader_open.store(false, Ordering::SeqCst);
                                let _ = events.send(SignalingEvent::Error(e.to_string()));
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            out_tx,
            open,
            cancel,
        })
    }

    /// Stop the reader/writer tasks and mark the channel closed
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

impl EnvelopeSink for SignalingChannel {
    fn send(&self, envelope: Envelope) {
        if !self.is_open() {
            error!(
                kind = envelope.kind(),
                "signaling channel is not open; envelope dropped"
            );
            return;
        }
        if self.out_tx.send(envelope).is_err() {
            self.open.store(false, Ordering::SeqCst);
            error!("signaling writer gone; envelope dropped");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
