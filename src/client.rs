//! Client event loop
//!
//! Owns the session machine and feeds it one [`CallEvent`] at a time from
//! three inbound streams: user commands, signaling events, and transport
//! callbacks. Single-threaded over the machine, so there is exactly one
//! writer of session state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{CallCommand, CallEvent};
use crate::identity::Identity;
use crate::media::MediaSource;
use crate::presenter::Presenter;
use crate::session::CallMachine;
use crate::signaling::{EnvelopeSink, SignalingEvent};
use crate::transport::TransportFactory;

/// Cloneable handle for submitting user commands to a running client
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<CallCommand>,
}

impl CallHandle {
    pub fn start_media(&self) {
        self.send(CallCommand::StartMedia);
    }

    pub fn place_call(&self, target: impl Into<String>) {
        self.send(CallCommand::PlaceCall {
            target: target.into(),
        });
    }

    pub fn hang_up(&self) {
        self.send(CallCommand::HangUp);
    }

    pub fn send_chat(&self, text: impl Into<String>) {
        self.send(CallCommand::SendChat { text: text.into() });
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.send(CallCommand::SetName { name: name.into() });
    }

    pub fn shutdown(&self) {
        self.send(CallCommand::Shutdown);
    }

    fn send(&self, command: CallCommand) {
        if self.tx.send(command).is_err() {
            warn!("client loop has stopped; command dropped");
        }
    }
}

/// The client event loop
pub struct CallClient {
    machine: CallMachine,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    signals: mpsc::UnboundedReceiver<SignalingEvent>,
    transport_rx: mpsc::UnboundedReceiver<(u64, crate::transport::TransportEvent)>,
}

impl CallClient {
    /// Assemble a client around its collaborators.
    ///
    /// `signals` is the receiving end of the stream the signaling channel
    /// writes into; the returned [`CallHandle`] submits user commands.
    pub fn new(
        identity: Identity,
        signaling: Arc<dyn EnvelopeSink>,
        media_source: Arc<dyn MediaSource>,
        factory: Arc<dyn TransportFactory>,
        presenter: Arc<dyn Presenter>,
        signals: mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> (Self, CallHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let machine = CallMachine::new(
            identity,
            signaling,
            media_source,
            factory,
            presenter,
            transport_tx,
        );
        let client = Self {
            machine,
            commands: command_rx,
            signals,
            transport_rx,
        };
        (client, CallHandle { tx: command_tx })
    }

    /// Run until shutdown, dispatching inbound events in arrival order
    pub async fn run(mut self) {
        info!("client loop started");
        let mut signals_open = true;
        loop {
            let event = tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None => break,
                        // Let the machine notify the peer before the loop ends
                        Some(CallCommand::Shutdown) => {
                            self.machine
                                .handle(CallEvent::Command(CallCommand::Shutdown))
                                .await;
                            break;
                        }
                        Some(command) => CallEvent::Command(command),
                    }
                }
                signal = self.signals.recv(), if signals_open => {
                    match signal {
                        Some(signal) => CallEvent::Signal(signal),
                        None => {
                            debug!("signaling stream ended");
                            signals_open = false;
                            CallEvent::Signal(SignalingEvent::Closed)
                        }
                    }
                }
                // The machine holds the matching sender, so this never closes
                // while the loop is alive.
                Some((generation, event)) = self.transport_rx.recv() => {
                    CallEvent::Transport { generation, event }
                }
            };
            self.machine.handle(event).await;
        }
        self.machine.teardown().await;
        info!("client loop stopped");
    }
}
