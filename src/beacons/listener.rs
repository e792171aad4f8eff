//! TCP listener for push-mode beacon channels.
//!
//! Each accepted connection must open with an `auth` message. Verified
//! connections get a per-beacon outbound mpsc channel registered with the
//! [`ConnectionManager`]; the connection task then pumps inbound lines and
//! outbound messages concurrently until either side goes away.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::connection_manager::ConnectionManager;
use super::messages::{InboundMessage, OutboundMessage};
use super::registry::BeaconRegistry;
use crate::dispatch::correlator::ResultCorrelator;
use crate::dispatch::types::CommandOutcome;
use crate::error_handling::types::ConnectionError;

/// Outbound channel depth per beacon connection.
const CHANNEL_DEPTH: usize = 64;

pub struct BeaconListener {
    registry: Arc<BeaconRegistry>,
    connections: Arc<ConnectionManager>,
    correlator: Arc<ResultCorrelator>,
}

impl BeaconListener {
    pub fn new(
        registry: Arc<BeaconRegistry>,
        connections: Arc<ConnectionManager>,
        correlator: Arc<ResultCorrelator>,
    ) -> Self {
        Self {
            registry,
            connections,
            correlator,
        }
    }

    /// Binds the listening socket and runs the accept loop forever.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> Result<(), ConnectionError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(ConnectionError::BindError)?;
        info!("beacon listener bound on {}", addr);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            };
            debug!("connection from {}", peer);
            let handler = self.clone();
            tokio::spawn(async move {
                if let Err(err) = handler.handle_connection(stream, peer).await {
                    debug!("connection from {} closed: {}", peer, err);
                }
            });
        }
    }

    /// Drives one beacon connection from handshake to disconnect.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // The first line must authenticate; anything else drops the
        // connection without a response.
        let first = lines
            .next_line()
            .await
            .map_err(ConnectionError::SockError)?
            .ok_or(ConnectionError::AuthFailed)?;
        let beacon_id = match serde_json::from_str::<InboundMessage>(&first) {
            Ok(InboundMessage::Auth {
                beacon_id, token, ..
            }) => {
                let verified = self
                    .registry
                    .verify(beacon_id, &token)
                    .await
                    .map_err(|_| ConnectionError::AuthFailed)?;
                if verified.is_none() {
                    warn!("rejected credentials for beacon {} from {}", beacon_id, peer);
                    return Err(ConnectionError::AuthFailed);
                }
                beacon_id
            }
            Ok(other) => {
                warn!("{} sent {:?} before authenticating", peer, other);
                return Err(ConnectionError::ProtocolViolation(
                    "expected auth as first message".into(),
                ));
            }
            Err(err) => {
                return Err(ConnectionError::ProtocolViolation(format!(
                    "unparseable handshake: {}",
                    err
                )))
            }
        };

        let (tx, mut rx) = mpsc::channel::<OutboundMessage>(CHANNEL_DEPTH);
        self.connections
            .register(beacon_id, tx)
            .await
            .map_err(|_| ConnectionError::AuthFailed)?;
        Self::write_message(&mut write_half, &OutboundMessage::AuthOk).await?;

        // Anything queued while the beacon was away goes out right after
        // the handshake, through the registry's sent CAS.
        match self.registry.checkin(beacon_id).await {
            Ok(pending) => {
                for command in pending {
                    let message = OutboundMessage::Command {
                        command_id: command.id,
                        script: command.script,
                    };
                    if let Err(err) = self.connections.deliver(beacon_id, message).await {
                        warn!("flush to beacon {} failed: {}", beacon_id, err);
                        break;
                    }
                }
            }
            Err(err) => warn!("pending flush for beacon {} failed: {}", beacon_id, err),
        }

        let result = loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(raw)) => {
                            if let Err(err) = self.handle_inbound(beacon_id, &raw).await {
                                break Err(err);
                            }
                        }
                        Ok(None) => break Ok(()),
                        Err(err) => break Err(ConnectionError::SockError(err)),
                    }
                }
                outbound = rx.recv() => {
                    match outbound {
                        Some(message) => {
                            if let Err(err) = Self::write_message(&mut write_half, &message).await {
                                break Err(err);
                            }
                        }
                        // Channel dropped, most likely by a heartbeat sweep.
                        None => break Ok(()),
                    }
                }
            }
        };

        self.connections.deregister(beacon_id);
        info!("beacon {} disconnected", beacon_id);
        result
    }

    async fn handle_inbound(&self, beacon_id: Uuid, raw: &str) -> Result<(), ConnectionError> {
        let message: InboundMessage = serde_json::from_str(raw)
            .map_err(|err| ConnectionError::ProtocolViolation(format!("bad message: {}", err)))?;
        match message {
            InboundMessage::Auth { .. } => {
                warn!("beacon {} re-sent auth mid-session", beacon_id);
                Err(ConnectionError::ProtocolViolation(
                    "auth after handshake".into(),
                ))
            }
            InboundMessage::Heartbeat => {
                debug!("heartbeat from beacon {} at {}", beacon_id, Utc::now());
                self.connections
                    .heartbeat(beacon_id)
                    .await
                    .map_err(|_| ConnectionError::ChannelFailed)
            }
            InboundMessage::CommandResult {
                command_id,
                exit_code,
                stdout,
                stderr,
                duration_ms,
                working_dir,
            } => {
                let outcome = CommandOutcome {
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                    working_dir,
                };
                if let Err(err) = self.correlator.deliver_result(command_id, outcome).await {
                    error!("persisting result for command {} failed: {}", command_id, err);
                }
                Ok(())
            }
        }
    }

    async fn write_message<W>(
        writer: &mut W,
        message: &OutboundMessage,
    ) -> Result<(), ConnectionError>
    where
        W: AsyncWriteExt + Unpin,
    {
        let mut line = serde_json::to_vec(message)
            .map_err(|err| ConnectionError::ProtocolViolation(format!("encode failed: {}", err)))?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .map_err(ConnectionError::SockError)
    }
}
