// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP client for submitting discovery results to the coordinator.
//!
//! Connection handling is lazy: `submit` reconnects on demand, and any
//! I/O failure drops back to the disconnected state so the next cycle
//! retries. Incoming messages (acks, rule-set pushes) are drained with
//! `poll_events` between cycles.

use nodesense::protocol::{
    self, CoordinatorMessage, NodeFeatureUpdate, ProtocolError, WorkerMessage,
};
use nodesense::rules::RuleSet;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator address (`host:port`).
    pub server_address: String,

    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Granularity of event polling reads.
    pub read_timeout: Duration,

    /// Maximum wire message size.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:8123".to_string(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(200),
            max_message_size: protocol::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Client error types.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not establish a connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected to coordinator")]
    NotConnected,

    /// I/O failure on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Wire protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => Self::Io(io),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Events received from the coordinator.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A submission was accepted.
    Acked { generation: u64 },

    /// The cluster rule set was pushed.
    Rules(RuleSet),

    /// The coordinator reported an error.
    ServerError { code: u32, message: String },
}

enum ClientState {
    Disconnected,
    Connected { stream: TcpStream },
}

/// Coordinator client.
pub struct CoordinatorClient {
    config: ClientConfig,
    state: ClientState,
}

impl CoordinatorClient {
    /// Create a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: ClientState::Disconnected,
        }
    }

    /// Connect to the coordinator.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        let addr = self
            .config
            .server_address
            .to_socket_addrs()
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?
            .next()
            .ok_or_else(|| {
                ClientError::ConnectionFailed(format!(
                    "no address for {:?}",
                    self.config.server_address
                ))
            })?;

        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(self.config.read_timeout)).ok();

        self.state = ClientState::Connected { stream };
        Ok(())
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ClientState::Connected { .. })
    }

    /// Drop the connection.
    pub fn disconnect(&mut self) {
        self.state = ClientState::Disconnected;
    }

    /// Submit a discovery result, reconnecting if necessary.
    pub fn submit(&mut self, update: &NodeFeatureUpdate) -> Result<(), ClientError> {
        if !self.is_connected() {
            self.connect()?;
        }
        let stream = match &mut self.state {
            ClientState::Connected { stream } => stream,
            ClientState::Disconnected => return Err(ClientError::NotConnected),
        };

        let msg = WorkerMessage::NodeFeatureUpdate(update.clone());
        if let Err(e) = protocol::write_message(stream, &msg, self.config.max_message_size) {
            self.state = ClientState::Disconnected;
            return Err(e.into());
        }
        Ok(())
    }

    /// Drain incoming coordinator messages for up to `wait`.
    ///
    /// Returns collected events; connection loss ends the drain and
    /// leaves the client disconnected for the next cycle to retry.
    pub fn poll_events(&mut self, wait: Duration) -> Vec<ClientEvent> {
        let deadline = Instant::now() + wait;
        let mut events = Vec::new();

        loop {
            let stream = match &mut self.state {
                ClientState::Connected { stream } => stream,
                ClientState::Disconnected => break,
            };

            match protocol::read_message::<_, CoordinatorMessage>(
                stream,
                self.config.max_message_size,
            ) {
                Ok(Some(msg)) => {
                    events.push(match msg {
                        CoordinatorMessage::Ack { generation } => ClientEvent::Acked { generation },
                        CoordinatorMessage::RuleSet(set) => ClientEvent::Rules(set),
                        CoordinatorMessage::Error { code, message } => {
                            ClientEvent::ServerError { code, message }
                        }
                    });
                }
                Ok(None) => {
                    tracing::debug!("coordinator closed the connection");
                    self.state = ClientState::Disconnected;
                    break;
                }
                Err(ProtocolError::Io(e))
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    // Nothing pending right now.
                }
                Err(e) => {
                    tracing::warn!("read error from coordinator: {}", e);
                    self.state = ClientState::Disconnected;
                    break;
                }
            }

            if Instant::now() >= deadline {
                break;
            }
        }
        events
    }

    /// The configured coordinator address.
    pub fn server_address(&self) -> &str {
        &self.config.server_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesense::labels::Emission;
    use nodesense::snapshot::FeatureSnapshot;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn update(generation: u64) -> NodeFeatureUpdate {
        NodeFeatureUpdate {
            node_name: "n1".to_string(),
            generation,
            snapshot: FeatureSnapshot::new(),
            local_emission: Emission::new(),
        }
    }

    #[test]
    fn test_submit_fails_when_unreachable() {
        let mut client = CoordinatorClient::new(ClientConfig {
            server_address: "127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        assert!(matches!(
            client.submit(&update(1)),
            Err(ClientError::ConnectionFailed(_))
        ));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_submit_and_receive_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            // Read the worker's update.
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).unwrap();
            let msg: WorkerMessage = protocol::decode(&payload).unwrap();
            let generation = match msg {
                WorkerMessage::NodeFeatureUpdate(u) => u.generation,
            };

            // Ack it.
            let ack = protocol::encode(
                &CoordinatorMessage::Ack { generation },
                protocol::DEFAULT_MAX_MESSAGE_SIZE,
            )
            .unwrap();
            stream.write_all(&ack).unwrap();
        });

        let mut client = CoordinatorClient::new(ClientConfig {
            server_address: addr.to_string(),
            read_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        client.submit(&update(7)).unwrap();
        assert!(client.is_connected());

        let mut events = Vec::new();
        for _ in 0..20 {
            events = client.poll_events(Duration::from_millis(100));
            if !events.is_empty() {
                break;
            }
        }
        assert!(matches!(
            events.as_slice(),
            [ClientEvent::Acked { generation: 7 }]
        ));

        server.join().unwrap();
    }

    #[test]
    fn test_server_close_disconnects_client() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut client = CoordinatorClient::new(ClientConfig {
            server_address: addr.to_string(),
            read_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        client.connect().unwrap();
        server.join().unwrap();

        // Drain until the closed connection is observed.
        for _ in 0..20 {
            client.poll_events(Duration::from_millis(50));
            if !client.is_connected() {
                break;
            }
        }
        assert!(!client.is_connected());
    }
}
