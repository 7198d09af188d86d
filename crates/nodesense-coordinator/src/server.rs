// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker-facing submission server.
//!
//! Accepts TCP connections from per-node workers, decodes
//! length-prefixed JSON submissions, feeds them into the snapshot
//! cache, and acknowledges each generation. The current cluster rule
//! set is pushed on connect and on every reload; a reload also
//! re-enqueues every cached node so reconciliation picks up the new
//! rules.
//!
//! The server runs on leaders and followers alike: followers keep
//! their caches warm so a takeover starts from a full picture.

use crate::config::CoordinatorConfig;
use crate::registry::{NodeRegistry, SubmitOutcome};
use nodesense::protocol::{self, CoordinatorMessage, WorkerMessage};
use nodesense::rules::{Rule, RuleSet};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};

const OUTBOUND_DEPTH: usize = 16;

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listener.
    #[error("bind error: {0}")]
    Bind(String),

    /// The server is already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Connection-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The worker-facing coordinator server.
pub struct Server {
    config: Arc<CoordinatorConfig>,
    registry: Arc<RwLock<NodeRegistry>>,
    rules: Arc<RwLock<RuleSet>>,
    reconcile_tx: mpsc::Sender<String>,
    subscribers: Arc<RwLock<HashMap<u64, mpsc::Sender<CoordinatorMessage>>>>,
    next_subscriber: AtomicU64,
    shutdown: Arc<Notify>,
    running: AtomicBool,
}

impl Server {
    /// Create a server.
    pub fn new(
        config: Arc<CoordinatorConfig>,
        registry: Arc<RwLock<NodeRegistry>>,
        rules: Arc<RwLock<RuleSet>>,
        reconcile_tx: mpsc::Sender<String>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            registry,
            rules,
            reconcile_tx,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber: AtomicU64::new(0),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Accept worker connections until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        tracing::info!("listening for workers on {}", addr);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        tracing::debug!("worker connected from {}", peer);
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                tracing::debug!("connection {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("accept error: {}", e),
                },
                _ = self.shutdown.notified() => {
                    tracing::info!("submission server shutting down");
                    break;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Install a new cluster rule set: bump the version, push it to
    /// every connected worker, and re-enqueue all cached nodes.
    pub async fn reload_rules(&self, rules: Vec<Rule>) {
        let set = {
            let mut guard = self.rules.write().await;
            let version = guard.version + 1;
            *guard = RuleSet::new(version, rules);
            guard.clone()
        };
        tracing::info!(
            "cluster rule set reloaded: v{} with {} rule(s)",
            set.version,
            set.rules.len()
        );

        let subscribers = self.subscribers.read().await;
        for tx in subscribers.values() {
            let _ = tx.try_send(CoordinatorMessage::RuleSet(set.clone()));
        }
        drop(subscribers);

        self.enqueue_all_nodes().await;
    }

    /// Queue every cached node for reconciliation (rule reloads,
    /// leadership takeover).
    pub async fn enqueue_all_nodes(&self) {
        for node in self.registry.read().await.node_names() {
            if self.reconcile_tx.try_send(node).is_err() {
                tracing::warn!("reconcile queue full, sweep will catch up");
                break;
            }
        }
    }

    /// Number of connected workers.
    pub async fn connection_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut conn = Connection::new(stream, self.config.max_message_size);

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<CoordinatorMessage>(OUTBOUND_DEPTH);
        let subscriber_id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .await
            .insert(subscriber_id, outbound_tx);

        let result = async {
            // New connections start from the current rule set.
            let current = self.rules.read().await.clone();
            if current.version > 0 {
                conn.send(&CoordinatorMessage::RuleSet(current)).await?;
            }

            loop {
                tokio::select! {
                    result = conn.read() => match result {
                        Ok(Some(WorkerMessage::NodeFeatureUpdate(update))) => {
                            let node = update.node_name.clone();
                            let generation = update.generation;
                            let outcome = self.registry.write().await.submit(update);
                            match outcome {
                                SubmitOutcome::Accepted => {
                                    tracing::debug!(
                                        "accepted {:?} generation {}",
                                        node,
                                        generation
                                    );
                                    if self.reconcile_tx.try_send(node.clone()).is_err() {
                                        tracing::warn!(
                                            "reconcile queue full, dropping {:?}",
                                            node
                                        );
                                    }
                                }
                                SubmitOutcome::Duplicate => {
                                    tracing::debug!(
                                        "duplicate generation {} from {:?}",
                                        generation,
                                        node
                                    );
                                }
                                SubmitOutcome::Stale => {
                                    tracing::debug!(
                                        "stale generation {} from {:?}",
                                        generation,
                                        node
                                    );
                                }
                            }
                            // At-least-once: every received generation
                            // is acknowledged, dispositions differ only
                            // in whether reconciliation runs.
                            conn.send(&CoordinatorMessage::Ack { generation }).await?;
                        }
                        Ok(None) => {
                            tracing::debug!("worker {} disconnected", peer);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("read error from {}: {}", peer, e);
                            break;
                        }
                    },
                    Some(msg) = outbound_rx.recv() => {
                        conn.send(&msg).await?;
                    }
                    _ = self.shutdown.notified() => break,
                }
            }
            Ok(())
        }
        .await;

        self.subscribers.write().await.remove(&subscriber_id);
        result
    }
}

/// One worker connection with length-prefixed JSON framing.
struct Connection {
    stream: TcpStream,
    max_message_size: usize,
    read_buffer: Vec<u8>,
}

impl Connection {
    fn new(stream: TcpStream, max_message_size: usize) -> Self {
        Self {
            stream,
            max_message_size,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Read one worker message; `Ok(None)` on clean close.
    async fn read(&mut self) -> Result<Option<WorkerMessage>, ServerError> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(ServerError::Io(e)),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(ServerError::Protocol("empty message".to_string()));
        }
        if len > self.max_message_size {
            return Err(ServerError::Protocol(format!(
                "message too large: {} > {}",
                len, self.max_message_size
            )));
        }

        self.read_buffer.clear();
        self.read_buffer.resize(len, 0);
        self.stream.read_exact(&mut self.read_buffer).await?;

        protocol::decode(&self.read_buffer)
            .map(Some)
            .map_err(|e| ServerError::Protocol(e.to_string()))
    }

    async fn send(&mut self, msg: &CoordinatorMessage) -> Result<(), ServerError> {
        let buf = protocol::encode(msg, self.max_message_size)
            .map_err(|e| ServerError::Protocol(e.to_string()))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesense::labels::Emission;
    use nodesense::protocol::NodeFeatureUpdate;
    use nodesense::snapshot::FeatureSnapshot;
    use std::time::Duration;

    fn test_server(port: u16) -> (Arc<Server>, mpsc::Receiver<String>, Arc<Notify>) {
        let config = Arc::new(CoordinatorConfig {
            bind_address: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(64);
        let shutdown = Arc::new(Notify::new());
        let server = Arc::new(Server::new(
            config,
            Arc::new(RwLock::new(NodeRegistry::new())),
            Arc::new(RwLock::new(RuleSet::default())),
            tx,
            Arc::clone(&shutdown),
        ));
        (server, rx, shutdown)
    }

    async fn connect(port: u16) -> TcpStream {
        for _ in 0..50 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("server did not come up on port {}", port);
    }

    async fn send_update(stream: &mut TcpStream, node: &str, generation: u64) {
        let msg = WorkerMessage::NodeFeatureUpdate(NodeFeatureUpdate {
            node_name: node.to_string(),
            generation,
            snapshot: FeatureSnapshot::new(),
            local_emission: Emission::new(),
        });
        let buf = protocol::encode(&msg, protocol::DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        stream.write_all(&buf).await.unwrap();
    }

    async fn read_coordinator_message(stream: &mut TcpStream) -> CoordinatorMessage {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        protocol::decode(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_submission_is_acked_and_enqueued() {
        let (server, mut reconcile_rx, shutdown) = test_server(18311);
        let task = tokio::spawn(Arc::clone(&server).run());

        let mut stream = connect(18311).await;
        send_update(&mut stream, "n1", 5).await;

        let msg = read_coordinator_message(&mut stream).await;
        assert!(matches!(msg, CoordinatorMessage::Ack { generation: 5 }));

        let queued = tokio::time::timeout(Duration::from_secs(1), reconcile_rx.recv())
            .await
            .unwrap();
        assert_eq!(queued, Some("n1".to_string()));

        shutdown.notify_waiters();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_submission_acked_but_not_enqueued() {
        let (server, mut reconcile_rx, shutdown) = test_server(18312);
        let task = tokio::spawn(Arc::clone(&server).run());

        let mut stream = connect(18312).await;
        send_update(&mut stream, "n1", 5).await;
        assert!(matches!(
            read_coordinator_message(&mut stream).await,
            CoordinatorMessage::Ack { generation: 5 }
        ));
        assert!(reconcile_rx.recv().await.is_some());

        send_update(&mut stream, "n1", 5).await;
        assert!(matches!(
            read_coordinator_message(&mut stream).await,
            CoordinatorMessage::Ack { generation: 5 }
        ));
        let extra = tokio::time::timeout(Duration::from_millis(200), reconcile_rx.recv()).await;
        assert!(extra.is_err(), "duplicate generation must not re-enqueue");

        shutdown.notify_waiters();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rules_pushed_on_connect_and_reload() {
        let (server, _reconcile_rx, shutdown) = test_server(18313);
        server.reload_rules(vec![Rule::named("r1")]).await;

        let task = tokio::spawn(Arc::clone(&server).run());
        let mut stream = connect(18313).await;

        match read_coordinator_message(&mut stream).await {
            CoordinatorMessage::RuleSet(set) => {
                assert_eq!(set.version, 1);
                assert_eq!(set.rules.len(), 1);
            }
            other => panic!("expected rule set on connect, got {:?}", other),
        }

        // Wait for the subscriber registration before reloading.
        for _ in 0..50 {
            if server.connection_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server
            .reload_rules(vec![Rule::named("r1"), Rule::named("r2")])
            .await;

        match read_coordinator_message(&mut stream).await {
            CoordinatorMessage::RuleSet(set) => {
                assert_eq!(set.version, 2);
                assert_eq!(set.rules.len(), 2);
            }
            other => panic!("expected pushed rule set, got {:?}", other),
        }

        shutdown.notify_waiters();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_generations_supersede() {
        let (server, mut reconcile_rx, shutdown) = test_server(18314);
        let registry = Arc::clone(&server.registry);
        let task = tokio::spawn(Arc::clone(&server).run());

        let mut stream = connect(18314).await;
        send_update(&mut stream, "n1", 6).await;
        read_coordinator_message(&mut stream).await;
        assert!(reconcile_rx.recv().await.is_some());

        // A late gen-5 arrival must not displace gen 6.
        send_update(&mut stream, "n1", 5).await;
        assert!(matches!(
            read_coordinator_message(&mut stream).await,
            CoordinatorMessage::Ack { generation: 5 }
        ));
        assert_eq!(registry.read().await.get("n1").unwrap().generation, 6);

        shutdown.notify_waiters();
        task.await.unwrap().unwrap();
    }
}
