// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Nodesense Coordinator
//!
//! Cluster-scoped daemon: collects worker snapshots, evaluates the
//! cluster rule set, reconciles node objects, and garbage-collects
//! per-node auxiliary objects. Replicas elect a single reconciling
//! leader through the cluster's lease primitive.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: listen on 0.0.0.0:8123, node API at 127.0.0.1:8080
//! nodesense-coordinator
//!
//! # Custom config and cluster rules
//! nodesense-coordinator --config coordinator.yaml --rules rules.yaml
//! ```

use clap::Parser;
use nodesense::config::ConfigError;
use nodesense::rules::RuleSet;
use nodesense_coordinator::config::CoordinatorConfig;
use nodesense_coordinator::election::{ElectionOutcome, LeaseElector};
use nodesense_coordinator::gc::GarbageCollector;
use nodesense_coordinator::nodeapi::{ApiError, HttpNodeApi, NodeApi};
use nodesense_coordinator::reconciler::{spawn_pool, Reconciler};
use nodesense_coordinator::registry::NodeRegistry;
use nodesense_coordinator::rules::{load_rules_file, spawn_rule_watcher, RuleWatcher};
use nodesense_coordinator::server::{Server, ServerError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const RECONCILE_QUEUE_DEPTH: usize = 1024;

/// Nodesense Coordinator - cluster-scoped rule evaluation and node labeling
#[derive(Parser, Debug)]
#[command(name = "nodesense-coordinator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for worker submissions
    #[arg(short, long)]
    bind: Option<String>,

    /// TCP port for worker submissions
    #[arg(short, long)]
    port: Option<u16>,

    /// Control-plane (node API) endpoint
    #[arg(long)]
    api_endpoint: Option<String>,

    /// Cluster rule document (watched for changes)
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Error)]
enum CoordinatorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("rule watch error: {0}")]
    Watch(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to initialize logging");
        return ExitCode::from(1);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            match e {
                CoordinatorError::Config(_) => ExitCode::from(1),
                _ => ExitCode::from(2),
            }
        }
    }
}

async fn run(args: Args) -> Result<(), CoordinatorError> {
    let mut config = match &args.config {
        Some(path) => {
            info!("loading config from {:?}", path);
            CoordinatorConfig::from_file(path)?
        }
        None => CoordinatorConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(endpoint) = args.api_endpoint {
        config.api_endpoint = endpoint;
    }
    if args.rules.is_some() {
        config.rules_path = args.rules.clone();
    }
    config.validate()?;

    info!(
        "nodesense-coordinator v{} (bind {}:{}, api {})",
        env!("CARGO_PKG_VERSION"),
        config.bind_address,
        config.port,
        config.api_endpoint
    );

    let api = Arc::new(HttpNodeApi::new(&config.api_endpoint, config.api_timeout()?)?);
    serve(api, config).await
}

/// Wire everything together and run until shutdown.
async fn serve<N: NodeApi>(api: Arc<N>, config: CoordinatorConfig) -> Result<(), CoordinatorError> {
    let config = Arc::new(config);
    let registry = Arc::new(RwLock::new(NodeRegistry::new()));
    let rules = Arc::new(RwLock::new(RuleSet::default()));
    let shutdown = Arc::new(Notify::new());
    let stopping = Arc::new(AtomicBool::new(false));
    let is_leader = Arc::new(AtomicBool::new(false));

    {
        let shutdown = Arc::clone(&shutdown);
        let stopping = Arc::clone(&stopping);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
            stopping.store(true, Ordering::SeqCst);
            shutdown.notify_waiters();
        });
    }

    let (reconcile_tx, reconcile_rx) = mpsc::channel(RECONCILE_QUEUE_DEPTH);
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&api),
        Arc::clone(&registry),
        Arc::clone(&rules),
        config.conflict_retries,
    ));
    let pool = spawn_pool(
        reconciler,
        config.effective_workers(),
        reconcile_rx,
        Arc::clone(&is_leader),
        Arc::clone(&shutdown),
    );

    let server = Arc::new(Server::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&rules),
        reconcile_tx,
        Arc::clone(&shutdown),
    ));

    let _rule_watcher: Option<RuleWatcher> = match &config.rules_path {
        Some(path) => {
            let initial = load_rules_file(path)?;
            server.reload_rules(initial).await;
            Some(
                spawn_rule_watcher(path.clone(), Arc::clone(&server))
                    .map_err(|e| CoordinatorError::Watch(e.to_string()))?,
            )
        }
        None => None,
    };

    let server_task = tokio::spawn(Arc::clone(&server).run());

    // Surface immediate startup failures (e.g. port already bound).
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    if server_task.is_finished() {
        return match server_task.await {
            Ok(result) => result.map_err(CoordinatorError::from),
            Err(e) => Err(CoordinatorError::Watch(e.to_string())),
        };
    }

    let elector = LeaseElector::new(
        Arc::clone(&api),
        config.lease_name.clone(),
        election_identity(),
        config.lease_duration()?,
        config.renew_interval()?,
    );

    // Followers run the server and keep caches warm; only the lease
    // holder reconciles and garbage-collects.
    while !stopping.load(Ordering::SeqCst) {
        if elector.campaign(&shutdown).await == ElectionOutcome::Shutdown {
            break;
        }
        is_leader.store(true, Ordering::SeqCst);
        server.enqueue_all_nodes().await;

        let gc_stop = Arc::new(Notify::new());
        let gc_task = {
            let gc = GarbageCollector::new(
                Arc::clone(&api),
                Arc::clone(&registry),
                config.gc_kinds.clone(),
                config.gc_interval()?,
            );
            let gc_stop = Arc::clone(&gc_stop);
            tokio::spawn(async move { gc.run(gc_stop).await })
        };

        let outcome = elector.hold(&shutdown).await;
        is_leader.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a collector busy in a sweep
        // still observes the stop.
        gc_stop.notify_one();
        gc_task.await.ok();

        match outcome {
            ElectionOutcome::Shutdown => break,
            _ => info!("leadership lost, re-entering election"),
        }
    }

    shutdown.notify_waiters();
    server_task.await.ok();
    for task in pool {
        task.abort();
    }
    info!("coordinator stopped");
    Ok(())
}

fn election_identity() -> String {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "coordinator".to_string());
    format!("{}-{}", hostname, std::process::id())
}
