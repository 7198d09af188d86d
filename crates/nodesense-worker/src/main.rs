// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Nodesense Worker
//!
//! Per-node feature discovery daemon. Discovers hardware, kernel, and
//! OS features through the source registry, evaluates worker-local
//! rules, and submits the resulting snapshot to the nodesense
//! coordinator.
//!
//! # Usage
//!
//! ```bash
//! # Run against a local coordinator with defaults
//! nodesense-worker --node-name node-1
//!
//! # Custom config and local rules
//! nodesense-worker --config worker.yaml --rules local-rules.yaml
//!
//! # Single discovery pass printed as YAML (no daemon)
//! nodesense-worker --oneshot
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod client;
mod watch;
mod worker;

use client::{ClientConfig, CoordinatorClient};
use nodesense::config::WorkerConfig;
use nodesense::rules::{parse_rule_document, RuleSet};
use nodesense::source::SourceRegistry;
use watch::FsWatcher;
use worker::{Trigger, Worker, WorkerError};

/// Nodesense Worker - per-node feature discovery and labeling agent
#[derive(Parser, Debug)]
#[command(name = "nodesense-worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Coordinator address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:8123")]
    server: String,

    /// Node name (defaults to the kernel hostname)
    #[arg(short, long)]
    node_name: Option<String>,

    /// Worker-local rules file (YAML or JSON sequence of rules)
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Compute labels but do not submit to the coordinator
    #[arg(long, default_value = "false")]
    no_publish: bool,

    /// Run one discovery pass, print it as YAML, and exit
    #[arg(long, default_value = "false")]
    oneshot: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
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

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            match e {
                WorkerError::Config(_) => ExitCode::from(1),
                _ => ExitCode::from(2),
            }
        }
    }
}

fn run(args: Args) -> Result<(), WorkerError> {
    let mut config = match &args.config {
        Some(path) => {
            info!("loading config from {:?}", path);
            WorkerConfig::from_file(path)?
        }
        None => WorkerConfig::default(),
    };
    if args.no_publish {
        config.core.no_publish = true;
    }

    let node_name = match args.node_name {
        Some(name) => name,
        None => default_node_name(),
    };

    // Build and configure the source registry.
    let mut registry = SourceRegistry::with_builtins();
    for e in registry.configure(&config.sources) {
        warn!("source configuration: {}", e);
    }
    registry.set_enabled(&config.core.feature_sources, &config.core.label_sources);

    // Worker-local rules.
    let local_rules = match &args.rules {
        Some(path) => {
            let doc = std::fs::read_to_string(path)
                .map_err(nodesense::config::ConfigError::Io)?;
            let (rules, diagnostics) = parse_rule_document(&doc)
                .map_err(|e| nodesense::config::ConfigError::Parse(e.to_string()))?;
            for d in diagnostics {
                warn!("local rules: {}", d);
            }
            info!("loaded {} local rule(s) from {:?}", rules.len(), path);
            RuleSet::new(1, rules)
        }
        None => RuleSet::default(),
    };

    let client = CoordinatorClient::new(ClientConfig {
        server_address: args.server.clone(),
        ..Default::default()
    });

    let (trigger_tx, trigger_rx) = channel();
    let stop = Arc::new(AtomicBool::new(false));

    let mut worker = Worker::new(
        node_name,
        &config,
        registry,
        client,
        local_rules,
        trigger_rx,
        Arc::clone(&stop),
    )?;

    if args.oneshot {
        let dump = worker.oneshot()?;
        println!("{}", dump);
        return Ok(());
    }

    // Shutdown on Ctrl-C.
    {
        let stop = Arc::clone(&stop);
        let trigger_tx = trigger_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
            let _ = trigger_tx.send(Trigger::Shutdown);
        }) {
            warn!("failed to install signal handler: {}", e);
        }
    }

    // Filesystem watches come from the enabled event sources.
    let watch_paths = worker.watch_paths();
    let _watcher = match FsWatcher::start(&watch_paths, trigger_tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("filesystem watching disabled: {}", e);
            None
        }
    };

    worker.run()
}

fn default_node_name() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}
