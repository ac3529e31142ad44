//! riptide: command-line front end for riptide-core.
//!
//! Replicates a source store into a target, compares the two, reads a
//! stream as a consumer-group member, or fills a store with random
//! data. Every subcommand shares the connection and reader settings
//! resolved by [`args::Cli::apply`].

mod args;
mod format;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use colored::Colorize;
use metrics_exporter_prometheus::PrometheusBuilder;
use riptide_core::{
    AckPolicy, ComparisonEngine, DataGenerator, DataType, GeneratorConfig,
    KeySource, ReplicationMode, Replicator, RiptideConfig, ScanKeyReader, StreamConsumer,
};
use tracing::{info, warn};

use crate::args::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "riptide=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // --config-template: dump defaults and exit
    if cli.config_template {
        return match RiptideConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                ExitCode::SUCCESS
            }
            Err(e) => fail(format!("failed to generate config template: {e}")),
        };
    }

    // defaults → TOML file → env/flags
    let mut cfg = match &cli.config {
        Some(path) => match RiptideConfig::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => return fail(e),
        },
        None => RiptideConfig::default(),
    };
    cli.apply(&mut cfg);

    if let Some(port) = cli.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        match PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => info!("prometheus metrics on http://{addr}/metrics"),
            Err(e) => return fail(format!("failed to start metrics exporter: {e}")),
        }
    }

    let Some(command) = cli.command else {
        // no subcommand: show usage
        let _ = Cli::command().print_help();
        return ExitCode::FAILURE;
    };

    match command {
        Command::Replicate { mode, .. } => replicate(&cfg, mode.into()).await,
        Command::Compare { show, .. } => compare(&cfg, show).await,
        Command::Stream { limit, .. } => stream(&cfg, limit).await,
        Command::Generate {
            prefix,
            count,
            types,
            collection_size,
            string_size,
            ttl_min_ms,
            ttl_max_ms,
            seed,
        } => {
            let defaults = GeneratorConfig::default();
            let ttl = ttl_min_ms.map(|min| {
                let max = ttl_max_ms.unwrap_or(min);
                (Duration::from_millis(min), Duration::from_millis(max))
            });
            let config = GeneratorConfig {
                prefix,
                count,
                types: if types.is_empty() { defaults.types } else { types },
                collection_size: (collection_size, collection_size),
                string_size: (string_size, string_size),
                ttl,
                seed,
                ..defaults
            };
            generate(&cfg, config).await
        }
    }
}

fn fail(msg: impl std::fmt::Display) -> ExitCode {
    eprintln!("{}", msg.to_string().red());
    ExitCode::FAILURE
}

/// Resolves once the user presses ctrl-c.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("interrupted, shutting down");
}

async fn replicate(cfg: &RiptideConfig, mode: ReplicationMode) -> ExitCode {
    let replicator = Replicator::new(
        cfg.source.clone(),
        cfg.target.clone(),
        cfg.reader.clone(),
        cfg.writer.clone(),
        mode,
    );
    match replicator.run(interrupted()).await {
        Ok(summary) => {
            println!("{}", format::format_summary(&summary));
            if summary.is_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => fail(format!("replication failed: {e}")),
    }
}

/// Exits with failure when the stores differ, like `diff`.
async fn compare(cfg: &RiptideConfig, show: usize) -> ExitCode {
    let keys = KeySource::Scan(ScanKeyReader::from_reader(cfg.source.clone(), &cfg.reader));
    let engine = match ComparisonEngine::start(
        keys,
        cfg.source.clone(),
        cfg.target.clone(),
        &cfg.reader,
        &cfg.compare,
    )
    .await
    {
        Ok(engine) => engine,
        Err(e) => return fail(format!("comparison failed to start: {e}")),
    };
    let report = engine.run().await;
    println!("{}", format::format_report(&report, show));
    if report.is_identical() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Prints entries until interrupted or `limit` entries have been read.
async fn stream(cfg: &RiptideConfig, limit: Option<u64>) -> ExitCode {
    let mut consumer = StreamConsumer::new(cfg.source.clone(), cfg.stream.clone());
    if let Err(e) = consumer.open().await {
        return fail(format!("cannot open stream: {e}"));
    }
    let manual = cfg.stream.ack_policy == AckPolicy::Manual;
    let mut seen = 0u64;
    let stop = interrupted();
    tokio::pin!(stop);

    let code = loop {
        if limit.is_some_and(|n| seen >= n) {
            break ExitCode::SUCCESS;
        }
        // never read past the limit: auto-acknowledged entries can't be
        // handed back
        let max = limit.map_or(usize::MAX, |n| (n - seen) as usize);
        let messages = tokio::select! {
            read = consumer.read_up_to(max) => read,
            _ = stop.as_mut() => break ExitCode::SUCCESS,
        };
        let messages = match messages {
            Ok(messages) => messages,
            Err(e) => break fail(format!("stream read failed: {e}")),
        };
        for msg in &messages {
            println!("{}", format::format_message(msg));
        }
        seen += messages.len() as u64;
        if manual {
            if let Err(e) = consumer.ack(&messages).await {
                break fail(format!("acknowledgement failed: {e}"));
            }
        }
    };
    consumer.close();
    info!(entries = seen, "stream consumer stopped");
    code
}

async fn generate(cfg: &RiptideConfig, config: GeneratorConfig) -> ExitCode {
    let types: Vec<&str> = config.types.iter().map(DataType::as_str).collect();
    info!(count = config.count, types = %types.join(","), "generating data");
    let generator = match DataGenerator::new(config) {
        Ok(generator) => generator,
        Err(e) => return fail(e),
    };
    match generator
        .write_to(cfg.source.clone(), cfg.reader.chunk_size)
        .await
    {
        Ok(n) => {
            println!("generated {} keys", n.to_string().green());
            ExitCode::SUCCESS
        }
        Err(e) => fail(format!("generation failed: {e}")),
    }
}
