// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Compose command
//!
//! Runs one composition request end to end. Event envelopes are written to
//! stdout as JSON lines while the composition runs; the final outcome can
//! be written to a file with `--output`. Ctrl-C cancels the composition and
//! still produces a terminal event. Closing stdout is treated the same way
//! as a disconnected client.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ensemble_core::application::Coordinator;
use ensemble_core::domain::config::OrchestratorConfig;
use ensemble_core::domain::outcome::CompositionOutcome;
use ensemble_core::domain::request::{section_id, CompositionRequest};
use ensemble_core::infrastructure::llm::OpenAIAdapter;
use ensemble_core::infrastructure::{ChannelEventSink, CircuitBreaker, GatedGenerator, HttpGenerator};

const EVENT_BUFFER: usize = 1024;

#[derive(Args)]
pub struct ComposeCommand {
    /// Composition request (YAML)
    #[arg(short, long, value_name = "FILE")]
    pub request: PathBuf,

    /// Write the final outcome as JSON
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Generation service base URL (overrides generator.endpoint)
    #[arg(long, env = "ENSEMBLE_GENERATOR_URL", value_name = "URL")]
    pub generator: Option<String>,

    /// Serve Prometheus metrics on this address while composing
    #[arg(long, value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Validate the request and print the section layout without composing
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(command: ComposeCommand, config_override: Option<PathBuf>) -> Result<()> {
    let mut config = OrchestratorConfig::load_or_default(config_override)
        .context("Failed to load configuration")?;
    if let Some(url) = command.generator {
        config.generator.endpoint = Some(url);
    }
    config
        .validate()
        .context("Configuration validation failed")?;

    let request = CompositionRequest::from_file(&command.request)
        .with_context(|| format!("Failed to load composition request {:?}", command.request))?;

    if command.dry_run {
        for line in layout_lines(&request) {
            println!("{}", line);
        }
        return Ok(());
    }

    let llm_config = config
        .llm
        .as_ref()
        .context("Configuration has no `llm` section")?;
    let llm = Arc::new(OpenAIAdapter::from_config(llm_config)?);

    let endpoint = config
        .generator
        .endpoint
        .clone()
        .context("No generator endpoint configured (generator.endpoint or --generator)")?;
    let breaker = Arc::new(CircuitBreaker::from_config(&config.circuit_breaker));
    let generator = Arc::new(GatedGenerator::from_config(
        Arc::new(HttpGenerator::new(endpoint)),
        breaker,
        &config,
    ));

    if let Some(addr) = command.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(%addr, "Serving Prometheus metrics");
    }

    let coordinator = Coordinator::new(llm, generator, Arc::new(config));
    let cancel = CancellationToken::new();

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling composition");
                cancel.cancel();
            }
        })
    };

    let (sink, mut receiver) = ChannelEventSink::new(EVENT_BUFFER);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(envelope) = receiver.recv().await {
            let line = match serde_json::to_string(&envelope) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, seq = envelope.seq, "Failed to encode event");
                    continue;
                }
            };
            if writeln!(stdout, "{}", line).is_err() {
                // Dropping the receiver closes the sink.
                warn!("stdout closed, stopping event output");
                break;
            }
        }
    });

    let outcome = coordinator.compose(&request, Arc::new(sink), cancel).await;
    interrupt.abort();
    printer.await.context("Event printer task failed")?;

    if let Some(path) = &command.output {
        let json = serde_json::to_string_pretty(&outcome).context("Failed to encode outcome")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write outcome to {:?}", path))?;
        info!(path = ?path, "Outcome written");
    }

    print_summary(&outcome);

    if !outcome.success {
        anyhow::bail!(
            "Composition failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Section layout the coordinator will build from a request.
fn layout_lines(request: &CompositionRequest) -> Vec<String> {
    let mut lines = vec![format!(
        "{} | {} BPM | {} | {}/4 | {:?}",
        request.style, request.tempo, request.key, request.beats_per_bar, request.section_mode
    )];

    let mut start_beat = 0u64;
    for (index, section) in request.sections.iter().enumerate() {
        lines.push(format!(
            "  {}  beat {}  {} bars",
            section_id(index, &section.name),
            start_beat,
            section.bars
        ));
        start_beat += u64::from(section.bars) * u64::from(request.beats_per_bar);
    }

    for instrument in &request.instruments {
        let mut line = format!("  {} ({})", instrument.name, instrument.role);
        if let Some(producer) = &instrument.depends_on {
            line.push_str(&format!(" <- {}", producer));
        }
        lines.push(line);
    }
    lines
}

fn print_summary(outcome: &CompositionOutcome) {
    eprintln!();
    for summary in &outcome.instruments {
        let line = summary.summary_line();
        if summary.succeeded() {
            eprintln!("  {}", line);
        } else {
            eprintln!("  {}", line.yellow());
        }
    }
    if !outcome.failed_steps.is_empty() {
        eprintln!("  failed steps: {}", outcome.failed_steps.join(", ").dimmed());
    }
    if outcome.success {
        eprintln!(
            "{}",
            format!("✓ Composition {} complete", outcome.composition_id).green()
        );
    } else {
        eprintln!(
            "{}",
            format!("✗ Composition {} failed", outcome.composition_id).red()
        );
    }
}
