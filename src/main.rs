//! Tracegate CLI
//!
//! Replays a JSONL file of agent traces through the buffering pipeline and
//! prints every summary it produces.

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracegate::oracle::{
    ExtractiveSummarizer, LlmClient, LlmDecisionOracle, LlmSummarizer, ThresholdDecisionOracle,
};
use tracegate::{Coordinator, DecisionOracle, SummarizationOracle, TracegateConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Tracegate - buffer agent reasoning traces and trigger summaries
#[derive(Parser, Debug)]
#[command(name = "tracegate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSONL input, one {"agent": "...", "text": "..."} object per line
    input: PathBuf,

    /// Config file (defaults to ~/.tracegate/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the deterministic offline oracles instead of an LLM endpoint
    #[arg(long)]
    offline: bool,

    /// Split each trace into word tokens and feed them through the token gate
    #[arg(long)]
    stream: bool,

    /// Offline mode: summarize after this many buffered traces
    #[arg(long, default_value_t = 3)]
    threshold: usize,

    /// Verbose output: debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct TraceLine {
    agent: String,
    text: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match cli.config.clone().or_else(TracegateConfig::default_path) {
        Some(path) => TracegateConfig::load(&path).await?,
        None => TracegateConfig::default(),
    };

    let lines = read_traces(&cli.input).await?;
    info!("Loaded {} traces from {:?}", lines.len(), cli.input);

    let (decision, summarizer) = build_oracles(&cli, &config)?;
    let coordinator = Arc::new(Coordinator::new(&config, decision, summarizer)?);

    let printer = tokio::spawn(print_summaries(coordinator.subscribe()));
    let timer = coordinator.spawn_timer_task();

    if cli.stream {
        replay_streamed(&coordinator, &lines).await;
    } else {
        replay_traces(&coordinator, &lines).await;
    }

    timer.abort();
    let _ = timer.await;

    let mut agents: Vec<String> = lines.iter().map(|l| l.agent.clone()).collect();
    agents.sort();
    agents.dedup();
    let counts: Vec<(String, u64, usize)> = agents
        .into_iter()
        .map(|agent| {
            let traces = coordinator.get_agent_trace_count(&agent);
            let summaries = coordinator.get_summaries_by_agent(&agent).len();
            (agent, traces, summaries)
        })
        .collect();
    let pending = coordinator.pending_traces().len();

    // Dropping the coordinator closes the summary channel and ends the printer.
    drop(coordinator);
    printer.await?;

    println!();
    println!("{:<24} {:>8} {:>10}", "agent", "traces", "summaries");
    for (agent, traces, summaries) in counts {
        println!("{:<24} {:>8} {:>10}", agent, traces, summaries);
    }
    if pending > 0 {
        println!("{} traces still buffered", pending);
    }

    Ok(())
}

fn build_oracles(
    cli: &Cli,
    config: &TracegateConfig,
) -> anyhow::Result<(Arc<dyn DecisionOracle>, Arc<dyn SummarizationOracle>)> {
    if cli.offline {
        info!("Offline mode: summarizing every {} traces", cli.threshold);
        return Ok((
            Arc::new(ThresholdDecisionOracle::new(cli.threshold)),
            Arc::new(ExtractiveSummarizer::default()),
        ));
    }

    info!("Using LLM endpoint {} ({})", config.llm.base_url, config.llm.model);
    let client = Arc::new(LlmClient::new(config.llm.clone())?);
    Ok((
        Arc::new(LlmDecisionOracle::new(client.clone())),
        Arc::new(LlmSummarizer::new(client)),
    ))
}

async fn read_traces(path: &Path) -> anyhow::Result<Vec<TraceLine>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {:?}", path))?;

    let mut lines = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let trace: TraceLine = serde_json::from_str(line)
            .with_context(|| format!("{:?} line {}: expected {{\"agent\", \"text\"}}", path, i + 1))?;
        lines.push(trace);
    }
    Ok(lines)
}

async fn replay_traces(coordinator: &Coordinator, lines: &[TraceLine]) {
    for line in lines {
        if let Err(e) = coordinator.receive_trace(&line.agent, &line.text).await {
            warn!("Trace from {} failed: {}", line.agent, e);
        }
    }
}

/// Each agent streams concurrently from its own channel, like live producers.
async fn replay_streamed(coordinator: &Coordinator, lines: &[TraceLine]) {
    let mut by_agent: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for line in lines {
        let tokens = by_agent.entry(line.agent.as_str()).or_default();
        tokens.extend(word_tokens(&line.text));
        if !line.text.ends_with(char::is_whitespace) {
            tokens.push("\n".to_string());
        }
    }

    let streams = by_agent.into_iter().map(|(agent, tokens)| async move {
        let (tx, rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            for token in tokens {
                if tx.send(token).await.is_err() {
                    break;
                }
            }
        });

        if let Err(e) = coordinator
            .receive_streamed_tokens(agent, ReceiverStream::new(rx))
            .await
        {
            warn!("Token stream from {} failed: {}", agent, e);
        }
        if let Err(e) = coordinator.flush_producer(agent).await {
            warn!("Final flush for {} failed: {}", agent, e);
        }
    });
    join_all(streams).await;
}

/// Split into tokens that keep their trailing whitespace, so concatenating
/// them restores the text.
fn word_tokens(text: &str) -> Vec<String> {
    text.split_inclusive(char::is_whitespace)
        .map(str::to_string)
        .collect()
}

async fn print_summaries(mut rx: broadcast::Receiver<tracegate::SummaryRecord>) {
    loop {
        match rx.recv().await {
            Ok(record) => match serde_json::to_string(&record) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to encode summary: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Summary printer lagged, {} summaries not shown", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
