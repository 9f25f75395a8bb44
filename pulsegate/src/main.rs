// pulsegate/src/main.rs
//
// Pulsegate: behavioral bot detection over recorded form sessions
//
// Three operational modes:
//   replay   feed a captured JSONL session recording, print a verdict per submit
//   tail     follow a live JSONL recording, sessions run their periodic tasks
//   eval     replay a labelled recording and report precision / recall / F1
//
// Usage:
//   pulsegate --mode replay --path sessions.jsonl
//   pulsegate --mode tail   --path /var/log/pulsegate/sensor.jsonl --config pulsegate.json
//   pulsegate --mode eval   --path labelled.jsonl --threshold 55 --format json

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pulsegate::eval::{report, Evaluator, Replayer, SessionVerdict};
use pulsegate::events::{GateDecision, RiskTier, SessionRecord};
use pulsegate::PulsegateConfig;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "pulsegate",
    about   = "Behavioral bot detection: keystroke, pointer and device signals fused into a trust score",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "replay")]
    mode: Mode,

    #[arg(long, default_value = "/tmp/pulsegate_sessions.jsonl",
          help = "JSONL session recording")]
    path: PathBuf,

    #[arg(long, help = "JSON configuration file (defaults apply without it)")]
    config: Option<PathBuf>,

    #[arg(long, help = "Eval: trust below this counts as a bot (default: gate challenge_below)")]
    threshold: Option<u8>,

    #[arg(long, value_enum, default_value = "markdown", help = "Eval report format")]
    format: Format,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Replay, // static recording, as fast as possible
    Tail,   // follow a growing recording
    Eval,   // labelled recording → metrics report
}

#[derive(Clone, ValueEnum)]
enum Format {
    Markdown,
    Json,
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_verdict(v: &SessionVerdict) {
    let tier = RiskTier::from_bot_score(v.bot_score());
    let color = match v.decision {
        GateDecision::Block     => "\x1b[91;1m",
        GateDecision::Challenge => "\x1b[93;1m",
        GateDecision::Allow     => "\x1b[92m",
    };
    let reset = "\x1b[0m";
    let c = &v.trust.components;
    let label = v.label_bot
        .map(|b| format!(" \x1b[90m[{}]{}", if b { "bot" } else { "human" }, reset))
        .unwrap_or_default();
    let factors = v.trust.risk_factors.iter().take(3).cloned().collect::<Vec<_>>().join(" | ");

    println!("\n{}{} {}{}{}", color, v.decision, tier, reset, label);
    println!("  Session : {}{}{}", color, v.session_id, reset);
    println!("  Trust   : {}{}{}  (device {} / bot-detection {} / consistency {})",
        color, v.trust.overall, reset, c.device, c.bot_detection, c.consistency);
    for s in &v.scores {
        println!("  {:9}: {:3}  conf {:.2}  {}", s.channel, s.score, s.confidence, s.evidence.join(", "));
    }
    if !factors.is_empty() {
        println!("  Factors : {}", factors);
    }
}

fn parse_line(line: &str) -> Option<SessionRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<SessionRecord>(line) {
        Ok(rec) => Some(rec),
        Err(e) => {
            warn!("Parse error: {}", e);
            None
        }
    }
}

// ── Event sources ─────────────────────────────────────────────────────────────

async fn replay_jsonl(path: PathBuf, config: PulsegateConfig) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut replayer = Replayer::new(config);

    for rec in content.lines().filter_map(parse_line) {
        if let Some(v) = replayer.apply(&rec)? {
            print_verdict(&v);
        }
    }
    for v in replayer.finish() {
        print_verdict(&v);
    }
    Ok(())
}

async fn tail_jsonl(path: PathBuf, config: PulsegateConfig) -> Result<()> {
    let file = tokio::fs::File::open(&path).await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut replayer = Replayer::new(config).live(true);

    while lines.next_line().await?.is_some() {}  // consume existing

    info!("Tailing {}", path.display());
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Some(rec) = parse_line(&line) {
                        if let Some(v) = replayer.apply(&rec)? {
                            print_verdict(&v);
                        }
                    }
                }
                None => tokio::time::sleep(tokio::time::Duration::from_millis(50)).await,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    for v in replayer.finish() {
        print_verdict(&v);
    }
    Ok(())
}

async fn run_eval(path: PathBuf, config: PulsegateConfig, threshold: Option<u8>, format: Format) -> Result<()> {
    let mut evaluator = Evaluator::new(config);
    if let Some(t) = threshold {
        evaluator = evaluator.with_threshold(t);
    }
    let result = evaluator.run_dataset(&path).await
        .with_context(|| format!("evaluating {}", path.display()))?;
    match format {
        Format::Markdown => report::print_markdown(&result),
        Format::Json     => println!("{}", report::to_json(&result)),
    }
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("pulsegate=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(p) => PulsegateConfig::from_json_file(p)
            .with_context(|| format!("loading config {}", p.display()))?,
        None => PulsegateConfig::default(),
    };

    match cli.mode {
        Mode::Replay => {
            println!("  Mode: \x1b[93mREPLAY\x1b[0m  |  {}\n", cli.path.display());
            replay_jsonl(cli.path, config).await?;
        }
        Mode::Tail => {
            println!("  Mode: \x1b[96mTAIL\x1b[0m  |  {}", cli.path.display());
            println!("  Press Ctrl+C to stop.\n");
            tail_jsonl(cli.path, config).await?;
        }
        Mode::Eval => run_eval(cli.path, config, cli.threshold, cli.format).await?,
    }
    Ok(())
}
