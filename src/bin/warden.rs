//! Warden CLI binary.
//!
//! Real-time threat inspection for LLM API traffic.
//!
//! # Commands
//!
//! - `scan` - Static rule scan of one payload (no workers, no vector store)
//! - `inspect` - Run a stream of payloads through the full pipeline
//! - `rules` - List the active rule set or validate a rule file
//! - `config` - Print the effective configuration

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use warden::{
    config::LoggingConfig,
    detection::{load_rules_file, Action, DetectionEngine, DetectionVerdict, PatternLibrary, ThreatCategory},
    Config, DetectionContext, Direction, Pipeline, Request, WardenError, VERSION,
};

/// Exit code when the verdict recommends blocking
const EXIT_BLOCKED: i32 = 2;

/// Drain window on shutdown
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "warden")]
#[command(version = VERSION)]
#[command(about = "Warden - real-time threat inspection for LLM API traffic", long_about = None)]
struct Cli {
    /// Config file (default: platform config dir, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Static rule scan of one payload
    Scan {
        /// Content to scan (or - for stdin)
        input: Option<String>,

        /// Input file path
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Treat the payload as model output
        #[arg(long)]
        outbound: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a stream of payloads through the full pipeline
    ///
    /// Input is JSON lines `{"content": "...", "content_type": "..."}`, or plain
    /// text lines with `--lines`. One verdict JSON per line goes to stdout, the
    /// statistics summary to stderr.
    Inspect {
        /// Input file path (default: stdin)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Override the configured worker count
        #[arg(short, long)]
        workers: Option<usize>,

        /// Treat each input line as plain text
        #[arg(long)]
        lines: bool,

        /// Requests in flight at once
        #[arg(long, default_value = "16")]
        concurrency: usize,
    },

    /// List the active rule set or validate a rule file
    Rules {
        /// Only rules in this category (e.g. prompt_injection)
        #[arg(long)]
        category: Option<String>,

        /// Validate this rule file instead of listing
        #[arg(long)]
        check: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging, cli.verbose);

    match cli.command {
        Commands::Scan {
            input,
            file,
            outbound,
            json,
        } => cmd_scan(&config, input, file, outbound, json),

        Commands::Inspect {
            file,
            workers,
            lines,
            concurrency,
        } => cmd_inspect(config, file, workers, lines, concurrency),

        Commands::Rules { category, check } => match check {
            Some(path) => cmd_check_rules(&path),
            None => cmd_rules(&config, category.as_deref()),
        },

        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        },
    }
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| Config::default_path().filter(|p| p.exists()));
    Ok(Config::load(path.as_deref())?)
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cmd_scan(
    config: &Config,
    input: Option<String>,
    file: Option<PathBuf>,
    outbound: bool,
    json_output: bool,
) -> anyhow::Result<()> {
    let content = read_input(input, file)?;
    let engine = DetectionEngine::from_config(&config.engine)?;
    let context = if outbound {
        DetectionContext::outbound()
    } else {
        DetectionContext::default()
    };

    let verdict = engine.detect(&content, &context)?;
    print_verdict(&verdict, json_output)?;

    if verdict.recommended_action == Action::Block {
        std::process::exit(EXIT_BLOCKED);
    }
    Ok(())
}

/// One line of `inspect` input
#[derive(Debug, Deserialize)]
struct InspectLine {
    content: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    direction: Direction,
}

fn parse_line(text: &str, plain: bool) -> anyhow::Result<Request> {
    if plain {
        return Ok(Request::text(text));
    }
    let line: InspectLine = serde_json::from_str(text)?;
    let mut request = Request::text(&line.content).with_context(DetectionContext {
        direction: line.direction,
    });
    if let Some(content_type) = line.content_type {
        request = request.with_content_type(content_type);
    }
    Ok(request)
}

fn cmd_inspect(
    mut config: Config,
    file: Option<PathBuf>,
    workers: Option<usize>,
    plain: bool,
    concurrency: usize,
) -> anyhow::Result<()> {
    if let Some(workers) = workers {
        config.pool.workers = workers;
    }
    let input = String::from_utf8(read_input(None, file)?)?;
    let lines: Vec<(usize, &str)> = input
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| (i + 1, l))
        .collect();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let pipeline = Arc::new(Pipeline::new(config)?);

        let results = stream::iter(lines)
            .map(|(line, text)| {
                let pipeline = Arc::clone(&pipeline);
                async move {
                    let outcome = match parse_line(text, plain) {
                        Ok(request) => pipeline.detect(request).await.map_err(anyhow::Error::from),
                        Err(e) => Err(e),
                    };
                    (line, outcome)
                }
            })
            .buffered(concurrency.max(1));
        futures::pin_mut!(results);

        while let Some((line, outcome)) = results.next().await {
            let output = match outcome {
                Ok(verdict) => serde_json::json!({ "line": line, "verdict": verdict }),
                Err(e) => serde_json::json!({ "line": line, "error": e.to_string() }),
            };
            println!("{output}");
        }

        eprintln!("{}", serde_json::to_string_pretty(&pipeline.summary())?);
        pipeline.shutdown(SHUTDOWN_DRAIN).await;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_check_rules(path: &Path) -> anyhow::Result<()> {
    let specs = load_rules_file(path)?;
    let library = PatternLibrary::compile(&specs)?;
    println!("{}: {} rules OK", path.display(), library.len());
    for category in library.categories() {
        let count = library.rules().iter().filter(|r| r.category() == category).count();
        println!("  {:<22} {count}", category.to_string());
    }
    Ok(())
}

fn cmd_rules(config: &Config, category: Option<&str>) -> anyhow::Result<()> {
    let library = PatternLibrary::load(config.engine.include_builtin_rules, config.engine.rules_path.as_deref())?;

    let wanted = category.map(parse_category).transpose()?;

    println!("{:<36} {:<22} {:<9} {:>6}  DESCRIPTION", "ID", "CATEGORY", "SEVERITY", "WEIGHT");
    for rule in library.rules() {
        if wanted.is_some_and(|c| c != rule.category()) {
            continue;
        }
        println!(
            "{:<36} {:<22} {:<9} {:>6.2}  {}",
            rule.id(),
            rule.category().to_string(),
            rule.severity().to_string(),
            rule.weight(),
            rule.description()
        );
    }
    println!();
    println!("{} rules", library.len());
    Ok(())
}

fn parse_category(name: &str) -> anyhow::Result<ThreatCategory> {
    ThreatCategory::ALL
        .into_iter()
        .find(|c| c.to_string() == name)
        .ok_or_else(|| WardenError::Config(format!("unknown category: {name}")).into())
}

fn print_verdict(verdict: &DetectionVerdict, json_output: bool) -> anyhow::Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(verdict)?);
        return Ok(());
    }

    if !verdict.detected {
        println!("CLEAN (confidence: {:.2})", verdict.confidence);
        return Ok(());
    }

    println!(
        "{} severity: {} confidence: {:.2}",
        verdict.recommended_action.to_string().to_uppercase(),
        verdict
            .max_severity
            .map_or_else(|| "-".to_string(), |s| s.to_string()),
        verdict.confidence
    );
    println!();
    println!("Matched categories:");
    for m in &verdict.categories {
        println!("  - {} ({}, {:.2})", m.category, m.severity, m.confidence);
        println!("    rules: {}", m.rule_ids.join(", "));
    }
    if !verdict.similar_threats.is_empty() {
        println!();
        println!("Similar known threats:");
        for s in &verdict.similar_threats {
            println!("  - {} (score {:.2})", s.id, s.score);
        }
    }
    println!();
    println!("fingerprint: {}", verdict.fingerprint.to_hex());
    Ok(())
}

fn read_input(input: Option<String>, file: Option<PathBuf>) -> anyhow::Result<Vec<u8>> {
    if let Some(path) = file {
        Ok(std::fs::read(path)?)
    } else if let Some(s) = input.filter(|s| s != "-") {
        Ok(s.into_bytes())
    } else {
        let mut buffer = Vec::new();
        io::stdin().read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}
