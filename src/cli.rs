// CLI module - command-line argument parsing and handlers
//
// Subcommands:
// - start:    run the capture proxy (default when no subcommand is given)
// - replay:   print one stored interaction
// - export:   write interactions as JSON or JSONL
// - stats:    aggregate statistics
// - sessions: list session aggregates
// - save:     export everything (with chunks) to a file
// - config:   show/reset the config file

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::config::{Config, VERSION};
use crate::export::{export_interactions, ExportFormat, ExportOptions};
use crate::store::query::{InteractionFilter, StoreQuery};

/// llmtap - transparent capture proxy for LLM traffic
#[derive(Parser)]
#[command(name = "llmtap")]
#[command(version = VERSION)]
#[command(about = "Transparent capture proxy for LLM traffic", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the capture proxy
    Start(StartArgs),

    /// Print a stored interaction
    Replay {
        /// Interaction id
        id: String,
    },

    /// Export interactions to stdout or a file
    Export(ExportArgs),

    /// Print aggregate statistics
    Stats,

    /// List sessions
    Sessions,

    /// Export all interactions, chunks included, to a JSON file
    Save {
        /// Output file path
        path: PathBuf,
    },

    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,

        /// Reset config file to defaults
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Args, Default)]
pub struct StartArgs {
    /// Listen host
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// SQLite database path
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// OpenAI-compatible upstream base URL
    #[arg(long)]
    pub openai_url: Option<String>,

    /// Anthropic upstream base URL
    #[arg(long)]
    pub anthropic_url: Option<String>,

    /// Ollama upstream base URL
    #[arg(long)]
    pub ollama_url: Option<String>,

    /// Chatty logging
    #[arg(long)]
    pub verbose: bool,

    /// Warnings and errors only
    #[arg(long)]
    pub quiet: bool,

    /// Store headers without redacting secrets
    #[arg(long = "no-redact")]
    pub no_redact: bool,

    /// Skip persisting individual stream chunks
    #[arg(long = "no-store-chunks")]
    pub no_store_chunks: bool,
}

impl StartArgs {
    /// Overlay CLI flags on top of env/file/default configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
        if let Some(url) = &self.openai_url {
            config.openai_url = url.clone();
        }
        if let Some(url) = &self.anthropic_url {
            config.anthropic_url = url.clone();
        }
        if let Some(url) = &self.ollama_url {
            config.ollama_url = url.clone();
        }
        if self.verbose {
            config.verbose = true;
        }
        if self.quiet {
            config.quiet = true;
        }
        if self.no_redact {
            config.redact = false;
        }
        if self.no_store_chunks {
            config.store_chunks = false;
        }
    }
}

#[derive(Args)]
pub struct ExportArgs {
    /// Output file; stdout when omitted
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Export format
    #[arg(long, value_enum, default_value = "jsonl")]
    pub format: ExportFormat,

    /// Embed stream chunks in JSONL output
    #[arg(long)]
    pub verbose: bool,

    /// Only interactions from this session
    #[arg(long)]
    pub session: Option<String>,

    /// Only interactions for this provider
    #[arg(long)]
    pub provider: Option<String>,

    /// Only interactions for this model
    #[arg(long)]
    pub model: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Read-only command handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Open the query pool, refusing politely when the database does not exist
fn open_query(config: &Config) -> Result<StoreQuery> {
    if !config.db_path.exists() {
        bail!(
            "no interaction database at {} (run `llmtap start` first)",
            config.db_path.display()
        );
    }
    StoreQuery::new(&config.db_path)
}

pub fn handle_stats(config: &Config) -> Result<()> {
    let query = open_query(config)?;
    let stats = query.stats()?;

    println!("Interactions: {}", stats.total_interactions);
    println!(
        "Errors:       {} ({:.1}%)",
        stats.total_errors,
        stats.error_rate * 100.0
    );
    println!(
        "Tokens:       {} prompt / {} completion / {} total",
        stats.total_prompt_tokens, stats.total_completion_tokens, stats.total_tokens
    );
    if !stats.by_provider.is_empty() {
        println!();
        println!("By provider:");
        for entry in &stats.by_provider {
            println!("  {:<12} {}", entry.key, entry.count);
        }
    }
    if !stats.by_model.is_empty() {
        println!();
        println!("By model:");
        for entry in &stats.by_model {
            println!("  {:<40} {}", entry.key, entry.count);
        }
    }
    Ok(())
}

pub fn handle_sessions(config: &Config) -> Result<()> {
    let query = open_query(config)?;
    let sessions = query.list_sessions()?;

    if sessions.is_empty() {
        println!("No sessions recorded.");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{:<32} {:>5} interactions  models: {}  last: {}",
            session.session_id,
            session.interactions,
            if session.models.is_empty() {
                "-".to_string()
            } else {
                session.models.join(", ")
            },
            session
                .last_seen
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

pub fn handle_replay(config: &Config, id: &str) -> Result<()> {
    let query = open_query(config)?;
    let Some(interaction) = query.get_interaction(id)? else {
        bail!("no interaction with id {}", id);
    };

    println!("id:       {}", interaction.id);
    if let Some(session) = &interaction.session_id {
        println!("session:  {}", session);
    }
    println!("provider: {}", interaction.provider);
    println!("request:  {} {}", interaction.method, interaction.path);
    if let Some(model) = &interaction.model {
        println!("model:    {}", model);
    }
    println!(
        "status:   {}",
        interaction
            .status_code
            .map(|s| s.to_string())
            .unwrap_or_else(|| "(incomplete)".to_string())
    );
    if let Some(latency) = interaction.total_latency_ms {
        println!("latency:  {} ms", latency);
    }
    if let Some(total) = interaction.usage.total_tokens {
        println!(
            "tokens:   {}{}",
            total,
            if interaction.usage.heuristic {
                " (estimated)"
            } else {
                ""
            }
        );
    }
    if let Some(error) = &interaction.error {
        println!("error:    {}", error);
    }
    if interaction.chunk_count > 0 {
        println!("chunks:   {}", interaction.chunk_count);
    }

    if let Some(response) = &interaction.response {
        if let Some(text) = &response.reconstructed_text {
            println!();
            println!("{}", text);
        }
        for call in &response.tool_calls {
            println!();
            println!("[tool_call] {}: {}", call.name, call.arguments);
        }
    }
    Ok(())
}

pub fn handle_export(config: &Config, args: &ExportArgs) -> Result<()> {
    let query = open_query(config)?;
    let options = ExportOptions {
        format: args.format,
        verbose: args.verbose,
        filter: InteractionFilter {
            provider: args.provider.clone(),
            model: args.model.clone(),
            session_id: args.session.clone(),
        },
    };

    let count = match &args.output {
        Some(path) => {
            let mut file = std::fs::File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            let count = export_interactions(&query, &options, &mut file)?;
            file.flush()?;
            count
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            export_interactions(&query, &options, &mut lock)?
        }
    };

    if args.output.is_some() {
        eprintln!("Exported {} interactions", count);
    }
    Ok(())
}

pub fn handle_save(config: &Config, path: &PathBuf) -> Result<()> {
    let query = open_query(config)?;
    let options = ExportOptions {
        format: ExportFormat::Json,
        verbose: true,
        filter: InteractionFilter::default(),
    };
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    let count = export_interactions(&query, &options, &mut file)?;
    file.flush()?;
    println!("Saved {} interactions to {}", count, path.display());
    Ok(())
}

pub fn handle_config(config: &Config, show: bool, path: bool, reset: bool) -> Result<()> {
    if path {
        match Config::config_path() {
            Some(p) => println!("{}", p.display()),
            None => bail!("could not determine config path"),
        }
    } else if reset {
        let Some(p) = Config::config_path() else {
            bail!("could not determine config path");
        };
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&p, Config::default().to_toml())?;
        println!("Config reset to defaults: {}", p.display());
    } else if show {
        print!("{}", config.to_toml());
        if let Some(p) = Config::config_path() {
            println!();
            if p.exists() {
                println!("# Source: {}", p.display());
            } else {
                println!("# Source: defaults (no config file)");
            }
        }
    } else {
        println!("Usage: llmtap config [--show|--path|--reset]");
    }
    Ok(())
}
