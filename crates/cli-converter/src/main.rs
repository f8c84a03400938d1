use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use converter::{
    config::ConverterConfig,
    events::{ChannelListener, JobEvent},
    ledger::SizeLedger,
    library,
    manager::ConversionManager,
    progress,
};
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};

/// Convert videos to WebM (VP9 + Opus) with ffmpeg
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one video file
    Convert {
        input: PathBuf,

        /// Output file (defaults to <output_dir>/<stem><suffix>.webm)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print job events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List converted files, newest first
    List {
        #[arg(long)]
        json: bool,
    },
    /// Delete a converted file and forget its original size
    Delete { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = ConverterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    debug!("Configuration: {:?}", cfg);

    match args.command {
        Command::Convert { input, output, json } => convert(&cfg, input, output, json).await,
        Command::List { json } => list(&cfg, json),
        Command::Delete { path } => delete(&cfg, &path),
    }
}

async fn convert(cfg: &ConverterConfig, input: PathBuf, output: Option<PathBuf>, json: bool) -> Result<()> {
    let output = output.unwrap_or_else(|| cfg.output_path_for(&input));
    let (listener, mut events) = ChannelListener::new();
    let manager = ConversionManager::from_config(cfg, Arc::new(listener));

    manager
        .start(&input, &output)
        .with_context(|| format!("Failed to start conversion of {}", input.display()))?;

    let mut cancel_requested = false;
    let terminal = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("Event stream closed before the job finished");
                };
                render(&event, json)?;
                if event.is_terminal() {
                    break event;
                }
            }
            signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                cancel_requested = true;
                if manager.cancel() {
                    info!("Cancellation requested, waiting for ffmpeg to stop");
                }
            }
        }
    };

    manager.shutdown().await;

    match terminal {
        JobEvent::Succeeded { .. } => Ok(()),
        JobEvent::Failed { message } => bail!(message),
        _ => bail!("Conversion cancelled"),
    }
}

fn render(event: &JobEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        JobEvent::Started { original_size, total_frames } => {
            let frames = if *total_frames > 0 {
                format!("{} frames", total_frames)
            } else {
                "unknown length".to_string()
            };
            println!("Converting {} ({})", format_size(*original_size, DECIMAL), frames);
        }
        JobEvent::Progress { percent, current_frame, total_frames } => {
            print!("\r{}", progress::describe(*percent, *current_frame, *total_frames));
            io::stdout().flush()?;
        }
        JobEvent::Succeeded { output_path, original_size, new_size } => {
            println!();
            println!("Converted: {}", output_path.display());
            println!("  Original:  {}", format_size(*original_size, DECIMAL));
            println!("  New:       {}", format_size(*new_size, DECIMAL));
            println!("  Reduction: {}%", library::reduction_percent(*original_size, *new_size));
        }
        JobEvent::Failed { message } => {
            println!();
            println!("Failed: {}", message);
        }
        JobEvent::Cancelled => {
            println!();
            println!("Cancelled");
        }
    }
    Ok(())
}

fn load_ledger(cfg: &ConverterConfig) -> Result<SizeLedger> {
    SizeLedger::load(cfg.ledger_path()).context("Failed to load size ledger")
}

fn list(cfg: &ConverterConfig, json: bool) -> Result<()> {
    let ledger = load_ledger(cfg)?;
    let entries = library::list_outputs(&cfg.output_dir, &ledger)
        .with_context(|| format!("Failed to list outputs in {}", cfg.output_dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No converted files in {}", cfg.output_dir.display());
        return Ok(());
    }

    for entry in &entries {
        println!(
            "{}  {:>10} -> {:>10}  ({:>3}%)  {}",
            entry.modified.format("%Y-%m-%d %H:%M"),
            entry.formatted_original_size(),
            entry.formatted_size(),
            entry.reduction_percent(),
            entry.name,
        );
    }
    Ok(())
}

fn delete(cfg: &ConverterConfig, path: &Path) -> Result<()> {
    let mut ledger = load_ledger(cfg)?;
    library::delete_output(path, &mut ledger)?;
    println!("Deleted {}", path.display());
    Ok(())
}
