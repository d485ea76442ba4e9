//! pdftools - maintenance CLI for the PDF output store
//!
//! Headless entry point over [`OutputStore`]. It initializes:
//! - Logging infrastructure (daily rotating file, console in debug mode)
//! - Configuration loading ([`ConfigManager`]) from the config directory
//! - The output store, which runs the configured auto-cleanup once on startup
//!
//! # Commands
//!
//! - `stats`: per-kind counts, sizes and age ranges of the output tree
//! - `cleanup`: delete artifacts older than a retention, optionally per kind
//! - `export`: write the JSON inventory
//! - `config show` / `config set-dir`: inspect or change the configuration

use anyhow::Result;
use camino::Utf8PathBuf;
use chrono::Local;
use clap::{Parser, Subcommand};
use pdftools::logging::{self, LogFormat};
use pdftools::services::{CleanupOptions, CleanupReport, OutputStatistics};
use pdftools::{APP_NAME, ConfigManager, Metrics, OperationKind, OutputStore, VERSION};

#[derive(Parser, Debug)]
#[command(name = "pdftools", version, about = "Maintain the PDF tools output directory")]
struct Cli {
    /// Directory holding output_config.yaml
    #[arg(long, env = "PDFTOOLS_CONFIG_DIR", default_value = "pdftools-data")]
    config_dir: Utf8PathBuf,

    /// Directory for log files
    #[arg(long, default_value = "logs")]
    log_dir: Utf8PathBuf,

    /// Debug logging, mirrored to the console
    #[arg(long)]
    debug: bool,

    /// Write the log file as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show statistics of the output directory
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete old artifacts
    Cleanup {
        /// Retention in days (defaults to auto_cleanup_days; 0 deletes nothing)
        #[arg(long)]
        days: Option<u32>,

        /// Only sweep these kinds (repeatable)
        #[arg(long = "kind")]
        kinds: Vec<OperationKind>,
    },

    /// Export the file inventory as JSON
    Export {
        /// Target file (defaults to <output>/file_list.json)
        #[arg(long)]
        output: Option<Utf8PathBuf>,
    },

    /// Inspect or change the output configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the active configuration
    Show,

    /// Change the output root
    SetDir { directory: Utf8PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    let _guard = logging::setup_logging_with_console(
        cli.log_dir.as_str(),
        APP_NAME,
        cli.debug,
        cli.debug,
        format,
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let metrics = Metrics::new();
    let config_manager = ConfigManager::new(&cli.config_dir)?;
    let store = OutputStore::open(config_manager);
    if let Some(warning) = store.load_warning() {
        eprintln!("warning: {}", warning);
    }

    // Manual cleanup replaces the startup sweep
    if !matches!(cli.command, Command::Cleanup { .. }) && store.configuration().cleanup_enabled() {
        let report = store.cleanup(Local::now());
        metrics.record_cleanup(report.deleted, report.failed.len());
    }

    let result = run(&cli.command, &store, &metrics);

    metrics.log_summary();
    tracing::info!("{} finished", APP_NAME);
    result
}

fn run(command: &Command, store: &OutputStore, metrics: &Metrics) -> Result<()> {
    match command {
        Command::Stats { json } => {
            let stats = store.statistics();
            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_statistics(&stats);
            }
        }
        Command::Cleanup { days, kinds } => {
            let options = CleanupOptions {
                older_than_days: *days,
                kinds: (!kinds.is_empty()).then(|| kinds.clone()),
            };
            let report = store.cleanup_with(Local::now(), &options);
            metrics.record_cleanup(report.deleted, report.failed.len());
            print_cleanup(&report);
        }
        Command::Export { output } => {
            let path = match output {
                Some(target) => store.export_inventory_to(target)?,
                None => store.export_inventory()?,
            };
            println!("Inventory written to {}", path);
        }
        Command::Config(ConfigCommand::Show) => {
            let config = store.configuration();
            print!("{}", serde_yaml_ng::to_string(config.as_ref())?);
        }
        Command::Config(ConfigCommand::SetDir { directory }) => {
            store.set_base_output_directory(directory)?;
            println!("Output directory set to {}", directory);
        }
    }
    Ok(())
}

fn print_statistics(stats: &OutputStatistics) {
    println!("Output directory: {}", stats.base_directory);
    println!(
        "Total: {} files, {}",
        stats.total_files,
        format_bytes(stats.total_bytes)
    );
    for (kind, kind_stats) in &stats.by_kind {
        print!(
            "  {:<12} {:>6} files {:>12}",
            kind.folder(),
            kind_stats.count,
            format_bytes(kind_stats.total_bytes)
        );
        if let (Some(oldest), Some(newest)) = (kind_stats.oldest, kind_stats.newest) {
            print!(
                "  {} .. {}",
                oldest.format("%Y-%m-%d"),
                newest.format("%Y-%m-%d")
            );
        }
        println!();
    }
    if stats.unclassified.count > 0 {
        println!(
            "  {:<12} {:>6} files {:>12}",
            "other",
            stats.unclassified.count,
            format_bytes(stats.unclassified.total_bytes)
        );
    }
    if stats.inaccessible > 0 {
        println!("Inaccessible entries skipped: {}", stats.inaccessible);
    }
    for crowded in &stats.crowded_directories {
        println!("Crowded: {} ({} files)", crowded.path, crowded.files);
    }
}

fn print_cleanup(report: &CleanupReport) {
    match report.cutoff {
        None => println!("Cleanup disabled (retention is 0 days)"),
        Some(cutoff) => {
            println!("Removed files older than {}", cutoff.format("%Y-%m-%d %H:%M:%S"));
            println!(
                "Deleted {} files ({}), skipped {}, failed {}, removed {} empty directories",
                report.deleted,
                format_bytes(report.bytes_freed),
                report.skipped,
                report.failed.len(),
                report.removed_directories
            );
            for failure in &report.failed {
                println!("  {}: {}", failure.path, failure.reason);
            }
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
