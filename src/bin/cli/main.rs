//! Binary entry point for the Voron administrative CLI.
#![forbid(unsafe_code)]

mod config;

use std::error::Error;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};
use voron::admin::{
    self, open_store, restore, AdminOpenOptions, BackupOptions, CompactionProgress, FullBackup,
};
use voron::storage::{FileHeader, FlushReport};
use voron::types::RootObjectType;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(
    name = "voron",
    version,
    about = "Administrative CLI for Voron stores",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        env = "VORON_CONFIG",
        value_name = "FILE",
        help = "Path to the CLI config file"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, help = "Hide progress bars")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, help = "Page size (bytes) used when creating a store")]
    page_size: Option<u32>,

    #[arg(long, global = true, value_name = "DIR", help = "Directory holding journal files")]
    journal_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Size (bytes) after which a journal file rolls over")]
    max_log_file_size: Option<u64>,

    #[arg(long, global = true, help = "Skip fsync after journal appends")]
    no_sync: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the persisted header and the root objects of a store.
    Header {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },
    /// Apply journaled transactions to the data file.
    Flush {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },
    /// Write a full backup of a store into a zip archive.
    Backup {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,
        #[arg(long, help = "Deflate level 0-9, 0 stores entries uncompressed")]
        compression_level: Option<i32>,
    },
    /// Extract a backup archive into a data directory.
    Restore {
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,
        #[arg(value_name = "DIR")]
        data_dir: PathBuf,
        #[arg(long = "into-journal-dir", value_name = "DIR", help = "Separate directory for journal files")]
        journal_dir: Option<PathBuf>,
    },
    /// Copy a store into a new, densely packed store.
    Compact {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(long, value_name = "DIR", help = "Directory of the compacted store")]
        into: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
struct HeaderReport {
    header: FileHeader,
    allocated_pages: u64,
    journal_files: Vec<u64>,
    root_objects: Vec<RootObjectEntry>,
}

#[derive(Debug, Serialize)]
struct RootObjectEntry {
    name: String,
    kind: RootObjectType,
}

fn main() {
    install_tracing_subscriber();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn install_tracing_subscriber() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone())?;
    if let Some(path) = config.path() {
        tracing::debug!(config = %path.display(), "cli.config.loaded");
    }
    let open_opts = build_open_options(&cli.open, &config);

    match cli.command {
        Command::Header { db_path } => {
            let env = open_store(&db_path, &open_opts)?;
            let mut tx = env.read_transaction()?;
            let root_objects = tx
                .root_objects()?
                .into_iter()
                .map(|(name, kind)| RootObjectEntry { name, kind })
                .collect();
            tx.dispose();
            let report = HeaderReport {
                header: env.header().header()?,
                allocated_pages: env.number_of_allocated_pages(),
                journal_files: env.journal_files(),
                root_objects,
            };
            emit(cli.format, &report, || print_header_text(&report))?;
        }
        Command::Flush { db_path } => {
            let env = open_store(&db_path, &open_opts)?;
            let report = env.flush_log_to_data_file()?;
            emit(cli.format, &report, || print_flush_text(&report))?;
        }
        Command::Backup {
            db_path,
            archive,
            compression_level,
        } => {
            let env = open_store(&db_path, &open_opts)?;
            let options = BackupOptions {
                compression_level: compression_level
                    .or(config.compression_level())
                    .unwrap_or(BackupOptions::default().compression_level),
            };
            let report = FullBackup::new(options).execute(&env, &archive)?;
            emit(cli.format, &report, || {
                println!(
                    "Backup of transaction {} written to {} ({} bytes, {} journals) in {:.2} ms",
                    report.transaction_id,
                    report.archive.display(),
                    report.archive_bytes,
                    report.journals.len(),
                    report.duration_ms
                );
            })?;
        }
        Command::Restore {
            archive,
            data_dir,
            journal_dir,
        } => {
            let report = restore(&archive, &data_dir, journal_dir.as_deref())?;
            emit(cli.format, &report, || {
                println!(
                    "Restored {} data files and {} journals ({} bytes)",
                    report.data_files.len(),
                    report.journal_files.len(),
                    report.bytes
                );
            })?;
        }
        Command::Compact { db_path, into } => {
            let bar = compaction_bar(cli.quiet || cli.format == OutputFormat::Json);
            let mut on_progress = |progress: &CompactionProgress| {
                bar.set_length(progress.total_trees as u64);
                bar.set_position(progress.copied_trees as u64);
                bar.set_message(format!(
                    "{} {}/{}",
                    progress.tree, progress.copied_entries, progress.total_entries
                ));
            };
            let report = admin::compact(&db_path, &into, &open_opts, Some(&mut on_progress))?;
            bar.finish_and_clear();
            emit(cli.format, &report, || {
                println!(
                    "Compacted {} trees ({} entries) in {:.2} ms: {} -> {} bytes",
                    report.trees_copied,
                    report.entries_copied,
                    report.duration_ms,
                    report.source_bytes,
                    report.destination_bytes
                );
            })?;
        }
    }

    Ok(())
}

fn build_open_options(args: &OpenArgs, config: &CliConfig) -> AdminOpenOptions {
    let mut opts = AdminOpenOptions::default();
    if let Some(page_size) = args.page_size.or(config.page_size()) {
        opts.page_size = page_size;
    }
    if let Some(max) = args.max_log_file_size.or(config.max_log_file_size()) {
        opts.max_log_file_size = max;
    }
    opts.journal_path = args.journal_dir.clone();
    opts.sync_journal = !args.no_sync;
    opts
}

fn compaction_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} trees {msg}") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_header_text(report: &HeaderReport) {
    let header = &report.header;
    println!(
        "Header: version={} revision={} page_size={}",
        header.version, header.header_revision, header.page_size
    );
    println!(
        "  transaction_id={} last_page_number={} allocated_pages={}",
        header.transaction_id, header.last_page_number, report.allocated_pages
    );
    println!(
        "Journal: current={} files={} last_synced_journal={} last_synced_tx={}",
        header.journal.current_journal,
        header.journal.journal_files_count,
        header.journal.last_synced_journal,
        header.journal.last_synced_transaction_id
    );
    println!("  on disk: {:?}", report.journal_files);
    println!("Root objects:");
    for entry in &report.root_objects {
        println!("  {} ({:?})", entry.name, entry.kind);
    }
}

fn print_flush_text(report: &FlushReport) {
    println!(
        "Flushed through transaction {} ({} pages written, {} journals retired)",
        report.flushed_through,
        report.pages_written,
        report.retired_journals.len()
    );
}
