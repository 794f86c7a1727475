//! Command-line interface for mailferry.
//!
//! Provides commands for importing an archive export into a Maildir,
//! inspecting and clearing saved progress, and checking folder mapping.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::{ArchiveReader, Credentials, DeliveryClient, JsonlArchive, MaildirClient};
use crate::config::{self, Settings};
use crate::core::{
    fingerprint, state_path_for, Orchestrator, ProgressSnapshot, ProgressTracker, RunOptions,
    SkipPolicy,
};
use crate::domain::RunSummary;

/// mailferry - Resumable archive-to-mailbox migration
#[derive(Parser, Debug)]
#[command(name = "mailferry")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import an archive export into a Maildir
    Import {
        /// Archive export (JSON lines)
        #[arg(short, long)]
        archive: PathBuf,

        /// Destination Maildir++ root
        #[arg(short, long)]
        maildir: PathBuf,

        /// Destination account identity
        #[arg(long, env = "MAILFERRY_ACCOUNT")]
        account: String,

        /// Ignore saved progress and start over
        #[arg(long)]
        fresh: bool,

        /// Skip Deleted Items and Trash folders
        #[arg(long)]
        skip_deleted: bool,

        /// Skip Sent Items folders
        #[arg(long)]
        skip_sent: bool,

        /// Exclude folders matching a glob (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Deliveries between progress saves
        #[arg(long)]
        batch: Option<u64>,
    },

    /// Show saved progress for an archive
    Status {
        /// Archive export (JSON lines)
        #[arg(short, long)]
        archive: PathBuf,

        /// Destination account identity
        #[arg(long, env = "MAILFERRY_ACCOUNT")]
        account: String,
    },

    /// Delete saved progress for an archive
    Clear {
        /// Archive export (JSON lines)
        #[arg(short, long)]
        archive: PathBuf,
    },

    /// Show the destination name for archive folder paths
    MapFolder {
        /// Archive folder paths
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Import {
                archive,
                maildir,
                account,
                fresh,
                skip_deleted,
                skip_sent,
                exclude,
                batch,
            } => {
                let mut settings = config::config()?.settings.clone();
                settings.folders.skip_deleted |= skip_deleted;
                settings.folders.skip_sent |= skip_sent;
                settings.folders.exclude.extend(exclude);
                if let Some(batch) = batch {
                    settings.pipeline.persist_every = batch;
                }

                import(&archive, &maildir, &account, fresh, &settings).await
            }
            Commands::Status { archive, account } => show_status(&archive, &account),
            Commands::Clear { archive } => clear_progress(&archive),
            Commands::MapFolder { paths } => map_folders(&paths),
            Commands::Config => show_config(),
        }
    }
}

/// Run an import
async fn import(
    archive_path: &Path,
    maildir: &Path,
    account: &str,
    fresh: bool,
    settings: &Settings,
) -> Result<()> {
    let mut archive = JsonlArchive::open(archive_path)
        .await
        .with_context(|| format!("Failed to open archive: {}", archive_path.display()))?;

    let credentials = Credentials::new(account);
    let mut client = MaildirClient::connect(maildir, &credentials, settings.namespace.clone())
        .await
        .with_context(|| format!("Failed to open maildir: {}", maildir.display()))?;

    let mut tracker = ProgressTracker::begin(archive_path, account, settings.tracker.clone())
        .context("Failed to load import progress")?;

    if fresh {
        tracker
            .discard()
            .context("Failed to clear import progress")?;
        println!("Starting fresh import");
    } else if tracker.has_existing_progress() {
        let (delivered, total) = tracker.progress();
        println!(
            "Resuming: {} of {} messages already delivered",
            delivered, total
        );
    }

    let orchestrator = Orchestrator::new(SkipPolicy::new(&settings.folders), settings.namespace.clone())
        .with_options(RunOptions {
            persist_every: settings.pipeline.persist_every,
            ..Default::default()
        });

    let cancel = orchestrator.cancel_signal();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current message...");
            cancel.cancel();
        }
    });

    let result = orchestrator
        .run(&mut archive, &mut client, &mut tracker)
        .await;
    ctrl_c.abort();

    archive.close().await?;
    client.disconnect().await?;

    let summary = result?;
    print_summary(&summary);

    if !summary.is_clean() {
        println!();
        println!("Progress saved to {}", tracker.state_path().display());
        println!("Run again to retry");
    }

    if let Some(reason) = summary.aborted {
        anyhow::bail!("Import aborted: {}", reason);
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    if summary.cancelled {
        println!("Import cancelled");
    } else if summary.aborted.is_some() {
        println!("Import stopped early");
    } else {
        println!("Import finished");
    }
    println!("  Delivered:          {}", summary.delivered);
    println!("  Already delivered:  {}", summary.already_delivered);
    println!("  Skipped (non-mail): {}", summary.skipped);
    println!("  Errors:             {}", summary.failed);
    println!("  Folders skipped:    {}", summary.folders_skipped);
    println!("  Folders completed:  {}", summary.folders_completed);
}

/// Show saved progress without taking the run lock
fn show_status(archive: &Path, account: &str) -> Result<()> {
    let settings = &config::config()?.settings;
    let archive = archive
        .canonicalize()
        .with_context(|| format!("Archive not found: {}", archive.display()))?;
    let state_path = state_path_for(&archive);

    let Some(snapshot) = ProgressSnapshot::load(&state_path)? else {
        println!("No resumable state for {}", archive.display());
        return Ok(());
    };

    let current = fingerprint(&archive, settings.tracker.fingerprint_bytes)
        .with_context(|| format!("Failed to read archive: {}", archive.display()))?;

    println!("State file: {}", state_path.display());
    println!("Saved at:   {}", snapshot.saved_at);
    println!("Account:    {}", snapshot.account);
    if snapshot.fingerprint != current {
        println!("Archive changed since this state was saved; the next import starts fresh");
    } else if snapshot.account != account {
        println!("State belongs to another account; the next import starts fresh");
    }
    println!();
    println!(
        "Delivered: {} of {}",
        snapshot.delivered_count, snapshot.total_count
    );

    match snapshot.filter(&state_path) {
        Ok(filter) => println!(
            "Membership: capacity {}, {} bytes, {} hashes",
            filter.capacity(),
            filter.size_bytes(),
            filter.num_hashes()
        ),
        Err(e) => println!("Membership: unreadable ({})", e),
    }

    println!();
    println!("Completed folders:");
    if snapshot.completed_folders.is_empty() {
        println!("  (none)");
    }
    for folder in &snapshot.completed_folders {
        let label = if folder.is_empty() { "(root)" } else { folder.as_str() };
        println!("  {}", label);
    }

    if !snapshot.failed.is_empty() {
        println!();
        println!("Failed deliveries in last run ({}):", snapshot.failed.len());
        for failure in snapshot.failed.iter().take(20) {
            println!("  {} -> {}: {}", failure.identity, failure.folder, failure.error);
        }
        if snapshot.failed.len() > 20 {
            println!("  ... and {} more", snapshot.failed.len() - 20);
        }
    }

    Ok(())
}

fn clear_progress(archive: &Path) -> Result<()> {
    let archive = archive
        .canonicalize()
        .with_context(|| format!("Archive not found: {}", archive.display()))?;
    let state_path = state_path_for(&archive);

    match std::fs::remove_file(&state_path) {
        Ok(()) => println!("Removed {}", state_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No saved progress for {}", archive.display())
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", state_path.display()))
        }
    }

    Ok(())
}

fn map_folders(paths: &[String]) -> Result<()> {
    let namespace = &config::config()?.settings.namespace;
    for path in paths {
        println!("{} -> {}", path, namespace.map_folder(path));
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    print!(
        "{}",
        serde_yaml::to_string(&cfg.settings).context("Failed to render configuration")?
    );

    Ok(())
}
