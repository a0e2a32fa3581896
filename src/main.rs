//! Command-line front end for coffer backup groups.

use clap::{Parser, Subcommand};
use coffer_catalog::CollectionId;
use coffer_config::Config;
use coffer_engine::{BackupReport, CompactReport, Compactor, Group, Issue, RestoreReport, RestoreRequest, VerifyReport};
use coffer_engine::{backup, restore, verify};
use derive_more::{Display, Error};
use exn::{OptionExt, ResultExt};
use std::path::PathBuf;
use std::process::ExitCode;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Display, Error)]
enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not open backup group {_0}")]
    Open(#[error(not(source))] String),
    #[display("{_0} failed")]
    Operation(#[error(not(source))] &'static str),
    #[display("the group has no collections to restore from")]
    NoCollections,
    #[display("could not start the async runtime")]
    Runtime,
}

type Result<T> = std::result::Result<T, exn::Exn<ErrorKind>>;

#[derive(Debug, Parser)]
#[command(name = "coffer", version, about = "Deduplicating, versioned backups packed into size-bounded archives")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "COFFER_CONFIG")]
    config: Option<PathBuf>,
    /// More logging; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Backup group, as named in the configuration
    group: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Back up every root of the group into a new collection
    Backup {
        /// Only report what would be backed up
        #[arg(long)]
        preview: bool,
    },
    /// Restore files as they were at a collection
    Restore {
        /// Glob matched against absolute source paths
        pattern: String,
        destination: PathBuf,
        /// Collection to restore from; defaults to the latest
        #[arg(long)]
        collection: Option<CollectionId>,
        /// Only list what would be restored
        #[arg(long)]
        preview: bool,
        /// Don't re-hash restored files
        #[arg(long)]
        skip_verify: bool,
    },
    /// Expire content only collections past the retention period use
    Compact {
        /// Also rebuild archives that still hold some live content
        #[arg(long)]
        thorough: bool,
        /// Only report what would be compacted
        #[arg(long)]
        preview: bool,
    },
    /// Check archives on disk against the catalog
    Verify,
    /// List the group's collections
    Collections,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match run(cli) {
        Ok(issues) if issues > 0 => {
            tracing::warn!(issues, "finished with issues");
            ExitCode::SUCCESS
        },
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:?}");
            ExitCode::FAILURE
        },
    }
}

/// Returns the number of recoverable issues reported.
fn run(cli: Cli) -> Result<usize> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let group_config = config.group(&cli.group).or_raise(|| ErrorKind::Config)?.clone();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().or_raise(|| ErrorKind::Runtime)?;
    runtime.block_on(async move {
        let group = Group::open(&cli.group, &group_config).await.or_raise(|| ErrorKind::Open(cli.group.clone()))?;
        let outcome = dispatch(&group, cli.command).await;
        group.close().await;
        outcome
    })
}

async fn dispatch(group: &Group, command: Command) -> Result<usize> {
    match command {
        Command::Backup { preview: true } => {
            let report = backup::preview(group).await.or_raise(|| ErrorKind::Operation("backup preview"))?;
            Ok(print_backup(&report))
        },
        Command::Backup { preview: false } => {
            let report = backup::run(group).await.or_raise(|| ErrorKind::Operation("backup"))?;
            Ok(print_backup(&report))
        },
        Command::Restore { collection, pattern, destination, preview, skip_verify } => {
            let collection = match collection {
                Some(collection) => collection,
                None => group
                    .latest_collection()
                    .await
                    .or_raise(|| ErrorKind::Operation("restore"))?
                    .ok_or_raise(|| ErrorKind::NoCollections)?
                    .id,
            };
            let request = RestoreRequest { collection, pattern, destination, preview, skip_verify };
            let report = restore::run(group, &request).await.or_raise(|| ErrorKind::Operation("restore"))?;
            Ok(print_restore(&report, preview))
        },
        Command::Compact { thorough, preview: true } => {
            let plan = Compactor::new(group, thorough).plan().await.or_raise(|| ErrorKind::Operation("compaction"))?;
            match plan.cutoff {
                None => println!("no collection is old enough to compact"),
                Some(cutoff) => println!("cutoff: collection {cutoff}"),
            }
            for bucket in plan.actionable() {
                println!(
                    "{:?} {}: {} expired ({} bytes), {} live ({} bytes)",
                    bucket.action,
                    bucket.name,
                    bucket.stats.old_items,
                    bucket.stats.old_bytes,
                    bucket.stats.new_items,
                    bucket.stats.new_bytes,
                );
            }
            Ok(0)
        },
        Command::Compact { thorough, preview: false } => {
            let report = Compactor::new(group, thorough).run().await.or_raise(|| ErrorKind::Operation("compaction"))?;
            Ok(print_compact(&report))
        },
        Command::Verify => {
            let report = verify::run(group).await.or_raise(|| ErrorKind::Operation("verification"))?;
            Ok(print_verify(&report))
        },
        Command::Collections => {
            let collections = group.collections().await.or_raise(|| ErrorKind::Operation("listing collections"))?;
            for collection in collections {
                let started = collection.started_at.format(&Rfc3339).unwrap_or_default();
                let finished = match collection.finished_at {
                    Some(finished) => finished.format(&Rfc3339).unwrap_or_default(),
                    None => "unfinished".to_string(),
                };
                println!(
                    "{:>6}  {started}  {finished}  {} files, {} new ({} bytes)",
                    collection.id,
                    collection.totals.total_files,
                    collection.totals.new_files,
                    collection.totals.new_bytes,
                );
            }
            Ok(0)
        },
    }
}

fn print_issues(heading: &str, issues: &[Issue]) -> usize {
    if !issues.is_empty() {
        println!("{heading}:");
        for issue in issues {
            println!("  {issue}");
        }
    }
    issues.len()
}

fn print_backup(report: &BackupReport) -> usize {
    if let Some(collection) = report.collection {
        println!("collection {collection}");
    }
    println!(
        "{} new, {} changed, {} unchanged ({} to hash)",
        report.new,
        report.changed,
        report.unchanged,
        report.queued()
    );
    if report.collection.is_some() {
        println!(
            "{} hashed, {} already stored, {} new contents ({} bytes), {} vanished",
            report.hashed, report.deduplicated, report.new_contents, report.new_bytes, report.vanished
        );
        for archive in &report.archives {
            println!("wrote {archive}");
        }
    }
    print_issues("issues", &report.issues)
}

fn print_restore(report: &RestoreReport, preview: bool) -> usize {
    if preview {
        for path in &report.paths {
            println!("{}", path.display());
        }
        println!("{} matched", report.matched);
        return 0;
    }
    println!("{} matched, {} restored", report.matched, report.restored);
    print_issues("caveats", &report.caveats);
    print_issues("issues", &report.issues)
}

fn print_compact(report: &CompactReport) -> usize {
    match report.cutoff {
        None => println!("no collection is old enough to compact"),
        Some(cutoff) => println!(
            "cutoff {cutoff}: {} archives removed, {} stripped, {} contents and {} files expired ({} bytes)",
            report.removed_archives.len(),
            report.stripped_archives.len(),
            report.deleted_contents,
            report.deleted_files,
            report.reclaimed_bytes,
        ),
    }
    print_issues("issues", &report.issues)
}

fn print_verify(report: &VerifyReport) -> usize {
    println!("{} of {} archives passed", report.passed, report.checked);
    for name in &report.safe_to_delete {
        println!("no longer needed: {name}");
    }
    print_issues("reclaimable with a thorough compaction", &report.reclaimable);
    print_issues("issues", &report.issues)
}
