use anyhow::Context;
use clap::{Parser, Subcommand};
use dirpatch::{ApplyOptions, ApplyReport, CancelToken, CreateOptions, PatchSummary};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dirpatch", about = "Create and apply verifiable directory-tree patches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing old and new directories
    Create {
        /// Path to the old (original) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Zstd compression level (0-22, -1 stores payloads uncompressed)
        #[arg(long, short, default_value_t = 3, allow_negative_numbers = true)]
        level: i32,
        /// Descend into symlinked directories instead of recording the links
        #[arg(long)]
        follow_symlinks: bool,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Skip the old/new tree digest checks
        #[arg(long)]
        no_verify: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run a blocking engine call off the async runtime, cancelling it on Ctrl-C.
async fn run_cancellable<T, F>(cancel: CancelToken, job: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> dirpatch::Result<T> + Send + 'static,
{
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping at the next operation boundary...");
            cancel.cancel();
        }
    });
    let result = tokio::task::spawn_blocking(job).await;
    watcher.abort();
    Ok(result.context("engine task panicked")??)
}

fn print_counts(counts: &dirpatch::OperationCounts) {
    println!("  Directories created: {}", counts.directories_added);
    println!("  Files added: {}", counts.files_added);
    println!("  Symlinks added: {}", counts.symlinks_added);
    println!("  Files modified: {}", counts.files_modified);
    println!("  Files moved: {}", counts.files_moved);
    println!("  Paths deleted: {}", counts.paths_deleted);
    println!("  Mode changes: {}", counts.chmod_only);
}

fn print_summary(summary: &PatchSummary) {
    println!("\nPatch created successfully!");
    print_counts(&summary.operations);
    println!("  Payloads: {}", summary.payload_count);
    println!("  Patch size: {} bytes", summary.patch_size);
}

fn print_report(report: &ApplyReport) {
    if report.already_applied {
        println!("\nTarget already matches the patched tree; nothing to do.");
        return;
    }
    println!("\nPatch applied successfully!");
    print_counts(&report.applied);
    println!("  Already in place: {}", report.skipped);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            old,
            new,
            output,
            level,
            follow_symlinks,
            json,
        } => {
            if !json {
                println!("Creating patch...");
                println!("  Old: {}", old.display());
                println!("  New: {}", new.display());
                println!("  Output: {}", output.display());
            }

            let options = CreateOptions {
                compression_level: level,
                follow_symlinks,
                cancel: CancelToken::new(),
            };
            let cancel = options.cancel.clone();
            let start = Instant::now();
            let summary = run_cancellable(cancel, move || {
                dirpatch::create_patch_with(&old, &new, &output, &options)
            })
            .await?;
            let elapsed = start.elapsed();

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
                println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
            }
        }
        Commands::Apply {
            target,
            patch,
            no_verify,
            json,
        } => {
            if !json {
                println!("Applying patch...");
                println!("  Target: {}", target.display());
                println!("  Patch: {}", patch.display());
            }

            let options = ApplyOptions {
                verify: !no_verify,
                cancel: CancelToken::new(),
            };
            let cancel = options.cancel.clone();
            let start = Instant::now();
            let report = run_cancellable(cancel, move || {
                dirpatch::apply_patch_with(&target, &patch, &options)
            })
            .await?;
            let elapsed = start.elapsed();

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
                println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
            }
        }
    }

    Ok(())
}
