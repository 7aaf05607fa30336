//! imagectl - build, verify and prune bootable cloud images
//!
//! ## Commands
//!
//! - `all`: build, verify, then apply retention
//! - `build`: build an image and print its id
//! - `test`: boot an image on a throwaway server and smoke-test it
//! - `clean`: keep the newest tagged images, delete the rest
//! - `list`: show tagged images
//! - `purge`: delete every tagged image after confirmation

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cloud_registry::{HcloudClient, ImageArtifact, ImageId, DEFAULT_ENDPOINT};
use image_lifecycle::preflight::{self, Need};
use image_lifecycle::{
    BootWait, PackerCli, Pipeline, PipelineConfig, PipelineReport, PurgeOutcome,
    ReconcileReport, SshShell, VerificationReport,
};
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, warn, Level};

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
/// Conventional exit status after SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "imagectl")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, verify and prune bootable cloud images", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by every command. Each has an environment fallback.
#[derive(Args, Debug)]
struct Settings {
    /// Cloud API token
    #[arg(long, env = "HCLOUD_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Cloud API base URL
    #[arg(long, env = "HCLOUD_ENDPOINT", default_value = DEFAULT_ENDPOINT, global = true)]
    endpoint: String,

    /// Server type of the throwaway test instance
    #[arg(long, env = "IMAGECTL_SERVER_TYPE", default_value = "cx22", global = true)]
    server_type: String,

    /// Location of the throwaway test instance
    #[arg(long, env = "IMAGECTL_LOCATION", default_value = "nbg1", global = true)]
    location: String,

    /// Number of tagged images to keep
    #[arg(long, env = "IMAGECTL_KEEP", default_value_t = image_lifecycle::DEFAULT_KEEP, global = true)]
    keep: usize,

    /// Directory holding the packer template
    #[arg(long, env = "IMAGECTL_TEMPLATE_DIR", default_value = "packer", global = true)]
    template_dir: PathBuf,

    /// Packer binary
    #[arg(long, env = "IMAGECTL_PACKER", default_value = "packer", global = true)]
    packer: PathBuf,

    /// Remote user for smoke tests
    #[arg(long, env = "IMAGECTL_SSH_USER", default_value = "root", global = true)]
    ssh_user: String,

    /// Private key for smoke tests
    #[arg(long, env = "IMAGECTL_SSH_KEY", global = true)]
    ssh_key: Option<PathBuf>,

    /// Project SSH key names injected into the test instance
    #[arg(long, env = "IMAGECTL_SSH_KEY_NAMES", value_delimiter = ',', global = true)]
    ssh_key_name: Vec<String>,

    /// Provenance label value (`created_by=<label>`)
    #[arg(long, env = "IMAGECTL_LABEL", default_value = image_lifecycle::DEFAULT_PROVENANCE, global = true)]
    label: String,

    /// Fixed boot wait before the first probe
    #[arg(long, env = "IMAGECTL_BOOT_WAIT_SECS", default_value_t = 60, global = true)]
    boot_wait_secs: u64,

    /// Poll SSH until it answers instead of waiting a fixed period
    #[arg(long, global = true)]
    boot_poll: bool,

    /// Poll interval with --boot-poll
    #[arg(long, default_value_t = 5, global = true)]
    poll_interval_secs: u64,

    /// Give up polling after this long
    #[arg(long, default_value_t = 180, global = true)]
    boot_timeout_secs: u64,
}

impl Settings {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default().with_keep(self.keep);
        config.api.token = self.token.clone();
        config.api.endpoint = self.endpoint.clone();
        config.provenance = self.label.clone();

        config.build.tool = self.packer.clone();
        config.build.template_dir = self.template_dir.clone();

        config.verify.server_type = self.server_type.clone();
        config.verify.location = Some(self.location.clone()).filter(|l| !l.is_empty());
        config.verify.ssh_key_names = self.ssh_key_name.clone();
        config.verify.ssh.user = self.ssh_user.clone();
        config.verify.ssh.identity_file = self.ssh_key.clone();

        let boot = if self.boot_poll {
            BootWait::Poll {
                interval_secs: self.poll_interval_secs,
                timeout_secs: self.boot_timeout_secs,
            }
        } else {
            BootWait::Fixed {
                secs: self.boot_wait_secs,
            }
        };
        config.with_boot_wait(boot)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build, verify, then apply retention
    All,

    /// Build an image and print the new artifact id
    Build,

    /// Boot an image on a throwaway server and smoke-test it
    Test {
        /// Image id (default: latest tagged image)
        #[arg(long)]
        image: Option<ImageId>,
    },

    /// Keep the newest tagged images, delete the rest
    Clean {
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// List tagged images, newest first
    List {
        /// Print a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Delete every tagged image
    Purge {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

impl Commands {
    fn needs(&self) -> &'static [Need] {
        match self {
            Commands::All => Need::FULL,
            Commands::Build => Need::BUILD,
            Commands::Test { .. } => Need::VERIFY,
            Commands::Clean { .. } | Commands::List { .. } | Commands::Purge { .. } => {
                Need::REGISTRY
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    image_lifecycle::init_tracing(cli.json_logs, level);

    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let status = runtime.block_on(supervise(run(cli), async {
        // If the handler cannot be installed, never report an interrupt.
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }));

    // An abandoned stdin read may still occupy a blocking thread; do not
    // wait for it.
    runtime.shutdown_background();
    ExitCode::from(status)
}

fn runtime() -> io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

/// Race `work` against `interrupt` and map the winner to an exit status.
async fn supervise<W, I>(work: W, interrupt: I) -> u8
where
    W: Future<Output = Result<()>>,
    I: Future<Output = ()>,
{
    tokio::select! {
        result = work => match result {
            Ok(()) => EXIT_SUCCESS,
            Err(e) => {
                error!(error = %format!("{e:#}"), "imagectl failed");
                eprintln!("Error: {e:#}");
                EXIT_FAILURE
            }
        },
        _ = interrupt => {
            warn!("interrupted; in-flight work was abandoned");
            EXIT_INTERRUPTED
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.settings.pipeline_config();
    let pipeline = build_pipeline(config, cli.command.needs())?;

    match cli.command {
        Commands::All => cmd_all(&pipeline).await,
        Commands::Build => cmd_build(&pipeline).await,
        Commands::Test { image } => cmd_test(&pipeline, image).await,
        Commands::Clean { dry_run } => cmd_clean(&pipeline, dry_run).await,
        Commands::List { json } => cmd_list(&pipeline, json).await,
        Commands::Purge { yes } => cmd_purge(&pipeline, yes).await,
    }
}

/// Wire real collaborators. Preflight runs first so a missing token is
/// reported alongside every other missing prerequisite.
fn build_pipeline(config: PipelineConfig, needs: &[Need]) -> Result<Pipeline> {
    preflight::check(&config, needs)?;

    let client_config = config
        .api
        .client_config()
        .context("API token is missing or empty")?;
    let client = HcloudClient::new(client_config).context("Failed to create cloud API client")?;
    let packer = PackerCli::new(&config.build.tool, &config.build.template_dir);
    let shell = SshShell::new(config.verify.ssh.clone());

    Ok(Pipeline::new(
        config,
        Arc::new(client),
        Arc::new(packer),
        Arc::new(shell),
    ))
}

/// Build, verify, retain
async fn cmd_all(pipeline: &Pipeline) -> Result<()> {
    let report = pipeline.run_all().await.context("Pipeline failed")?;
    print_artifact(&report);
    if let Some(verification) = &report.verification {
        print_verification(verification);
    }
    if let Some(reconciled) = &report.reconcile {
        print_reconcile(reconciled);
    }
    println!("Done in {}s", report.duration_ms() / 1000);
    Ok(())
}

async fn cmd_build(pipeline: &Pipeline) -> Result<()> {
    let report = pipeline.build().await.context("Build failed")?;
    print_artifact(&report);
    Ok(())
}

async fn cmd_test(pipeline: &Pipeline, image: Option<ImageId>) -> Result<()> {
    let report = pipeline.test(image).await.context("Verification failed")?;
    if let Some(verification) = &report.verification {
        print_verification(verification);
    }
    Ok(())
}

async fn cmd_clean(pipeline: &Pipeline, dry_run: bool) -> Result<()> {
    let report = pipeline.clean(dry_run).await.context("Cleanup failed")?;
    if let Some(reconciled) = &report.reconcile {
        print_reconcile(reconciled);
    }
    Ok(())
}

async fn cmd_list(pipeline: &Pipeline, json: bool) -> Result<()> {
    let artifacts = pipeline.list().await.context("Failed to list images")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&artifacts)?);
        return Ok(());
    }

    if artifacts.is_empty() {
        println!("No images labelled {}", pipeline.config().provenance_label());
        return Ok(());
    }
    print_artifact_table(&artifacts);
    Ok(())
}

/// Purge deletes exactly the set the operator was shown.
async fn cmd_purge(pipeline: &Pipeline, yes: bool) -> Result<()> {
    let shown = pipeline.list().await.context("Failed to list images")?;
    if shown.is_empty() {
        println!("Nothing to purge");
        return Ok(());
    }

    print_artifact_table(&shown);
    let confirmed = if yes {
        true
    } else {
        print!(
            "Delete all {} images labelled {}? Type 'yes' to confirm: ",
            shown.len(),
            pipeline.config().provenance_label()
        );
        io::stdout().flush()?;
        confirm_blocking(io::BufReader::new(io::stdin())).await?
    };

    let outcome = pipeline
        .purge(|current| confirmed && same_ids(current, &shown))
        .await
        .context("Purge failed")?;

    match outcome {
        PurgeOutcome::NothingToPurge => println!("Nothing to purge"),
        PurgeOutcome::Declined { .. } if confirmed => {
            println!("Image set changed since it was listed; nothing deleted. Run purge again.")
        }
        PurgeOutcome::Declined { .. } => println!("Aborted; nothing deleted"),
        PurgeOutcome::Purged(report) => print_reconcile(&report),
    }
    Ok(())
}

/// Read the answer on a blocking thread. Dropping the returned future
/// abandons the read; the thread is reclaimed at runtime shutdown.
async fn confirm_blocking<R>(mut reader: R) -> Result<bool>
where
    R: BufRead + Send + 'static,
{
    let answer = tokio::task::spawn_blocking(move || read_confirmation(&mut reader))
        .await
        .context("Confirmation prompt failed")??;
    Ok(answer)
}

/// `true` only when the first line reads `yes`.
fn read_confirmation(reader: &mut impl BufRead) -> io::Result<bool> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(line.trim() == "yes")
}

fn same_ids(a: &[ImageArtifact], b: &[ImageArtifact]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id == y.id)
}

fn print_artifact(report: &PipelineReport) {
    if let Some(artifact) = &report.artifact {
        println!(
            "Image: {} (id {})",
            report.image_name.as_deref().unwrap_or(&artifact.description),
            artifact.id
        );
    }
}

fn print_artifact_table(artifacts: &[ImageArtifact]) {
    println!("{:<12} {:<32} {:>8}  CREATED", "ID", "DESCRIPTION", "SIZE_GB");
    for artifact in artifacts {
        let size = artifact
            .image_size
            .map(|s| format!("{s:.2}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<32} {:>8}  {}",
            artifact.id,
            artifact.description,
            size,
            artifact.created.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}

fn print_verification(report: &VerificationReport) {
    println!(
        "Verified image {} on {} (server {})",
        report.image_id, report.instance_name, report.instance_id
    );
    for probe in &report.probes {
        let status = if probe.passed { "ok" } else { "WARN" };
        println!("  [{status}] {}", probe.name);
        for line in probe.output.lines().filter(|l| !l.trim().is_empty()) {
            println!("        {line}");
        }
    }
    if !report.ssh_reachable {
        println!("  SSH unreachable; installation checks skipped");
    }
    if !report.cleaned_up() {
        println!(
            "  WARNING: server {} may still exist; delete it manually",
            report.instance_id
        );
    }
}

fn print_reconcile(report: &ReconcileReport) {
    let verb = if report.dry_run { "Would delete" } else { "Deleted" };
    println!("Kept: {:?}", report.kept);
    println!("{verb}: {:?}", report.deleted);
    for failure in &report.failed {
        println!("Failed to delete {}: {}", failure.id, failure.error);
    }
}
