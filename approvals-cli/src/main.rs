//! Approvals CLI: operator terminal for the invoice approval workflow engine.
//!
//! Every subcommand opens the workspace's SQLite database, runs one
//! operation through the approval router, and prints the result.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;

/// Route vendor invoices through multi-level approval workflows
#[derive(Parser, Debug)]
#[command(name = "approvals", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Entity (legal company) to operate on
    #[arg(short, long, default_value = "default")]
    entity: String,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Create the workspace config and database
    Init,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage approval rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },
    /// Manage invoices
    Invoice {
        #[command(subcommand)]
        action: InvoiceAction,
    },
    /// Submit a draft invoice for approval
    Submit {
        invoice: Uuid,
        /// Submitting user
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        notes: Option<String>,
    },
    /// Approve the current step of a workflow
    Approve {
        invoice: Uuid,
        workflow: Uuid,
        step: u32,
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        notes: Option<String>,
    },
    /// Reject a workflow at its current step
    Reject {
        invoice: Uuid,
        workflow: Uuid,
        step: u32,
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        reason: String,
    },
    /// Recall an active workflow (submitter only)
    Recall {
        invoice: Uuid,
        workflow: Uuid,
        #[arg(short, long)]
        user: String,
    },
    /// Delegate the current step to another user
    Delegate {
        workflow: Uuid,
        step: u32,
        /// User handing off the step
        #[arg(short, long)]
        user: String,
        /// User receiving the step
        #[arg(short, long)]
        to: String,
        #[arg(short, long)]
        reason: String,
    },
    /// Reassign the current step (approval admins only)
    Reassign {
        workflow: Uuid,
        step: u32,
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        to: String,
    },
    /// List steps awaiting a user
    Pending {
        #[arg(short, long)]
        user: String,
    },
    /// Show the steps of an invoice's active workflow
    Steps { invoice: Uuid },
    /// Show the audit trail of an invoice or workflow
    History {
        invoice: Uuid,
        /// Restrict to one workflow
        #[arg(long)]
        workflow: Option<Uuid>,
    },
    /// List current steps past their due date
    Overdue,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default workspace configuration file
    Init,
    /// Show the current configuration
    Show,
}

#[derive(clap::Subcommand, Debug)]
enum RuleAction {
    /// Add an approval rule
    Add {
        /// Rule name, unique per entity
        name: String,
        /// amount_based, vendor_based, or department_based
        #[arg(short = 't', long = "type")]
        rule_type: String,
        /// Approver role per step, in order (repeatable)
        #[arg(short, long = "step", required = true)]
        steps: Vec<String>,
        /// Lower values are evaluated first
        #[arg(short, long, default_value = "0")]
        priority: i32,
        /// Inclusive lower amount bound, in minor units
        #[arg(long)]
        min: Option<i64>,
        /// Exclusive upper amount bound, in minor units
        #[arg(long)]
        max: Option<i64>,
        #[arg(long)]
        vendor: Option<String>,
        #[arg(long)]
        department: Option<String>,
    },
    /// List rules in evaluation order
    List {
        /// Include inactive rules
        #[arg(short, long)]
        all: bool,
    },
    /// Deactivate a rule without deleting it
    Disable { id: Uuid },
    /// Delete a rule
    Remove { id: Uuid },
}

#[derive(clap::Subcommand, Debug)]
enum InvoiceAction {
    /// Record a draft invoice
    Add {
        vendor: String,
        number: String,
        /// Line as ACCOUNT:AMOUNT[:TAX[:DEPARTMENT]] (repeatable)
        #[arg(short, long = "line", required = true)]
        lines: Vec<String>,
        /// Description applied to every line
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Show an invoice
    Show { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| cli.workspace.clone());

    let config = approvals_core::config::load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    // Optional JSON file layer
    let mut _guard = None;
    let json_layer = config.logging.json_dir.as_ref().and_then(|dir| {
        let dir = if dir.is_absolute() {
            dir.clone()
        } else {
            workspace.join(dir)
        };
        std::fs::create_dir_all(&dir).ok()?;
        let file_appender = tracing_appender::rolling::daily(&dir, "approvals.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _guard = Some(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug")),
        )
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    tracing::debug!(workspace = %workspace.display(), entity = %cli.entity, "Configuration loaded");

    commands::handle_command(cli.command, config, &workspace, &cli.entity).await
}
