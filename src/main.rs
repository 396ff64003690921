//! # ReportClaw
//! Scheduled report delivery from the command line.
//!
//! Usage:
//!   reportclaw run                                   # Trigger loop + dispatcher (daemon)
//!   reportclaw item create --name KPIs --project p1 --chart c1 --cron "0 9 * * *" --email a@x.com
//!   reportclaw item list --project p1
//!   reportclaw submit <item-id>                      # Run an item now
//!   reportclaw export --project p1 --chart c1 --sheet <spreadsheet-id>
//!   reportclaw history <item-id>
//!   reportclaw overview --project p1
//!   reportclaw retry <task-id>

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use reportclaw_channels::{
    HttpReportRenderer, HttpSpreadsheetUploader, SmtpEmailTransport, WebhookChatTransport,
};
use reportclaw_core::config::ReportClawConfig;
use reportclaw_core::types::{
    Action, Actor, AdHocExport, Cadence, DeliveryFormat, Destination, ItemDraft, ItemId, OrgRole,
    ScheduledItem, Subject, Target, TaskId,
};
use reportclaw_scheduler::query::{self, JobTree};
use reportclaw_scheduler::{
    ExecutorRegistry, JobTicket, RoleGate, SchedulerEngine, SubmitRequest,
};

#[derive(Parser)]
#[command(
    name = "reportclaw",
    version,
    about = "📅 ReportClaw — scheduled report delivery"
)]
struct Cli {
    /// Config file (default: ~/.reportclaw/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Acting user id
    #[arg(long, global = true, default_value = "local")]
    user: String,

    /// Acting user's organization
    #[arg(long, global = true, default_value = "default")]
    org: String,

    /// Acting user's organization role
    #[arg(long, global = true, value_enum, default_value = "admin")]
    role: RoleArg,

    /// Extra capability, `action:subject[:project]` (e.g. `manage:export_csv:p1`)
    #[arg(long = "grant", global = true, value_parser = parse_grant)]
    grants: Vec<GrantArg>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Viewer,
    Editor,
    Admin,
}

impl From<RoleArg> for OrgRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Viewer => OrgRole::Viewer,
            RoleArg::Editor => OrgRole::Editor,
            RoleArg::Admin => OrgRole::Admin,
        }
    }
}

#[derive(Clone)]
struct GrantArg {
    action: Action,
    subject: Subject,
    project_id: Option<String>,
}

fn parse_grant(raw: &str) -> std::result::Result<GrantArg, String> {
    let mut parts = raw.splitn(3, ':');
    let action = match parts.next() {
        Some("view") => Action::View,
        Some("manage") => Action::Manage,
        other => return Err(format!("unknown action '{}'", other.unwrap_or_default())),
    };
    let subject = match parts.next() {
        Some("scheduled_delivery") => Subject::ScheduledDelivery,
        Some("export_csv") => Subject::ExportCsv,
        other => return Err(format!("unknown subject '{}'", other.unwrap_or_default())),
    };
    let project_id = parts.next().filter(|p| !p.is_empty()).map(str::to_string);
    Ok(GrantArg {
        action,
        subject,
        project_id,
    })
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Manage scheduled items
    Item {
        #[command(subcommand)]
        action: ItemCommand,
    },
    /// Run a scheduled item now (works for paused items too)
    Submit { item_id: ItemId },
    /// One-off export of a chart or dashboard into a spreadsheet
    Export {
        #[arg(long)]
        project: String,
        #[arg(long)]
        chart: Option<String>,
        #[arg(long)]
        dashboard: Option<String>,
        /// Spreadsheet id
        #[arg(long)]
        sheet: String,
        #[arg(long)]
        tab: Option<String>,
        #[arg(long)]
        title: Option<String>,
    },
    /// Job history of an item, newest first
    History {
        item_id: ItemId,
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Every item with its next run and latest job
    Overview {
        #[arg(long)]
        project: Option<String>,
    },
    /// Retry a job (root task id) or one failed delivery (delivery task id)
    Retry { task_id: TaskId },
}

#[derive(Subcommand)]
enum ItemCommand {
    /// Create a scheduled item
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        chart: Option<String>,
        #[arg(long)]
        dashboard: Option<String>,
        #[arg(long, default_value = "csv")]
        format: DeliveryFormat,
        /// Cron expression or macro (`@daily`, `@weekly`, ...)
        #[arg(long)]
        cron: String,
        /// `UTC`, a fixed offset such as `+07:00` or an IANA zone such as `Europe/Berlin`
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Comma-separated recipients of one email delivery (repeatable)
        #[arg(long)]
        email: Vec<String>,
        /// Chat channel name or webhook URL (repeatable)
        #[arg(long)]
        chat: Vec<String>,
        /// Spreadsheet target `id` or `id/tab` (repeatable)
        #[arg(long)]
        sheet: Vec<String>,
        /// Create disabled
        #[arg(long)]
        paused: bool,
    },
    /// List live items
    List {
        #[arg(long)]
        project: Option<String>,
    },
    Pause { item_id: ItemId },
    Resume { item_id: ItemId },
    /// Soft-delete; history stays queryable
    Delete { item_id: ItemId },
}

fn destinations(email: Vec<String>, chat: Vec<String>, sheet: Vec<String>) -> Vec<Destination> {
    let mut out = Vec::new();
    for list in email {
        out.push(Destination::Email {
            recipients: list
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect(),
        });
    }
    for channel in chat {
        out.push(Destination::Chat { channel });
    }
    for target in sheet {
        let (spreadsheet_id, tab) = match target.split_once('/') {
            Some((id, tab)) => (id.to_string(), Some(tab.to_string())),
            None => (target.clone(), None),
        };
        out.push(Destination::Spreadsheet {
            spreadsheet_id,
            tab,
        });
    }
    out
}

fn init_logging(config: &ReportClawConfig, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn open_engine(config: &ReportClawConfig) -> Result<SchedulerEngine> {
    let executors = ExecutorRegistry::with_builtins(
        Arc::new(HttpReportRenderer::new(config.render.clone())),
        Arc::new(SmtpEmailTransport::new(config.email.clone())),
        Arc::new(WebhookChatTransport::new(config.chat.clone())),
        Arc::new(HttpSpreadsheetUploader::new(config.spreadsheet.clone())),
    );
    SchedulerEngine::open(&config.scheduler, executors, Arc::new(RoleGate))
        .context("failed to open scheduler database")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_item(item: &ScheduledItem) {
    println!(
        "{}  {:<24} {}:{} {:<5} {:<16} {} {}",
        item.id,
        item.name,
        item.target.kind(),
        item.target.reference(),
        item.format.label(),
        item.cadence.expression,
        item.cadence.timezone,
        if item.enabled { "" } else { "(paused)" },
    );
    for destination in &item.destinations {
        println!("    → {}", destination.describe());
    }
}

fn print_tree(tree: &JobTree) {
    let root = &tree.root.task;
    println!(
        "{}  {} @ {}  [{}] {}",
        root.id,
        root.kind.label(),
        root.scheduled_time.format("%Y-%m-%d %H:%M:%S UTC"),
        root.status,
        tree.health(),
    );
    if let Some(error) = &root.error {
        println!("    ❌ {error}");
    }
    if let Some(retry_of) = root.retry_of {
        println!("    ↻ retry of {retry_of}");
    }
    for child in &tree.children {
        let task = &child.task;
        println!(
            "    {}  {:<20} {:<40} [{}]",
            task.id,
            task.kind.label(),
            task.destination
                .as_ref()
                .map(|d| d.describe())
                .unwrap_or_default(),
            task.status,
        );
        if let Some(error) = &task.error {
            println!("        ❌ {error}");
        }
    }
}

/// Wait for a job started from the CLI and print its tree.
async fn finish(engine: &SchedulerEngine, ticket: JobTicket, json: bool) -> Result<()> {
    let job_id = ticket.wait().await?;
    let tree = query::job_tree(engine.store(), job_id).await?;
    if json {
        print_json(&tree)
    } else {
        print_tree(&tree);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string());
            ReportClawConfig::load_from(&path)?
        }
        None => ReportClawConfig::load()?,
    };
    init_logging(&config, cli.verbose);

    let mut actor = Actor::new(&cli.user, &cli.org, cli.role.into());
    for grant in &cli.grants {
        actor = actor.with_grant(grant.action, grant.subject, grant.project_id.as_deref());
    }

    let engine = open_engine(&config)?;
    let json = cli.json;

    match cli.command {
        Command::Run => {
            let handle = engine.spawn().await?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down scheduler");
            handle.shutdown();
        }
        Command::Item { action } => match action {
            ItemCommand::Create {
                name,
                project,
                chart,
                dashboard,
                format,
                cron,
                timezone,
                email,
                chat,
                sheet,
                paused,
            } => {
                let item = engine.registry().create(
                    &actor,
                    ItemDraft {
                        name,
                        project_id: project,
                        chart,
                        dashboard,
                        format,
                        cadence: Cadence::new(&cron, &timezone),
                        destinations: destinations(email, chat, sheet),
                        enabled: !paused,
                    },
                )?;
                if json {
                    print_json(&item)?;
                } else {
                    println!("✅ Created scheduled item:");
                    print_item(&item);
                    if let Some(next) = engine.registry().next_run(item.id, chrono::Utc::now())? {
                        println!("    next run: {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
                    }
                }
            }
            ItemCommand::List { project } => {
                let items = engine.registry().list(project.as_deref())?;
                if json {
                    print_json(&items)?;
                } else if items.is_empty() {
                    println!("No scheduled items.");
                } else {
                    items.iter().for_each(print_item);
                }
            }
            ItemCommand::Pause { item_id } => {
                engine.registry().pause(&actor, item_id)?;
                println!("⏸️  Paused {item_id}");
            }
            ItemCommand::Resume { item_id } => {
                engine.registry().resume(&actor, item_id)?;
                println!("▶️  Resumed {item_id}");
            }
            ItemCommand::Delete { item_id } => {
                engine.registry().delete(&actor, item_id)?;
                println!("🗑️  Deleted {item_id}");
            }
        },
        Command::Submit { item_id } => {
            let ticket = engine
                .submissions()
                .submit(SubmitRequest::Item(item_id), &actor)
                .await?;
            finish(&engine, ticket, json).await?;
        }
        Command::Export {
            project,
            chart,
            dashboard,
            sheet,
            tab,
            title,
        } => {
            let export = AdHocExport {
                organization_id: actor.organization_id.clone(),
                project_id: project,
                target: Target::from_parts(chart, dashboard)?,
                spreadsheet_id: sheet,
                tab,
                title,
            };
            let ticket = engine
                .submissions()
                .submit(SubmitRequest::AdHoc(export), &actor)
                .await?;
            finish(&engine, ticket, json).await?;
        }
        Command::History { item_id, limit } => {
            let trees = query::history(engine.store(), item_id, limit).await?;
            if json {
                print_json(&trees)?;
            } else if trees.is_empty() {
                println!("No jobs yet.");
            } else {
                trees.iter().for_each(print_tree);
            }
        }
        Command::Overview { project } => {
            let rows = query::overview(
                engine.registry(),
                engine.store(),
                project.as_deref(),
                chrono::Utc::now(),
            )
            .await?;
            if json {
                print_json(&rows)?;
            } else {
                for row in &rows {
                    println!(
                        "{}  {:<24} {:<24} {:<5} by {}{}",
                        row.item_id,
                        row.name,
                        row.target,
                        row.format,
                        row.owner,
                        if row.enabled { "" } else { " (paused)" },
                    );
                    if let Some(next) = row.next_run {
                        println!("    next run: {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
                    }
                    match &row.latest_job {
                        None => println!("    No jobs yet"),
                        Some(job) => {
                            println!(
                                "    {} @ {}  [{}] {}",
                                job.kind.label(),
                                job.scheduled_time.format("%Y-%m-%d %H:%M:%S UTC"),
                                job.status,
                                job.health,
                            );
                            for delivery in &job.deliveries {
                                println!(
                                    "      {:<20} {:<40} [{}]",
                                    delivery.kind.label(),
                                    delivery.destination,
                                    delivery.status,
                                );
                            }
                        }
                    }
                }
            }
        }
        Command::Retry { task_id } => {
            let ticket = engine.submissions().retry(task_id, &actor).await?;
            finish(&engine, ticket, json).await?;
        }
    }

    Ok(())
}
