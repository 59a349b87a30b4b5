//! Chaos-experiment controller CLI.
//!
//! Experiments live under `.chaos/experiments/` as JSON records. Each command
//! loads the project configuration, wires the controller to the AWS CLI (or a
//! fixture inventory), and applies one lifecycle operation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chaosctl::batch::{BatchItem, create_all, execute_top};
use chaosctl::core::status::ExperimentStatus;
use chaosctl::core::types::ExperimentRecord;
use chaosctl::exit_codes;
use chaosctl::io::aws::AwsCli;
use chaosctl::io::clock::SystemClock;
use chaosctl::io::config::{
    ControllerConfig, InventorySource, load_config, resolve_region, resolve_role_arn,
};
use chaosctl::io::init::{ChaosPaths, InitOptions, init_workspace};
use chaosctl::io::inventory::{FixtureInventory, InventoryProvider};
use chaosctl::io::store::{FileStore, StoreError};
use chaosctl::io::submission::load_submission;
use chaosctl::io::tags::EnvOrConfigTags;
use chaosctl::lifecycle::{
    CancelToken, CheckOutcome, Controller, ControllerError, ControllerSettings, Ports,
};
use chaosctl::logging;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "chaosctl",
    version,
    about = "Validate, create, and run fault-injection experiments"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Project root containing `.chaos/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Region override (else CHAOS_REGION, AWS_REGION, config, us-east-1).
    #[arg(long, global = true)]
    region: Option<String>,
    /// Execution role the fault-injection service assumes.
    #[arg(long, global = true)]
    role_arn: Option<String>,
    /// Serve inventory from a JSON fixture instead of the AWS CLI.
    #[arg(long, global = true)]
    inventory_fixture: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.chaos/` with default config and the experiment schema.
    Init {
        /// Overwrite config and schema files.
        #[arg(short, long)]
        force: bool,
    },
    /// Store an experiment definition as a draft.
    Submit { file: PathBuf },
    /// Validate a draft against live inventory without changing it.
    Check { id: String },
    /// Validate a draft and create its fault-injection template.
    Create {
        #[arg(required_unless_present = "all")]
        id: Option<String>,
        /// Create every draft.
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Start a created experiment and poll it until it settles.
    Execute {
        #[arg(required_unless_present = "top")]
        id: Option<String>,
        /// Return as soon as the run has started.
        #[arg(long)]
        no_wait: bool,
        /// Start the first N created experiments in id order.
        #[arg(long, conflicts_with = "id")]
        top: Option<usize>,
    },
    /// Poll a running experiment once.
    Refresh { id: String },
    /// Stop a running experiment.
    Stop { id: String },
    /// Reset a settled experiment to draft.
    Retry { id: String },
    /// Print an experiment record as JSON.
    Show { id: String },
    /// List experiments, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<ExperimentStatus>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(error_code(&err));
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    if let Command::Init { force } = cli.command {
        let paths = init_workspace(&cli.global.root, &InitOptions { force })?;
        println!("initialized {}", paths.chaos_dir.display());
        return Ok(exit_codes::OK);
    }

    let runtime = Runtime::load(&cli.global)?;
    let controller = runtime.controller();
    let cancel = CancelToken::new();
    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Submit { file } => {
            let record = load_submission(&file)?;
            controller.submit(&record)?;
            println!("{}\t{}", record.id, record.status);
            Ok(exit_codes::OK)
        }
        Command::Check { id } => cmd_check(&controller, &id),
        Command::Create { id: Some(id), .. } => {
            Ok(report_record(&controller.create(&id, &cancel)?))
        }
        Command::Create { id: None, .. } => {
            let items = create_all(&controller, runtime.config.max_parallel, &cancel)?;
            Ok(report_batch(&items))
        }
        Command::Execute {
            id: Some(id),
            no_wait,
            ..
        } => Ok(report_record(&controller.execute(&id, !no_wait, &cancel)?)),
        Command::Execute {
            id: None,
            no_wait,
            top,
        } => {
            let items = execute_top(
                &controller,
                top.unwrap_or(1),
                !no_wait,
                runtime.config.max_parallel,
                &cancel,
            )?;
            Ok(report_batch(&items))
        }
        Command::Refresh { id } => Ok(report_record(&controller.refresh(&id)?)),
        Command::Stop { id } => Ok(report_record(&controller.stop(&id)?)),
        Command::Retry { id } => Ok(report_record(&controller.retry(&id)?)),
        Command::Show { id } => {
            print_json(&controller.show(&id)?)?;
            Ok(exit_codes::OK)
        }
        Command::List { status } => {
            for record in controller.list(status)? {
                println!("{}\t{}\t{}", record.id, record.status, record.action_id);
            }
            Ok(exit_codes::OK)
        }
    }
}

/// Owned collaborators for one CLI invocation.
struct Runtime {
    config: ControllerConfig,
    store: FileStore,
    aws: AwsCli,
    fixture: Option<FixtureInventory>,
    tags: EnvOrConfigTags<fn(&str) -> Option<String>>,
    clock: SystemClock,
    settings: ControllerSettings,
}

impl Runtime {
    fn load(global: &GlobalArgs) -> Result<Self> {
        let paths = ChaosPaths::new(&global.root);
        if !paths.chaos_dir.is_dir() {
            bail!(
                "no .chaos/ under {} (run `chaosctl init` first)",
                global.root.display()
            );
        }
        let config = load_config(&paths.config_path)?;
        let env = |key: &str| std::env::var(key).ok();
        let region = resolve_region(global.region.as_deref(), env, &config);
        let role_arn = resolve_role_arn(global.role_arn.as_deref(), env, &config);
        let fixture = match (&global.inventory_fixture, config.inventory.source) {
            (Some(path), _) => Some(FixtureInventory::load(path)?),
            (None, InventorySource::Fixture) => {
                let path = config
                    .inventory
                    .fixture_path
                    .as_deref()
                    .context("inventory.source = \"fixture\" needs inventory.fixture_path")?;
                Some(FixtureInventory::load(&resolve_in_root(&global.root, path))?)
            }
            (None, InventorySource::Aws) => None,
        };
        Ok(Self {
            aws: AwsCli::new(&config.aws, region.clone()),
            settings: ControllerSettings::from_config(&config, region, role_arn),
            tags: EnvOrConfigTags::from_process_env(config.workload_tags.clone()),
            store: FileStore::new(paths),
            clock: SystemClock,
            fixture,
            config,
        })
    }

    fn controller(&self) -> Controller<'_> {
        let inventory: &dyn InventoryProvider = match &self.fixture {
            Some(fixture) => fixture,
            None => &self.aws,
        };
        Controller::new(
            Ports {
                store: &self.store,
                inventory,
                service: &self.aws,
                tags: &self.tags,
                clock: &self.clock,
            },
            self.settings.clone(),
        )
    }
}

fn resolve_in_root(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn cmd_check(controller: &Controller<'_>, id: &str) -> Result<i32> {
    match controller.check(id)? {
        CheckOutcome::Valid(report) => {
            print_json(&report)?;
            Ok(exit_codes::OK)
        }
        CheckOutcome::Invalid(report) => {
            print_json(&report)?;
            Ok(exit_codes::FAILED)
        }
        CheckOutcome::Unavailable { status, detail } => {
            eprintln!("{id}: inventory unavailable ({status}): {detail}");
            Ok(exit_codes::FAILED)
        }
    }
}

/// Print the outcome of a single-experiment operation.
fn report_record(record: &ExperimentRecord) -> i32 {
    println!("{}\t{}", record.id, record.status);
    if record.status.is_failure()
        && let Some(note) = record.last_note()
    {
        eprintln!("{}: {}", record.id, note.message);
        if let Some(remediation) = &note.remediation {
            eprintln!("  hint: {remediation}");
        }
    }
    status_code(record.status)
}

fn report_batch(items: &[BatchItem]) -> i32 {
    let mut code = exit_codes::OK;
    for item in items {
        match &item.outcome {
            Ok(status) => {
                println!("{}\t{}", item.id, status);
                if status.is_failure() {
                    code = exit_codes::FAILED;
                }
            }
            Err(err) => {
                println!("{}\terror", item.id);
                eprintln!("{}: {}", item.id, err);
                code = exit_codes::FAILED;
            }
        }
    }
    code
}

fn status_code(status: ExperimentStatus) -> i32 {
    if status.is_failure() {
        exit_codes::FAILED
    } else {
        exit_codes::OK
    }
}

fn error_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ControllerError>() {
        Some(ControllerError::ForbiddenTransition { .. } | ControllerError::Conflict { .. }) => {
            exit_codes::CONFLICT
        }
        Some(ControllerError::Store(StoreError::AlreadyExists(_))) => exit_codes::CONFLICT,
        _ => exit_codes::INVALID,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
