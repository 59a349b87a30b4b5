//! Initialization helpers for `.chaos/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ControllerConfig, write_config};

pub const EXPERIMENT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/experiment/v1.schema.json"
));

/// All canonical paths within `.chaos/` for a project root.
#[derive(Debug, Clone)]
pub struct ChaosPaths {
    pub root: PathBuf,
    pub chaos_dir: PathBuf,
    pub experiments_dir: PathBuf,
    pub journal_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub schema_path: PathBuf,
    pub lock_path: PathBuf,
}

impl ChaosPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let chaos_dir = root.join(".chaos");
        Self {
            root: root.clone(),
            chaos_dir: chaos_dir.clone(),
            experiments_dir: chaos_dir.join("experiments"),
            journal_dir: chaos_dir.join("journal"),
            gitignore_path: chaos_dir.join(".gitignore"),
            config_path: chaos_dir.join("config.toml"),
            schema_path: chaos_dir.join("experiment.schema.json"),
            lock_path: chaos_dir.join("store.lock"),
        }
    }

    pub fn experiment_path(&self, id: &str) -> PathBuf {
        self.experiments_dir.join(format!("{id}.json"))
    }

    pub fn journal_path(&self, id: &str) -> PathBuf {
        self.journal_dir.join(format!("{id}.jsonl"))
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite the config and schema files.
    pub force: bool,
}

/// Create `.chaos/` scaffolding in `root`.
///
/// Fails if `.chaos/` already exists unless `options.force` is set. Existing
/// experiment records are never touched.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<ChaosPaths> {
    let paths = ChaosPaths::new(root);
    if paths.chaos_dir.exists() && !paths.chaos_dir.is_dir() {
        return Err(anyhow!("chaosctl init: .chaos exists but is not a directory"));
    }
    if paths.chaos_dir.exists() && !options.force {
        return Err(anyhow!(
            "chaosctl init: .chaos already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.chaos_dir)?;
    create_dir(&paths.experiments_dir)?;
    create_dir(&paths.journal_dir)?;

    write_file(&paths.gitignore_path, CHAOS_GITIGNORE)?;
    write_file(&paths.schema_path, EXPERIMENT_SCHEMA)?;
    write_config(&paths.config_path, &ControllerConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const CHAOS_GITIGNORE: &str = "journal/\nstore.lock\n*.tmp\n";
