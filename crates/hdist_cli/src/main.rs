//! `hit` — the hdist command-line frontend.
//!
//! Provides `hit build` for running build specs against the store,
//! `hit resolve`/`hit purge` for store management, `hit fetch`/`hit put`/
//! `hit unpack` for the source cache, and the in-job tools
//! (`build-unpack-sources`, `build-write-files`, `create-links`,
//! `build-postprocess`) as standalone commands.

#![warn(missing_docs)]

mod build;
mod source;
mod store;
mod tools;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

/// Exit code for user errors (bad flags, guarded operations).
pub const EXIT_USER_ERROR: i32 = 1;

/// Exit code for missing resources.
pub const EXIT_NOT_FOUND: i32 = 2;

/// hit — content-addressed build artifact manager.
#[derive(Parser, Debug)]
#[command(name = "hit", version, about = "hdist build artifact manager")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose (debug-level) output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Store root directory (holding `hdist.toml`); defaults to
    /// `$HDIST_ROOT` or the current directory.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a spec (or return the existing artifact).
    Build(build::BuildArgs),
    /// Resolve an artifact ID to its directory.
    Resolve(store::ResolveArgs),
    /// Delete one artifact.
    Delete(store::DeleteArgs),
    /// Remove every artifact and all cached sources.
    Purge(store::PurgeArgs),
    /// Download an archive into the source cache.
    Fetch(source::FetchArgs),
    /// Store local files under a `files:` key.
    Put(source::PutArgs),
    /// Unpack a cached source into a directory.
    Unpack(source::UnpackArgs),
    /// Unpack the sources listed in a build spec into the cwd.
    #[command(name = "build-unpack-sources")]
    BuildUnpackSources(tools::ToolArgs),
    /// Materialize inline files from a spec document.
    #[command(name = "build-write-files")]
    BuildWriteFiles(tools::ToolArgs),
    /// Apply the links DSL from a spec document.
    #[command(name = "create-links")]
    CreateLinks(tools::ToolArgs),
    /// Post-process an artifact tree.
    #[command(name = "build-postprocess")]
    BuildPostprocess(tools::ToolArgs),
}

/// Shared handles the commands operate on.
pub struct Context {
    /// Loaded (or defaulted) configuration, paths resolved.
    pub config: hdist_config::StoreConfig,
    /// The job/build logger.
    pub logger: hdist_logging::Logger,
}

impl Context {
    /// Opens the artifact store from the configuration.
    pub fn store(&self) -> Result<hdist_store::BuildStore, CliError> {
        Ok(hdist_store::BuildStore::open(
            &self.config.store.build_temp,
            &self.config.store.db,
            &self.config.store.artifacts,
            &self.config.store.artifact_pattern,
        )?)
    }

    /// Opens the source cache from the configuration.
    pub fn source_cache(&self) -> Result<hdist_source_cache::SourceCache, CliError> {
        Ok(hdist_source_cache::SourceCache::with_mirrors(
            &self.config.source_cache.path,
            self.config.source_cache.mirrors.clone(),
        )?)
    }
}

/// Error wrapper mapping every failure onto an exit code.
#[derive(Debug)]
pub struct CliError {
    /// Message printed to stderr.
    pub message: String,
    /// Process exit code.
    pub code: i32,
}

impl CliError {
    /// A user error (exit code 1).
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: EXIT_USER_ERROR,
        }
    }

    /// A missing resource (exit code 2).
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: EXIT_NOT_FOUND,
        }
    }
}

impl From<hdist_store::StoreError> for CliError {
    fn from(e: hdist_store::StoreError) -> Self {
        CliError::user(e.to_string())
    }
}

impl From<hdist_source_cache::SourceCacheError> for CliError {
    fn from(e: hdist_source_cache::SourceCacheError) -> Self {
        let code = match &e {
            hdist_source_cache::SourceCacheError::KeyNotFound { .. } => EXIT_NOT_FOUND,
            _ => EXIT_USER_ERROR,
        };
        CliError {
            message: e.to_string(),
            code,
        }
    }
}

impl From<hdist_builder::BuildError> for CliError {
    fn from(e: hdist_builder::BuildError) -> Self {
        // Subprocess failures surface with the subprocess's own code.
        let code = e.exit_code().unwrap_or(EXIT_USER_ERROR);
        CliError {
            message: e.to_string(),
            code,
        }
    }
}

impl From<hdist_config::ConfigError> for CliError {
    fn from(e: hdist_config::ConfigError) -> Self {
        CliError::user(e.to_string())
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {}", e.message);
            process::exit(e.code);
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let root = cli
        .root
        .or_else(|| std::env::var_os("HDIST_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let config = load_or_default(&root)?;

    let level = if cli.quiet {
        hdist_logging::Level::Error
    } else if cli.verbose {
        hdist_logging::Level::Debug
    } else {
        hdist_logging::Level::Info
    };
    let ctx = Context {
        config,
        logger: hdist_logging::Logger::new(level),
    };

    match cli.command {
        Command::Build(args) => build::run(&ctx, args),
        Command::Resolve(args) => store::resolve(&ctx, args),
        Command::Delete(args) => store::delete(&ctx, args),
        Command::Purge(args) => store::purge(&ctx, args),
        Command::Fetch(args) => source::fetch(&ctx, args),
        Command::Put(args) => source::put(&ctx, args),
        Command::Unpack(args) => source::unpack(&ctx, args),
        Command::BuildUnpackSources(args) => tools::run(&ctx, "build-unpack-sources", args),
        Command::BuildWriteFiles(args) => tools::run(&ctx, "build-write-files", args),
        Command::CreateLinks(args) => tools::run(&ctx, "create-links", args),
        Command::BuildPostprocess(args) => tools::run(&ctx, "build-postprocess", args),
    }
}

/// Loads `hdist.toml` when present; otherwise uses defaults rooted at
/// `root`.
fn load_or_default(root: &std::path::Path) -> Result<hdist_config::StoreConfig, CliError> {
    if root.join("hdist.toml").exists() {
        Ok(hdist_config::load_config(root)?)
    } else {
        let mut config = hdist_config::StoreConfig::default();
        config.resolve_relative_to(root);
        Ok(config)
    }
}
