//! Standalone access to the in-job tools.
//!
//! The same verbs jobs reach through the `hit` command dispatch are
//! exposed as ordinary subcommands operating on the process environment
//! and working directory, so scripts outside a build can reuse them.

use std::collections::BTreeMap;
use std::io::Write;

use clap::Parser;

use hdist_builder::BuildTools;
use hdist_runner::{HitContext, HitDispatcher};

use crate::{CliError, Context};

/// Pass-through arguments for an in-job tool verb.
#[derive(Parser, Debug)]
pub struct ToolArgs {
    /// Arguments forwarded to the tool.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub rest: Vec<String>,
}

pub fn run(ctx: &Context, verb: &str, args: ToolArgs) -> Result<(), CliError> {
    let cwd = std::env::current_dir()
        .map_err(|e| CliError::user(format!("cannot determine cwd: {e}")))?;
    let env: BTreeMap<String, String> = std::env::vars().collect();

    let source_cache = ctx.source_cache()?;
    let tools = BuildTools {
        source_cache: &source_cache,
    };

    let mut argv = vec![verb.to_string()];
    argv.extend(args.rest);

    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    let mut hit_ctx = HitContext {
        env: &env,
        cwd: &cwd,
        logger: &ctx.logger,
        stdout: &mut handle,
    };
    tools
        .dispatch(&mut hit_ctx, &argv)
        .map_err(|e| CliError::user(e.to_string()))?;
    handle.flush().ok();
    Ok(())
}
