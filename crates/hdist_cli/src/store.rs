//! Store management commands: `resolve`, `delete`, `purge`.

use clap::Parser;

use hdist_common::ArtifactId;

use crate::{CliError, Context};

/// Arguments for `hit resolve`.
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// Artifact ID (`name/digest`).
    pub id: String,
}

pub fn resolve(ctx: &Context, args: ResolveArgs) -> Result<(), CliError> {
    let id: ArtifactId = args
        .id
        .parse()
        .map_err(|e| CliError::user(format!("{e}")))?;
    let store = ctx.store()?;
    match store.resolve(&id)? {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => Err(CliError::not_found(format!("artifact {id} is not built"))),
    }
}

/// Arguments for `hit delete`.
#[derive(Parser, Debug)]
pub struct DeleteArgs {
    /// Artifact ID (`name/digest`).
    pub id: String,
}

pub fn delete(ctx: &Context, args: DeleteArgs) -> Result<(), CliError> {
    let id: ArtifactId = args
        .id
        .parse()
        .map_err(|e| CliError::user(format!("{e}")))?;
    let store = ctx.store()?;
    if store.delete(&id)? {
        Ok(())
    } else {
        Err(CliError::not_found(format!("artifact {id} is not built")))
    }
}

/// Arguments for `hit purge`.
#[derive(Parser, Debug)]
pub struct PurgeArgs {
    /// Actually do it.
    #[arg(long)]
    pub force: bool,

    /// Also remove every cached source.
    #[arg(long)]
    pub sources: bool,
}

pub fn purge(ctx: &Context, args: PurgeArgs) -> Result<(), CliError> {
    if !args.force {
        return Err(CliError::user(
            "purge removes every artifact; pass --force to proceed",
        ));
    }
    ctx.store()?.delete_all()?;
    if args.sources {
        ctx.source_cache()?.delete_all()?;
    }
    Ok(())
}
