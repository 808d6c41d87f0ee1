//! Command-line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vertex_observability::LogArgs;

/// Vertex Swarm - local store maintenance
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// Logging configuration (applies to all subcommands).
    #[command(flatten)]
    pub(crate) logs: LogArgs,

    /// Configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    pub(crate) config: Option<PathBuf>,

    /// Data directory holding the index and blob store.
    #[arg(long, global = true, value_name = "DIR")]
    pub(crate) datadir: Option<PathBuf>,

    /// Blob store shard count (must match the store on disk).
    #[arg(long = "localstore.shards", global = true)]
    pub(crate) shards: Option<u8>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Inspect and repair the local store.
    Db(DbArgs),
}

#[derive(Debug, Args)]
pub(crate) struct DbArgs {
    #[command(subcommand)]
    pub(crate) command: DbCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub(crate) enum DbCommand {
    /// Print schema version, populations and radius.
    Info,
    /// Cross-check every index and read back every blob.
    Validate,
    /// Apply pending schema migrations.
    Migrate,
    /// Forget the last sweep so the next one starts from bin 0.
    ResetEpoch,
}
