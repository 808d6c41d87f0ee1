//! Vertex Swarm local store maintenance tool.

mod cli;
mod commands;
mod config;

use clap::Parser;
use color_eyre::eyre;
use tracing::debug;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();
    vertex_observability::init_logging(&cli.logs)?;

    let config = config::VertexConfig::load(cli.config.as_deref())?.with_overrides(&cli);
    debug!(datadir = %config.datadir.display(), "configuration loaded");

    match cli.command {
        cli::Commands::Db(db) => commands::run(db.command, &config),
    }
}
