//! `vertex db` subcommands.
//!
//! These work on the index and blob store directly, without starting the
//! local store's background workers. Nothing else may have the data
//! directory open.

use std::{ops::ControlFlow, path::Path, sync::Arc};

use eyre::{Result, WrapErr, bail};
use tracing::{info, warn};
use vertex_storage::{IndexRead, IndexStore, IndexTransaction, Query, migration};
use vertex_storage_slab::Slab;
use vertex_swarm_primitives::MAX_CHUNK_DATA_SIZE;
use vertex_swarm_storer::{
    SLAB_DIR, StorerError,
    cache::CacheEntry,
    chunkstore,
    migration::{reset_epoch, steps},
    open_index,
    pinning::PinCounter,
    reserve::{BINS, Epoch, Radius, ReserveEntry},
    validate,
};

use crate::{cli::DbCommand, config::VertexConfig};

pub(crate) fn run(command: DbCommand, config: &VertexConfig) -> Result<()> {
    let dir = config.datadir.as_path();
    if !dir.exists() {
        bail!("data directory {} does not exist", dir.display());
    }
    let index = open_index(dir, false).wrap_err("failed to open index")?;

    let result = match command {
        DbCommand::Info => print_info(&index),
        DbCommand::Validate => run_validate(&index, dir, config.localstore.shards),
        DbCommand::Migrate => run_migrate(&index),
        DbCommand::ResetEpoch => run_reset_epoch(&index),
    };
    index.close().wrap_err("failed to close index")?;
    result
}

fn print_info(index: &Arc<dyn IndexStore>) -> Result<()> {
    let latest = steps().last().map_or(0, |step| step.version);
    let version = migration::version(index.as_ref())?;

    let mut bins = [0u64; BINS];
    index.iterate::<ReserveEntry, StorerError, _>(&Query::all(), |_, item| {
        if let Some(count) = bins.get_mut(item.bin as usize) {
            *count += 1;
        }
        Ok(ControlFlow::Continue(()))
    })?;

    println!("schema version: {version} (latest {latest})");
    println!("chunks:         {}", chunkstore::count(index.as_ref())?);
    println!("cached:         {}", index.count::<CacheEntry>()?);
    println!("reserved:       {}", bins.iter().sum::<u64>());
    println!("pinned:         {}", index.count::<PinCounter>()?);
    println!("radius:         {}", index.get::<Radius>(&())?.unwrap_or(0));
    match index.get::<Epoch>(&())? {
        Some(epoch) => println!("epoch:          bin {} at {}", epoch.bin, epoch.timestamp),
        None => println!("epoch:          none"),
    }
    for (bin, count) in bins.iter().enumerate().filter(|(_, count)| **count > 0) {
        println!("  bin {bin:>2}: {count}");
    }
    Ok(())
}

fn run_validate(index: &Arc<dyn IndexStore>, dir: &Path, shards: u8) -> Result<()> {
    let slab = Slab::open(dir.join(SLAB_DIR), shards, MAX_CHUNK_DATA_SIZE)
        .wrap_err("failed to open blob store")?;
    if slab.needs_recovery() {
        warn!("blob store was not closed cleanly, rebuilding free slots");
        slab.recover(chunkstore::used_locations(index.as_ref())?)?;
    }

    let report = validate(index.as_ref(), &slab);
    slab.close().wrap_err("failed to close blob store")?;
    let report = report?;

    println!(
        "checked {} chunks ({} cached, {} reserved, {} pinned)",
        report.chunks, report.cached, report.reserved, report.pinned
    );
    for problem in &report.problems {
        println!("  {problem}");
    }
    if !report.is_ok() {
        bail!("{} inconsistencies found", report.problems.len());
    }
    println!("ok");
    Ok(())
}

fn run_migrate(index: &Arc<dyn IndexStore>) -> Result<()> {
    let before = migration::version(index.as_ref())?;
    let after = migration::migrate(index, &steps()).wrap_err("migration failed")?;
    if before == after {
        println!("schema already at version {after}");
    } else {
        info!(from = before, to = after, "schema migrated");
        println!("schema migrated from version {before} to {after}");
    }
    Ok(())
}

fn run_reset_epoch(index: &Arc<dyn IndexStore>) -> Result<()> {
    let mut tx = IndexTransaction::new(index.clone());
    reset_epoch(&mut tx)?;
    tx.commit()?;
    println!("epoch reset, the next sweep starts at bin 0");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vertex_swarm_storer::reserve::EpochItem;

    fn config(dir: &Path) -> VertexConfig {
        let mut config = VertexConfig::default();
        config.datadir = dir.to_path_buf();
        config.localstore.shards = 2;
        config
    }

    #[test]
    fn test_missing_datadir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir.path().join("absent"));
        assert!(run(DbCommand::Info, &config).is_err());
    }

    #[test]
    fn test_migrate_then_validate_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        run(DbCommand::Migrate, &config).unwrap();
        run(DbCommand::Validate, &config).unwrap();
        run(DbCommand::Info, &config).unwrap();

        let index = open_index(dir.path(), false).unwrap();
        assert_eq!(migration::version(index.as_ref()).unwrap(), 2);
    }

    #[test]
    fn test_reset_epoch() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = open_index(dir.path(), false).unwrap();
            let mut tx = IndexTransaction::new(index.clone());
            tx.put::<Epoch>(&(), &EpochItem { timestamp: 1, bin: 3 }).unwrap();
            tx.commit().unwrap();
            index.close().unwrap();
        }

        run(DbCommand::ResetEpoch, &config(dir.path())).unwrap();

        let index = open_index(dir.path(), false).unwrap();
        assert!(index.get::<Epoch>(&()).unwrap().is_none());
    }
}
