//! Local store schema migrations.

use std::ops::ControlFlow;

use vertex_storage::{
    DatabaseError, IndexRead, IndexTransaction, Query,
    migration::Step,
};
use vertex_swarm_primitives::ChunkAddress;

use crate::{
    cache::{CacheEntry, CacheOrder},
    now_nanos,
    reserve::Epoch,
};

/// Every local store migration step, in order.
pub fn steps() -> Vec<Step> {
    vec![
        Step::new(1, "reset epoch", reset_epoch),
        Step::new(2, "refresh cache access times", refresh_cache_access),
    ]
}

/// Forgets the last sweep so the next one starts at bin 0.
pub fn reset_epoch(tx: &mut IndexTransaction) -> Result<(), DatabaseError> {
    tx.delete::<Epoch>(&());
    Ok(())
}

/// Gives every cache entry a fresh access time and rebuilds the access
/// order, keeping the previous relative order.
pub fn refresh_cache_access(tx: &mut IndexTransaction) -> Result<(), DatabaseError> {
    let mut entries: Vec<(u64, ChunkAddress)> = Vec::new();
    tx.iterate::<CacheEntry, DatabaseError, _>(&Query::all(), |address, accessed| {
        entries.push((accessed, address));
        Ok(ControlFlow::Continue(()))
    })?;

    let mut stale = Vec::new();
    tx.iterate::<CacheOrder, DatabaseError, _>(&Query::all(), |key, ()| {
        stale.push(key);
        Ok(ControlFlow::Continue(()))
    })?;
    for key in &stale {
        tx.delete::<CacheOrder>(key);
    }

    entries.sort_unstable();
    let now = now_nanos();
    for (i, (_, address)) in entries.into_iter().enumerate() {
        let accessed = now + i as u64;
        tx.put::<CacheEntry>(&address, &accessed)?;
        tx.put::<CacheOrder>(&(accessed, address), &())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::reserve::EpochItem;
    use vertex_storage::{IndexStore, MemoryStore, migration};

    fn store() -> Arc<dyn IndexStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_steps_are_valid() {
        migration::validate_versions(&steps()).unwrap();
    }

    #[test]
    fn test_migrate_empty_store() {
        let store = store();
        assert_eq!(migration::migrate(&store, &steps()).unwrap(), 2);
        assert_eq!(store.count::<CacheEntry>().unwrap(), 0);
    }

    #[test]
    fn test_reset_epoch() {
        let store = store();
        let mut tx = IndexTransaction::new(store.clone());
        tx.put::<Epoch>(&(), &EpochItem { timestamp: 1, bin: 4 }).unwrap();
        tx.commit().unwrap();

        let mut tx = IndexTransaction::new(store.clone());
        reset_epoch(&mut tx).unwrap();
        tx.commit().unwrap();

        assert!(!store.has::<Epoch>(&()).unwrap());
    }

    #[test]
    fn test_refresh_cache_access_keeps_order() {
        let store = store();
        let a = ChunkAddress::new([0xaa; 32]);
        let b = ChunkAddress::new([0x11; 32]);

        // entries from an older layout without a matching order index
        let mut tx = IndexTransaction::new(store.clone());
        tx.put::<CacheEntry>(&a, &5).unwrap();
        tx.put::<CacheEntry>(&b, &9).unwrap();
        tx.put::<CacheOrder>(&(1, a), &()).unwrap();
        tx.commit().unwrap();

        let mut tx = IndexTransaction::new(store.clone());
        refresh_cache_access(&mut tx).unwrap();
        tx.commit().unwrap();

        let order: Vec<_> = store
            .page::<CacheOrder>(&Query::all(), 10)
            .unwrap()
            .into_iter()
            .map(|((accessed, address), ())| (accessed, address))
            .collect();
        assert_eq!(order.len(), 2);
        assert_eq!(order[0].1, a);
        assert_eq!(order[1].1, b);
        assert_eq!(store.get::<CacheEntry>(&a).unwrap(), Some(order[0].0));
        assert!(order[0].0 > 9);
    }
}
