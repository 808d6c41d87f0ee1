//! Reserve sweeps, radius maintenance and the background worker.
//!
//! A sweep walks bins from the last epoch's bin upwards. Bins below the
//! target radius are emptied. From there, chunks are evicted oldest first
//! until the population is back within capacity, moving to the next bin
//! whenever one empties. Evicted chunks are handed to the cache. Entries
//! with equal admission time are evicted in address order.
//!
//! An emptied bin is closed: the radius moves past it in the transaction
//! that removes its last entries, so a put racing the sweep either lands
//! before the close and is evicted with the bin, or is refused.

use std::{sync::Arc, sync::atomic::Ordering, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vertex_storage::{IndexRead, Query};
use vertex_swarm_primitives::{ChunkAddress, MAX_PO};

use super::{Epoch, EpochItem, Radius, Reserve, ReserveOrder};
use crate::{
    cache::Cache,
    error::{StorerError, StorerResult},
    now_nanos,
    transaction::Transaction,
};

/// What a sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub old_radius: u8,
    pub radius: u8,
}

impl Reserve {
    /// Evicts until the population is within capacity and every bin below
    /// `target` is empty, then persists the new radius and epoch.
    pub async fn sweep(
        &self,
        cancel: &CancellationToken,
        cache: &Cache,
        target: u8,
    ) -> StorerResult<SweepReport> {
        let _sweeping = self.sweeping.lock().await;
        let target = target.min(MAX_PO);
        let old_radius = self.radius();
        let start = self.epoch()?.map_or(0, |epoch| epoch.bin);
        debug!(start, target, size = self.size(), "reserve sweep started");

        let mut evicted = 0;
        for bin in start..target {
            evicted += self.evict_from_bin(cancel, cache, bin, u64::MAX).await?;
            evicted += self.close_bin(cancel, cache, bin).await?;
        }

        let mut bin = start.max(target);
        while self.is_over_capacity() {
            let excess = self.size() - self.capacity;
            evicted += self.evict_from_bin(cancel, cache, bin, excess).await?;
            if self.bin_size(bin) > 0 || bin == MAX_PO {
                break;
            }
            evicted += self.close_bin(cancel, cache, bin).await?;
            bin += 1;
        }

        let radius = self.radius().max(target);
        self.set_radius(cancel, old_radius, radius).await?;

        if evicted > 0 {
            self.metrics.reserve_evicted_total.increment(evicted as u64);
            self.events.reserve_evicted(evicted, radius);
        }
        debug!(evicted, radius, size = self.size(), "reserve sweep finished");

        Ok(SweepReport {
            evicted,
            old_radius,
            radius,
        })
    }

    /// Lowers the radius by one when the reserve is less than half full.
    /// Returns the new radius if it moved.
    pub async fn maybe_decrease_radius(&self, cancel: &CancellationToken) -> StorerResult<Option<u8>> {
        let _sweeping = self.sweeping.lock().await;
        let radius = self.radius();
        if radius == 0 || self.size() >= self.capacity / 2 {
            return Ok(None);
        }
        self.set_radius(cancel, radius, radius - 1).await?;
        Ok(Some(radius - 1))
    }

    /// Persists `radius` and an epoch marking bins below it as empty, and
    /// announces the move from `old`.
    async fn set_radius(&self, cancel: &CancellationToken, old: u8, radius: u8) -> StorerResult<()> {
        let epoch = EpochItem {
            timestamp: now_nanos(),
            bin: radius,
        };
        let counters = self.counters.clone();
        self.storage
            .run(cancel, |tx| {
                tx.index_mut().put::<Radius>(&(), &radius)?;
                tx.index_mut().put::<Epoch>(&(), &epoch)?;
                let counters = counters.clone();
                tx.on_commit(move || counters.radius.store(radius, Ordering::Release));
                Ok(())
            })
            .await?;

        if old != radius {
            info!(old, new = radius, "storage radius changed");
            self.metrics.reserve_radius.set(radius as f64);
            self.events.radius_changed(old, radius);
        }
        Ok(())
    }

    /// Evicts whatever is left in `bin` and raises the radius past it in the
    /// same transaction. Puts check the radius under the write lock, so none
    /// can land in `bin` once this commits.
    async fn close_bin(&self, cancel: &CancellationToken, cache: &Cache, bin: u8) -> StorerResult<usize> {
        let counters = self.counters.clone();
        let removed = self
            .storage
            .run(cancel, |tx| {
                // the write lock is held, so the committed view is current
                let left = self
                    .storage
                    .index()
                    .page::<ReserveOrder>(&Query::prefix(bin), usize::MAX)?;
                let removed = self.demote(tx, cache, &left)?;

                let radius = self.radius().max(bin.saturating_add(1)).min(MAX_PO);
                tx.index_mut().put::<Radius>(&(), &radius)?;
                let counters = counters.clone();
                tx.on_commit(move || counters.radius.store(radius, Ordering::Release));
                Ok(removed)
            })
            .await?;
        if removed > 0 {
            debug!(bin, removed, "late arrivals evicted while closing bin");
        }
        Ok(removed)
    }

    /// Evicts up to `max` of the oldest chunks in `bin`, handing them to
    /// the cache.
    async fn evict_from_bin(
        &self,
        cancel: &CancellationToken,
        cache: &Cache,
        bin: u8,
        max: u64,
    ) -> StorerResult<usize> {
        let mut evicted = 0usize;
        while (evicted as u64) < max && self.bin_size(bin) > 0 {
            let want = (max - evicted as u64).min(self.sweep_batch as u64) as usize;
            let oldest = self
                .storage
                .index()
                .page::<ReserveOrder>(&Query::prefix(bin), want)?;
            if oldest.is_empty() {
                break;
            }

            let removed = self
                .storage
                .run(cancel, |tx| self.demote(tx, cache, &oldest))
                .await?;
            if removed == 0 {
                break;
            }
            evicted += removed;
        }
        Ok(evicted)
    }

    /// Moves the given reserve entries to the cache.
    fn demote(
        &self,
        tx: &mut Transaction,
        cache: &Cache,
        entries: &[((u8, u64, ChunkAddress), ())],
    ) -> StorerResult<usize> {
        let mut removed = 0;
        for ((_, _, address), ()) in entries {
            if self.remove_entry(tx, address)?.is_some() {
                cache.demote(tx, address)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Spawns the reserve worker: sweeps when woken over capacity and on
    /// every `interval` tick, and lowers the radius when underpopulated.
    pub fn spawn(
        self: &Arc<Self>,
        cache: Arc<Cache>,
        cancel: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        let reserve = self.clone();
        tokio::spawn(async move {
            loop {
                let tick = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = reserve.wake.notified() => false,
                    _ = tokio::time::sleep(interval) => true,
                };

                let result = if reserve.is_over_capacity() {
                    reserve
                        .sweep(&cancel, &cache, reserve.radius())
                        .await
                        .map(drop)
                } else if tick {
                    reserve.maybe_decrease_radius(&cancel).await.map(drop)
                } else {
                    Ok(())
                };

                match result {
                    Ok(()) | Err(StorerError::Cancelled) => {}
                    Err(err) if err.is_integrity() => error!(%err, "reserve maintenance failed"),
                    Err(err) => warn!(%err, "reserve maintenance failed"),
                }
            }
            debug!("reserve worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        events::StorerEvent,
        reserve::{
            PutOutcome,
            tests::{chunk_in_bin, harness, put},
        },
    };
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_sweep_empties_lowest_bin_first() {
        let h = harness(6);
        let mut by_bin = BTreeMap::new();
        for bin in 0u8..3 {
            for i in 0..4 {
                let chunk = chunk_in_bin(bin, bin as u32 * 100 + i);
                put(&h, &chunk).await.unwrap();
                by_bin.entry(bin).or_insert_with(Vec::new).push(*chunk.address());
            }
        }
        assert_eq!(h.reserve.size(), 12);

        let report = h.reserve.sweep(&CancellationToken::new(), &h.cache, 0).await.unwrap();

        assert_eq!(report.evicted, 6);
        // bin 0 is gone entirely, bin 1 lost its two oldest
        assert_eq!(h.reserve.bin_size(0), 0);
        assert_eq!(h.reserve.bin_size(1), 2);
        assert_eq!(h.reserve.bin_size(2), 4);
        assert_eq!(report.radius, 1);
        assert_eq!(h.reserve.radius(), 1);

        for address in &by_bin[&1][..2] {
            assert!(!h.reserve.has(address).unwrap());
            // demoted, not dropped
            assert!(h.cache.contains(address).unwrap());
        }
        for address in &by_bin[&1][2..] {
            assert!(h.reserve.has(address).unwrap());
        }
    }

    #[tokio::test]
    async fn test_sweep_persists_epoch_and_announces_radius() {
        let h = harness(2);
        let mut events = h.reserve.events.subscribe();
        for i in 0..3 {
            put(&h, &chunk_in_bin(0, i)).await.unwrap();
        }
        for i in 0..2 {
            put(&h, &chunk_in_bin(1, 10 + i)).await.unwrap();
        }

        let report = h.reserve.sweep(&CancellationToken::new(), &h.cache, 0).await.unwrap();
        assert_eq!(report.radius, 1);

        let epoch = h.reserve.epoch().unwrap().unwrap();
        assert_eq!(epoch.bin, 1);
        assert_eq!(h.storage.index().get::<Radius>(&()).unwrap(), Some(1));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&StorerEvent::RadiusChanged { old: 0, new: 1 }));
        assert!(seen.contains(&StorerEvent::ReserveEvicted { count: 3, radius: 1 }));
    }

    #[tokio::test]
    async fn test_sweep_to_target_evicts_bins_below_it() {
        let h = harness(100);
        for bin in 0u8..4 {
            put(&h, &chunk_in_bin(bin, bin as u32)).await.unwrap();
        }

        let report = h.reserve.sweep(&CancellationToken::new(), &h.cache, 2).await.unwrap();

        assert_eq!(report.evicted, 2);
        assert_eq!(report.radius, 2);
        assert_eq!(h.reserve.bin_sizes()[..4], [0, 0, 1, 1]);
        assert_matches!(
            put(&h, &chunk_in_bin(1, 99)).await,
            Err(StorerError::OutOfRadius { bin: 1, radius: 2 })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_puts_during_sweep_never_stay_below_radius() {
        let h = harness(10);
        for i in 0..20 {
            put(&h, &chunk_in_bin(0, i)).await.unwrap();
        }
        for i in 0..400 {
            put(&h, &chunk_in_bin(1, 1_000 + i)).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let sweep = h.reserve.sweep(&cancel, &h.cache, 0);
        let late_puts = async {
            let mut outcomes = Vec::new();
            for i in 0..50 {
                outcomes.push(put(&h, &chunk_in_bin(0, 10_000 + i)).await);
                tokio::task::yield_now().await;
            }
            outcomes
        };
        let (report, outcomes) = tokio::join!(sweep, late_puts);
        let report = report.unwrap();

        for outcome in outcomes {
            assert_matches!(
                outcome,
                Ok(PutOutcome::Stored { bin: 0, .. }) | Err(StorerError::OutOfRadius { bin: 0, radius: 1 })
            );
        }
        assert_eq!(report.radius, 1);
        assert_eq!(h.reserve.bin_size(0), 0);
        assert!(h.storage.index().page::<ReserveOrder>(&Query::prefix(0u8), 1).unwrap().is_empty());
        assert!(h.reserve.size() <= 10);

        // nothing is left behind for a later sweep to trip over
        let bin1 = h.reserve.bin_size(1);
        let again = h.reserve.sweep(&cancel, &h.cache, h.reserve.radius()).await.unwrap();
        assert_eq!(again.evicted, 0);
        assert_eq!(h.reserve.bin_size(1), bin1);
    }

    #[tokio::test]
    async fn test_radius_decreases_when_underpopulated() {
        let h = harness(100);
        for bin in 0u8..3 {
            put(&h, &chunk_in_bin(bin, bin as u32)).await.unwrap();
        }
        let cancel = CancellationToken::new();
        h.reserve.sweep(&cancel, &h.cache, 2).await.unwrap();
        assert_eq!(h.reserve.radius(), 2);

        assert_eq!(h.reserve.maybe_decrease_radius(&cancel).await.unwrap(), Some(1));
        assert_eq!(h.reserve.radius(), 1);
        assert_eq!(h.reserve.epoch().unwrap().unwrap().bin, 1);
        put(&h, &chunk_in_bin(1, 50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_sweeps_when_woken() {
        let h = harness(2);
        let reserve = Arc::new(h.reserve);
        let cache = Arc::new(h.cache);
        let cancel = CancellationToken::new();
        let worker = reserve.spawn(cache.clone(), cancel.clone(), Duration::from_secs(3600));

        for i in 0..4 {
            h.storage
                .run(&cancel, |tx| reserve.put(tx, &cache, &chunk_in_bin(0, i)))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while reserve.is_over_capacity() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        worker.await.unwrap();
        assert!(reserve.size() <= 2);
    }
}
