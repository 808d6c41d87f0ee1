//! Epoch-based deferred reclamation of released slots.
//!
//! Every reader registers the epoch current at its start. Releasing a slot
//! stamps it with the current epoch and advances the epoch. A released slot
//! becomes reusable once every active reader started after the release.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;

use crate::Location;

#[derive(Debug, Default)]
struct State {
    epoch: u64,
    /// Active reader count per start epoch.
    readers: BTreeMap<u64, usize>,
    /// Released locations with their release epoch, oldest first.
    limbo: VecDeque<(u64, Location)>,
}

impl State {
    fn drain_reclaimable(&mut self) -> Vec<Location> {
        let oldest_reader = self.readers.keys().next().copied().unwrap_or(u64::MAX);
        let mut ready = Vec::new();
        while let Some((released, _)) = self.limbo.front() {
            if *released >= oldest_reader {
                break;
            }
            if let Some((_, location)) = self.limbo.pop_front() {
                ready.push(location);
            }
        }
        ready
    }
}

#[derive(Debug, Default)]
pub(crate) struct Reclaimer {
    state: Mutex<State>,
}

impl Reclaimer {
    /// Registers a reader, returning its epoch.
    pub(crate) fn enter(&self) -> u64 {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        *state.readers.entry(epoch).or_default() += 1;
        epoch
    }

    /// Unregisters a reader; returns locations that became reusable.
    pub(crate) fn exit(&self, epoch: u64) -> Vec<Location> {
        let mut state = self.state.lock();
        if let Some(count) = state.readers.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&epoch);
            }
        }
        state.drain_reclaimable()
    }

    /// Queues released locations; returns those reusable right away.
    pub(crate) fn release(&self, locations: impl IntoIterator<Item = Location>) -> Vec<Location> {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        state.epoch += 1;
        state
            .limbo
            .extend(locations.into_iter().map(|location| (epoch, location)));
        state.drain_reclaimable()
    }

    /// Empties the limbo regardless of readers.
    pub(crate) fn drain_all(&self) -> Vec<Location> {
        let mut state = self.state.lock();
        state.limbo.drain(..).map(|(_, location)| location).collect()
    }

    pub(crate) fn pending(&self) -> usize {
        self.state.lock().limbo.len()
    }
}
