//! Versioned schema migrations.
//!
//! A migration is an ordered list of [`Step`]s. The store records the version
//! of the last applied step; [`migrate`] applies every later step in
//! ascending order, each in its own transaction together with its version
//! marker. A crash between steps therefore resumes at the first step that
//! did not commit.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{DatabaseError, IndexRead, IndexStore, IndexTransaction, tables};

tables! {
    /// Version of the last applied migration step.
    pub SchemaVersion: () => u64 = "schema_version";
}

/// A step body. Must be idempotent: it may run again if the process stops
/// before the step's transaction commits.
pub type StepFn = Box<dyn Fn(&mut IndexTransaction) -> Result<(), DatabaseError> + Send + Sync>;

/// One migration step.
pub struct Step {
    pub version: u64,
    pub name: &'static str,
    pub apply: StepFn,
}

impl Step {
    pub fn new<F>(version: u64, name: &'static str, apply: F) -> Self
    where
        F: Fn(&mut IndexTransaction) -> Result<(), DatabaseError> + Send + Sync + 'static,
    {
        Self {
            version,
            name,
            apply: Box::new(apply),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish()
    }
}

/// Errors raised while migrating.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("migration steps must be non-empty with strictly ascending versions starting at 1")]
    InvalidVersions,

    #[error("store is at version {found}, newer than the latest known step {latest}")]
    UnknownVersion { found: u64, latest: u64 },

    #[error("migration step {version} ({name}) failed: {source}")]
    Step {
        version: u64,
        name: &'static str,
        #[source]
        source: DatabaseError,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Checks that step versions are strictly ascending, starting at 1.
pub fn validate_versions(steps: &[Step]) -> Result<(), MigrationError> {
    let mut expected_min = 1;
    if steps.is_empty() {
        return Err(MigrationError::InvalidVersions);
    }
    for step in steps {
        if step.version < expected_min {
            return Err(MigrationError::InvalidVersions);
        }
        expected_min = step.version + 1;
    }
    Ok(())
}

/// Latest version recorded in the store, `0` if none.
pub fn version(store: &dyn IndexStore) -> Result<u64, DatabaseError> {
    Ok(store.get::<SchemaVersion>(&())?.unwrap_or(0))
}

/// Applies every step newer than the recorded version. Stops at the first
/// failing step, leaving later steps unapplied. Returns the final version.
pub fn migrate(store: &Arc<dyn IndexStore>, steps: &[Step]) -> Result<u64, MigrationError> {
    validate_versions(steps)?;
    let latest = steps.last().map_or(0, |s| s.version);

    let mut current = version(store.as_ref())?;
    if current > latest {
        return Err(MigrationError::UnknownVersion {
            found: current,
            latest,
        });
    }

    let applied = current;
    for step in steps.iter().filter(|s| s.version > applied) {
        debug!(version = step.version, name = step.name, "applying migration step");

        let mut tx = IndexTransaction::new(store.clone());
        (step.apply)(&mut tx).map_err(|source| MigrationError::Step {
            version: step.version,
            name: step.name,
            source,
        })?;
        tx.put::<SchemaVersion>(&(), &step.version)?;
        tx.commit().map_err(|source| MigrationError::Step {
            version: step.version,
            name: step.name,
            source,
        })?;

        current = step.version;
        info!(version = current, name = step.name, "migration step applied");
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::MemoryStore;
    use assert_matches::assert_matches;

    tables! {
        Marks: u64 => () = "marks";
    }

    fn mark(version: u64) -> Step {
        Step::new(version, "mark", move |tx| tx.put::<Marks>(&version, &()))
    }

    #[test]
    fn test_validate_versions() {
        assert!(validate_versions(&[mark(1), mark(2), mark(5)]).is_ok());
        assert_matches!(validate_versions(&[]), Err(MigrationError::InvalidVersions));
        assert_matches!(
            validate_versions(&[mark(2), mark(2)]),
            Err(MigrationError::InvalidVersions)
        );
        assert_matches!(validate_versions(&[mark(0)]), Err(MigrationError::InvalidVersions));
    }

    #[test]
    fn test_migrate_applies_pending_steps_once() {
        let store: Arc<dyn IndexStore> = Arc::new(MemoryStore::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let steps = vec![
            mark(1),
            Step::new(2, "count", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ];

        assert_eq!(migrate(&store, &steps).unwrap(), 2);
        assert_eq!(migrate(&store, &steps).unwrap(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(store.has::<Marks>(&1).unwrap());
    }

    #[test]
    fn test_migrate_resumes_after_recorded_version() {
        let store: Arc<dyn IndexStore> = Arc::new(MemoryStore::new());
        assert_eq!(migrate(&store, &[mark(1)]).unwrap(), 1);
        let mut tx = IndexTransaction::new(store.clone());
        tx.delete::<Marks>(&1);
        tx.commit().unwrap();

        assert_eq!(migrate(&store, &[mark(1), mark(2), mark(3)]).unwrap(), 3);
        // step 1 is not applied again
        assert!(!store.has::<Marks>(&1).unwrap());
        assert!(store.has::<Marks>(&2).unwrap());
        assert!(store.has::<Marks>(&3).unwrap());
    }

    #[test]
    fn test_failing_step_halts_migration() {
        let store: Arc<dyn IndexStore> = Arc::new(MemoryStore::new());
        let steps = vec![
            mark(1),
            Step::new(2, "broken", |tx| {
                tx.put::<Marks>(&2, &())?;
                Err(DatabaseError::Other("boom".into()))
            }),
            mark(3),
        ];

        assert_matches!(
            migrate(&store, &steps),
            Err(MigrationError::Step { version: 2, .. })
        );
        assert_eq!(version(store.as_ref()).unwrap(), 1);
        assert!(!store.has::<Marks>(&2).unwrap());
        assert!(!store.has::<Marks>(&3).unwrap());
    }

    #[test]
    fn test_store_newer_than_steps() {
        let store: Arc<dyn IndexStore> = Arc::new(MemoryStore::new());
        migrate(&store, &[mark(1), mark(2)]).unwrap();
        assert_matches!(
            migrate(&store, &[mark(1)]),
            Err(MigrationError::UnknownVersion { found: 2, latest: 1 })
        );
    }
}
