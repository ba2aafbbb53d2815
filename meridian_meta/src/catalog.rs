//! Timestamp-versioned schema catalog.

use crate::Schema;
use meridian_types::{Error, Result, Timestamp};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Maps a timestamp to the schema that was authoritative at that instant.
///
/// Each installed schema is valid from its DDL commit timestamp until the
/// next one is installed. Snapshots are copy-on-write: readers hold an
/// `Arc<Schema>` and are unaffected by later installs.
#[derive(Debug, Default)]
pub struct VersionedCatalog {
    schemas: RwLock<BTreeMap<Timestamp, Arc<Schema>>>,
}

impl VersionedCatalog {
    /// An empty catalog. At least one schema must be installed before reads.
    pub fn new() -> Self {
        VersionedCatalog::default()
    }

    /// A catalog whose initial schema is valid from the epoch.
    pub fn with_initial(schema: Schema) -> Self {
        let catalog = VersionedCatalog::new();
        let mut guard = catalog.schemas.write().unwrap();
        guard.insert(Timestamp::from_micros(0), Arc::new(schema));
        drop(guard);
        catalog
    }

    /// The schema whose validity interval contains `ts`.
    pub fn get_schema(&self, ts: Timestamp) -> Result<Arc<Schema>> {
        let guard = self.schemas.read().unwrap();
        guard
            .range(..=ts)
            .next_back()
            .map(|(_, schema)| Arc::clone(schema))
            .ok_or_else(|| Error::NotFound(format!("no schema is valid at {ts}")))
    }

    /// The newest schema.
    pub fn latest_schema(&self) -> Result<Arc<Schema>> {
        let guard = self.schemas.read().unwrap();
        guard
            .values()
            .next_back()
            .map(Arc::clone)
            .ok_or_else(|| Error::NotFound("catalog is empty".to_owned()))
    }

    /// Install `schema` as authoritative from `commit_ts` onward. The commit
    /// timestamp must be newer than every installed schema.
    pub fn install(&self, commit_ts: Timestamp, schema: Schema) -> Result<()> {
        let mut guard = self.schemas.write().unwrap();
        if let Some((&last, _)) = guard.iter().next_back() {
            if commit_ts <= last {
                return Err(Error::Internal(format!(
                    "schema install at {commit_ts} is not newer than {last}"
                )));
            }
        }
        info!(generation = schema.generation(), %commit_ts, "installing schema");
        guard.insert(commit_ts, Arc::new(schema));
        Ok(())
    }
}
