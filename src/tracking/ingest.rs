//! Recording sightings and answering name queries
//!
//! The synchronous methods do the storage and lookup I/O on the calling
//! thread. The async methods move that work onto tokio's blocking pool so
//! the caller's executor is never stalled by a slow provider or disk.

use super::policy::HistoryPolicy;
use crate::geolocation::GeoLookup;
use crate::models::{ConnectEvent, UserProfile};
use crate::persistence::{StorageBackend, StorageError};
use chrono::{DateTime, SubsecRound, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Errors from the async operations
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result of recording one sighting
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// The profile as saved
    pub profile: UserProfile,
    /// The address was not in the history before this sighting
    pub new_address: bool,
}

/// Records address sightings into a storage backend
pub struct AddressTracker {
    store: Arc<dyn StorageBackend>,
    lookup: Option<Arc<dyn GeoLookup>>,
    policy: HistoryPolicy,
}

impl AddressTracker {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        lookup: Option<Arc<dyn GeoLookup>>,
        policy: HistoryPolicy,
    ) -> Self {
        AddressTracker {
            store,
            lookup,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn StorageBackend> {
        &self.store
    }

    /// Record a sighting now
    pub fn record(&self, event: &ConnectEvent) -> Result<IngestOutcome, StorageError> {
        self.record_at(event, Utc::now())
    }

    /// Record a sighting at an explicit time
    ///
    /// `now` is truncated to milliseconds, the precision both backends store.
    pub fn record_at(
        &self,
        event: &ConnectEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, StorageError> {
        let now = now.trunc_subsecs(3);
        let mut profile = match self.store.load(&event.id)? {
            Some(profile) => profile,
            None => {
                log::info!("First sighting of {} ({})", event.name, event.id);
                UserProfile::new(&event.id, &event.name)
            }
        };

        let new_address = self.policy.apply(
            &mut profile,
            &event.name,
            &event.address,
            now,
            self.lookup.as_deref(),
        );

        self.store.save(&profile)?;
        log::info!(
            "Recorded {} for {} ({}, {} in history)",
            event.address,
            event.name,
            if new_address { "new address" } else { "known address" },
            profile.history.len()
        );

        Ok(IngestOutcome {
            profile,
            new_address,
        })
    }

    /// Find a stored profile by display name, ignoring case
    pub fn find_by_name(&self, name: &str) -> Result<Option<UserProfile>, StorageError> {
        self.store.find_by_name(name)
    }

    /// Record a sighting off the async executor
    pub async fn ingest(self: Arc<Self>, event: ConnectEvent) -> Result<IngestOutcome, IngestError> {
        let outcome = tokio::task::spawn_blocking(move || self.record(&event)).await??;
        Ok(outcome)
    }

    /// Look a profile up by name off the async executor
    pub async fn query(self: Arc<Self>, name: String) -> Result<Option<UserProfile>, IngestError> {
        let profile = tokio::task::spawn_blocking(move || self.find_by_name(&name)).await??;
        Ok(profile)
    }
}
