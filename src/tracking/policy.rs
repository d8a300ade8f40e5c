//! Dedup, ordering and cap rules for a user's address history

use crate::config::Config;
use crate::geolocation::{Enrichment, GeoLookup};
use crate::models::{AddressRecord, UserProfile};
use chrono::{DateTime, Utc};

/// Rules applied to a profile each time its user is seen
#[derive(Debug, Clone)]
pub struct HistoryPolicy {
    /// Maximum number of records kept per user
    pub max_history_size: usize,
    /// Look up new addresses with the geolocation provider
    pub query_location: bool,
    /// Skip the lookup for an address already in the history
    pub check_duplicate_address: bool,
}

impl HistoryPolicy {
    pub fn new(max_history_size: usize) -> Self {
        HistoryPolicy {
            max_history_size,
            query_location: true,
            check_duplicate_address: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        HistoryPolicy {
            max_history_size: config.history.max_size,
            query_location: config.features.query_location,
            check_duplicate_address: config.features.check_duplicate_address,
        }
    }

    /// Record that `profile`'s user was seen at `address` under `display_name`
    ///
    /// A known address has its record refreshed and moved to the head of the
    /// history. An unknown address gets a new record at the head, enriched by
    /// `lookup` when possible, and the history is capped. A failed lookup
    /// never prevents the record from being added.
    ///
    /// `current_location` and `current_isp` are always copied from the head
    /// record afterwards, so a failed lookup clears them and a repeat
    /// sighting restores that address's stored values.
    ///
    /// Returns `true` if the address was not in the history before.
    pub fn apply(
        &self,
        profile: &mut UserProfile,
        display_name: &str,
        address: &str,
        now: DateTime<Utc>,
        lookup: Option<&dyn GeoLookup>,
    ) -> bool {
        profile.display_name = display_name.to_string();
        profile.current_address = Some(address.to_string());
        profile.last_seen = Some(now);

        let was_new = match profile.position_of(address) {
            Some(position) => {
                let mut record = profile.history.remove(position);
                record.last_seen = now;

                if self.check_duplicate_address {
                    log::debug!(
                        "Address {} already recorded for {}, skipping lookup",
                        address,
                        profile.id
                    );
                } else if let Some(enrichment) = self.enrich(lookup, address) {
                    record.location = enrichment.location;
                    record.isp = enrichment.isp;
                }

                profile.history.insert(0, record);
                false
            }
            None => {
                let mut record = AddressRecord::new(address, now);
                if let Some(enrichment) = self.enrich(lookup, address) {
                    record.location = enrichment.location;
                    record.isp = enrichment.isp;
                }

                profile.history.insert(0, record);
                profile.enforce_cap(self.max_history_size);
                true
            }
        };

        // The current view always describes the head record
        let head = profile.history.first();
        profile.current_location = head.and_then(|r| r.location.clone());
        profile.current_isp = head.and_then(|r| r.isp.clone());

        was_new
    }

    fn enrich(&self, lookup: Option<&dyn GeoLookup>, address: &str) -> Option<Enrichment> {
        if !self.query_location {
            return None;
        }

        match lookup?.lookup(address) {
            Ok(enrichment) => {
                log::debug!(
                    "Located {}: {} / {}",
                    address,
                    enrichment.location.as_deref().unwrap_or("-"),
                    enrichment.isp.as_deref().unwrap_or("-")
                );
                Some(enrichment)
            }
            Err(e) => {
                log::warn!("Geolocation lookup failed for {}: {}", address, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geolocation::LookupError;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and answers with a fixed result
    struct FakeLookup {
        calls: AtomicUsize,
        result: Option<Enrichment>,
    }

    impl FakeLookup {
        fn answering(location: &str, isp: &str) -> Self {
            FakeLookup {
                calls: AtomicUsize::new(0),
                result: Some(Enrichment {
                    location: Some(location.to_string()),
                    isp: Some(isp.to_string()),
                }),
            }
        }

        fn failing() -> Self {
            FakeLookup {
                calls: AtomicUsize::new(0),
                result: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl GeoLookup for FakeLookup {
        fn lookup(&self, _address: &str) -> Result<Enrichment, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().ok_or(LookupError::NoData)
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_first_sighting_enriched() {
        let policy = HistoryPolicy::new(100);
        let lookup = FakeLookup::answering("X", "Y");
        let mut profile = UserProfile::new("u1", "Alice");

        let was_new = policy.apply(&mut profile, "Alice", "1.2.3.4", at(0), Some(&lookup));

        assert!(was_new);
        assert_eq!(lookup.calls(), 1);
        assert_eq!(profile.history.len(), 1);
        assert_eq!(profile.history[0].location.as_deref(), Some("X"));
        assert_eq!(profile.history[0].isp.as_deref(), Some("Y"));
        assert_eq!(profile.history[0].first_seen, at(0));
        assert_eq!(profile.current_address.as_deref(), Some("1.2.3.4"));
        assert_eq!(profile.current_location.as_deref(), Some("X"));
        assert_eq!(profile.current_isp.as_deref(), Some("Y"));
        assert_eq!(profile.last_seen, Some(at(0)));
    }

    #[test]
    fn test_repeat_address_skips_lookup() {
        let policy = HistoryPolicy::new(100);
        let lookup = FakeLookup::answering("X", "Y");
        let mut profile = UserProfile::new("u1", "Alice");

        policy.apply(&mut profile, "Alice", "1.2.3.4", at(0), Some(&lookup));
        let was_new = policy.apply(&mut profile, "Alice", "1.2.3.4", at(60), Some(&lookup));

        assert!(!was_new);
        assert_eq!(lookup.calls(), 1);
        assert_eq!(profile.history.len(), 1);
        assert_eq!(profile.history[0].first_seen, at(0));
        assert_eq!(profile.history[0].last_seen, at(60));
        assert_eq!(profile.history[0].location.as_deref(), Some("X"));
    }

    #[test]
    fn test_failed_lookup_still_records() {
        let policy = HistoryPolicy::new(100);
        let good = FakeLookup::answering("X", "Y");
        let bad = FakeLookup::failing();
        let mut profile = UserProfile::new("u1", "Alice");

        policy.apply(&mut profile, "Alice", "1.2.3.4", at(0), Some(&good));
        let was_new = policy.apply(&mut profile, "Alice", "5.6.7.8", at(10), Some(&bad));

        assert!(was_new);
        assert_eq!(bad.calls(), 1);
        assert_eq!(profile.history.len(), 2);
        assert_eq!(profile.history[0].address, "5.6.7.8");
        assert!(profile.history[0].location.is_none());
        assert!(profile.history[0].isp.is_none());
        assert!(profile.current_location.is_none());
    }

    #[test]
    fn test_returning_to_old_address_moves_it_to_head() {
        let policy = HistoryPolicy::new(100);
        let lookup = FakeLookup::answering("X", "Y");
        let mut profile = UserProfile::new("u1", "Alice");

        policy.apply(&mut profile, "Alice", "1.1.1.1", at(0), Some(&lookup));
        policy.apply(&mut profile, "Alice", "2.2.2.2", at(10), Some(&lookup));
        policy.apply(&mut profile, "Alice", "1.1.1.1", at(20), Some(&lookup));

        let addresses: Vec<&str> = profile.history.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["1.1.1.1", "2.2.2.2"]);
        assert_eq!(lookup.calls(), 2);
    }

    #[test]
    fn test_cap_evicts_earliest() {
        let policy = HistoryPolicy::new(3);
        let lookup = FakeLookup::failing();
        let mut profile = UserProfile::new("u1", "Alice");

        for i in 0..4 {
            policy.apply(&mut profile, "Alice", &format!("10.0.0.{}", i), at(i), Some(&lookup));
        }

        assert_eq!(profile.history.len(), 3);
        assert!(profile.find_record("10.0.0.0").is_none());
        assert_eq!(profile.history[0].address, "10.0.0.3");
    }

    #[test]
    fn test_zero_cap_keeps_nothing() {
        let policy = HistoryPolicy::new(0);
        let lookup = FakeLookup::answering("X", "Y");
        let mut profile = UserProfile::new("u1", "Alice");

        assert!(policy.apply(&mut profile, "Alice", "1.1.1.1", at(0), Some(&lookup)));

        assert!(profile.history.is_empty());
        assert_eq!(profile.current_address.as_deref(), Some("1.1.1.1"));
        assert!(profile.current_location.is_none());
        assert!(profile.current_isp.is_none());
    }

    #[test]
    fn test_display_name_overwritten() {
        let policy = HistoryPolicy::new(100);
        let mut profile = UserProfile::new("u1", "Alice");

        policy.apply(&mut profile, "Alice", "1.1.1.1", at(0), None);
        policy.apply(&mut profile, "Alicia", "1.1.1.1", at(5), None);

        assert_eq!(profile.display_name, "Alicia");
        assert_eq!(profile.id, "u1");
    }

    #[test]
    fn test_lookup_disabled() {
        let mut policy = HistoryPolicy::new(100);
        policy.query_location = false;
        let lookup = FakeLookup::answering("X", "Y");
        let mut profile = UserProfile::new("u1", "Alice");

        assert!(policy.apply(&mut profile, "Alice", "1.1.1.1", at(0), Some(&lookup)));
        assert_eq!(lookup.calls(), 0);
        assert!(profile.history[0].location.is_none());
    }

    #[test]
    fn test_duplicate_check_disabled_refreshes_in_place() {
        let mut policy = HistoryPolicy::new(100);
        policy.check_duplicate_address = false;
        let lookup = FakeLookup::answering("X", "Y");
        let mut profile = UserProfile::new("u1", "Alice");

        policy.apply(&mut profile, "Alice", "1.1.1.1", at(0), Some(&lookup));
        let was_new = policy.apply(&mut profile, "Alice", "1.1.1.1", at(5), Some(&lookup));

        assert!(!was_new);
        assert_eq!(lookup.calls(), 2);
        assert_eq!(profile.history.len(), 1);
    }

    #[test]
    fn test_no_lookup_provider() {
        let policy = HistoryPolicy::new(100);
        let mut profile = UserProfile::new("u1", "Alice");

        assert!(policy.apply(&mut profile, "Alice", "1.1.1.1", at(0), None));
        assert_eq!(profile.history.len(), 1);
        assert!(profile.current_location.is_none());
    }
}
