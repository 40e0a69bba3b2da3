//! In-memory DNS zone
//!
//! Acts as both the record writer and the resolver, so tests can drive the
//! full DNS-01 path without a network. A propagation delay hides freshly
//! written records for a number of lookups.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::propagation::{LookupError, TxtResolver};
use super::provider::{DnsProvider, DnsProviderError, DnsResult};
use crate::request::ObjectRef;

#[derive(Debug, Default)]
struct ZoneState {
    records: BTreeMap<String, Vec<String>>,
    /// Lookups remaining before a name becomes visible
    hidden: HashMap<String, u32>,
    /// (name, value) pairs some lookup has returned
    observed: HashSet<(String, String)>,
    lookups: u32,
    removals: u32,
}

/// In-memory zone implementing [`DnsProvider`] and [`TxtResolver`]
#[derive(Debug, Default)]
pub struct MemoryZone {
    state: Mutex<ZoneState>,
    propagation_delay: u32,
    fail_puts: bool,
    deny_write_access: bool,
}

impl MemoryZone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hide each newly written record for `lookups` resolutions
    pub fn with_propagation_delay(mut self, lookups: u32) -> Self {
        self.propagation_delay = lookups;
        self
    }

    /// Fail every `put`
    pub fn failing_puts(mut self) -> Self {
        self.fail_puts = true;
        self
    }

    /// Reject write-access checks
    pub fn denying_write_access(mut self) -> Self {
        self.deny_write_access = true;
        self
    }

    /// Values currently stored at `name`
    pub fn values(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .records
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of names with at least one value
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether a lookup has already returned `value` at `name`
    pub fn was_observed(&self, name: &str, value: &str) -> bool {
        self.state
            .lock()
            .observed
            .contains(&(name.to_string(), value.to_string()))
    }

    /// Total lookups served
    pub fn lookups(&self) -> u32 {
        self.state.lock().lookups
    }

    /// Total successful removals
    pub fn removals(&self) -> u32 {
        self.state.lock().removals
    }
}

#[async_trait]
impl DnsProvider for MemoryZone {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, record_name: &str, value: &str, _credentials: &ObjectRef) -> DnsResult<()> {
        if self.fail_puts {
            return Err(DnsProviderError::RecordWrite {
                record: record_name.to_string(),
                message: "injected failure".to_string(),
            });
        }

        let mut state = self.state.lock();
        let values = state.records.entry(record_name.to_string()).or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
        state
            .hidden
            .insert(record_name.to_string(), self.propagation_delay);
        Ok(())
    }

    async fn remove(
        &self,
        record_name: &str,
        value: &str,
        _credentials: &ObjectRef,
    ) -> DnsResult<()> {
        let mut state = self.state.lock();
        let mut removed = false;
        if let Some(values) = state.records.get_mut(record_name) {
            let before = values.len();
            values.retain(|v| v != value);
            removed = values.len() != before;
            if values.is_empty() {
                state.records.remove(record_name);
                state.hidden.remove(record_name);
            }
        }
        if removed {
            state.removals += 1;
        }
        Ok(())
    }

    async fn verify_write_access(&self, base_domain: &str, credentials: &ObjectRef) -> DnsResult<()> {
        if self.deny_write_access {
            return Err(DnsProviderError::Authentication(format!(
                "credentials '{}' cannot write to '{}'",
                credentials, base_domain
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TxtResolver for MemoryZone {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, LookupError> {
        let mut state = self.state.lock();
        state.lookups += 1;

        if let Some(remaining) = state.hidden.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LookupError::NoRecords(name.to_string()));
            }
        }

        let values = state
            .records
            .get(name)
            .cloned()
            .ok_or_else(|| LookupError::NoRecords(name.to_string()))?;
        for value in &values {
            state.observed.insert((name.to_string(), value.clone()));
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_propagation_delay_hides_record() {
        let zone = MemoryZone::new().with_propagation_delay(2);
        let creds = ObjectRef::new("ns", "c");
        zone.put("_acme-challenge.a.com", "v", &creds).await.unwrap();

        assert!(zone.lookup_txt("_acme-challenge.a.com").await.is_err());
        assert!(zone.lookup_txt("_acme-challenge.a.com").await.is_err());
        assert!(!zone.was_observed("_acme-challenge.a.com", "v"));
        assert_eq!(
            zone.lookup_txt("_acme-challenge.a.com").await.unwrap(),
            vec!["v".to_string()]
        );
        assert!(zone.was_observed("_acme-challenge.a.com", "v"));
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let zone = MemoryZone::new();
        let creds = ObjectRef::new("ns", "c");
        zone.remove("_acme-challenge.a.com", "v", &creds).await.unwrap();
        assert_eq!(zone.removals(), 0);
    }
}
