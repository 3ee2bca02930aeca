use std::sync::RwLock;

use dns_types::protocol::types::{DomainName, Question, ResourceRecord};
use dns_types::zones::types::{Zone, ZoneResult, Zones};

const LOCK_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] zone cache lock poisoned, cannot recover from this - aborting";

/// The outcome of a zone lookup, collapsed to what the resolver needs
/// to decide its next step (spec.md §4.3/§4.7): whether a zone covers
/// the name at all is kept distinct from whether that zone has
/// anything to say about the question.
#[derive(Debug, Clone)]
pub enum FindResult {
    /// No loaded zone is authoritative for this name.
    NotCovered,
    /// A zone covers this name but it does not exist in it.
    NameError,
    /// A zone covers this name; `rrs` holds whatever it had to offer
    /// (possibly empty, i.e. NODATA; possibly a substituted CNAME).
    Found(Vec<ResourceRecord>),
}

/// A thread-safe handle to the in-memory authoritative store, per
/// spec.md §4.3.  Reads and writes are synchronized with a
/// `std::sync::RwLock`: lookups are expected to complete without I/O,
/// so there's no reason to hold an async lock across an await point.
#[derive(Debug)]
pub struct ZoneCache {
    zones: RwLock<Zones>,
}

impl ZoneCache {
    pub fn new() -> Self {
        Self {
            zones: RwLock::new(Zones::new()),
        }
    }

    pub fn find(&self, question: &Question) -> FindResult {
        let zones = self.zones.read().expect(LOCK_POISON_MESSAGE);
        match zones.resolve(question) {
            None => FindResult::NotCovered,
            Some((_, ZoneResult::NameError)) => FindResult::NameError,
            Some((_, ZoneResult::Answer { rrs })) => FindResult::Found(rrs),
        }
    }

    pub fn put_zone(&self, zone: Zone) {
        self.zones.write().expect(LOCK_POISON_MESSAGE).insert(zone);
    }

    pub fn remove_zone(&self, apex: &DomainName) {
        self.zones.write().expect(LOCK_POISON_MESSAGE).remove(apex);
    }

    pub fn zones(&self) -> Vec<DomainName> {
        self.zones.read().expect(LOCK_POISON_MESSAGE).apices()
    }

    pub fn count(&self) -> usize {
        self.zones.read().expect(LOCK_POISON_MESSAGE).len()
    }
}

impl Default for ZoneCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;
    use dns_types::protocol::types::{QueryType, RecordType};
    use std::net::Ipv4Addr;

    #[test]
    fn reports_not_covered_outside_any_zone() {
        let cache = ZoneCache::new();
        let q = question("example.com.", QueryType::Record(RecordType::A));
        assert!(matches!(cache.find(&q), FindResult::NotCovered));
    }

    #[test]
    fn reports_found_within_a_zone() {
        let cache = ZoneCache::new();
        let mut zone = Zone::new(domain("example.com."));
        zone.insert(a_record("api.example.com.", Ipv4Addr::new(10, 0, 0, 1)));
        cache.put_zone(zone);

        let q = question("api.example.com.", QueryType::Record(RecordType::A));
        match cache.find(&q) {
            FindResult::Found(rrs) => assert_eq!(rrs.len(), 1),
            other => panic!("expected Found, got {other:?}"),
        }
        assert_eq!(cache.count(), 1);
    }
}
