use std::collections::HashMap;

use crate::protocol::types::{DomainName, Question, RecordTypeWithData, ResourceRecord};

/// The outcome of looking a name up within a zone that is
/// authoritative for it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ZoneResult {
    /// The name exists in the zone.  `rrs` holds the records matching
    /// the question's type and class, or — when there are none but
    /// the name has a `CNAME` — the single `CNAME` record instead,
    /// mirroring the classic nameserver lookup algorithm (RFC 1034
    /// §3.6.2).  An empty `rrs` means the name exists but has nothing
    /// usable for this question (`NODATA`), which the caller
    /// distinguishes from `NameError` (the name doesn't exist at
    /// all).
    Answer { rrs: Vec<ResourceRecord> },

    /// The name does not exist anywhere in the zone.
    NameError,
}

/// A single authoritative zone: an origin name, and the exact-match
/// records loaded for it.  There is no delegation or wildcard
/// matching here — every name either exists exactly, or it doesn't.
#[derive(Debug, Clone)]
pub struct Zone {
    pub origin: DomainName,
    records: HashMap<DomainName, Vec<ResourceRecord>>,
}

impl Zone {
    pub fn new(origin: DomainName) -> Self {
        Self {
            origin,
            records: HashMap::new(),
        }
    }

    pub fn insert(&mut self, rr: ResourceRecord) {
        self.records.entry(rr.name.clone()).or_default().push(rr);
    }

    pub fn all_records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.records.values().flatten()
    }

    pub fn resolve(&self, question: &Question) -> ZoneResult {
        let Some(rrs) = self.records.get(&question.name) else {
            return ZoneResult::NameError;
        };

        let matches: Vec<ResourceRecord> =
            rrs.iter().filter(|rr| rr.matches(question)).cloned().collect();

        if !matches.is_empty() {
            return ZoneResult::Answer { rrs: matches };
        }

        match rrs
            .iter()
            .find(|rr| matches!(rr.rtype_with_data, RecordTypeWithData::CNAME { .. }))
        {
            Some(cname) => ZoneResult::Answer {
                rrs: vec![cname.clone()],
            },
            None => ZoneResult::Answer { rrs: vec![] },
        }
    }
}

/// The full set of authoritative zones this server serves, keyed by
/// origin.  Lookup picks the zone whose origin is the longest
/// suffix-match of the queried name (i.e. the most specific zone that
/// could be authoritative for it), mirroring how a real zone tree
/// picks the closest enclosing zone — but without delegation to
/// child zones, since this server has none.
#[derive(Debug, Clone, Default)]
pub struct Zones {
    zones: HashMap<DomainName, Zone>,
}

impl Zones {
    pub fn new() -> Self {
        Self {
            zones: HashMap::new(),
        }
    }

    pub fn insert(&mut self, zone: Zone) {
        self.zones.insert(zone.origin.clone(), zone);
    }

    pub fn remove(&mut self, apex: &DomainName) {
        self.zones.remove(apex);
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn apices(&self) -> Vec<DomainName> {
        self.zones.keys().cloned().collect()
    }

    /// The zone, if any, that is authoritative for `name`: the one
    /// whose origin is a suffix of `name` (or exactly `name`) with
    /// the greatest number of labels.
    pub fn get(&self, name: &DomainName) -> Option<&Zone> {
        self.zones
            .values()
            .filter(|zone| name.is_subdomain_of(&zone.origin))
            .max_by_key(|zone| zone.origin.labels.len())
    }

    /// Look a question up against the zone authoritative for its
    /// name, if there is one.  Returns `None` when no loaded zone is
    /// authoritative for the name at all, which the caller should
    /// treat as "not ours to answer", not as `NXDOMAIN`.
    pub fn resolve(&self, question: &Question) -> Option<(&Zone, ZoneResult)> {
        let zone = self.get(&question.name)?;
        Some((zone, zone.resolve(question)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;
    use crate::protocol::types::{QueryType, RecordType};
    use std::net::Ipv4Addr;

    fn q(name: &str, qtype: RecordType) -> Question {
        question(name, QueryType::Record(qtype))
    }

    #[test]
    fn resolves_exact_name() {
        let mut zone = Zone::new(domain("example.com."));
        zone.insert(a_record("www.example.com.", Ipv4Addr::new(1, 2, 3, 4)));

        let mut zones = Zones::new();
        zones.insert(zone);

        match zones.resolve(&q("www.example.com.", RecordType::A)) {
            Some((z, ZoneResult::Answer { rrs })) => {
                assert_eq!(z.origin, domain("example.com."));
                assert_eq!(rrs.len(), 1);
            }
            other => panic!("expected an answer, got {other:?}"),
        }
    }

    #[test]
    fn name_error_within_zone() {
        let mut zone = Zone::new(domain("example.com."));
        zone.insert(a_record("www.example.com.", Ipv4Addr::new(1, 2, 3, 4)));

        let mut zones = Zones::new();
        zones.insert(zone);

        match zones.resolve(&q("nonexistent.example.com.", RecordType::A)) {
            Some((_, ZoneResult::NameError)) => {}
            other => panic!("expected a name error, got {other:?}"),
        }
    }

    #[test]
    fn not_authoritative_outside_zone() {
        let zones = Zones::new();
        assert_eq!(zones.resolve(&q("example.com.", RecordType::A)), None);
    }

    #[test]
    fn picks_most_specific_zone() {
        let mut parent = Zone::new(domain("example.com."));
        parent.insert(ns_record("example.com.", "ns1.example.com."));

        let mut child = Zone::new(domain("internal.example.com."));
        child.insert(a_record(
            "host.internal.example.com.",
            Ipv4Addr::new(10, 0, 0, 1),
        ));

        let mut zones = Zones::new();
        zones.insert(parent);
        zones.insert(child);

        let zone = zones.get(&domain("host.internal.example.com.")).unwrap();
        assert_eq!(zone.origin, domain("internal.example.com."));
    }

    #[test]
    fn nodata_when_name_exists_but_type_does_not() {
        let mut zone = Zone::new(domain("example.com."));
        zone.insert(ns_record("example.com.", "ns1.example.com."));

        let mut zones = Zones::new();
        zones.insert(zone);

        match zones.resolve(&q("example.com.", RecordType::A)) {
            Some((_, ZoneResult::Answer { rrs })) => assert!(rrs.is_empty()),
            other => panic!("expected NODATA (empty answer), got {other:?}"),
        }
    }

    #[test]
    fn cname_substitutes_for_missing_type() {
        let mut zone = Zone::new(domain("example.com."));
        zone.insert(cname_record("blog.example.com.", "www.example.com."));

        let mut zones = Zones::new();
        zones.insert(zone);

        match zones.resolve(&q("blog.example.com.", RecordType::A)) {
            Some((_, ZoneResult::Answer { rrs })) => {
                assert_eq!(rrs.len(), 1);
                assert!(matches!(
                    rrs[0].rtype_with_data,
                    crate::protocol::types::RecordTypeWithData::CNAME { .. }
                ));
            }
            other => panic!("expected the CNAME as the answer, got {other:?}"),
        }
    }
}
