use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use tracing::warn;

use dns_types::protocol::types::{DomainName, RecordClass, RecordTypeWithData, ResourceRecord};
use dns_types::zones::types::{Zone, Zones};

/// Loads the startup authoritative data set. Zone-file ingestion
/// itself is out of scope (spec.md §1) — all the resolver needs is a
/// `Zones` populated with canonical records (spec.md §6, "Zone
/// source"). This reads a minimal hosts-style format rather than a
/// general zone-file grammar: each file under `zone_dir` is named
/// `<apex>.hosts` and contains `<name> <ipv4>` lines, one A record per
/// line, blank lines and `#`-prefixed comments ignored.
///
/// A directory that doesn't exist yields an empty `Zones`, not an
/// error — a server with no local authoritative data and only
/// upstream forwarding is a valid configuration.
pub fn load_zones(zone_dir: &Path) -> Zones {
    let mut zones = Zones::new();

    let entries = match fs::read_dir(zone_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %zone_dir.display(), %err, "zone directory not readable, starting with no authoritative data");
            return zones;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("hosts") {
            continue;
        }
        let Some(apex_str) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(apex) = DomainName::from_dotted_string(&format!("{apex_str}.")) else {
            warn!(path = %path.display(), "skipping zone file with an invalid apex name");
            continue;
        };

        match fs::read_to_string(&path) {
            Ok(contents) => {
                let zone = parse_hosts_zone(apex.clone(), &contents);
                zones.insert(zone);
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "could not read zone file");
            }
        }
    }

    zones
}

fn parse_hosts_zone(apex: DomainName, contents: &str) -> Zone {
    let mut zone = Zone::new(apex.clone());

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(name_part), Some(ip_part)) = (parts.next(), parts.next()) else {
            warn!(%apex, line, "skipping malformed hosts-zone line");
            continue;
        };

        let Ok(address) = ip_part.parse::<Ipv4Addr>() else {
            warn!(%apex, line, "skipping hosts-zone line with an invalid address");
            continue;
        };

        let name = if name_part == "@" {
            apex.clone()
        } else {
            match DomainName::from_dotted_string(&format!("{name_part}.{apex}")) {
                Some(name) => name,
                None => {
                    warn!(%apex, line, "skipping hosts-zone line with an invalid name");
                    continue;
                }
            }
        };

        zone.insert(ResourceRecord {
            name,
            rtype_with_data: RecordTypeWithData::A { address },
            rclass: RecordClass::IN,
            ttl: 300,
            origin: dns_types::protocol::types::Origin::Authoritative,
            expires_at: None,
        });
    }

    zone
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_hosts_zone() {
        let apex = DomainName::from_dotted_string("example.com.").unwrap();
        let zone = parse_hosts_zone(
            apex,
            "# comment\n@ 10.0.0.1\nwww 10.0.0.2\n\nbroken-line\nbadip 999.0.0.1\n",
        );

        assert_eq!(zone.all_records().count(), 2);
    }
}
