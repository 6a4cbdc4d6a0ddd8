//! Topology-aware placement preferences.
//!
//! A topology hint is an ordered list of `cloud.region.zone:priority` keys,
//! e.g. `gcp.us-east1.*:1,gcp.us-central1.*:2`. Priority 1 is the most
//! preferred tier; a zone of `*` matches every zone in the region. The
//! connector ranks the cluster's tablet servers (as reported by
//! `yb_servers()`) against these keys and opens new connections on the best
//! tier that has at least one live server.

use std::fmt;

use crate::error::{DbError, DbResult};

/// Highest priority value a topology key may carry
pub const MAX_TOPOLOGY_PRIORITY: u8 = 10;

/// One placement preference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyKey {
    pub cloud: String,
    pub region: String,
    /// `None` matches any zone
    pub zone: Option<String>,
    pub priority: u8,
}

impl TopologyKey {
    /// Parse `cloud.region.zone[:priority]`; priority defaults to 1
    pub fn parse(raw: &str) -> DbResult<Self> {
        let raw = raw.trim();
        let (placement, priority) = match raw.rsplit_once(':') {
            Some((placement, priority)) => {
                let priority: u8 = priority.trim().parse().map_err(|_| {
                    DbError::configuration(format!(
                        "topology key '{raw}': priority '{priority}' is not a number"
                    ))
                })?;
                (placement, priority)
            }
            None => (raw, 1),
        };

        if priority == 0 || priority > MAX_TOPOLOGY_PRIORITY {
            return Err(DbError::configuration(format!(
                "topology key '{raw}': priority must be between 1 and {MAX_TOPOLOGY_PRIORITY}"
            )));
        }

        let parts: Vec<&str> = placement.split('.').map(str::trim).collect();
        let [cloud, region, zone] = parts.as_slice() else {
            return Err(DbError::configuration(format!(
                "topology key '{raw}': expected cloud.region.zone"
            )));
        };
        if cloud.is_empty() || region.is_empty() || zone.is_empty() {
            return Err(DbError::configuration(format!(
                "topology key '{raw}': empty placement component"
            )));
        }
        if *cloud == "*" || *region == "*" {
            return Err(DbError::configuration(format!(
                "topology key '{raw}': only the zone may be a wildcard"
            )));
        }

        Ok(Self {
            cloud: (*cloud).to_owned(),
            region: (*region).to_owned(),
            zone: (*zone != "*").then(|| (*zone).to_owned()),
            priority,
        })
    }

    /// Whether a server's placement satisfies this key
    pub fn matches(&self, server: &ServerPlacement) -> bool {
        self.cloud == server.cloud
            && self.region == server.region
            && self.zone.as_ref().map_or(true, |zone| *zone == server.zone)
    }
}

impl fmt::Display for TopologyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}:{}",
            self.cloud,
            self.region,
            self.zone.as_deref().unwrap_or("*"),
            self.priority
        )
    }
}

/// Parse a comma-separated topology hint; blank input yields no keys
pub fn parse_topology_keys(raw: &str) -> DbResult<Vec<TopologyKey>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(TopologyKey::parse)
        .collect()
}

/// Render keys back into the driver option format
pub fn render_topology_keys(keys: &[TopologyKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// A tablet server and where it lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPlacement {
    pub host: String,
    pub port: u16,
    pub cloud: String,
    pub region: String,
    pub zone: String,
}

impl ServerPlacement {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Servers on the most preferred tier that has any match.
///
/// Falls back to every server when no key matches (or no keys are given),
/// so a misconfigured hint degrades to plain load balancing instead of
/// refusing to connect.
pub fn preferred_servers<'a>(
    servers: &'a [ServerPlacement],
    keys: &[TopologyKey],
) -> Vec<&'a ServerPlacement> {
    let best = servers
        .iter()
        .filter_map(|server| {
            keys.iter()
                .filter(|key| key.matches(server))
                .map(|key| key.priority)
                .min()
        })
        .min();

    match best {
        Some(tier) => servers
            .iter()
            .filter(|server| {
                keys.iter()
                    .any(|key| key.priority == tier && key.matches(server))
            })
            .collect(),
        None => servers.iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn server(host: &str, region: &str, zone: &str) -> ServerPlacement {
        ServerPlacement {
            host: host.to_string(),
            port: 5433,
            cloud: "gcp".to_string(),
            region: region.to_string(),
            zone: zone.to_string(),
        }
    }

    #[test]
    fn test_parse_default_hint() {
        let keys =
            parse_topology_keys("gcp.us-east1.*:1,gcp.us-central1.*:2,gcp.us-west1.*:3").unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].region, "us-east1");
        assert_eq!(keys[0].zone, None);
        assert_eq!(keys[2].priority, 3);
    }

    #[test]
    fn test_parse_without_priority_defaults_to_one() {
        let key = TopologyKey::parse("aws.us-west-2.us-west-2a").unwrap();
        assert_eq!(key.priority, 1);
        assert_eq!(key.zone.as_deref(), Some("us-west-2a"));
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        assert!(TopologyKey::parse("gcp.us-east1").is_err());
        assert!(TopologyKey::parse("gcp.us-east1.*:0").is_err());
        assert!(TopologyKey::parse("gcp.us-east1.*:11").is_err());
        assert!(TopologyKey::parse("gcp.us-east1.*:high").is_err());
        assert!(TopologyKey::parse("*.us-east1.a:1").is_err());
        assert!(TopologyKey::parse("gcp..a:1").is_err());
    }

    #[test]
    fn test_blank_hint_is_empty() {
        assert!(parse_topology_keys("").unwrap().is_empty());
        assert!(parse_topology_keys(" , ").unwrap().is_empty());
    }

    #[test]
    fn test_preferred_servers_picks_best_live_tier() {
        let servers = vec![
            server("10.0.0.1", "us-west1", "a"),
            server("10.0.0.2", "us-central1", "a"),
            server("10.0.0.3", "us-central1", "b"),
        ];
        let keys =
            parse_topology_keys("gcp.us-east1.*:1,gcp.us-central1.*:2,gcp.us-west1.*:3").unwrap();

        // nothing in us-east1, so tier 2 wins
        let hosts: Vec<_> = preferred_servers(&servers, &keys)
            .into_iter()
            .map(|s| s.host.as_str())
            .collect();
        assert_eq!(hosts, vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_preferred_servers_zone_filter() {
        let servers = vec![
            server("10.0.0.1", "us-east1", "us-east1-b"),
            server("10.0.0.2", "us-east1", "us-east1-c"),
        ];
        let keys = parse_topology_keys("gcp.us-east1.us-east1-c:1").unwrap();
        let preferred = preferred_servers(&servers, &keys);
        assert_eq!(preferred.len(), 1);
        assert_eq!(preferred[0].host, "10.0.0.2");
    }

    #[test]
    fn test_preferred_servers_falls_back_to_all() {
        let servers = vec![server("10.0.0.1", "eu-west1", "a")];
        let keys = parse_topology_keys("gcp.us-east1.*:1").unwrap();
        assert_eq!(preferred_servers(&servers, &keys).len(), 1);
        assert_eq!(preferred_servers(&servers, &[]).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_rendered_keys_parse_back(
            region in "[a-z]{2,8}-[a-z]{2,6}[0-9]",
            zone in prop_oneof![Just(None), "[a-z0-9-]{1,10}".prop_map(Some)],
            priority in 1u8..=MAX_TOPOLOGY_PRIORITY,
        ) {
            let key = TopologyKey {
                cloud: "gcp".to_string(),
                region,
                zone,
                priority,
            };
            let parsed = parse_topology_keys(&render_topology_keys(&[key.clone()])).unwrap();
            prop_assert_eq!(parsed, vec![key]);
        }
    }
}
