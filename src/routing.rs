//! Hostname-based routing tables.
//!
//! A [`RoutingTable`] is an immutable snapshot mapping normalized hostnames
//! to backend servers. Tables are built once per configuration generation
//! and published through an `ArcSwap` on each gateway, so the lookup hot
//! path is lock-free and a reload is a single atomic pointer swap - readers
//! observe either the old table or the new one, never a mix.

use crate::protocol::normalize_domain;
use crate::server::BackendServer;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Immutable hostname -> backend mapping.
///
/// Exact entries are consulted first; `*.suffix` wildcard patterns act as a
/// fallback, longest suffix first. On collision the first-registered server
/// wins and the duplicate is reported as a warning.
#[derive(Debug, Default)]
pub struct RoutingTable {
    exact: HashMap<String, Arc<BackendServer>>,
    /// Wildcard suffixes including the leading dot, sorted longest first.
    wildcards: Vec<(String, Arc<BackendServer>)>,
}

impl RoutingTable {
    /// Build a table from servers in registration order.
    pub fn new(servers: &[Arc<BackendServer>]) -> Self {
        let mut table = Self::default();

        for server in servers {
            for pattern in server.domains() {
                let normalized = normalize_domain(pattern);
                if let Some(suffix) = normalized.strip_prefix("*.") {
                    let suffix = format!(".{suffix}");
                    if let Some((_, existing)) =
                        table.wildcards.iter().find(|(s, _)| *s == suffix)
                    {
                        warn!(
                            pattern = %normalized,
                            first = %existing.id(),
                            duplicate = %server.id(),
                            "wildcard pattern already registered; first registered wins"
                        );
                        continue;
                    }
                    table.wildcards.push((suffix, server.clone()));
                } else if let Some(existing) = table.exact.get(&normalized) {
                    warn!(
                        domain = %normalized,
                        first = %existing.id(),
                        duplicate = %server.id(),
                        "domain already registered; first registered wins"
                    );
                } else {
                    table.exact.insert(normalized, server.clone());
                }
            }
        }

        // Longest suffix first so "*.eu.example.com" beats "*.example.com".
        table
            .wildcards
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        table
    }

    /// Look up a backend for an already-normalized hostname.
    pub fn lookup(&self, domain: &str) -> Option<Arc<BackendServer>> {
        if let Some(server) = self.exact.get(domain) {
            return Some(server.clone());
        }
        self.wildcards
            .iter()
            .find(|(suffix, _)| domain.ends_with(suffix.as_str()) && domain.len() > suffix.len())
            .map(|(_, server)| server.clone())
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn server(id: &str, domains: &[&str]) -> Arc<BackendServer> {
        let config = ServerConfig {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            address: "127.0.0.1:25566".to_string(),
            proxy_bind: None,
            dial_timeout_ms: 1000,
            send_proxy_protocol: false,
            send_real_ip: false,
            disconnect_message: "unreachable".to_string(),
            online_status: Default::default(),
            offline_status: Default::default(),
        };
        BackendServer::from_config(id, &config).unwrap()
    }

    #[test]
    fn test_exact_lookup_is_case_insensitive_at_build() {
        let table = RoutingTable::new(&[server("a", &["Play.Example.COM"])]);
        assert_eq!(table.lookup("play.example.com").unwrap().id(), "a");
        assert!(table.lookup("other.example.com").is_none());
    }

    #[test]
    fn test_exact_wins_over_wildcard() {
        let table = RoutingTable::new(&[
            server("wild", &["*.example.com"]),
            server("exact", &["play.example.com"]),
        ]);
        assert_eq!(table.lookup("play.example.com").unwrap().id(), "exact");
        assert_eq!(table.lookup("mini.example.com").unwrap().id(), "wild");
    }

    #[test]
    fn test_longest_wildcard_suffix_wins() {
        let table = RoutingTable::new(&[
            server("broad", &["*.example.com"]),
            server("narrow", &["*.eu.example.com"]),
        ]);
        assert_eq!(table.lookup("play.eu.example.com").unwrap().id(), "narrow");
        assert_eq!(table.lookup("play.example.com").unwrap().id(), "broad");
    }

    #[test]
    fn test_wildcard_does_not_match_bare_suffix() {
        let table = RoutingTable::new(&[server("wild", &["*.example.com"])]);
        assert!(table.lookup("example.com").is_none());
    }

    #[test]
    fn test_first_registered_wins_on_collision() {
        let table = RoutingTable::new(&[
            server("first", &["play.example.com"]),
            server("second", &["play.example.com"]),
        ]);
        assert_eq!(table.lookup("play.example.com").unwrap().id(), "first");
        assert_eq!(table.len(), 1);
    }
}
