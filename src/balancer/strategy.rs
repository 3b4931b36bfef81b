//! Backend selection strategies
//!
//! Every strategy picks from the already-filtered list of eligible servers
//! and returns an index into it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::ServerInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastConnections,
    LeastLoad,
    ConsistentHash,
    Random,
    WeightedRoundRobin,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::LeastConnections => "least_connections",
            LoadBalancingStrategy::LeastLoad => "least_load",
            LoadBalancingStrategy::ConsistentHash => "consistent_hash",
            LoadBalancingStrategy::Random => "random",
            LoadBalancingStrategy::WeightedRoundRobin => "weighted_round_robin",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "least_connections" => Ok(LoadBalancingStrategy::LeastConnections),
            "least_load" => Ok(LoadBalancingStrategy::LeastLoad),
            "consistent_hash" => Ok(LoadBalancingStrategy::ConsistentHash),
            "random" => Ok(LoadBalancingStrategy::Random),
            "weighted_round_robin" => Ok(LoadBalancingStrategy::WeightedRoundRobin),
            other => Err(format!("Unknown load balancing strategy '{}'", other)),
        }
    }
}

/// Routing keys for one selection
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionContext<'a> {
    pub session_id: Option<&'a str>,
    pub user_id: Option<&'a str>,
}

impl<'a> SelectionContext<'a> {
    /// Sticky key: user first, then session
    fn hash_key(&self) -> Option<&'a str> {
        self.user_id.or(self.session_id)
    }
}

pub trait SelectionStrategy: Send + Sync {
    fn kind(&self) -> LoadBalancingStrategy;

    /// Index into `candidates`, which is never empty
    fn select(&self, candidates: &[ServerInfo], ctx: &SelectionContext<'_>) -> Option<usize>;

    /// Called with the full server list whenever servers are added or removed
    fn rebuild(&self, _servers: &[ServerInfo]) {}
}

pub fn build_strategy(kind: LoadBalancingStrategy, virtual_nodes: usize) -> Box<dyn SelectionStrategy> {
    match kind {
        LoadBalancingStrategy::RoundRobin => Box::new(RoundRobin::default()),
        LoadBalancingStrategy::LeastConnections => Box::new(LeastConnections),
        LoadBalancingStrategy::LeastLoad => Box::new(LeastLoad),
        LoadBalancingStrategy::ConsistentHash => Box::new(ConsistentHash::new(virtual_nodes)),
        LoadBalancingStrategy::Random => Box::new(RandomChoice),
        LoadBalancingStrategy::WeightedRoundRobin => Box::new(WeightedRoundRobin::default()),
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl SelectionStrategy for RoundRobin {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::RoundRobin
    }

    fn select(&self, candidates: &[ServerInfo], _ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }
}

#[derive(Debug)]
pub struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::LeastConnections
    }

    fn select(&self, candidates: &[ServerInfo], _ctx: &SelectionContext<'_>) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.current_connections)
            .map(|(i, _)| i)
    }
}

#[derive(Debug)]
pub struct LeastLoad;

impl SelectionStrategy for LeastLoad {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::LeastLoad
    }

    fn select(&self, candidates: &[ServerInfo], _ctx: &SelectionContext<'_>) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.load_score().total_cmp(&b.load_score()))
            .map(|(i, _)| i)
    }
}

#[derive(Debug)]
pub struct RandomChoice;

impl SelectionStrategy for RandomChoice {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::Random
    }

    fn select(&self, candidates: &[ServerInfo], _ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::rng().random_range(0..candidates.len()))
    }
}

/// Counter mapped onto weighted slots; a server of weight 3 owns three
/// consecutive slots.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counter: AtomicUsize,
}

impl SelectionStrategy for WeightedRoundRobin {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::WeightedRoundRobin
    }

    fn select(&self, candidates: &[ServerInfo], _ctx: &SelectionContext<'_>) -> Option<usize> {
        let total_weight: usize = candidates.iter().map(|s| s.weight.max(1) as usize).sum();
        if total_weight == 0 {
            return None;
        }

        let mut slot = self.counter.fetch_add(1, Ordering::Relaxed) % total_weight;
        for (i, server) in candidates.iter().enumerate() {
            let weight = server.weight.max(1) as usize;
            if slot < weight {
                return Some(i);
            }
            slot -= weight;
        }
        None
    }
}

/// Hash ring with `virtual_nodes` points per server
pub struct ConsistentHash {
    virtual_nodes: usize,
    ring: RwLock<Vec<(u64, String)>>,
}

impl ConsistentHash {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: RwLock::new(Vec::new()),
        }
    }

    fn hash(key: &str) -> u64 {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }
}

impl SelectionStrategy for ConsistentHash {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::ConsistentHash
    }

    fn rebuild(&self, servers: &[ServerInfo]) {
        let mut ring: Vec<(u64, String)> = servers
            .iter()
            .flat_map(|s| {
                (0..self.virtual_nodes)
                    .map(move |vn| (Self::hash(&format!("{}#{}", s.server_id, vn)), s.server_id.clone()))
            })
            .collect();
        ring.sort();

        match self.ring.write() {
            Ok(mut guard) => *guard = ring,
            Err(poisoned) => *poisoned.into_inner() = ring,
        }
    }

    fn select(&self, candidates: &[ServerInfo], ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let Some(key) = ctx.hash_key() else {
            return Some(0);
        };
        let point = Self::hash(key);

        let by_id: HashMap<&str, usize> = candidates
            .iter()
            .enumerate()
            .map(|(i, s)| (s.server_id.as_str(), i))
            .collect();

        let ring = match self.ring.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ring.is_empty() {
            return Some((point % candidates.len() as u64) as usize);
        }

        // walk clockwise past servers that are not eligible
        let start = ring.partition_point(|(h, _)| *h < point);
        ring.iter()
            .cycle()
            .skip(start)
            .take(ring.len())
            .find_map(|(_, id)| by_id.get(id.as_str()).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn server(id: &str, weight: u32) -> ServerInfo {
        let mut cfg = ServerConfig::new(id, "127.0.0.1", 9000);
        cfg.weight = weight;
        ServerInfo::from_config(&cfg)
    }

    #[test]
    fn test_round_robin_cycles() {
        let servers = vec![server("a", 1), server("b", 1), server("c", 1)];
        let rr = RoundRobin::default();
        let ctx = SelectionContext::default();
        let picks: Vec<usize> = (0..6).filter_map(|_| rr.select(&servers, &ctx)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_least_connections_and_load() {
        let mut servers = vec![server("a", 1), server("b", 1)];
        servers[0].current_connections = 5;
        servers[1].current_connections = 2;
        servers[0].cpu_usage = 0.1;
        servers[1].cpu_usage = 0.9;
        let ctx = SelectionContext::default();

        assert_eq!(LeastConnections.select(&servers, &ctx), Some(1));
        assert_eq!(LeastLoad.select(&servers, &ctx), Some(0));
    }

    #[test]
    fn test_weighted_round_robin_distribution() {
        let servers = vec![server("a", 3), server("b", 1)];
        let wrr = WeightedRoundRobin::default();
        let ctx = SelectionContext::default();
        let picks: Vec<usize> = (0..8).filter_map(|_| wrr.select(&servers, &ctx)).collect();
        assert_eq!(picks, vec![0, 0, 0, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn test_random_stays_in_range() {
        let servers = vec![server("a", 1), server("b", 1)];
        let ctx = SelectionContext::default();
        for _ in 0..50 {
            assert!(RandomChoice.select(&servers, &ctx).unwrap() < 2);
        }
    }

    #[test]
    fn test_consistent_hash_is_sticky_and_skips_ineligible() {
        let all = vec![server("a", 1), server("b", 1), server("c", 1)];
        let ch = ConsistentHash::new(50);
        ch.rebuild(&all);

        let ctx = SelectionContext {
            session_id: Some("session-1"),
            user_id: Some("user-42"),
        };
        let first = ch.select(&all, &ctx).unwrap();
        for _ in 0..10 {
            assert_eq!(ch.select(&all, &ctx), Some(first));
        }

        // same user from another session lands on the same server
        let other_session = SelectionContext {
            session_id: Some("session-2"),
            user_id: Some("user-42"),
        };
        assert_eq!(ch.select(&all, &other_session), Some(first));

        // with the chosen server gone the key moves to a remaining one
        let remaining: Vec<ServerInfo> = all
            .iter()
            .filter(|s| s.server_id != all[first].server_id)
            .cloned()
            .collect();
        let moved = ch.select(&remaining, &ctx).unwrap();
        assert_ne!(remaining[moved].server_id, all[first].server_id);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "least-connections".parse::<LoadBalancingStrategy>(),
            Ok(LoadBalancingStrategy::LeastConnections)
        );
        assert!("fastest".parse::<LoadBalancingStrategy>().is_err());
        assert_eq!(
            build_strategy(LoadBalancingStrategy::Random, 10).kind(),
            LoadBalancingStrategy::Random
        );
    }
}
