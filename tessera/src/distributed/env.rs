//! Peer discovery from environment variables

use std::time::Duration;

use crate::{Error, Result};

const DEFAULT_MASTER_ADDR: &str = "localhost";
const DEFAULT_MASTER_PORT: u16 = 29500;
const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 300;

/// Where this process sits in the group and how to reach rank 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEnv {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
    /// How long a rank keeps trying to reach rank 0 before giving up.
    pub join_timeout: Duration,
}

impl TopologyEnv {
    /// Single-process topology.
    #[must_use]
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECS),
        }
    }

    /// Read `RANK`, `WORLD_SIZE`, `MASTER_ADDR`, `MASTER_PORT` and
    /// `TESSERA_JOIN_TIMEOUT_SECS`.
    ///
    /// # Errors
    /// Returns [`Error::Topology`] if a variable is unparsable or the values
    /// are inconsistent.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an explicit variable source.
    ///
    /// # Errors
    /// Returns [`Error::Topology`] if a variable is unparsable or the values
    /// are inconsistent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let rank = parse_var(&lookup, "RANK")?.unwrap_or(0);
        let world_size = parse_var(&lookup, "WORLD_SIZE")?.unwrap_or(1);
        let master_addr = lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let master_port = parse_var(&lookup, "MASTER_PORT")?.unwrap_or(DEFAULT_MASTER_PORT);
        let join_timeout = Duration::from_secs(
            parse_var(&lookup, "TESSERA_JOIN_TIMEOUT_SECS")?.unwrap_or(DEFAULT_JOIN_TIMEOUT_SECS),
        );

        if world_size == 0 {
            return Err(Error::Topology("WORLD_SIZE must be at least 1".into()));
        }
        if rank >= world_size {
            return Err(Error::Topology(format!(
                "RANK {rank} is out of range for WORLD_SIZE {world_size}"
            )));
        }

        Ok(Self {
            rank,
            world_size,
            master_addr,
            master_port,
            join_timeout,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Topology(format!("{key}={raw:?} is not a valid value"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_to_single_rank() {
        let env = TopologyEnv::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(env, TopologyEnv::single());
    }

    #[test]
    fn test_reads_all_variables() {
        let env = TopologyEnv::from_lookup(lookup_from(&[
            ("RANK", "2"),
            ("WORLD_SIZE", "4"),
            ("MASTER_ADDR", "10.0.0.1"),
            ("MASTER_PORT", "12345"),
            ("TESSERA_JOIN_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(env.rank, 2);
        assert_eq!(env.world_size, 4);
        assert_eq!(env.master_addr, "10.0.0.1");
        assert_eq!(env.master_port, 12345);
        assert_eq!(env.join_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_rank_out_of_range() {
        let err = TopologyEnv::from_lookup(lookup_from(&[("RANK", "2"), ("WORLD_SIZE", "2")]))
            .unwrap_err();
        assert!(matches!(err, Error::Topology(_)));
    }

    #[test]
    fn test_unparsable_world_size() {
        let err = TopologyEnv::from_lookup(lookup_from(&[("WORLD_SIZE", "two")])).unwrap_err();
        assert!(err.to_string().contains("WORLD_SIZE"));
    }

    #[test]
    fn test_zero_world_size() {
        let err = TopologyEnv::from_lookup(lookup_from(&[("WORLD_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, Error::Topology(_)));
    }
}
