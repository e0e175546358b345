//! Process configuration.
//!
//! Runtime tunables with recognized environment overrides, constructed
//! once per process and carried by the process context. Every member of a
//! cluster must agree on the wire-affecting ones.

use crate::address::PortLayout;
use crate::{ElgaError, ElgaResult};

/// Which vertex algorithm the cluster runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlgorithmKind {
    /// PageRank with a fixed superstep count.
    Pagerank,
    /// Weakly connected components by minimum-label propagation.
    Wcc,
    /// Breadth-first distances from a start vertex.
    Bfs,
    /// k-Core decomposition by H-index iteration.
    Kcore,
    /// Label propagation communities.
    Lpa,
}

/// Which superstep discipline the agents follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Discipline {
    /// Bulk-synchronous: every vertex processes every iteration.
    Bsp,
    /// Locally-applied BSP: same-agent notifications apply directly.
    Lbsp,
    /// Fully asynchronous: the active set evolves, waits release vertices.
    Full,
}

/// How per-key replication counts are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationMode {
    /// Every key has exactly one owner.
    None,
    /// Count-min sketch estimate divided by the threshold, plus one.
    CountMin,
    /// Count sketch estimate divided by the threshold, plus one.
    CountSketch,
}

impl std::str::FromStr for AlgorithmKind {
    type Err = ElgaError;
    fn from_str(s: &str) -> ElgaResult<Self> {
        match s {
            "pagerank" | "pr" => Ok(Self::Pagerank),
            "wcc" => Ok(Self::Wcc),
            "bfs" => Ok(Self::Bfs),
            "kcore" | "k-core" => Ok(Self::Kcore),
            "lpa" => Ok(Self::Lpa),
            _ => Err(ElgaError::arg(format!("unknown algorithm: {s}"))),
        }
    }
}

impl std::str::FromStr for Discipline {
    type Err = ElgaError;
    fn from_str(s: &str) -> ElgaResult<Self> {
        match s {
            "bsp" => Ok(Self::Bsp),
            "lbsp" => Ok(Self::Lbsp),
            "full" => Ok(Self::Full),
            _ => Err(ElgaError::arg(format!("unknown discipline: {s}"))),
        }
    }
}

impl std::str::FromStr for ReplicationMode {
    type Err = ElgaError;
    fn from_str(s: &str) -> ElgaResult<Self> {
        match s {
            "none" => Ok(Self::None),
            "count-min" | "cms" => Ok(Self::CountMin),
            "count-sketch" | "cs" => Ok(Self::CountSketch),
            _ => Err(ElgaError::arg(format!("unknown replication mode: {s}"))),
        }
    }
}

/// Cluster-wide tunables.
///
/// Every member of a cluster must agree on the port layout, replication
/// mode, algorithm, and discipline; the rest are per-process knobs.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Filesystem directory receiving save/dump output.
    pub save_dir: std::path::PathBuf,

    /// Sketch count per extra replica.
    pub rep_threshold: i32,

    /// TCP port layout.
    pub ports: PortLayout,

    /// Heartbeat cadence in microseconds.
    pub heartbeat_us: u64,

    /// Blocking poll timeout in milliseconds.
    pub poll_timeout_ms: u64,

    /// Virtual agents a fresh physical agent registers with.
    pub starting_vagents: u16,

    /// Outbound requester pool size; eviction closes the connection.
    pub lru_limit: usize,

    /// Streamer mid-batch flush threshold, in edges.
    pub mid_batch_size: usize,

    /// Supersteps PageRank runs before voting to stop.
    pub pagerank_supersteps: i32,

    /// The configured vertex algorithm.
    pub algorithm: AlgorithmKind,

    /// The configured superstep discipline.
    pub discipline: Discipline,

    /// The configured replication mode.
    pub replication: ReplicationMode,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            save_dir: std::path::PathBuf::from("/scratch/elga"),
            rep_threshold: 512,
            ports: PortLayout::default(),
            heartbeat_us: 1_000_000,
            poll_timeout_ms: 2500,
            starting_vagents: 4,
            lru_limit: 128,
            mid_batch_size: 65536,
            pagerank_supersteps: 30,
            algorithm: AlgorithmKind::Pagerank,
            discipline: Discipline::Bsp,
            replication: ReplicationMode::None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, into: &mut T) -> ElgaResult<()> {
    if let Ok(v) = std::env::var(name) {
        *into = v
            .parse()
            .map_err(|_| ElgaError::arg(format!("bad value for {name}: {v}")))?;
    }
    Ok(())
}

impl Tunables {
    /// Defaults overridden by any recognized `ELGA_*` environment variable.
    pub fn from_env() -> ElgaResult<Self> {
        let mut t = Self::default();
        if let Ok(v) = std::env::var("ELGA_SAVE_DIR") {
            t.save_dir = std::path::PathBuf::from(v);
        }
        env_parse("ELGA_REP_THRESHOLD", &mut t.rep_threshold)?;
        env_parse("ELGA_START_PORT", &mut t.ports.start_port)?;
        env_parse("ELGA_PUB_OFFSET", &mut t.ports.pub_offset)?;
        env_parse("ELGA_PULL_OFFSET", &mut t.ports.pull_offset)?;
        env_parse("ELGA_HEARTBEAT_US", &mut t.heartbeat_us)?;
        env_parse("ELGA_STARTING_VAGENTS", &mut t.starting_vagents)?;
        env_parse("ELGA_LRU_LIMIT", &mut t.lru_limit)?;
        env_parse("ELGA_MID_BATCH_SIZE", &mut t.mid_batch_size)?;
        env_parse("ELGA_PAGERANK_SUPERSTEPS", &mut t.pagerank_supersteps)?;
        env_parse("ELGA_ALGORITHM", &mut t.algorithm)?;
        env_parse("ELGA_DISCIPLINE", &mut t.discipline)?;
        env_parse("ELGA_REPLICATION", &mut t.replication)?;
        Ok(t)
    }

    /// A configuration suitable for tests: temp save dir, short heartbeat
    /// and poll intervals.
    pub fn testing() -> Self {
        Self {
            save_dir: std::env::temp_dir().join("elga-test"),
            heartbeat_us: 50_000,
            poll_timeout_ms: 100,
            ..Self::default()
        }
    }

    /// Whether a frequency sketch rides along with directory updates.
    pub fn sketch_enabled(&self) -> bool {
        self.replication != ReplicationMode::None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn enum_parsing() {
        assert_eq!(AlgorithmKind::Pagerank, "pr".parse().unwrap());
        assert_eq!(AlgorithmKind::Kcore, "k-core".parse().unwrap());
        assert_eq!(Discipline::Lbsp, "lbsp".parse().unwrap());
        assert_eq!(ReplicationMode::CountMin, "cms".parse().unwrap());
        assert!("bogus".parse::<AlgorithmKind>().is_err());
    }

    #[test]
    fn defaults_match_wire_expectations() {
        let t = Tunables::default();
        assert_eq!(17200, t.ports.start_port);
        assert!(!t.sketch_enabled());
    }
}
