//! Per-key replication counts.

use crate::sketch::{CountMinSketch, CountSketch};
use elga_api::{ElgaResult, ReplicationMode};

/// Maps a key to its replication count (at least 1).
///
/// The sketch-backed variants divide the estimated frequency by the
/// configured threshold, so a key counted `n` times gets `n / threshold + 1`
/// owners on the ring.
#[derive(Debug, Clone)]
pub enum ReplicationMap {
    /// Every key has exactly one owner.
    None,
    /// Backed by a count-min sketch.
    CountMin {
        /// The merged cluster-wide sketch, installed from directory updates.
        sketch: CountMinSketch,
        /// Sketch count per extra replica.
        threshold: i32,
    },
    /// Backed by a count sketch.
    CountSketch {
        /// The merged cluster-wide sketch, installed from directory updates.
        sketch: CountSketch,
        /// Sketch count per extra replica.
        threshold: i32,
    },
}

impl ReplicationMap {
    /// Build the map for the configured mode.
    pub fn new(mode: ReplicationMode, threshold: i32) -> Self {
        match mode {
            ReplicationMode::None => Self::None,
            ReplicationMode::CountMin => Self::CountMin {
                sketch: CountMinSketch::new(),
                threshold,
            },
            ReplicationMode::CountSketch => Self::CountSketch {
                sketch: CountSketch::new(),
                threshold,
            },
        }
    }

    /// The replication count for `key`. Always at least 1.
    pub fn query(&self, key: u64) -> i32 {
        match self {
            Self::None => 1,
            Self::CountMin { sketch, threshold } => sketch.query(key).max(0) / threshold + 1,
            Self::CountSketch { sketch, threshold } => sketch.query(key).max(0) / threshold + 1,
        }
    }

    /// The raw sketch estimate for `key` (0 when replication is off).
    pub fn sk_query(&self, key: u64) -> i32 {
        match self {
            Self::None => 0,
            Self::CountMin { sketch, .. } => sketch.query(key),
            Self::CountSketch { sketch, .. } => sketch.query(key),
        }
    }

    /// Install a serialized sketch from a directory update.
    pub fn update(&mut self, data: &[u8]) -> ElgaResult<()> {
        match self {
            Self::None => Ok(()),
            Self::CountMin { sketch, .. } => sketch.update(data),
            Self::CountSketch { sketch, .. } => sketch.update(data),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn none_is_always_one() {
        let rm = ReplicationMap::new(ReplicationMode::None, 10);
        assert_eq!(1, rm.query(0));
        assert_eq!(1, rm.query(u64::MAX));
        assert_eq!(0, rm.sk_query(3));
    }

    #[test]
    fn count_min_backed_scales_with_threshold() {
        let mut sketch = CountMinSketch::new();
        for _ in 0..25 {
            sketch.count(7);
        }
        let rm = ReplicationMap::CountMin { sketch, threshold: 10 };
        assert_eq!(3, rm.query(7));
        assert_eq!(1, rm.query(8));
        assert!(rm.sk_query(7) >= 25);
    }

    #[test]
    fn installing_a_sketch_changes_counts() {
        let mut heavy = CountMinSketch::new();
        for _ in 0..100 {
            heavy.count(11);
        }
        let mut rm = ReplicationMap::new(ReplicationMode::CountMin, 10);
        assert_eq!(1, rm.query(11));
        rm.update(&heavy.serialize()).unwrap();
        assert_eq!(11, rm.query(11));
    }
}
