//! Fixed-size frequency sketches.
//!
//! Both sketches are WIDTH x DEPTH tables of signed 32-bit counters. The
//! dimensions are part of the cluster protocol: directory updates carry the
//! raw table as a fixed-size trailer, so every member must agree on them.

use crate::hash::hash;
use elga_api::{ElgaError, ElgaResult};

/// Counters per row. Must be a power of two.
pub const TABLE_WIDTH: usize = 1024;

/// Number of rows.
pub const TABLE_DEPTH: usize = 5;

/// Serialized size of a sketch in bytes.
pub const SKETCH_BYTES: usize = TABLE_WIDTH * TABLE_DEPTH * 4;

fn idx(key: u64, row: usize) -> usize {
    (hash(key ^ row as u64) & (TABLE_WIDTH as u64 - 1)) as usize
}

fn sign(key: u64, row: usize) -> i32 {
    if hash(key ^ (TABLE_DEPTH + row) as u64) & 1 == 0 {
        1
    } else {
        -1
    }
}

fn table_to_bytes(table: &[i32]) -> bytes::Bytes {
    let mut out = bytes::BytesMut::with_capacity(SKETCH_BYTES);
    for c in table {
        out.extend_from_slice(&c.to_le_bytes());
    }
    out.freeze()
}

fn table_from_bytes(data: &[u8]) -> ElgaResult<Vec<i32>> {
    if data.len() != SKETCH_BYTES {
        return Err(ElgaError::protocol(format!(
            "sketch blob is {} bytes, expected {SKETCH_BYTES}",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().expect("len 4")))
        .collect())
}

/// A count-min sketch: `query` returns the minimum counter across rows and
/// never under-estimates a frequency.
#[derive(Debug, Clone)]
pub struct CountMinSketch {
    table: Vec<i32>,
}

impl Default for CountMinSketch {
    fn default() -> Self {
        Self {
            table: vec![0; TABLE_WIDTH * TABLE_DEPTH],
        }
    }
}

impl CountMinSketch {
    /// An empty sketch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a sketch from its serialized table.
    pub fn from_bytes(data: &[u8]) -> ElgaResult<Self> {
        Ok(Self {
            table: table_from_bytes(data)?,
        })
    }

    /// Count one occurrence of `key`.
    pub fn count(&mut self, key: u64) {
        for row in 0..TABLE_DEPTH {
            self.table[row * TABLE_WIDTH + idx(key, row)] += 1;
        }
    }

    /// Estimate the frequency of `key`.
    pub fn query(&self, key: u64) -> i32 {
        let mut min = self.table[idx(key, 0)];
        for row in 1..TABLE_DEPTH {
            min = min.min(self.table[row * TABLE_WIDTH + idx(key, row)]);
        }
        min
    }

    /// Count one occurrence and return the updated estimate in one pass.
    pub fn query_count(&mut self, key: u64) -> i32 {
        let mut min = i32::MAX;
        for row in 0..TABLE_DEPTH {
            let c = &mut self.table[row * TABLE_WIDTH + idx(key, row)];
            *c += 1;
            min = min.min(*c);
        }
        min
    }

    /// Element-wise addition of another sketch.
    pub fn merge(&mut self, other: &CountMinSketch) {
        for (a, b) in self.table.iter_mut().zip(other.table.iter()) {
            *a += b;
        }
    }

    /// Element-wise maximum, for merging sketches that counted overlapping
    /// streams.
    pub fn disjoint_merge(&mut self, other: &CountMinSketch) {
        for (a, b) in self.table.iter_mut().zip(other.table.iter()) {
            *a = (*a).max(*b);
        }
    }

    /// Byte-exact view of the raw counters.
    pub fn serialize(&self) -> bytes::Bytes {
        table_to_bytes(&self.table)
    }

    /// Overwrite the table from a serialized blob.
    pub fn update(&mut self, data: &[u8]) -> ElgaResult<()> {
        self.table = table_from_bytes(data)?;
        Ok(())
    }

    /// Zero every counter.
    pub fn clear(&mut self) {
        self.table.iter_mut().for_each(|c| *c = 0);
    }
}

/// A count sketch: updates carry a per-row sign and `query` returns the
/// median of the signed per-row estimates, trading one-sided error for
/// unbiasedness.
#[derive(Debug, Clone)]
pub struct CountSketch {
    table: Vec<i32>,
}

impl Default for CountSketch {
    fn default() -> Self {
        Self {
            table: vec![0; TABLE_WIDTH * TABLE_DEPTH],
        }
    }
}

impl CountSketch {
    /// An empty sketch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a sketch from its serialized table.
    pub fn from_bytes(data: &[u8]) -> ElgaResult<Self> {
        Ok(Self {
            table: table_from_bytes(data)?,
        })
    }

    /// Count one occurrence of `key`.
    pub fn count(&mut self, key: u64) {
        for row in 0..TABLE_DEPTH {
            self.table[row * TABLE_WIDTH + idx(key, row)] += sign(key, row);
        }
    }

    /// Estimate the frequency of `key`.
    pub fn query(&self, key: u64) -> i32 {
        let mut res = [0i32; TABLE_DEPTH];
        for (row, r) in res.iter_mut().enumerate() {
            *r = self.table[row * TABLE_WIDTH + idx(key, row)] * sign(key, row);
        }
        res.sort_unstable();
        let mid = TABLE_DEPTH / 2;
        if TABLE_DEPTH % 2 == 1 {
            res[mid]
        } else {
            (res[mid - 1] + res[mid]) / 2
        }
    }

    /// Count one occurrence and return the updated estimate.
    pub fn query_count(&mut self, key: u64) -> i32 {
        self.count(key);
        self.query(key)
    }

    /// Element-wise addition of another sketch.
    pub fn merge(&mut self, other: &CountSketch) {
        for (a, b) in self.table.iter_mut().zip(other.table.iter()) {
            *a += b;
        }
    }

    /// Byte-exact view of the raw counters.
    pub fn serialize(&self) -> bytes::Bytes {
        table_to_bytes(&self.table)
    }

    /// Overwrite the table from a serialized blob.
    pub fn update(&mut self, data: &[u8]) -> ElgaResult<()> {
        self.table = table_from_bytes(data)?;
        Ok(())
    }

    /// Zero every counter.
    pub fn clear(&mut self) {
        self.table.iter_mut().for_each(|c| *c = 0);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn count_min_never_underestimates() {
        let mut s = CountMinSketch::new();
        for _ in 0..7 {
            s.count(42);
        }
        for _ in 0..3 {
            s.count(43);
        }
        assert!(s.query(42) >= 7);
        assert!(s.query(43) >= 3);
        assert_eq!(0, s.query(9_999_999));
    }

    #[test]
    fn query_count_matches_count_then_query() {
        let mut a = CountMinSketch::new();
        let mut b = CountMinSketch::new();
        for i in 0..100u64 {
            let qc = a.query_count(i % 10);
            b.count(i % 10);
            assert_eq!(b.query(i % 10), qc);
        }
    }

    #[test]
    fn merge_adds_and_disjoint_merge_maxes() {
        let mut a = CountMinSketch::new();
        let mut b = CountMinSketch::new();
        for _ in 0..4 {
            a.count(7);
        }
        for _ in 0..9 {
            b.count(7);
        }

        let mut sum = a.clone();
        sum.merge(&b);
        assert!(sum.query(7) >= 13);

        let mut mx = a.clone();
        mx.disjoint_merge(&b);
        assert_eq!(9, mx.query(7));
    }

    #[test]
    fn serialize_round_trip_is_byte_exact() {
        let mut s = CountMinSketch::new();
        for i in 0..500u64 {
            s.count(i);
        }
        let blob = s.serialize();
        assert_eq!(SKETCH_BYTES, blob.len());
        let t = CountMinSketch::from_bytes(&blob).unwrap();
        assert_eq!(blob, t.serialize());

        assert!(CountMinSketch::from_bytes(&blob[1..]).is_err());
    }

    #[test]
    fn count_sketch_estimates_heavy_keys() {
        let mut s = CountSketch::new();
        for _ in 0..1000 {
            s.count(5);
        }
        for i in 0..200u64 {
            s.count(1_000_000 + i);
        }
        let est = s.query(5);
        assert!((900..=1100).contains(&est), "estimate {est}");
    }

    #[test]
    fn count_sketch_merge_and_serialize() {
        let mut a = CountSketch::new();
        let mut b = CountSketch::new();
        for _ in 0..50 {
            a.count(3);
            b.count(3);
        }
        a.merge(&b);
        assert!((90..=110).contains(&a.query(3)));

        let blob = a.serialize();
        let c = CountSketch::from_bytes(&blob).unwrap();
        assert_eq!(a.query(3), c.query(3));
    }
}
