//! The built-in vertex algorithms.
//!
//! Each implements [Algorithm](elga_api::Algorithm) with its own local
//! state, replica contribution, and notification payload. Which one a
//! cluster runs is fixed by configuration at startup.

mod pagerank;
pub use pagerank::PageRank;

mod wcc;
pub use wcc::Wcc;

mod bfs;
pub use bfs::Bfs;

mod kcore;
pub use kcore::KCore;

mod lpa;
pub use lpa::Lpa;
