#![deny(missing_docs)]
//! ElGA API contains the shared types and module seams of the ElGA elastic
//! graph system: endpoint addresses, edges and updates, the little-endian
//! wire codec, the message-kind enumeration, process configuration, and the
//! vertex-algorithm trait.
//!
//! If you want to run ElGA itself, please see the elga crate.

mod error;
pub use error::*;

pub mod address;
pub use address::{Address, SocketKind};

pub mod types;
pub use types::*;

pub mod protocol;
pub use protocol::MsgKind;

pub mod pack;
pub use pack::{Packer, Unpacker, WireFixed};

pub mod config;
pub use config::*;

pub mod algorithm;
pub use algorithm::*;
