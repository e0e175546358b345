#![deny(missing_docs)]
//! ElGA core contains the component implementations of the ElGA elastic
//! graph system: the frequency sketches and replication map, the
//! consistent-hash ring and edge-owner resolution, the chatterbox
//! messaging layer, and the directory master, directory, agent, streamer,
//! and client roles.

pub mod hash;

pub mod sketch;
pub use sketch::{CountMinSketch, CountSketch, SKETCH_BYTES};

pub mod replication;
pub use replication::ReplicationMap;

pub mod ring;
pub use ring::ConsistentHasher;

pub mod locator;
pub use locator::EdgeLocator;

pub mod ctx;
pub use ctx::ProcessCtx;

pub mod chatterbox;
pub use chatterbox::{Chatterbox, Incoming, Replier, Requester};

pub mod participant;
pub use participant::{Participant, Role};

pub mod directory_master;
pub use directory_master::DirectoryMaster;

pub mod directory;
pub use directory::Directory;

pub mod agent;
pub use agent::Agent;

pub mod algorithms;

pub mod streamer;
pub use streamer::Streamer;

pub mod client;
pub use client::Client;
