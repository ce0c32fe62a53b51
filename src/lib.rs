//! A single-node proof-of-work ledger.
//!
//! Blocks are sealed by proof of work and chained by hash in a sled
//! database. Value moves through unspent transaction outputs, and a derived
//! index of those outputs is kept next to the chain.

pub mod blockchain;
pub mod config;
