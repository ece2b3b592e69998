//! Mirrors the events of a ticketing contract into a relational database.

pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod contract;
pub mod database;
pub mod decoder;
pub mod indexer;
pub mod processor;
pub mod retry;

#[cfg(test)]
mod testing;
