//! Adapters: in-process and durable implementations of the ports

pub mod assignment;
pub mod dead_letter;
pub mod membership;
pub mod persistence;
pub mod queue;
pub mod rocksdb_queue;
