//! A small MapReduce engine: one coordinator hands out map and reduce tasks
//! over a local socket to any number of stateless worker processes.

pub mod mr;
