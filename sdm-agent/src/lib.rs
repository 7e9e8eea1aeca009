//! Storage domain job agent.
//!
//! Runs volume-mutating jobs (qcow2 attribute amendment, data copy) against
//! storage domains, serializing access per image through a resource guard
//! and protecting volume metadata with a generation counter.

pub mod config;
pub mod file_domain;
pub mod guard;
pub mod jobs;
pub mod qemu_img;
pub mod scheduler;
