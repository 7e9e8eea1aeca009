//! Storage Domain Manager Base Crate
//!
//! This crate contains shared type definitions and the collaborator traits
//! used by the storage job agent: volume metadata vocabulary, image tool
//! boundary, resource locking boundary and the job API types. It does not
//! contain any actual service implementations.

pub mod api;
pub mod image;
pub mod resource;
pub mod storage;
pub mod volume;
