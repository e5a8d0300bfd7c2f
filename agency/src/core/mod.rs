//! Deterministic, pure logic shared by agency.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod identity;
pub mod meta;
pub mod naming;
pub mod repo;
pub mod resolver;
pub mod status;
