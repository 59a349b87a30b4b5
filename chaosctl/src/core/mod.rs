//! Deterministic, pure logic shared by the controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod invariants;
pub mod preconditions;
pub mod selection;
pub mod status;
pub mod tag_filter;
pub mod types;
