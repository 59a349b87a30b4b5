//! Chaos-experiment controller.
//!
//! Takes experiment definitions from an upstream producer, checks them against
//! live inventory, materializes fault-injection templates, and drives each
//! experiment through its lifecycle. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (tag filtering, preconditions,
//!   selection, status graph, backoff). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (store, inventory, fault service,
//!   configuration, journal). Behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`resolve`], [`validate`], [`lifecycle`], [`batch`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod batch;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod resolve;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
