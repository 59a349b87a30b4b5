//! Side-effecting adapters: filesystem, external CLIs, clocks.

pub mod atomic;
pub mod aws;
pub mod clock;
pub mod config;
pub mod fault_service;
pub mod init;
pub mod inventory;
pub mod journal;
pub mod process;
pub mod store;
pub mod submission;
pub mod tags;
