//! kos rollout operator library.
//!
//! This crate primarily ships a `kos-operator` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod cleanup;
pub mod config;
pub mod controller;
pub mod health;
pub mod seed;
pub mod state;
