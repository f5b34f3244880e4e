//! grid-study-core: the build-state tree behind a power-grid study.
//!
//! A study is a versioned tree of network modifications. Each node can be
//! materialized against one or more independent base-network baselines
//! ("root networks"), producing a network variant and, later, computation
//! results from remote services. This crate owns the per (node, root
//! network) build-state matrix: linking, invalidation, variant lifecycle,
//! and the best-effort asynchronous cleanup of remote resources.

pub mod builder;
pub mod cleanup;
pub mod config;
pub mod domain;
pub mod executor;
pub mod service;
pub mod stores;
pub mod telemetry;
pub mod tree;
