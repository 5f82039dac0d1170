//! Integration test suite for hive.
//!
//! These tests drive the coordinator, workflow engine, reaper and swarm
//! together through the public API and check the properties the system
//! promises to its agents.
//!
//! # Test Categories
//!
//! - `claims`: exclusivity, monotonic progress, terminal immutability
//! - `identity`: identifier uniqueness under concurrency
//! - `workflow_e2e`: compensation ordering, trace causality, cancellation
//! - `recovery`: reaper liveness and swarm recovery
//! - `contention`: conflict and error rates under concurrent load
//!
//! All stores are in memory or under a temporary directory.

mod fixtures;

mod claims;
mod contention;
mod identity;
mod recovery;
mod workflow_e2e;
