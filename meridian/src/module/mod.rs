//! # Summary
//!
//! This module contains the pipeline components of a machine. Each one owns
//! a message loop over its inproc channel — a hand-polled future spawned on
//! its own task — and communicates exclusively by envelope passing; no state
//! is shared between components.

/// Client-facing admission and response aggregation.
pub mod server;

/// Home-region resolution and single-home/multi-home routing.
pub mod forwarder;

/// Per-region batching and log proposal.
pub mod sequencer;

/// Deterministic interleaving of batches and multi-home transactions.
pub mod orderer;

/// Lock acquisition and transaction lifecycle.
pub mod scheduler;

/// Transaction execution against storage.
pub mod worker;

/// Clock skew estimation between machines.
pub mod clock;
