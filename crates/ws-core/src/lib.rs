//! Core library for worksync — foundational types, configuration, the crypto
//! vault, and the SQLite persistence store.
//!
//! This crate is the bottom of the dependency stack and provides:
//! - Entity types shared across the sync pipeline (configs, mappings,
//!   identity registry, versions, conflicts, executions, webhooks, jobs)
//! - The transport-agnostic error taxonomy used by every other crate
//! - TOML configuration loading with defaulted sections
//! - Authenticated encryption for stored credentials and webhook signing
//! - The relational store all durable state lives in

pub mod cancel;
pub mod config;
pub mod error;
pub mod store;
pub mod types;
pub mod vault;
