//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the sidecar sync engine:
//! - Logging and tracing infrastructure
//! - Typed configuration loading and validation
//! - Event bus system for catalog, watch and sidecar notifications
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the catalog and sync crates
//! depend on. It establishes the logging conventions and the event
//! broadcasting mechanism used to tell collaborators (publish workflow,
//! presentation layer) that the catalog changed.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
