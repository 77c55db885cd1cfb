//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the streaming core:
//! - Logging and tracing infrastructure
//! - Configuration management and bridge injection
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that `core-streaming` depends on.
//! It establishes the logging conventions, fail-fast configuration and event
//! broadcasting used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
