//! # dlrelay-core
//!
//! Core library for dlrelay - a relay between a page's analytics event queue
//! and a measurement endpoint.
//!
//! This library provides:
//! - Domain types for pushed records and outbound parameters
//! - Filtering, parameter shaping and carry-over fields
//! - The transport gate, its guarded handle slot and HTTP delivery
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! A record flows through one pipeline:
//! - **Intercept:** the queue's own push runs first, then the record is scheduled
//! - **Shape:** persistence, filtering and the well-known/bundle split
//! - **Deliver:** the gate queues until the transport is ready, then sends directly
//!
//! ## Example
//!
//! ```rust,no_run
//! use dlrelay_core::{Config, DataLayer, EventValue, Initialization, RelayEngine};
//!
//! let config = Config::load().expect("failed to load config");
//! let mut relay = RelayEngine::install(&config, DataLayer::new());
//!
//! relay.push(vec![EventValue::from(serde_json::json!({"event": "page_view"}))]);
//! if let Initialization::LoadScript(request) = relay.initialize() {
//!     println!("load {}", request.url);
//! }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use error::{Error, Result};
pub use relay::{DataLayer, DispatchPolicy, ObservedQueue, Outcome, RelayEngine, RelayReport, RelayStats};
pub use transport::{Initialization, ScriptRequest, TransportCommand, TransportHandle};
pub use types::*;

// Public modules
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod persist;
pub mod relay;
pub mod shape;
pub mod template;
pub mod transport;
pub mod types;
