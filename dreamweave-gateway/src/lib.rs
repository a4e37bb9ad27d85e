//! # Dreamweave Gateway
//!
//! An AI provider gateway that accepts natural-language dream prompts and
//! returns validated, schema-conformant structured scene content. The
//! gateway owns provider selection, health tracking, retry orchestration,
//! response extraction and repair, fallback progression, and the metric
//! and alerting machinery feeding its own decisions.
//!
//! ## Request flow
//!
//! ```text
//! request → ProviderManager (scored selection)
//!         → ProviderInvoker (rate limiter + circuit gates, dispatch)
//!         → extraction (dreamweave-providers)
//!         → ValidationPipeline → RepairEngine on failure
//!         → RetryOrchestrator (retry / re-prompt / move / give up)
//!         → EmergencyFallback when everything is exhausted
//! ```
//!
//! The health monitor, metrics collector, and alerting system observe every
//! step over the event bus and feed weights back into selection.
//!
//! ## Modules
//!
//! - [`manager`]: top-level coordinator, the `Generate` operation
//! - [`invoker`]: single-attempt execution under admission gates
//! - [`retry`]: the per-kind decision table and backoff policy
//! - [`validation`] / [`repair`]: three-phase schema checks and bounded
//!   candidate repair
//! - [`fallback`]: deterministic local synthesis of last resort
//! - [`registry`]: provider runtime entries and serialized status
//! - [`health`] / [`metrics`] / [`alerts`]: the observation stack
//! - [`server`] / [`handlers`]: the axum HTTP surface
//! - [`config`]: TOML configuration, env overrides, startup validation
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dreamweave_gateway::{config::Config, server::create_server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml")?;
//!     let app = create_server(config).await?;
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod alerts;
pub mod cache;
pub mod config;
pub mod events;
pub mod fallback;
pub mod gateway_error;
pub mod handlers;
pub mod health;
pub mod invoker;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod repair;
pub mod retry;
pub mod server;
pub mod validation;

pub use config::Config;
pub use gateway_error::GatewayError;
pub use manager::ProviderManager;
pub use server::{create_server, AppState};
