//! PolicyGate Gateway
//!
//! HTTP front door that submits template registrations and source-control
//! webhooks to an external policy engine and enforces the verdict.
//!
//! This crate provides:
//! - Configuration loading (YAML file, CLI flags, environment)
//! - The shared enforcement pipeline and application state
//! - The axum router for `/register`, `/webhook`, `/health` and `/metrics`
//! - The background dispatcher running post-decision side effects
//! - Webhook signature verification

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod effects;
pub mod pipeline;
pub mod routes;
pub mod signature;

pub use cli::Cli;
pub use config::{GatewayConfig, LogFormat};
pub use dispatcher::{DispatchSettings, Dispatcher, EffectPlan};
pub use effects::{AuditEffect, EffectContext, EffectError, HookEffect, SideEffect};
pub use pipeline::{execute, AppState};
pub use routes::{create_router, GatewayError};
