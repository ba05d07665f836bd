//! Trigger Invocation Engine
//!
//! Lets tenants subscribe to platform triggers and delivers invocations to
//! their targets:
//! - Subscription lifecycle (HTTP, SCRIPT, EVENTBRIDGE, WORKFLOW, INLINE)
//! - Invocation state machine with per-subscription filters
//! - Per-type dispatch guarded by a per-tenant, per-trigger circuit breaker
//! - Completion callbacks and deadline expiry
//! - Events staged through the transactional outbox

#[cfg(feature = "aws")]
pub mod aws;
pub mod catalog;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod filter;
pub mod invoker;
pub mod repository;
pub mod service;

pub use domain::*;
pub use error::{EtsError, Result};
