//! # Architect Core
//!
//! The control-plane core for multi-agent development orchestration: a task
//! queue and dispatch engine (C1), a session orchestrator that keeps
//! interactive assistant sessions fed with work (C2), and a prompt
//! auto-responder that detects and answers routine confirmation prompts so
//! sessions never idle on a yes/no question (C3).
//!
//! ## Modules
//!
//! - [`lock`] — advisory file lock preventing concurrent mutation of shared
//!   state directories.
//! - [`storage`] — the embedded relational engine (SQLite via `rusqlite`)
//!   backing every other module: tasks, templates, batches, workers,
//!   sessions, webhooks, prompt patterns, watchers, and rollback metadata.
//! - [`queue`] — C1: task submission, priority claim, completion, retry,
//!   and batch expansion.
//! - [`dispatcher`] — C2: the session-assignment loop, heartbeats, and
//!   graceful shutdown state machine.
//! - [`responder`] — C3: pattern-matching pipeline, risk-scored response
//!   delay, and the pattern-change learning loop.
//! - [`csrf`] — double-submit CSRF token issuance and validation for the
//!   operator HTTP surface.
//! - [`watcher`] — per-user task watch subscriptions and notification
//!   fan-out.
//! - [`rollback`] — point-in-time database + git snapshot and restore.
//! - [`http`] — the operator HTTP/JSON surface (axum), wiring CSRF
//!   middleware in front of the queue/dispatcher/responder APIs.
//!
//! ## Stability
//!
//! The library API is subject to change before v1.0.0.

/// Advisory file lock preventing concurrent mutation of shared state.
pub mod lock;

/// The embedded relational storage engine.
pub mod storage;

/// C1: task queue and dispatch core.
pub mod queue;

/// C2: session orchestrator / dispatcher.
pub mod dispatcher;

/// C3: prompt auto-responder.
pub mod responder;

/// CSRF token issuance and validation.
pub mod csrf;

/// Per-user task watch subscriptions.
pub mod watcher;

/// Point-in-time rollback snapshots.
pub mod rollback;

/// Operator HTTP/JSON surface.
pub mod http;

/// Configurable retry strategies with backoff and jitter.
pub use architect_retry as retry;

/// Signed webhook delivery.
pub use architect_webhook as webhook;

/// Core domain types shared across the control plane.
pub use architect_types as types;
