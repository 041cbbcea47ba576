//! Component lifecycle and orchestration for the Woodwork runtime.
//!
//! Handles:
//! - **Components**: capability traits a component may implement and the
//!   flag set detected once at registration.
//! - **Factory**: construction of live components from a resolved graph.
//! - **Context**: the run-scoped registry of instances and their state.
//! - **Lifecycle**: the concurrent init/start driver with progress events.
//! - **Backends**: the sequential chain and the message bus.
//! - **Engine**: the facade tying parse, build, bring-up and run together.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod bus;
pub mod component;
pub mod config;
pub mod context;
pub mod engine;
pub mod factory;
pub mod lifecycle;
pub mod progress;
pub mod settings;
