//! agent-hub: runs untrusted agents in isolated, ephemeral containers.
//!
//! ```text
//!            submit_job                     recover / health_check
//!                │                                  │
//!   ┌────────────▼──────────────────────────────────▼─────────┐
//!   │                      Dispatcher                          │
//!   │  ContextStore  JobStore  JobQueue   worker pool          │
//!   │                                 │                        │
//!   │       AgentRegistry ─► SecurityPolicyGate                │
//!   │                                 │                        │
//!   │                     ContainerManager ─► ContainerRuntime │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Jobs move `queued → running → succeeded | failed | cancelled`, with
//! `timed_out` and `retrying` recording why a retry happened. Each attempt
//! gets its own container, its own execution record and its own slot under
//! the global concurrency cap.

pub mod agents;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod observability;
pub mod policy;
pub mod queue;
pub mod sandbox;
pub mod util;

pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherDeps, HealthReport, RecoveryReport};
pub use error::{Error, Result};
