//! Collabd - collaborative document server.
//!
//! Many clients attach to a shared document. A dedicated, sandboxed worker
//! process owns the live document; this crate is the front-end that spawns
//! and supervises those workers and relays traffic between them and the
//! clients.
//!
//! # Architecture
//!
//! ```text
//! client socket ──► PollEngine (acceptor) ──Join──► BrokerRegistry
//!                                                     │
//!                                  ┌──────────────────┘
//!                                  ▼
//!                 PollEngine (documents) ── DocumentBroker ──► worker control socket
//!                                  ▲              │                     │
//!                                  └── Relay ◄────┘◄────── Supervisor ◄─┘
//! ```
//!
//! # Modules
//!
//! - [`poll`] - thread-bound readiness-multiplexed socket dispatcher
//! - [`sandbox`] - seccomp lockdown and resource-limit directives
//! - [`worker`] - worker launch, liveness supervision and the worker-side loop
//! - [`broker`] - per-document session broker and the document registry
//! - [`relay`] - wire protocol, chunking and per-destination outbound queues
//! - [`server`] - listener, dispatcher and composition root

pub mod auth;
pub mod blob;
pub mod broker;
pub mod client;
pub mod config;
pub mod constants;
pub mod context;
pub mod env;
pub mod error;
pub mod poll;
pub mod relay;
pub mod sandbox;
pub mod server;
pub mod socket;
pub mod worker;

pub use broker::{BrokerState, DocumentBroker};
pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
