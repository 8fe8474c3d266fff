//! fleet-types — shared domain types for the resource fleet.
//!
//! Every other fleet crate speaks in these types: node identities and the
//! lifecycle graph, client principals and access scopes, the opaque
//! `NodeHandle` contract, and the `FleetError` taxonomy.
//!
//! # Node lifecycle
//!
//! ```text
//! Configuring ──► Free ◄──► Busy
//!      │           │  \    /  │
//!      │           │   Down   │
//!      │           │    │     │
//!      └──► Lost ◄─┴────┴─────┘
//!                       ▼
//!                   ToRemove ──► (deleted)
//! ```
//!
//! Only the core registry performs transitions; `NodeState::can_transition_to`
//! is the single definition of the graph.

pub mod client;
pub mod error;
pub mod handle;
pub mod types;

pub use client::{AccessType, Client, Permission};
pub use error::{FleetError, FleetResult};
pub use handle::NodeHandle;
pub use types::*;
