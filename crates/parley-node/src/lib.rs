// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The parley node: authenticated WebSocket sessions speaking the framed
//! turn protocol, the REST request/response surface, and startup plumbing
//! that wires configuration into live components.

pub mod auth;
pub mod error;
pub mod http;
pub mod node;
pub mod protocol;
pub mod session;
pub mod state;

pub use error::{GatewayError, StartupError};
pub use node::{build_state, serve};
pub use protocol::{ClientFrame, ServerFrame};
pub use session::{Session, SessionLimits};
pub use state::AppState;
