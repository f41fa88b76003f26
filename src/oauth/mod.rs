// ABOUTME: OAuth module: authorization state machine types and submodules
// ABOUTME: PKCE generation and the initiate/callback state manager
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! # OAuth state machine
//!
//! Two halves: [`state::OAuthStateManager::initiate`] issues a single-use
//! state row and builds the provider authorization URL;
//! [`state::OAuthStateManager::handle_callback`] consumes the row, exchanges
//! the code, and lands the connection. The single-use guard lives in the
//! store's conditional update so it holds across processes.

pub mod pkce;
pub mod state;

pub use pkce::PkcePair;
pub use state::{CallbackRedirect, ConnectInitiation, OAuthStateManager};
