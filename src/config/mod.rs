// ABOUTME: Configuration module for environment-driven broker settings
// ABOUTME: Re-exports the environment parser as the crate-level config surface
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Configuration loading for the broker.

pub mod environment;

pub use environment::{Environment, ProviderCredentials, ServerConfig};
