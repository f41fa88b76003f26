// ABOUTME: Server binary: load config, connect the store, serve the broker
// ABOUTME: Runs migrations and provider seeding before accepting traffic
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! The `link-broker` server binary.

use anyhow::Result;
use clap::Parser;
use link_broker::config::ServerConfig;
use link_broker::logging::LoggingConfig;
use link_broker::server::{self, ServerResources};
use link_broker::store::{PostgresStore, Store};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "link-broker", version, about = "Multi-tenant OAuth broker and API gateway")]
struct Args {
    /// Skip schema migration at boot
    #[arg(long)]
    skip_migrations: bool,

    /// Re-encrypt stored secrets under the current key version, then exit
    #[arg(long)]
    rotate_keys: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    LoggingConfig::from_env().init()?;
    let config = ServerConfig::from_env()?;

    let postgres = PostgresStore::connect(&config.database_url).await?;
    if !args.skip_migrations {
        postgres.migrate().await?;
    }
    let store: Arc<dyn Store> = Arc::new(postgres);

    let resources = Arc::new(ServerResources::new(config, store));
    resources.seed_provider_configs().await?;

    if args.rotate_keys {
        let report =
            link_broker::crypto::rotate_stored_secrets(&resources.store, &resources.cipher).await?;
        tracing::info!(
            connections = report.connections,
            api_keys = report.api_keys,
            "rotation finished"
        );
        return Ok(());
    }

    server::serve(resources).await
}
