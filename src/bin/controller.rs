//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use clap::Parser;
use std::sync::Arc;
use stria::{
    catalog::Catalog,
    controller::Controller,
    server::{routes, ServerConfig},
};
use tokio_util::sync::CancellationToken;
use warp::Filter;

#[macro_use]
extern crate tracing;

#[tokio::main]
async fn main() {
    AppOptions::parse().run().await;
}

#[derive(Debug, Parser)]
#[clap(about)]
struct AppOptions {
    /// Minimum level of logs to print.
    #[clap(long, default_value = "warn", env = "ST_LOG_LEVEL")]
    log_level: String,

    /// Port on which the API server listens.
    #[clap(long, default_value = "8080", env = "ST_PORT")]
    port: u16,

    /// PostgreSQL catalog connection string.
    #[clap(long, env = "ST_DB_CONNECTION")]
    db_connection: String,

    /// Maximum number of open catalog connections.
    #[clap(long, default_value = "10", env = "ST_DB_MAX_CONNECTIONS")]
    db_max_connections: u32,
}

impl AppOptions {
    pub async fn run(self) {
        // initialize logger
        tracing_subscriber::fmt()
            .with_env_filter(&self.log_level)
            .init();

        debug!("parsed options: {:?}", self);

        let Self {
            log_level: _,
            port,
            db_connection,
            db_max_connections,
        } = self;

        debug!("connecting to database");

        // catalog client
        let catalog = Catalog::new(db_connection, db_max_connections)
            .expect("failed to initialize catalog client");
        catalog
            .migrate()
            .await
            .expect("failed to migrate catalog schema");

        let controller = Arc::new(Controller::new(catalog));

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("termination signal received; stopping");
            stop.cancel();
        });

        info!("initialization complete; starting http server");

        // frontend server
        let (addr, server) = warp::serve(
            routes(ServerConfig {
                controller,
                cancel: cancel.clone(),
            })
            .with(warp::log("warp")),
        )
        .bind_with_graceful_shutdown(([0, 0, 0, 0], port), cancel.cancelled_owned());

        info!("http server started on {addr}");
        server.await;
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install signal handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
