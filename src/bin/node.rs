//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use clap::Parser;
use std::path::PathBuf;
use stria::{disk::DiskStore, node::NodeService, proto::NodeServer};
use tokio_util::sync::CancellationToken;

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

    /// Port on which the node listens.
    #[clap(long, default_value = "8123", env = "ST_PORT")]
    port: u16,

    /// Root directory under which blobs are stored.
    #[clap(long, default_value = "./data", env = "ST_ROOT_DIR")]
    root_dir: PathBuf,
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
            root_dir,
        } = self;

        let store = DiskStore::new(root_dir).expect("failed to initialize disk store");
        let service = NodeService::new(store);

        let server = NodeServer::bind(port, service)
            .await
            .expect("failed to bind tcp listener");

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("termination signal received; stopping");
            stop.cancel();
        });

        info!("tcp server started on port {port}");
        server.run(cancel).await;
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
