#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use direktiv_functions::{k8s, Builder, Config, Manager, Registry, Scheduler, Server};
use futures::{future, prelude::*};
use std::net::SocketAddr;
use std::sync::Arc;
use structopt::StructOpt;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

#[derive(Debug, StructOpt)]
#[structopt(name = "direktiv-functions", about = "Function execution control plane")]
struct Args {
    /// Path to the YAML configuration file.
    #[structopt(long, default_value = "/etc/direktiv/functions.yaml")]
    config: String,

    /// Address the gRPC surface binds to.
    #[structopt(long, default_value = "0.0.0.0:5555")]
    grpc_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let Args { config, grpc_addr } = Args::from_args();
    let config = Arc::new(Config::load(&config)?);

    let cluster = k8s::Cluster::connect(config.namespace.clone()).await?;
    let lock = k8s::Lock::new(cluster.config_maps());
    let registry = Registry::new(&cluster);
    let builder = Builder::new(config.clone());
    let manager = Arc::new(Manager::new(
        cluster.clone(),
        builder.clone(),
        registry.clone(),
        lock.clone(),
        config.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        cluster.clone(),
        builder,
        registry.clone(),
        lock,
        config.clone(),
    ));

    // The scheduler must have folded the initial job listing into its gauge
    // before the RPC surface opens.
    let (ready_tx, mut ready_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(
        scheduler.clone().run(ready_tx).instrument(info_span!("scheduler")),
    );
    while !*ready_rx.borrow() {
        ready_rx.changed().await?;
    }
    info!("Scheduler ready");

    let (drain_tx, drain_rx) = drain::channel();
    let server = Server::new(
        cluster,
        manager,
        scheduler,
        registry,
        config,
        drain_rx.clone(),
    );
    let grpc = tokio::spawn(
        async move {
            let shutdown = drain_rx.signaled().map(|_| ());
            match server.serve(grpc_addr, shutdown).await {
                Ok(()) => debug!("Shutdown"),
                Err(error) => error!(%error, "Server failed"),
            }
        }
        .instrument(info_span!("grpc")),
    );
    info!(%grpc_addr, "Serving");

    let ctrl_c = tokio::signal::ctrl_c();
    let term = async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => term.recv().await,
            _ => future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Interrupted"),
        _ = term => info!("Terminated"),
    }

    // Stop accepting RPCs and drain in-flight watch streams, then stop the
    // scheduler.
    drain_tx.drain().await;
    scheduler_task.abort();
    grpc.await?;
    Ok(())
}
