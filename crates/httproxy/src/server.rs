//! Process Bootstrap (C0): binds the shared listener, fans out `concurrency`
//! worker tasks each running their own accept loop (grounded in
//! `rproxy::start::handle_local_target` / `httproxy::start::handle_local_target`,
//! replicated rather than forked — see DESIGN.md), and drains in-flight
//! connections before returning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use smol::future;
use smol::net::{TcpListener, TcpStream};

use crate::cmd::Args;
use crate::connection::{self, ConnectionConfig};
use crate::headers::{self, HeaderMiddleware};
use crate::init::shutdown::GracefulShutdown;
use crate::upstream::UpstreamClient;

pub async fn run(args: Args, shutdown: GracefulShutdown) -> Result<()> {
    let listener = TcpListener::bind(args.bind).await.with_context(|| format!("binding to {}", args.bind))?;
    log::info!("httproxy listening on {} with {} worker task(s)", args.bind, args.concurrency.max(1));

    let listener = Arc::new(listener);
    let middlewares: Arc<Vec<Box<dyn HeaderMiddleware>>> = Arc::new(headers::build_chain(&args.headers_middleware));
    let client = Arc::new(UpstreamClient::new());
    let config = Arc::new(ConnectionConfig {
        server_software: args.server_software.clone(),
        keep_alive: Duration::from_secs(args.keep_alive),
    });

    let mut workers = Vec::with_capacity(args.concurrency.max(1));
    for worker_id in 0..args.concurrency.max(1) {
        let listener = listener.clone();
        let shutdown = shutdown.clone();
        let middlewares = middlewares.clone();
        let client = client.clone();
        let config = config.clone();
        workers.push(smol::spawn(async move { accept_loop(worker_id, listener, shutdown, middlewares, client, config).await }));
    }

    for worker in workers {
        worker.await?;
    }

    shutdown.wait_inflight_zero().await;
    log::info!("all in-flight connections drained");
    Ok(())
}

async fn accept_loop(
    worker_id: usize,
    listener: Arc<TcpListener>,
    shutdown: GracefulShutdown,
    middlewares: Arc<Vec<Box<dyn HeaderMiddleware>>>,
    client: Arc<UpstreamClient>,
    config: Arc<ConnectionConfig>,
) -> Result<()> {
    loop {
        let Some((stream, peer)) = accept_or_shutdown(&listener, &shutdown).await? else {
            break;
        };
        log::debug!("worker={worker_id} accepted {peer}");

        let guard = shutdown.inflight_guard();
        let middlewares = middlewares.clone();
        let client = client.clone();
        let config = config.clone();
        smol::spawn(async move {
            let _guard = guard;
            if let Err(err) = connection::handle_connection(stream, peer, &client, &middlewares, &config).await {
                log::warn!("peer={peer} connection error: {err}");
            }
        })
        .detach();
    }

    Ok(())
}

async fn accept_or_shutdown(listener: &TcpListener, shutdown: &GracefulShutdown) -> std::io::Result<Option<(TcpStream, SocketAddr)>> {
    let accept_fut = async { listener.accept().await.map(Some) };
    let shutdown_fut = async {
        shutdown.wait_shutting_down().await;
        Ok(None)
    };
    future::or(accept_fut, shutdown_fut).await
}
