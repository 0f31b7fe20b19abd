use anyhow::Result;

mod cmd;
mod init;
mod server;
mod util;

// Exposed for integration tests under `tests/`, which exercise the proxy's
// internals over real loopback sockets rather than spawning the whole
// `run()` binary.
pub mod connection;
pub mod error;
pub mod error_render;
pub mod headers;
pub mod pipeline;
pub mod request;
pub mod tunnel;
pub mod upstream;

pub async fn run() -> Result<()> {
    let shutdown = init::shutdown::init()?;
    let args = init::cmd::init()?;

    server::run(args, shutdown).await?;
    log::info!("Shutdown complete.");
    Ok(())
}
