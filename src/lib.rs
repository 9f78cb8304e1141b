pub mod config;
pub mod logger;
pub mod observer;
pub mod server;
pub mod statistics;

use anyhow::Result;
use tokio::signal::unix::{SignalKind, signal};

use self::{config::Config, statistics::Statistics};

/// In order to let integration tests start the proxy without going
/// through the binary, a function replaces the main function here.
pub async fn startup(config: Config) -> Result<()> {
    let setup = config.build()?;
    let statistics = Statistics::default();

    server::start(setup, &statistics).await?;

    // SIGHUP reopens the log file for external rotation; SIGPIPE is
    // swallowed so a dying peer cannot take the process with it.
    // Everything else terminates the process, which is the normal
    // teardown path.
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        loop {
            hangup.recv().await;
            match logger::reopen() {
                Ok(()) => log::info!("log file reopened"),
                Err(e) => log::error!("unable to reopen the log file: {e:#}"),
            }
        }
    });

    let mut pipe = signal(SignalKind::pipe())?;
    tokio::spawn(async move {
        loop {
            pipe.recv().await;
        }
    });

    // The proxy is non-blocking after it runs; keep the process from
    // exiting.
    std::future::pending::<()>().await;

    Ok(())
}
