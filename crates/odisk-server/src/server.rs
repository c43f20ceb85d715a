use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use odisk_media::{CommandRunner, DiskRegistry, RegistryConfig, SystemCommandRunner};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::announce::{self, Announcer, LogAnnouncer, MdnsAnnouncer};
use crate::AppState;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Address published in the service record.
    pub advertise_host: IpAddr,
    pub image_root: PathBuf,
    pub include_removable: bool,
    pub poll_interval: Duration,
    pub tool_timeout: Duration,
    pub disable_metrics: bool,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, image_root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr,
            advertise_host: bind_addr.ip(),
            image_root: image_root.into(),
            include_removable: false,
            poll_interval: Duration::from_secs(5),
            tool_timeout: odisk_media::DEFAULT_TOOL_TIMEOUT,
            disable_metrics: false,
        }
    }
}

pub struct RunningServer {
    addr: SocketAddr,
    registry: Arc<DiskRegistry>,
    shutdown_tx: watch::Sender<bool>,
    join: Option<JoinHandle<anyhow::Result<()>>>,
    background: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &Arc<DiskRegistry> {
        &self.registry
    }

    /// Stop accepting connections, let in-flight requests finish and withdraw the announcement.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.shutdown_tx.send_replace(true);

        if let Some(join) = self.join.take() {
            join.await.context("server task panicked")??;
        }
        for task in self.background.drain(..) {
            task.await.context("background task panicked")?;
        }
        Ok(())
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);

        if let Some(join) = self.join.take() {
            join.abort();
        }
        for task in self.background.drain(..) {
            task.abort();
        }
    }
}

/// Start the server with the system tool runner, announcing over multicast DNS.
///
/// Falls back to logging the service record when no mDNS responder can be started.
pub async fn start(config: ServerConfig) -> anyhow::Result<RunningServer> {
    let runner = Arc::new(SystemCommandRunner::new(config.tool_timeout));
    let announcer: Arc<dyn Announcer> = match MdnsAnnouncer::new() {
        Ok(mdns) => Arc::new(mdns),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "mDNS unavailable; service record will only be logged");
            Arc::new(LogAnnouncer)
        }
    };
    start_with(config, runner, announcer).await
}

pub async fn start_with(
    config: ServerConfig,
    runner: Arc<dyn CommandRunner>,
    announcer: Arc<dyn Announcer>,
) -> anyhow::Result<RunningServer> {
    let registry = Arc::new(DiskRegistry::new(
        RegistryConfig::new(&config.image_root).with_include_removable(config.include_removable),
        runner,
    ));
    registry
        .refresh()
        .await
        .with_context(|| format!("enumerate disks under {}", config.image_root.display()))?;

    let app = crate::app(
        AppState::new(Arc::clone(&registry)).with_disable_metrics(config.disable_metrics),
    );

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    let addr = listener.local_addr().context("read bound address")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let background = vec![
        tokio::spawn(poll_registry(
            Arc::clone(&registry),
            config.poll_interval,
            shutdown_rx.clone(),
        )),
        tokio::spawn(announce::run(
            Arc::clone(&registry),
            announcer,
            announce::local_hostname(),
            config.advertise_host,
            addr.port(),
            shutdown_rx.clone(),
        )),
    ];

    let mut serve_shutdown = shutdown_rx;
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = serve_shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .context("serve")?;
        Ok(())
    });

    tracing::info!(%addr, root = %config.image_root.display(), "odisk-server started");

    Ok(RunningServer {
        addr,
        registry,
        shutdown_tx,
        join: Some(join),
        background,
    })
}

/// Refresh the registry every `interval`. Failures keep the previous snapshot.
async fn poll_registry(
    registry: Arc<DiskRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial enumeration already happened.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = registry.refresh().await {
                    tracing::warn!(error = %err, "registry refresh failed; keeping previous disks");
                }
            }
            _ = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            } => break,
        }
    }
}
