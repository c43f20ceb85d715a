//! Service announcement.
//!
//! Clients discover the server through a `_odisk._tcp` service record whose properties list every
//! shared disk. The record is rebuilt and re-published whenever the registry reports a change in
//! its disk set. [`MdnsAnnouncer`] registers it with multicast DNS; [`LogAnnouncer`] only logs it.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use odisk_media::{DiskRegistry, DiskSnapshot};
use tokio::sync::watch;

pub const SERVICE_TYPE: &str = "_odisk._tcp.local.";

/// Fixed system descriptor clients expect under the `sys` key.
const SYSTEM_PROPERTY: &str = "waMA=A4:BA:DB:E7:89:CD,adVF=0x4,adDT=0x3,adCC=1";
const MEDIA_TYPE: &str = "public.cd-media";
const FALLBACK_HOSTNAME: &str = "odisk";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_type: &'static str,
    /// Host label the instance is named after.
    pub hostname: String,
    /// Fully-qualified instance name, `<hostname>._odisk._tcp.local.`.
    pub instance: String,
    pub host: IpAddr,
    pub port: u16,
    pub properties: BTreeMap<String, String>,
}

impl ServiceRecord {
    pub async fn from_snapshot(
        hostname: &str,
        host: IpAddr,
        port: u16,
        snapshot: &DiskSnapshot,
    ) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("sys".to_string(), SYSTEM_PROPERTY.to_string());
        for (id, disk) in snapshot.iter() {
            let label = match disk.label().await {
                Some(label) => label,
                None => disk
                    .filename()
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| id.to_string()),
            };
            tracing::info!(
                filename = %disk.filename().display(),
                disk_id = id,
                label = %label,
                "announcing disk"
            );
            properties.insert(id.to_string(), format!("adVN={label},adVT={MEDIA_TYPE}"));
        }

        Self {
            service_type: SERVICE_TYPE,
            hostname: hostname.to_string(),
            instance: format!("{hostname}.{SERVICE_TYPE}"),
            host,
            port,
            properties,
        }
    }
}

/// Publishes service records on the local network.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn publish(&self, record: &ServiceRecord) -> anyhow::Result<()>;

    async fn withdraw(&self, record: &ServiceRecord) -> anyhow::Result<()>;
}

/// Logs records instead of registering them with a responder.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    async fn publish(&self, record: &ServiceRecord) -> anyhow::Result<()> {
        tracing::info!(
            instance = %record.instance,
            host = %record.host,
            port = record.port,
            properties = ?record.properties,
            "service published"
        );
        Ok(())
    }

    async fn withdraw(&self, record: &ServiceRecord) -> anyhow::Result<()> {
        tracing::info!(instance = %record.instance, "service withdrawn");
        Ok(())
    }
}

/// Registers records with the multicast DNS responder running in the background.
pub struct MdnsAnnouncer {
    daemon: ServiceDaemon,
}

impl MdnsAnnouncer {
    pub fn new() -> anyhow::Result<Self> {
        let daemon = ServiceDaemon::new().context("start mDNS responder")?;
        Ok(Self { daemon })
    }
}

impl Drop for MdnsAnnouncer {
    fn drop(&mut self) {
        if let Err(err) = self.daemon.shutdown() {
            tracing::debug!(error = %err, "mDNS responder already stopped");
        }
    }
}

#[async_trait]
impl Announcer for MdnsAnnouncer {
    async fn publish(&self, record: &ServiceRecord) -> anyhow::Result<()> {
        self.daemon
            .register(service_info(record)?)
            .with_context(|| format!("register {}", record.instance))?;
        tracing::info!(
            instance = %record.instance,
            host = %record.host,
            port = record.port,
            disks = record.properties.len().saturating_sub(1),
            "service registered"
        );
        Ok(())
    }

    async fn withdraw(&self, record: &ServiceRecord) -> anyhow::Result<()> {
        self.daemon
            .unregister(&record.instance)
            .with_context(|| format!("unregister {}", record.instance))?;
        tracing::info!(instance = %record.instance, "service unregistered");
        Ok(())
    }
}

/// mDNS form of a record. The responder answers for `<hostname>.local.`.
fn service_info(record: &ServiceRecord) -> anyhow::Result<ServiceInfo> {
    let host_label = record.hostname.split('.').next().unwrap_or(&record.hostname);
    let properties: HashMap<String, String> = record.properties.clone().into_iter().collect();
    ServiceInfo::new(
        record.service_type,
        &record.hostname,
        &format!("{host_label}.local."),
        record.host,
        record.port,
        properties,
    )
    .with_context(|| format!("build service info for {}", record.instance))
}

/// Host name used for the service instance.
pub fn local_hostname() -> String {
    let name = gethostname::gethostname();
    let name = name.to_string_lossy();
    let name = name.trim();
    if name.is_empty() {
        FALLBACK_HOSTNAME.to_string()
    } else {
        name.to_string()
    }
}

/// Publish the current disk set, then re-publish on every registry change until `shutdown`
/// flips to `true`. The last record is withdrawn on exit.
pub async fn run(
    registry: Arc<DiskRegistry>,
    announcer: Arc<dyn Announcer>,
    hostname: String,
    host: IpAddr,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut changes = registry.subscribe();
    let mut published: Option<ServiceRecord> = None;

    loop {
        changes.borrow_and_update();
        let snapshot = registry.snapshot();
        let record = ServiceRecord::from_snapshot(&hostname, host, port, &snapshot).await;
        if let Some(previous) = published.take() {
            if let Err(err) = announcer.withdraw(&previous).await {
                tracing::warn!(error = %err, "failed to withdraw service record");
            }
        }
        match announcer.publish(&record).await {
            Ok(()) => published = Some(record),
            Err(err) => tracing::warn!(error = %err, "failed to publish service record"),
        }

        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            } => break,
        }
    }

    if let Some(record) = published {
        if let Err(err) = announcer.withdraw(&record).await {
            tracing::warn!(error = %err, "failed to withdraw service record");
        }
    }
}
