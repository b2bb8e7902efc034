//! The lease daemon: registry, RPC surface, and startup reconciliation.
//!
//! The daemon owns one coarse mutex over the client-id → lease map. Every
//! mutation is followed by a persistence attempt before the mutex is
//! released, so the lease file always reflects the registry. RPC handlers
//! report failures as reply payloads; nothing a single request does can
//! bring the process down.

use std::collections::HashMap;
use std::env;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::sync::Arc;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::config::{CmdArgs, DaemonConfig, NetConf, parse_cni_args};
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseConfig, Route, WorkloadRef};
use crate::options::prepare_options;
use crate::orchestrator::Orchestrator;
use crate::persist::{self, PersistedLease};

pub const DEFAULT_SOCKET_PATH: &str = "/run/cni/dhcp.sock";
pub const DEFAULT_LEASE_FILE: &str = "/run/dhcp-leases.json";

/// First descriptor a socket-activating supervisor passes.
const LISTEN_FDS_START: i32 = 3;

/// RFC 2132 caps the client-identifier option length at one octet.
const MAX_CLIENT_ID_LEN: usize = 254;

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "args")]
enum RpcRequest {
    Allocate(CmdArgs),
    Release(CmdArgs),
}

/// One allocated address with its gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    pub address: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

/// The Allocate reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamResult {
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// Derives the single id used both on the wire and as the registry key,
/// truncated to the wire limit at the nearest character boundary.
pub fn generate_client_id(container_id: &str, net_name: &str, if_name: &str) -> String {
    let mut client_id = format!("{}/{}/{}", container_id, net_name, if_name);
    if client_id.len() > MAX_CLIENT_ID_LEN {
        let mut end = MAX_CLIENT_ID_LEN;
        while !client_id.is_char_boundary(end) {
            end -= 1;
        }
        client_id.truncate(end);
    }
    client_id
}

pub struct Daemon {
    config: DaemonConfig,
    leases: Mutex<HashMap<String, Arc<Lease>>>,
    orchestrator: Arc<dyn Orchestrator>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            config,
            leases: Mutex::new(HashMap::new()),
            orchestrator,
        }
    }

    /// Aligns the persisted leases with the live workload inventory, revives
    /// the survivors, and rewrites the lease file to match.
    pub async fn reconcile(&self) -> Result<()> {
        let records = persist::load(&self.config.lease_file).await;
        let loaded = records.len();
        let kept = self.filter_records(records).await?;

        let mut map = self.leases.lock().await;
        for record in kept {
            let client_id = record.client_id.clone();
            let (timeout, resend_max, broadcast) = (
                self.config.timeout,
                self.config.resend_max,
                self.config.broadcast,
            );
            let revived =
                task::spawn_blocking(move || Lease::revive(record, timeout, resend_max, broadcast))
                    .await
                    .map_err(|join_error| {
                        Error::Socket(format!("revival task failed: {}", join_error))
                    })?;

            match revived {
                Ok(lease) => {
                    info!("reinstated lease for {}", client_id);
                    map.insert(client_id, lease);
                }
                Err(Error::NamespaceUnavailable(path)) => {
                    info!(
                        "dropping lease {}: namespace {} no longer exists",
                        client_id, path
                    );
                }
                Err(revive_error) => {
                    error!("dropping lease {}: {}", client_id, revive_error);
                }
            }
        }

        info!("reconciled {} persisted leases, {} active", loaded, map.len());
        self.persist_registry(&map).await;
        Ok(())
    }

    /// Drops records whose workload the orchestrator no longer knows.
    /// Any inventory error other than not-found aborts startup: the daemon
    /// refuses to serve from a registry it cannot trust.
    async fn filter_records(&self, records: Vec<PersistedLease>) -> Result<Vec<PersistedLease>> {
        let mut kept = Vec::new();
        for record in records {
            if let (Some(namespace), Some(name)) =
                (&record.workload_namespace, &record.workload_name)
            {
                match self.orchestrator.workload_exists(namespace, name).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(
                            "workload {}/{} is gone, dropping lease {}",
                            namespace, name, record.client_id
                        );
                        continue;
                    }
                    Err(inventory_error) => return Err(inventory_error),
                }
            }
            kept.push(record);
        }
        Ok(kept)
    }

    pub async fn run(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(accept_error) => {
                    warn!("accept error: {}", accept_error);
                    continue;
                }
            };
            let daemon = Arc::clone(&self);
            tokio::spawn(async move {
                daemon.handle_connection(stream).await;
            });
        }
    }

    /// One JSON request per connection; the client half-closes after writing.
    async fn handle_connection(&self, mut stream: UnixStream) {
        let mut payload = Vec::new();
        if let Err(read_error) = stream.read_to_end(&mut payload).await {
            warn!("failed to read request: {}", read_error);
            return;
        }

        let reply = match serde_json::from_slice::<RpcRequest>(&payload) {
            Ok(RpcRequest::Allocate(args)) => match self.allocate(args).await {
                Ok(result) => json!({ "result": result }),
                Err(allocate_error) => json!({ "error": allocate_error.to_string() }),
            },
            Ok(RpcRequest::Release(args)) => match self.release(args).await {
                Ok(()) => json!({ "result": {} }),
                Err(release_error) => json!({ "error": release_error.to_string() }),
            },
            Err(parse_error) => json!({ "error": format!("invalid request: {}", parse_error) }),
        };

        let bytes = match serde_json::to_vec(&reply) {
            Ok(bytes) => bytes,
            Err(encode_error) => {
                error!("failed to encode reply: {}", encode_error);
                return;
            }
        };
        if let Err(write_error) = stream.write_all(&bytes).await {
            warn!("failed to write reply: {}", write_error);
        }
        let _ = stream.shutdown().await;
    }

    /// Acquires a lease for the container and records it. A second Allocate
    /// for the same client id replaces the stale lease instead of leaking
    /// its maintainer.
    pub async fn allocate(&self, args: CmdArgs) -> Result<IpamResult> {
        let conf = NetConf::parse(&args.stdin_data)?;
        let cni_args = parse_cni_args(&args.args);
        let (providing, requesting) =
            prepare_options(&cni_args, &conf.ipam.provide, &conf.ipam.request)?;

        let client_id = generate_client_id(&args.container_id, &conf.name, &args.if_name);
        let workload = match (
            cni_args.get("K8S_POD_NAMESPACE"),
            cni_args.get("K8S_POD_NAME"),
        ) {
            (Some(namespace), Some(name)) => Some(WorkloadRef {
                namespace: namespace.clone(),
                name: name.clone(),
            }),
            _ => None,
        };

        let lease_config = LeaseConfig {
            client_id: client_id.clone(),
            netns_path: format!("{}{}", self.config.hostprefix, args.netns),
            link_name: args.if_name.clone(),
            workload,
            timeout: self.config.timeout,
            resend_max: self.config.resend_max,
            broadcast: self.config.broadcast,
        };

        info!("allocating lease for {}", client_id);
        let lease =
            task::spawn_blocking(move || Lease::acquire(lease_config, &providing, &requesting))
                .await
                .map_err(|join_error| {
                    Error::Socket(format!("acquisition task failed: {}", join_error))
                })??;

        let address = match lease.ip_net() {
            Ok(address) => address,
            Err(address_error) => {
                stop_detached(lease);
                return Err(address_error);
            }
        };
        let result = IpamResult {
            ips: vec![IpConfig {
                address,
                gateway: lease.gateway(),
            }],
            routes: lease.routes(),
        };

        let replaced = {
            let mut map = self.leases.lock().await;
            let replaced = map.insert(client_id.clone(), lease);
            self.persist_registry(&map).await;
            replaced
        };
        if let Some(stale) = replaced {
            warn!("replacing existing lease for {}", client_id);
            stop_detached(stale);
        }

        Ok(result)
    }

    /// Removes the lease under the mutex and stops it outside, so a slow
    /// release can never stall other requests.
    pub async fn release(&self, args: CmdArgs) -> Result<()> {
        let conf = NetConf::parse(&args.stdin_data)?;
        let client_id = generate_client_id(&args.container_id, &conf.name, &args.if_name);

        let removed = {
            let mut map = self.leases.lock().await;
            let removed = map.remove(&client_id);
            if removed.is_some() {
                self.persist_registry(&map).await;
            }
            removed
        };

        match removed {
            Some(lease) => {
                info!("releasing lease for {}", client_id);
                let stopped = task::spawn_blocking(move || lease.stop()).await;
                if let Err(join_error) = stopped {
                    error!("stop task for {} failed: {}", client_id, join_error);
                }
            }
            None => debug!("release for unknown lease {}", client_id),
        }
        Ok(())
    }

    /// Lease-file write failures are logged, never surfaced to the caller:
    /// the in-memory registry stays authoritative and the next successful
    /// write supersedes.
    async fn persist_registry(&self, map: &HashMap<String, Arc<Lease>>) {
        let records: Vec<PersistedLease> =
            map.values().filter_map(|lease| lease.persisted()).collect();
        if let Err(persist_error) = persist::save(&self.config.lease_file, &records).await {
            error!("{}", persist_error);
        }
    }

    #[cfg(test)]
    pub async fn lease_count(&self) -> usize {
        self.leases.lock().await.len()
    }
}

fn stop_detached(lease: Arc<Lease>) {
    let _ = task::spawn_blocking(move || lease.stop());
}

/// Adopts a supervisor-passed listener when the activation environment names
/// this process, otherwise binds the configured socket path.
pub fn listener_or_bind(socket_path: &Path) -> io::Result<UnixListener> {
    if let Some(listener) = activated_listener()? {
        info!("adopted socket-activated listener");
        return Ok(listener);
    }
    bind_socket(socket_path)
}

fn activated_listener() -> io::Result<Option<UnixListener>> {
    let listen_pid = env::var("LISTEN_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok());
    let listen_fds = env::var("LISTEN_FDS")
        .ok()
        .and_then(|value| value.parse::<i32>().ok());

    if listen_pid != Some(std::process::id()) {
        return Ok(None);
    }

    let fds = listen_fds.unwrap_or(0);
    if fds < 1 {
        return Ok(None);
    }
    if fds > 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("too many ({}) fds passed through socket activation", fds),
        ));
    }

    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(LISTEN_FDS_START) };
    std_listener.set_nonblocking(true)?;
    Ok(Some(UnixListener::from_std(std_listener)?))
}

fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let listener = std::os::unix::net::UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}
