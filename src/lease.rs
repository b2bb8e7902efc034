//! Lease acquisition and maintenance.
//!
//! A [`Lease`] is one DHCP binding for one (client-id, interface) pair. It is
//! acquired synchronously (the caller blocks until the exchange either binds
//! or fails) and then kept alive by a dedicated maintainer thread that walks
//! the renew/rebind/expire timeline until the lease is stopped.
//!
//! The maintainer is the only writer of lease state after acquisition. It
//! sleeps on a channel that doubles as the cancellation signal: dropping the
//! sender wakes the thread at its next sleep or I/O boundary. Acquisition
//! waits (retry backoff, decline hold-off) sleep on the same channel, so a
//! stop lands mid-reacquisition too.

use std::net::Ipv4Addr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use ipnet::Ipv4Net;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::client::DhcpSocket;
use crate::error::{Error, Result};
use crate::netns::{self, LinkRef};
use crate::options::{OptionMap, codes};
use crate::packet::DhcpPacket;
use crate::persist::{self, PersistedLease};

/// Delay before the first resend of a failed exchange.
const RESEND_DELAY_FIRST: Duration = Duration::from_secs(4);
/// Resend delays double up to this cap.
const RESEND_DELAY_MAX: Duration = Duration::from_secs(62);
/// Floor for the renew/rebind retry interval (RFC 2131 §4.4.5).
const MAINTAIN_RETRY_MIN: Duration = Duration::from_secs(60);
/// Pause between re-acquisition rounds after a lease expires.
const REACQUIRE_DELAY: Duration = Duration::from_secs(10);

/// The orchestrator workload a lease belongs to, when known. Only consulted
/// at startup to decide whether a persisted lease is still wanted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Initializing,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
    Expired,
    Stopped,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Selecting => write!(f, "SELECTING"),
            Self::Requesting => write!(f, "REQUESTING"),
            Self::Bound => write!(f, "BOUND"),
            Self::Renewing => write!(f, "RENEWING"),
            Self::Rebinding => write!(f, "REBINDING"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// A route handed back to the plugin. A missing gateway means on-link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dst: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub client_id: String,
    pub netns_path: String,
    pub link_name: String,
    pub workload: Option<WorkloadRef>,
    /// Per-try timeout for each send/receive.
    pub timeout: Duration,
    /// Cumulative retry budget for one acquisition.
    pub resend_max: Duration,
    pub broadcast: bool,
}

struct LeaseInner {
    state: LeaseState,
    ack: Option<DhcpPacket>,
    link: Option<LinkRef>,
    renewal_time: DateTime<Utc>,
    rebinding_time: DateTime<Utc>,
    expire_time: DateTime<Utc>,
}

pub struct Lease {
    config: LeaseConfig,
    /// Outbound option dictionary: provided options, the client identifier,
    /// and the parameter request list. Fixed for the life of the lease.
    opts: OptionMap,
    inner: Mutex<LeaseInner>,
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Lease {
    /// Acquires a lease inside the container's namespace, blocking until
    /// bound or failed, then detaches the maintainer.
    pub fn acquire(
        config: LeaseConfig,
        providing: &OptionMap,
        requesting: &[u8],
    ) -> Result<Arc<Self>> {
        let opts = build_dictionary(&config.client_id, providing, requesting);
        let lease = Arc::new(Self {
            config,
            opts,
            inner: Mutex::new(LeaseInner {
                state: LeaseState::Initializing,
                ack: None,
                link: None,
                renewal_time: DateTime::UNIX_EPOCH,
                rebinding_time: DateTime::UNIX_EPOCH,
                expire_time: DateTime::UNIX_EPOCH,
            }),
            stop: Mutex::new(None),
            worker: Mutex::new(None),
        });

        let stop_rx = lease.arm_stop();
        lease.acquire_binding(&stop_rx)?;
        lease.start_maintaining(stop_rx);
        Ok(lease)
    }

    /// Rebuilds a lease from its persisted record: the acknowledgement is
    /// re-parsed, the link re-resolved inside the stored namespace, and the
    /// maintainer restarted against the original timers.
    pub fn revive(
        record: PersistedLease,
        timeout: Duration,
        resend_max: Duration,
        broadcast: bool,
    ) -> Result<Arc<Self>> {
        let ack_bytes = persist::decode_packet_bytes(&record.ack)?;
        let ack = DhcpPacket::parse(&ack_bytes)?;

        let workload = match (record.workload_namespace, record.workload_name) {
            (Some(namespace), Some(name)) => Some(WorkloadRef { namespace, name }),
            _ => None,
        };
        let config = LeaseConfig {
            client_id: record.client_id,
            netns_path: record.netns_path,
            link_name: record.link_name,
            workload,
            timeout,
            resend_max,
            broadcast,
        };

        let link = netns::with_netns(&config.netns_path, || {
            netns::resolve_link(&config.link_name)
        })?;

        let opts = build_dictionary(&config.client_id, &OptionMap::new(), &[]);
        let lease = Arc::new(Self {
            config,
            opts,
            inner: Mutex::new(LeaseInner {
                state: LeaseState::Bound,
                ack: Some(ack),
                link: Some(link),
                renewal_time: record.renewal_time,
                rebinding_time: record.rebinding_time,
                expire_time: record.expire_time,
            }),
            stop: Mutex::new(None),
            worker: Mutex::new(None),
        });

        let stop_rx = lease.arm_stop();
        lease.start_maintaining(stop_rx);
        Ok(lease)
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn workload(&self) -> Option<&WorkloadRef> {
        self.config.workload.as_ref()
    }

    pub fn state(&self) -> LeaseState {
        self.inner().state
    }

    /// The bound address with its subnet mask.
    pub fn ip_net(&self) -> Result<Ipv4Net> {
        let inner = self.inner();
        let ack = inner
            .ack
            .as_ref()
            .ok_or_else(|| Error::LeaseLost(self.config.client_id.clone()))?;
        derive_ip_net(ack)
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        let inner = self.inner();
        inner
            .ack
            .as_ref()
            .and_then(|ack| ack.routers().first().copied())
    }

    pub fn routes(&self) -> Vec<Route> {
        let inner = self.inner();
        match inner.ack.as_ref() {
            Some(ack) => derive_routes(ack),
            None => Vec::new(),
        }
    }

    /// Snapshot of the durable fields, or `None` before the first bind.
    pub fn persisted(&self) -> Option<PersistedLease> {
        let inner = self.inner();
        let ack = inner.ack.as_ref()?;
        let link_name = inner
            .link
            .as_ref()
            .map(|link| link.name.clone())
            .unwrap_or_else(|| self.config.link_name.clone());

        Some(PersistedLease {
            client_id: self.config.client_id.clone(),
            ack: persist::encode_packet_bytes(&ack.encode()),
            link_name,
            renewal_time: inner.renewal_time,
            rebinding_time: inner.rebinding_time,
            expire_time: inner.expire_time,
            workload_namespace: self.config.workload.as_ref().map(|w| w.namespace.clone()),
            workload_name: self.config.workload.as_ref().map(|w| w.name.clone()),
            netns_path: self.config.netns_path.clone(),
        })
    }

    /// Stops the maintainer and waits for it to exit. A lease that was bound
    /// sends a best-effort Release on the way out. Idempotent.
    pub fn stop(&self) {
        let sender = self.stop_handle().take();
        drop(sender);

        let handle = self.worker_handle().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("maintainer for {} panicked", self.config.client_id);
        }
    }

    fn inner(&self) -> MutexGuard<'_, LeaseInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_handle(&self) -> MutexGuard<'_, Option<Sender<()>>> {
        self.stop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LeaseState) {
        let mut inner = self.inner();
        if inner.state != state {
            debug!("lease {}: {} -> {}", self.config.client_id, inner.state, state);
            inner.state = state;
        }
    }

    /// One full acquisition: enter the namespace, resolve and raise the link,
    /// then retry the exchange under the cumulative budget. Every wait sleeps
    /// on the stop channel; a stop surfaces as [`Error::Canceled`].
    fn acquire_binding(&self, stop: &Receiver<()>) -> Result<()> {
        self.set_state(LeaseState::Selecting);
        netns::with_netns(&self.config.netns_path, || {
            let link = netns::resolve_link(&self.config.link_name)?;
            netns::ensure_link_up(&link.name)?;
            let socket = DhcpSocket::open(&link, self.config.timeout, self.config.broadcast)?;
            let ack = self.run_handshake(&socket, stop)?;
            self.commit(ack, link)
        })
    }

    fn run_handshake(&self, socket: &DhcpSocket, stop: &Receiver<()>) -> Result<DhcpPacket> {
        let started = Instant::now();
        let mut delay = RESEND_DELAY_FIRST;

        loop {
            match self.one_exchange(socket) {
                Ok(ack) => {
                    if address_is_sane(&ack) {
                        return Ok(ack);
                    }
                    // Unusable address: tell the server, hold off, start over.
                    warn!(
                        "lease {}: declining unusable address {}",
                        self.config.client_id, ack.yiaddr
                    );
                    if let Err(decline_error) = socket.decline(&ack, &self.opts) {
                        warn!("decline failed: {}", decline_error);
                    }
                    let holdoff =
                        Duration::from_secs(rand::thread_rng().gen_range(1..=10));
                    if self.wait_or_stop(stop, holdoff) {
                        return Err(Error::Canceled);
                    }
                    self.set_state(LeaseState::Selecting);
                    if started.elapsed() >= self.config.resend_max {
                        return Err(Error::Declined);
                    }
                }
                // A NAK is the server's answer, not a transport failure.
                Err(error @ Error::NoAck(_)) => return Err(error),
                Err(error) => {
                    if started.elapsed() + delay >= self.config.resend_max {
                        warn!(
                            "lease {}: giving up after {:?}: {}",
                            self.config.client_id,
                            started.elapsed(),
                            error
                        );
                        return Err(error);
                    }
                    debug!(
                        "lease {}: retrying in {:?} after: {}",
                        self.config.client_id, delay, error
                    );
                    if self.wait_or_stop(stop, jitter(delay)) {
                        return Err(Error::Canceled);
                    }
                    delay = (delay * 2).min(RESEND_DELAY_MAX);
                    self.set_state(LeaseState::Selecting);
                }
            }
        }
    }

    fn one_exchange(&self, socket: &DhcpSocket) -> Result<DhcpPacket> {
        let offer = socket.discover_offer(&self.opts)?;
        self.set_state(LeaseState::Requesting);

        let (accepted, ack) = socket.request_ack(&offer, &self.opts)?;
        if !accepted {
            let message = ack
                .message()
                .unwrap_or_else(|| "server refused the request".to_string());
            return Err(Error::NoAck(message));
        }
        Ok(ack)
    }

    /// Installs a fresh acknowledgement and its timers; enters BOUND.
    fn commit(&self, ack: DhcpPacket, link: LinkRef) -> Result<()> {
        let (renewal_time, rebinding_time, expire_time) = lease_timers(&ack, Utc::now())?;

        let mut inner = self.inner();
        info!(
            "lease {}: bound to {} until {}",
            self.config.client_id, ack.yiaddr, expire_time
        );
        inner.ack = Some(ack);
        inner.link = Some(link);
        inner.renewal_time = renewal_time;
        inner.rebinding_time = rebinding_time;
        inner.expire_time = expire_time;
        inner.state = LeaseState::Bound;
        Ok(())
    }

    /// Creates the stop channel, keeping the sender for [`Lease::stop`] and
    /// handing the receiver back for the acquisition and maintainer waits.
    fn arm_stop(&self) -> Receiver<()> {
        let (stop_tx, stop_rx) = mpsc::channel();
        *self.stop_handle() = Some(stop_tx);
        stop_rx
    }

    fn start_maintaining(self: &Arc<Self>, stop: Receiver<()>) {
        let lease = Arc::clone(self);
        let name = format!("lease-{}", self.config.link_name);
        match thread::Builder::new()
            .name(name)
            .spawn(move || lease.maintain(stop))
        {
            Ok(handle) => *self.worker_handle() = Some(handle),
            Err(spawn_error) => {
                error!(
                    "failed to spawn maintainer for {}: {}",
                    self.config.client_id, spawn_error
                );
            }
        }
    }

    /// The maintainer loop. Owns all state transitions after acquisition.
    fn maintain(&self, stop: Receiver<()>) {
        loop {
            let (state, renewal_time, rebinding_time, expire_time) = {
                let inner = self.inner();
                (
                    inner.state,
                    inner.renewal_time,
                    inner.rebinding_time,
                    inner.expire_time,
                )
            };

            match state {
                LeaseState::Bound => {
                    let wait = until(renewal_time);
                    debug!(
                        "lease {}: sleeping {:?} until renewal",
                        self.config.client_id, wait
                    );
                    if self.wait_or_stop(&stop, wait) {
                        return self.finish();
                    }
                    self.set_state(LeaseState::Renewing);
                }
                LeaseState::Renewing => match self.renew_binding(false) {
                    Ok(()) => {}
                    Err(Error::NoAck(message)) => {
                        warn!(
                            "lease {}: server invalidated the binding: {}",
                            self.config.client_id, message
                        );
                        self.set_state(LeaseState::Expired);
                    }
                    Err(renew_error) => {
                        warn!(
                            "lease {}: renewal failed: {}",
                            self.config.client_id, renew_error
                        );
                        if Utc::now() >= rebinding_time {
                            self.set_state(LeaseState::Rebinding);
                        } else if self.wait_or_stop(&stop, retry_wait(rebinding_time)) {
                            return self.finish();
                        }
                    }
                },
                LeaseState::Rebinding => match self.renew_binding(true) {
                    Ok(()) => {}
                    Err(Error::NoAck(message)) => {
                        warn!(
                            "lease {}: rebind refused: {}",
                            self.config.client_id, message
                        );
                        self.set_state(LeaseState::Expired);
                    }
                    Err(rebind_error) => {
                        warn!(
                            "lease {}: rebind failed: {}",
                            self.config.client_id, rebind_error
                        );
                        if Utc::now() >= expire_time {
                            self.set_state(LeaseState::Expired);
                        } else if self.wait_or_stop(&stop, retry_wait(expire_time)) {
                            return self.finish();
                        }
                    }
                },
                LeaseState::Expired => {
                    warn!(
                        "lease {}: expired without rebinding, reacquiring from scratch",
                        self.config.client_id
                    );
                    match self.acquire_binding(&stop) {
                        Ok(()) => {
                            info!("lease {}: reacquired", self.config.client_id);
                        }
                        Err(Error::Canceled) => return self.finish(),
                        Err(reacquire_error) => {
                            warn!(
                                "lease {}: reacquisition failed: {}",
                                self.config.client_id, reacquire_error
                            );
                            self.set_state(LeaseState::Expired);
                            if self.wait_or_stop(&stop, REACQUIRE_DELAY) {
                                return self.finish();
                            }
                        }
                    }
                }
                LeaseState::Stopped => return,
                LeaseState::Initializing | LeaseState::Selecting | LeaseState::Requesting => {
                    // Only reachable when a re-acquisition was interrupted.
                    self.set_state(LeaseState::Expired);
                }
            }
        }
    }

    /// True when the stop signal arrived before the wait elapsed.
    fn wait_or_stop(&self, stop: &Receiver<()>, wait: Duration) -> bool {
        match stop.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// One renew (unicast) or rebind (broadcast) attempt; commits on success.
    fn renew_binding(&self, rebind: bool) -> Result<()> {
        let ack = self
            .inner()
            .ack
            .clone()
            .ok_or_else(|| Error::LeaseLost(self.config.client_id.clone()))?;

        let (accepted, reply, link) = netns::with_netns(&self.config.netns_path, || {
            let link = netns::resolve_link(&self.config.link_name)?;
            let socket = DhcpSocket::open(&link, self.config.timeout, self.config.broadcast)?;
            let (accepted, reply) = if rebind {
                socket.rebind(&ack, &self.opts)?
            } else {
                socket.renew(&ack, &self.opts)?
            };
            Ok((accepted, reply, link))
        })?;

        if !accepted {
            let message = reply
                .message()
                .unwrap_or_else(|| "server refused renewal".to_string());
            return Err(Error::NoAck(message));
        }

        self.commit(reply, link)
    }

    /// Worker-side shutdown: release a settled binding, never one whose
    /// renewal is still in flight on the server.
    fn finish(&self) {
        let (state, ack) = {
            let mut inner = self.inner();
            let state = inner.state;
            inner.state = LeaseState::Stopped;
            (state, inner.ack.clone())
        };

        if state == LeaseState::Bound
            && let Some(ack) = ack
        {
            match self.send_release(&ack) {
                Ok(()) => info!(
                    "lease {}: released {}",
                    self.config.client_id, ack.yiaddr
                ),
                Err(release_error) => warn!(
                    "lease {}: release failed: {}",
                    self.config.client_id, release_error
                ),
            }
        }
        debug!("maintainer for {} stopped", self.config.client_id);
    }

    fn send_release(&self, ack: &DhcpPacket) -> Result<()> {
        netns::with_netns(&self.config.netns_path, || {
            let link = netns::resolve_link(&self.config.link_name)?;
            let socket = DhcpSocket::open(&link, self.config.timeout, self.config.broadcast)?;
            socket.release(ack, &self.opts)
        })
    }
}

fn build_dictionary(client_id: &str, providing: &OptionMap, requesting: &[u8]) -> OptionMap {
    let mut opts = providing.clone();
    opts.insert(codes::CLIENT_IDENTIFIER, client_id.as_bytes().to_vec());
    if !requesting.is_empty() {
        opts.insert(codes::PARAMETER_REQUEST_LIST, requesting.to_vec());
    }
    opts
}

/// An address we refuse to configure: the server must take it back.
fn address_is_sane(ack: &DhcpPacket) -> bool {
    !ack.yiaddr.is_unspecified() && !ack.yiaddr.is_broadcast()
}

/// Timers from the acknowledgement: T1 and T2 when present, the classical
/// 1/2 and 7/8 of lease-time otherwise. Inconsistent values fall back to the
/// fractions so renewal ≤ rebinding ≤ expiry always holds.
fn lease_timers(
    ack: &DhcpPacket,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>, DateTime<Utc>)> {
    let lease_secs = ack
        .lease_time()
        .filter(|secs| *secs != 0)
        .ok_or_else(|| Error::NoAck("acknowledgement carries no usable lease time".to_string()))?;

    let mut t1 = ack.renewal_time().unwrap_or(lease_secs / 2);
    let mut t2 = ack.rebinding_time().unwrap_or(seven_eighths(lease_secs));
    if t1 > t2 || t2 > lease_secs {
        t1 = lease_secs / 2;
        t2 = seven_eighths(lease_secs);
    }

    Ok((
        now + TimeDelta::seconds(t1 as i64),
        now + TimeDelta::seconds(t2 as i64),
        now + TimeDelta::seconds(lease_secs as i64),
    ))
}

fn seven_eighths(secs: u32) -> u32 {
    ((secs as u64) * 7 / 8) as u32
}

fn derive_ip_net(ack: &DhcpPacket) -> Result<Ipv4Net> {
    let mask = ack
        .subnet_mask()
        .unwrap_or_else(|| Ipv4Addr::new(255, 255, 255, 0));
    Ipv4Net::with_netmask(ack.yiaddr, mask)
        .map_err(|_| Error::InvalidPacket(format!("invalid subnet mask {}", mask)))
}

/// Classless static routes take precedence over the router option; the
/// gateway-derived default is only used when the server sent none.
fn derive_routes(ack: &DhcpPacket) -> Vec<Route> {
    let classless = ack.classless_routes();
    if !classless.is_empty() {
        return classless
            .into_iter()
            .map(|route| Route {
                dst: route.dst,
                gw: (!route.gateway.is_unspecified()).then_some(route.gateway),
            })
            .collect();
    }

    let Ok(default_dst) = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0) else {
        return Vec::new();
    };
    match ack.routers().first() {
        Some(gateway) => vec![Route {
            dst: default_dst,
            gw: Some(*gateway),
        }],
        None => Vec::new(),
    }
}

fn until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Half the remaining window, floored at one minute.
fn retry_wait(deadline: DateTime<Utc>) -> Duration {
    (until(deadline) / 2).max(MAINTAIN_RETRY_MIN)
}

fn jitter(delay: Duration) -> Duration {
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ClasslessRoute, MessageType};

    fn ack_packet(entries: &[(u8, Vec<u8>)]) -> DhcpPacket {
        let mut packet = DhcpPacket::new_request(1, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff], false);
        packet.op = crate::packet::BOOTREPLY;
        packet.yiaddr = Ipv4Addr::new(10, 0, 0, 5);
        packet
            .options
            .insert(codes::MESSAGE_TYPE, vec![MessageType::Ack as u8]);
        for (code, value) in entries {
            packet.options.insert(*code, value.clone());
        }
        packet
    }

    fn lease_time(secs: u32) -> (u8, Vec<u8>) {
        (codes::LEASE_TIME, secs.to_be_bytes().to_vec())
    }

    #[test]
    fn test_timers_from_explicit_options() {
        let ack = ack_packet(&[
            lease_time(3600),
            (codes::RENEWAL_TIME, 1000u32.to_be_bytes().to_vec()),
            (codes::REBINDING_TIME, 2000u32.to_be_bytes().to_vec()),
        ]);
        let now = Utc::now();
        let (t1, t2, expire) = lease_timers(&ack, now).unwrap();
        assert_eq!(t1, now + TimeDelta::seconds(1000));
        assert_eq!(t2, now + TimeDelta::seconds(2000));
        assert_eq!(expire, now + TimeDelta::seconds(3600));
    }

    #[test]
    fn test_timers_fall_back_to_fractions() {
        let ack = ack_packet(&[lease_time(3600)]);
        let now = Utc::now();
        let (t1, t2, expire) = lease_timers(&ack, now).unwrap();
        assert_eq!(t1, now + TimeDelta::seconds(1800));
        assert_eq!(t2, now + TimeDelta::seconds(3150));
        assert_eq!(expire, now + TimeDelta::seconds(3600));
    }

    #[test]
    fn test_timers_reject_inconsistent_options() {
        let ack = ack_packet(&[
            lease_time(3600),
            (codes::RENEWAL_TIME, 3000u32.to_be_bytes().to_vec()),
            (codes::REBINDING_TIME, 2000u32.to_be_bytes().to_vec()),
        ]);
        let now = Utc::now();
        let (t1, t2, _) = lease_timers(&ack, now).unwrap();
        assert_eq!(t1, now + TimeDelta::seconds(1800));
        assert_eq!(t2, now + TimeDelta::seconds(3150));
    }

    #[test]
    fn test_zero_lease_time_is_no_ack() {
        let ack = ack_packet(&[lease_time(0)]);
        assert!(matches!(
            lease_timers(&ack, Utc::now()),
            Err(Error::NoAck(_))
        ));

        let no_lease_time = ack_packet(&[]);
        assert!(matches!(
            lease_timers(&no_lease_time, Utc::now()),
            Err(Error::NoAck(_))
        ));
    }

    #[test]
    fn test_timer_ordering_always_holds() {
        for lease_secs in [1u32, 59, 600, 3600, 86400, u32::MAX] {
            let ack = ack_packet(&[lease_time(lease_secs)]);
            let now = Utc::now();
            let (t1, t2, expire) = lease_timers(&ack, now).unwrap();
            assert!(t1 <= t2, "lease_secs={}", lease_secs);
            assert!(t2 <= expire, "lease_secs={}", lease_secs);
        }
    }

    #[test]
    fn test_derive_ip_net() {
        let ack = ack_packet(&[
            lease_time(3600),
            (codes::SUBNET_MASK, vec![255, 255, 255, 0]),
        ]);
        let net = derive_ip_net(&ack).unwrap();
        assert_eq!(net.to_string(), "10.0.0.5/24");

        let no_mask = ack_packet(&[]);
        assert_eq!(derive_ip_net(&no_mask).unwrap().prefix_len(), 24);
    }

    #[test]
    fn test_routes_default_from_gateway() {
        let ack = ack_packet(&[(codes::ROUTERS, vec![10, 0, 0, 1])]);
        let routes = derive_routes(&ack);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst.to_string(), "0.0.0.0/0");
        assert_eq!(routes[0].gw, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_classless_routes_take_precedence() {
        let classless = ClasslessRoute::encode_list(&[ClasslessRoute {
            dst: "172.16.0.0/16".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 0, 0, 254),
        }]);
        let ack = ack_packet(&[
            (codes::ROUTERS, vec![10, 0, 0, 1]),
            (codes::CLASSLESS_STATIC_ROUTE, classless),
        ]);
        let routes = derive_routes(&ack);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst.to_string(), "172.16.0.0/16");
        assert_eq!(routes[0].gw, Some(Ipv4Addr::new(10, 0, 0, 254)));
    }

    #[test]
    fn test_on_link_classless_route_has_no_gateway() {
        let classless = ClasslessRoute::encode_list(&[ClasslessRoute {
            dst: "10.0.0.0/24".parse().unwrap(),
            gateway: Ipv4Addr::UNSPECIFIED,
        }]);
        let ack = ack_packet(&[(codes::CLASSLESS_STATIC_ROUTE, classless)]);
        let routes = derive_routes(&ack);
        assert_eq!(routes[0].gw, None);
    }

    #[test]
    fn test_empty_ack_yields_no_routes() {
        let ack = ack_packet(&[]);
        assert!(derive_routes(&ack).is_empty());
    }

    #[test]
    fn test_dictionary_carries_identity_and_request_list() {
        let mut providing = OptionMap::new();
        providing.insert(12, b"pod-7".to_vec());

        let opts = build_dictionary("c1/mynet/eth0", &providing, &[1, 3, 121]);
        assert_eq!(opts.get(&61).unwrap(), b"c1/mynet/eth0");
        assert_eq!(opts.get(&55).unwrap(), &vec![1, 3, 121]);
        assert_eq!(opts.get(&12).unwrap(), b"pod-7");

        let bare = build_dictionary("c1", &OptionMap::new(), &[]);
        assert!(!bare.contains_key(&55));
    }

    #[test]
    fn test_past_deadline_fires_immediately() {
        let past = Utc::now() - TimeDelta::seconds(30);
        assert_eq!(until(past), Duration::ZERO);

        let future = Utc::now() + TimeDelta::seconds(30);
        assert!(until(future) > Duration::from_secs(25));
    }

    #[test]
    fn test_retry_wait_floor() {
        let soon = Utc::now() + TimeDelta::seconds(10);
        assert_eq!(retry_wait(soon), MAINTAIN_RETRY_MIN);

        let far = Utc::now() + TimeDelta::seconds(10_000);
        assert!(retry_wait(far) > MAINTAIN_RETRY_MIN);
    }

    #[test]
    fn test_address_sanity() {
        let good = ack_packet(&[]);
        assert!(address_is_sane(&good));

        let mut zero = ack_packet(&[]);
        zero.yiaddr = Ipv4Addr::UNSPECIFIED;
        assert!(!address_is_sane(&zero));

        let mut broadcast = ack_packet(&[]);
        broadcast.yiaddr = Ipv4Addr::BROADCAST;
        assert!(!address_is_sane(&broadcast));
    }
}
