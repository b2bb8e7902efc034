//! One-shot DHCP packet exchange.
//!
//! A [`DhcpSocket`] is created inside the container's network namespace and
//! bound to the container's interface; the helpers on it drive one phase of
//! the protocol each. Replies are matched on transaction id and expected
//! message type, everything else on the wire is ignored until the per-try
//! timeout runs out. A server NAK is reported as `(false, reply)` so callers
//! can tell a rejection from a transport failure.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::{Error, Result};
use crate::netns::LinkRef;
use crate::options::{MessageType, OptionMap};
use crate::packet::{BOOTREPLY, DhcpPacket};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;

pub struct DhcpSocket {
    socket: UdpSocket,
    xid: u32,
    mac: [u8; 6],
    broadcast: bool,
    timeout: Duration,
}

impl DhcpSocket {
    /// Binds port 68 on the given link. Must be called on a thread already
    /// joined to the link's namespace; the socket keeps targeting that
    /// namespace for its whole life.
    pub fn open(link: &LinkRef, timeout: Duration, broadcast: bool) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket.bind_device(Some(link.name.as_bytes())).map_err(|error| {
            Error::Socket(format!("Failed to bind to device {}: {}", link.name, error))
        })?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_CLIENT_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let socket: UdpSocket = socket.into();

        Ok(Self {
            socket,
            xid: rand::random(),
            mac: link.mac,
            broadcast,
            timeout,
        })
    }

    /// Broadcasts a Discover and waits for an Offer.
    pub fn discover_offer(&self, dictionary: &OptionMap) -> Result<DhcpPacket> {
        let discover = DhcpPacket::discover(self.xid, self.mac, self.broadcast, dictionary);
        self.send_broadcast(&discover.encode())?;

        let offer = self
            .recv_reply(&[MessageType::Offer])
            .map_err(|error| match error {
                Error::Timeout => Error::NoOffer,
                other => other,
            })?;
        debug!(
            server = %offer.server_identifier().unwrap_or(Ipv4Addr::UNSPECIFIED),
            offered = %offer.yiaddr,
            "received offer"
        );
        Ok(offer)
    }

    /// Requests the offered address and waits for the acknowledgement.
    pub fn request_ack(
        &self,
        offer: &DhcpPacket,
        dictionary: &OptionMap,
    ) -> Result<(bool, DhcpPacket)> {
        let request = DhcpPacket::request_for(offer, self.mac, self.broadcast, dictionary);
        self.send_broadcast(&request.encode())?;
        self.await_ack()
    }

    /// Renews against the server named in the acknowledgement, unicast.
    pub fn renew(&self, ack: &DhcpPacket, dictionary: &OptionMap) -> Result<(bool, DhcpPacket)> {
        let server = ack
            .server_identifier()
            .ok_or_else(|| Error::InvalidPacket("acknowledgement has no server id".to_string()))?;

        let renewal = DhcpPacket::renewal(ack, self.xid, self.mac, false, dictionary);
        self.send_unicast(&renewal.encode(), server)?;
        self.await_ack()
    }

    /// Rebinds by broadcasting the renewal request to any server.
    pub fn rebind(&self, ack: &DhcpPacket, dictionary: &OptionMap) -> Result<(bool, DhcpPacket)> {
        let renewal = DhcpPacket::renewal(ack, self.xid, self.mac, true, dictionary);
        self.send_broadcast(&renewal.encode())?;
        self.await_ack()
    }

    fn await_ack(&self) -> Result<(bool, DhcpPacket)> {
        let reply = self.recv_reply(&[MessageType::Ack, MessageType::Nak])?;
        let accepted = reply.message_type() == Some(MessageType::Ack);
        Ok((accepted, reply))
    }

    /// Tells the server its offered address is unusable. No reply expected.
    pub fn decline(&self, ack: &DhcpPacket, dictionary: &OptionMap) -> Result<()> {
        let decline = DhcpPacket::decline_of(ack, self.xid, self.mac, dictionary);
        self.send_broadcast(&decline.encode())
    }

    /// Hands the bound address back. Fire-and-forget.
    pub fn release(&self, ack: &DhcpPacket, dictionary: &OptionMap) -> Result<()> {
        let release = DhcpPacket::release_of(ack, self.xid, self.mac, dictionary);
        match ack.server_identifier() {
            Some(server) => self.send_unicast(&release.encode(), server),
            None => self.send_broadcast(&release.encode()),
        }
    }

    fn send_broadcast(&self, payload: &[u8]) -> Result<()> {
        self.send_to(payload, Ipv4Addr::BROADCAST)
    }

    fn send_unicast(&self, payload: &[u8], server: Ipv4Addr) -> Result<()> {
        self.send_to(payload, server)
    }

    fn send_to(&self, payload: &[u8], destination: Ipv4Addr) -> Result<()> {
        let destination = SocketAddr::from((destination, DHCP_SERVER_PORT));
        self.socket
            .send_to(payload, destination)
            .map_err(|error| Error::Socket(format!("send to {} failed: {}", destination, error)))?;
        Ok(())
    }

    /// Waits for a reply matching our transaction id and one of the expected
    /// message types, for at most the per-try timeout.
    fn recv_reply(&self, expected: &[MessageType]) -> Result<DhcpPacket> {
        let deadline = Instant::now() + self.timeout;
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            self.socket.set_read_timeout(Some(remaining))?;

            let (size, _) = match self.socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(error)
                    if error.kind() == std::io::ErrorKind::WouldBlock
                        || error.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(Error::Timeout);
                }
                Err(error) => return Err(error.into()),
            };

            let packet = match DhcpPacket::parse(&buffer[..size]) {
                Ok(packet) => packet,
                Err(_) => continue,
            };

            if packet.op != BOOTREPLY || packet.xid != self.xid {
                continue;
            }
            match packet.message_type() {
                Some(msg_type) if expected.contains(&msg_type) => return Ok(packet),
                _ => continue,
            }
        }
    }
}
