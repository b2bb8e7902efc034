//! DHCP option codes, value codecs, and option negotiation.
//!
//! Options travel as a dictionary from code to raw value bytes; typed views
//! of the handful of options the client interprets live in small codec
//! functions.
//!
//! Negotiation merges three sources, in increasing precedence: built-in
//! defaults, the provide/request sets from the network configuration, and
//! per-invocation CNI args. Unknown option names and malformed values are
//! rejected before any packet is assembled.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::config::{ProvideOption, RequestOption};
use crate::error::{Error, Result};

/// An option dictionary: option code to raw value bytes.
///
/// A `BTreeMap` keeps assembly deterministic, so building the same dictionary
/// twice yields byte-identical packets.
pub type OptionMap = BTreeMap<u8, Vec<u8>>;

/// The BOOTP/DHCP option codes this client traffics in.
pub mod codes {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTERS: u8 = 3;
    pub const DOMAIN_NAME_SERVERS: u8 = 6;
    pub const HOST_NAME: u8 = 12;
    pub const INTERFACE_MTU: u8 = 26;
    pub const BROADCAST_ADDRESS: u8 = 28;
    pub const REQUESTED_IP_ADDRESS: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const OPTION_OVERLOAD: u8 = 52;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_IDENTIFIER: u8 = 54;
    pub const PARAMETER_REQUEST_LIST: u8 = 55;
    pub const MESSAGE: u8 = 56;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const VENDOR_CLASS_IDENTIFIER: u8 = 60;
    pub const CLIENT_IDENTIFIER: u8 = 61;
    pub const USER_CLASS: u8 = 77;
    pub const CLASSLESS_STATIC_ROUTE: u8 = 121;
    pub const END: u8 = 255;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// A four-octet address value. `None` when the value has the wrong size,
/// which also catches concatenated duplicates of single-address options.
pub fn decode_ip(value: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = value.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// A list of four-octet addresses; trailing partial entries are dropped.
pub fn decode_ip_list(value: &[u8]) -> Vec<Ipv4Addr> {
    value
        .chunks_exact(4)
        .map(|quad| Ipv4Addr::new(quad[0], quad[1], quad[2], quad[3]))
        .collect()
}

/// A big-endian 32-bit value (lease time, T1, T2).
pub fn decode_u32(value: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = value.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// A classless static route (RFC 3442): destination prefix plus gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClasslessRoute {
    pub dst: Ipv4Net,
    pub gateway: Ipv4Addr,
}

impl ClasslessRoute {
    /// Decodes the packed RFC 3442 value: per route, one prefix-length
    /// octet, the significant destination octets, then four gateway octets.
    /// `None` when the value is malformed.
    pub fn parse_list(value: &[u8]) -> Option<Vec<Self>> {
        let mut routes = Vec::new();
        let mut rest = value;

        while let Some((&prefix_len, tail)) = rest.split_first() {
            if prefix_len > 32 {
                return None;
            }
            let dst_octets = prefix_len.div_ceil(8) as usize;
            if tail.len() < dst_octets + 4 {
                return None;
            }

            let mut dst = [0u8; 4];
            dst[..dst_octets].copy_from_slice(&tail[..dst_octets]);
            let gw = &tail[dst_octets..dst_octets + 4];

            let net = Ipv4Net::new(Ipv4Addr::from(dst), prefix_len).ok()?;
            routes.push(Self {
                dst: net,
                gateway: Ipv4Addr::new(gw[0], gw[1], gw[2], gw[3]),
            });
            rest = &tail[dst_octets + 4..];
        }

        Some(routes)
    }

    pub fn encode_list(routes: &[Self]) -> Vec<u8> {
        let mut value = Vec::new();
        for route in routes {
            let prefix_len = route.dst.prefix_len();
            value.push(prefix_len);
            let dst_octets = prefix_len.div_ceil(8) as usize;
            value.extend_from_slice(&route.dst.addr().octets()[..dst_octets]);
            value.extend_from_slice(&route.gateway.octets());
        }
        value
    }
}

/// How a configured option value string is converted into wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Ip,
    Text,
}

/// Option names accepted in provide/request configuration.
const OPTION_NAMES: &[(&str, u8, ValueKind)] = &[
    ("dhcp-client-identifier", codes::CLIENT_IDENTIFIER, ValueKind::Text),
    ("subnet-mask", codes::SUBNET_MASK, ValueKind::Ip),
    ("routers", codes::ROUTERS, ValueKind::Ip),
    ("host-name", codes::HOST_NAME, ValueKind::Text),
    ("user-class", codes::USER_CLASS, ValueKind::Text),
    ("vendor-class-identifier", codes::VENDOR_CLASS_IDENTIFIER, ValueKind::Text),
    ("requested-ip-address", codes::REQUESTED_IP_ADDRESS, ValueKind::Ip),
    ("classless-static-route", codes::CLASSLESS_STATIC_ROUTE, ValueKind::Text),
];

/// Options placed in the parameter request list unless skipped.
const DEFAULT_REQUESTED: &[u8] = &[
    codes::SUBNET_MASK,
    codes::ROUTERS,
    codes::CLASSLESS_STATIC_ROUTE,
];

fn lookup_option_name(name: &str) -> Result<(u8, ValueKind)> {
    if let Some((_, code, kind)) = OPTION_NAMES.iter().find(|(known, _, _)| *known == name) {
        return Ok((*code, *kind));
    }
    if let Ok(code) = name.parse::<u8>()
        && code != codes::PAD
        && code != codes::END
    {
        return Ok((code, ValueKind::Text));
    }
    Err(Error::ConfigInvalid(format!(
        "unknown DHCP option {:?}",
        name
    )))
}

fn encode_value(value: &str, kind: ValueKind) -> Result<Vec<u8>> {
    let bytes = match kind {
        ValueKind::Ip => {
            let addr: Ipv4Addr = value.parse().map_err(|_| {
                Error::ConfigInvalid(format!("invalid IP option value {:?}", value))
            })?;
            addr.octets().to_vec()
        }
        ValueKind::Text => value.as_bytes().to_vec(),
    };
    if bytes.len() > 255 {
        return Err(Error::ConfigInvalid(format!(
            "option value {:?} exceeds 255 bytes",
            value
        )));
    }
    Ok(bytes)
}

/// Builds the option dictionary to send and the parameter-request-list codes
/// from the configured provide/request sets and the per-invocation CNI args.
pub fn prepare_options(
    cni_args: &BTreeMap<String, String>,
    provide: &[ProvideOption],
    request: &[RequestOption],
) -> Result<(OptionMap, Vec<u8>)> {
    let mut providing = OptionMap::new();
    let mut requesting: Vec<u8> = Vec::new();
    let mut skip_defaults = false;

    for entry in provide {
        let (code, kind) = lookup_option_name(&entry.option)?;
        if let Some(value) = &entry.value {
            providing.insert(code, encode_value(value, kind)?);
        }
        if let Some(arg_name) = &entry.from_arg
            && let Some(value) = cni_args.get(arg_name)
        {
            providing.insert(code, encode_value(value, kind)?);
        }
    }

    for entry in request {
        if entry.skip_default {
            skip_defaults = true;
        }
        if entry.option.is_empty() {
            continue;
        }
        let (code, _) = lookup_option_name(&entry.option)?;
        if !requesting.contains(&code) {
            requesting.push(code);
        }
    }

    if !skip_defaults {
        for code in DEFAULT_REQUESTED {
            if !requesting.contains(code) {
                requesting.push(*code);
            }
        }
    }

    // The `ip` CNI arg asks the server for a specific address.
    if let Some(value) = cni_args.get("ip") {
        providing.insert(
            codes::REQUESTED_IP_ADDRESS,
            encode_value(value, ValueKind::Ip)?,
        );
    }

    requesting.sort_unstable();

    Ok((providing, requesting))
}
