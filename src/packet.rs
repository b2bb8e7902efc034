//! BOOTP/DHCP wire format, client side.
//!
//! A packet is the fixed BOOTP header plus an option dictionary. Parsing
//! follows RFC 2131 §4.1: the options field may declare overload (option 52),
//! in which case the `file` and `sname` header fields carry further options,
//! and a code that appears more than once has its values concatenated
//! (RFC 3396). Encoding splits long values back into 255-octet instances and
//! pads the message to the BOOTP minimum.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{
    ClasslessRoute, MessageType, OptionMap, codes, decode_ip, decode_ip_list, decode_u32,
};

/// BOOTP opcodes.
pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

const HTYPE_ETHER: u8 = 1;
const HLEN_ETHER: u8 = 6;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

// Fixed-header field offsets (RFC 2131 figure 1).
const XID_OFFSET: usize = 4;
const SECS_OFFSET: usize = 8;
const FLAGS_OFFSET: usize = 10;
const CIADDR_OFFSET: usize = 12;
const YIADDR_OFFSET: usize = 16;
const SIADDR_OFFSET: usize = 20;
const GIADDR_OFFSET: usize = 24;
const CHADDR_OFFSET: usize = 28;
const SNAME_OFFSET: usize = 44;
const FILE_OFFSET: usize = 108;
const COOKIE_OFFSET: usize = 236;
const OPTIONS_OFFSET: usize = 240;

/// Flag bit asking the server to broadcast its replies.
const FLAG_BROADCAST: u16 = 0x8000;

/// BOOTP-compatible minimum message size; shorter encodings are padded.
const MIN_MESSAGE_SIZE: usize = 300;

// Option-overload flag bits (option 52).
const OVERLOAD_FILE: u8 = 1;
const OVERLOAD_SNAME: u8 = 2;

#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    /// Option dictionary. A code the server sent more than once (or moved
    /// into an overloaded header field) holds its concatenated value.
    pub options: OptionMap,
}

fn read_u16(wire: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([wire[offset], wire[offset + 1]])
}

fn read_u32(wire: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([wire[offset], wire[offset + 1], wire[offset + 2], wire[offset + 3]])
}

fn read_ip(wire: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(wire[offset], wire[offset + 1], wire[offset + 2], wire[offset + 3])
}

/// Walks one options region, accumulating values into the dictionary.
/// Repeated codes concatenate per RFC 3396. Stops at End, skips Pad.
fn walk_options(region: &[u8], options: &mut OptionMap) -> Result<()> {
    let mut cursor = 0;
    while cursor < region.len() {
        let code = region[cursor];
        if code == codes::PAD {
            cursor += 1;
            continue;
        }
        if code == codes::END {
            break;
        }

        let Some(&length) = region.get(cursor + 1) else {
            return Err(Error::InvalidPacket(format!(
                "option {} has no length octet",
                code
            )));
        };
        let start = cursor + 2;
        let end = start + length as usize;
        if end > region.len() {
            return Err(Error::InvalidPacket(format!(
                "option {} value runs past the end of its field",
                code
            )));
        }

        options
            .entry(code)
            .or_default()
            .extend_from_slice(&region[start..end]);
        cursor = end;
    }
    Ok(())
}

impl DhcpPacket {
    pub fn parse(wire: &[u8]) -> Result<Self> {
        if wire.len() < OPTIONS_OFFSET {
            return Err(Error::InvalidPacket(format!(
                "{} bytes is shorter than the fixed BOOTP header",
                wire.len()
            )));
        }
        if wire[COOKIE_OFFSET..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return Err(Error::InvalidPacket(
                "missing DHCP magic cookie".to_string(),
            ));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&wire[CHADDR_OFFSET..SNAME_OFFSET]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&wire[SNAME_OFFSET..FILE_OFFSET]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&wire[FILE_OFFSET..COOKIE_OFFSET]);

        let mut options = OptionMap::new();
        walk_options(&wire[OPTIONS_OFFSET..], &mut options)?;

        // Overloaded packets continue in `file`, then `sname` (RFC 2131 §4.1).
        let overload = options
            .get(&codes::OPTION_OVERLOAD)
            .and_then(|value| value.first().copied());
        if let Some(overload) = overload {
            if overload & OVERLOAD_FILE != 0 {
                walk_options(&file, &mut options)?;
            }
            if overload & OVERLOAD_SNAME != 0 {
                walk_options(&sname, &mut options)?;
            }
        }

        Ok(Self {
            op: wire[0],
            htype: wire[1],
            hlen: wire[2],
            hops: wire[3],
            xid: read_u32(wire, XID_OFFSET),
            secs: read_u16(wire, SECS_OFFSET),
            flags: read_u16(wire, FLAGS_OFFSET),
            ciaddr: read_ip(wire, CIADDR_OFFSET),
            yiaddr: read_ip(wire, YIADDR_OFFSET),
            siaddr: read_ip(wire, SIADDR_OFFSET),
            giaddr: read_ip(wire, GIADDR_OFFSET),
            chaddr,
            sname,
            file,
            options,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(MIN_MESSAGE_SIZE);

        wire.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        wire.extend_from_slice(&self.xid.to_be_bytes());
        wire.extend_from_slice(&self.secs.to_be_bytes());
        wire.extend_from_slice(&self.flags.to_be_bytes());
        wire.extend_from_slice(&self.ciaddr.octets());
        wire.extend_from_slice(&self.yiaddr.octets());
        wire.extend_from_slice(&self.siaddr.octets());
        wire.extend_from_slice(&self.giaddr.octets());
        wire.extend_from_slice(&self.chaddr);
        wire.extend_from_slice(&self.sname);
        wire.extend_from_slice(&self.file);
        wire.extend_from_slice(&MAGIC_COOKIE);

        for (&code, value) in &self.options {
            if code == codes::PAD || code == codes::END {
                continue;
            }
            if value.is_empty() {
                wire.extend_from_slice(&[code, 0]);
                continue;
            }
            // Values past one octet of length go out as consecutive
            // instances of the same code (RFC 3396).
            for chunk in value.chunks(255) {
                wire.push(code);
                wire.push(chunk.len() as u8);
                wire.extend_from_slice(chunk);
            }
        }
        wire.push(codes::END);

        if wire.len() < MIN_MESSAGE_SIZE {
            wire.resize(MIN_MESSAGE_SIZE, 0);
        }
        wire
    }

    fn option(&self, code: u8) -> Option<&[u8]> {
        self.options.get(&code).map(Vec::as_slice)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        let value = self.option(codes::MESSAGE_TYPE)?;
        MessageType::try_from(*value.first()?).ok()
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.option(codes::SERVER_IDENTIFIER).and_then(decode_ip)
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.option(codes::SUBNET_MASK).and_then(decode_ip)
    }

    pub fn routers(&self) -> Vec<Ipv4Addr> {
        self.option(codes::ROUTERS)
            .map(decode_ip_list)
            .unwrap_or_default()
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.option(codes::LEASE_TIME).and_then(decode_u32)
    }

    pub fn renewal_time(&self) -> Option<u32> {
        self.option(codes::RENEWAL_TIME).and_then(decode_u32)
    }

    pub fn rebinding_time(&self) -> Option<u32> {
        self.option(codes::REBINDING_TIME).and_then(decode_u32)
    }

    pub fn classless_routes(&self) -> Vec<ClasslessRoute> {
        self.option(codes::CLASSLESS_STATIC_ROUTE)
            .and_then(ClasslessRoute::parse_list)
            .unwrap_or_default()
    }

    /// Free-form server message (option 56), carried on NAKs.
    pub fn message(&self) -> Option<String> {
        self.option(codes::MESSAGE)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    pub fn mac_address(&self) -> String {
        self.chaddr[..6]
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & FLAG_BROADCAST) != 0
    }

    /// Base outbound request with the fixed header filled in.
    pub fn new_request(xid: u32, mac: [u8; 6], broadcast: bool) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);

        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHER,
            hlen: HLEN_ETHER,
            hops: 0,
            xid,
            secs: 0,
            flags: if broadcast { FLAG_BROADCAST } else { 0 },
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: OptionMap::new(),
        }
    }

    /// Merges a negotiated dictionary into the packet. Protocol-owned codes
    /// are set by the builders afterwards, so they win over configuration.
    pub fn add_dictionary(&mut self, dictionary: &OptionMap) {
        for (code, value) in dictionary {
            self.options.insert(*code, value.clone());
        }
    }

    fn set_message_type(&mut self, msg_type: MessageType) {
        self.options
            .insert(codes::MESSAGE_TYPE, vec![msg_type as u8]);
    }

    pub fn discover(xid: u32, mac: [u8; 6], broadcast: bool, dictionary: &OptionMap) -> Self {
        let mut packet = Self::new_request(xid, mac, broadcast);
        packet.add_dictionary(dictionary);
        packet.set_message_type(MessageType::Discover);
        packet
    }

    /// REQUEST following an OFFER: names the offered address and the server.
    pub fn request_for(
        offer: &DhcpPacket,
        mac: [u8; 6],
        broadcast: bool,
        dictionary: &OptionMap,
    ) -> Self {
        let mut packet = Self::new_request(offer.xid, mac, broadcast);
        packet.add_dictionary(dictionary);
        packet.set_message_type(MessageType::Request);
        packet
            .options
            .insert(codes::REQUESTED_IP_ADDRESS, offer.yiaddr.octets().to_vec());
        if let Some(server) = offer.server_identifier() {
            packet
                .options
                .insert(codes::SERVER_IDENTIFIER, server.octets().to_vec());
        }
        packet
    }

    /// Renewal REQUEST: the client identifies itself through ciaddr alone,
    /// without options 50/54 (RFC 2131 §4.3.2).
    pub fn renewal(
        ack: &DhcpPacket,
        xid: u32,
        mac: [u8; 6],
        broadcast: bool,
        dictionary: &OptionMap,
    ) -> Self {
        let mut packet = Self::new_request(xid, mac, broadcast);
        packet.ciaddr = ack.yiaddr;
        packet.add_dictionary(dictionary);
        packet.set_message_type(MessageType::Request);
        packet.options.remove(&codes::REQUESTED_IP_ADDRESS);
        packet.options.remove(&codes::SERVER_IDENTIFIER);
        packet
    }

    pub fn decline_of(ack: &DhcpPacket, xid: u32, mac: [u8; 6], dictionary: &OptionMap) -> Self {
        let mut packet = Self::new_request(xid, mac, false);
        packet.add_dictionary(dictionary);
        packet.set_message_type(MessageType::Decline);
        packet
            .options
            .insert(codes::REQUESTED_IP_ADDRESS, ack.yiaddr.octets().to_vec());
        if let Some(server) = ack.server_identifier() {
            packet
                .options
                .insert(codes::SERVER_IDENTIFIER, server.octets().to_vec());
        }
        packet
    }

    pub fn release_of(ack: &DhcpPacket, xid: u32, mac: [u8; 6], dictionary: &OptionMap) -> Self {
        let mut packet = Self::new_request(xid, mac, false);
        packet.ciaddr = ack.yiaddr;
        packet.add_dictionary(dictionary);
        packet.set_message_type(MessageType::Release);
        if let Some(server) = ack.server_identifier() {
            packet
                .options
                .insert(codes::SERVER_IDENTIFIER, server.octets().to_vec());
        }
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    /// A server reply assembled through the same struct the daemon parses
    /// into, so tests exercise encode and parse together.
    fn reply(entries: &[(u8, &[u8])]) -> DhcpPacket {
        let mut packet = DhcpPacket::new_request(0x1f2f3f4f, MAC, false);
        packet.op = BOOTREPLY;
        packet.yiaddr = Ipv4Addr::new(10, 0, 0, 5);
        packet.set_message_type(MessageType::Ack);
        for (code, value) in entries {
            packet.options.insert(*code, value.to_vec());
        }
        packet
    }

    #[test]
    fn test_reply_roundtrip() {
        let original = reply(&[
            (codes::SUBNET_MASK, &[255, 255, 255, 0]),
            (codes::SERVER_IDENTIFIER, &[10, 0, 0, 1]),
            (codes::LEASE_TIME, &3600u32.to_be_bytes()),
        ]);

        let parsed = DhcpPacket::parse(&original.encode()).unwrap();
        assert_eq!(parsed.op, BOOTREPLY);
        assert_eq!(parsed.xid, 0x1f2f3f4f);
        assert_eq!(parsed.yiaddr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(parsed.message_type(), Some(MessageType::Ack));
        assert_eq!(parsed.subnet_mask(), Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(parsed.server_identifier(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(parsed.lease_time(), Some(3600));
        assert_eq!(parsed.mac_address(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_overloaded_reply_reads_sname_and_file() {
        // Options continue in `file` (flag 1) and `sname` (flag 2).
        let mut packet = reply(&[(codes::OPTION_OVERLOAD, &[OVERLOAD_FILE | OVERLOAD_SNAME])]);
        packet.file[..8].copy_from_slice(&[
            codes::LEASE_TIME,
            4,
            0,
            0,
            14,
            16,
            codes::END,
            0,
        ]);
        packet.sname[..7].copy_from_slice(&[
            codes::SERVER_IDENTIFIER,
            4,
            10,
            0,
            0,
            1,
            codes::END,
        ]);

        let parsed = DhcpPacket::parse(&packet.encode()).unwrap();
        assert_eq!(parsed.lease_time(), Some(3600));
        assert_eq!(parsed.server_identifier(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_repeated_codes_concatenate() {
        // Two instances of the routers option on the wire surface as one
        // eight-octet value.
        let mut wire = reply(&[]).encode();
        let end = OPTIONS_OFFSET
            + wire[OPTIONS_OFFSET..]
                .iter()
                .position(|&byte| byte == codes::END)
                .unwrap();
        let mut tail = vec![
            codes::ROUTERS, 4, 10, 0, 0, 1,
            codes::ROUTERS, 4, 10, 0, 0, 2,
            codes::END,
        ];
        wire.truncate(end);
        wire.append(&mut tail);

        let parsed = DhcpPacket::parse(&wire).unwrap();
        assert_eq!(
            parsed.routers(),
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
    }

    #[test]
    fn test_long_value_splits_and_rejoins() {
        let long_value: Vec<u8> = (0..=255u8).chain(0..=255u8).collect();
        let mut packet = reply(&[]);
        packet
            .options
            .insert(codes::VENDOR_CLASS_IDENTIFIER, long_value.clone());

        let wire = packet.encode();
        let parsed = DhcpPacket::parse(&wire).unwrap();
        assert_eq!(
            parsed.options.get(&codes::VENDOR_CLASS_IDENTIFIER),
            Some(&long_value)
        );
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(DhcpPacket::parse(&[0u8; 100]).is_err());
        assert!(DhcpPacket::parse(&[]).is_err());
    }

    #[test]
    fn test_missing_cookie_rejected() {
        let mut wire = reply(&[]).encode();
        wire[COOKIE_OFFSET] = 0;
        assert!(DhcpPacket::parse(&wire).is_err());
    }

    #[test]
    fn test_option_running_past_field_rejected() {
        let mut wire = reply(&[]).encode();
        wire.truncate(OPTIONS_OFFSET);
        wire.extend_from_slice(&[codes::HOST_NAME, 200, b'x']);
        assert!(DhcpPacket::parse(&wire).is_err());
    }

    #[test]
    fn test_encoding_pads_to_bootp_minimum() {
        let wire = reply(&[]).encode();
        assert!(wire.len() >= MIN_MESSAGE_SIZE);
    }

    #[test]
    fn test_discover_builder() {
        let mut dictionary = OptionMap::new();
        dictionary.insert(codes::CLIENT_IDENTIFIER, b"some-client".to_vec());
        dictionary.insert(codes::PARAMETER_REQUEST_LIST, vec![1, 3, 121]);

        let discover = DhcpPacket::discover(7, MAC, true, &dictionary);
        assert_eq!(discover.op, BOOTREQUEST);
        assert!(discover.is_broadcast());
        assert_eq!(discover.message_type(), Some(MessageType::Discover));

        let parsed = DhcpPacket::parse(&discover.encode()).unwrap();
        assert_eq!(parsed.xid, 7);
        assert_eq!(parsed.message_type(), Some(MessageType::Discover));
        assert_eq!(
            parsed.options.get(&codes::CLIENT_IDENTIFIER).unwrap(),
            b"some-client"
        );
        assert_eq!(
            parsed.options.get(&codes::PARAMETER_REQUEST_LIST).unwrap(),
            &vec![1, 3, 121]
        );
    }

    #[test]
    fn test_dictionary_cannot_override_message_type() {
        let mut dictionary = OptionMap::new();
        dictionary.insert(codes::MESSAGE_TYPE, vec![MessageType::Release as u8]);

        let discover = DhcpPacket::discover(7, MAC, false, &dictionary);
        assert_eq!(discover.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn test_request_builder_names_offer() {
        let offer = reply(&[(codes::SERVER_IDENTIFIER, &[10, 0, 0, 1])]);
        let request = DhcpPacket::request_for(&offer, MAC, false, &OptionMap::new());

        assert_eq!(request.xid, offer.xid);
        assert_eq!(request.message_type(), Some(MessageType::Request));
        assert_eq!(
            request.options.get(&codes::REQUESTED_IP_ADDRESS).unwrap(),
            &vec![10, 0, 0, 5]
        );
        assert_eq!(
            request.options.get(&codes::SERVER_IDENTIFIER).unwrap(),
            &vec![10, 0, 0, 1]
        );
    }

    #[test]
    fn test_renewal_builder_uses_ciaddr_only() {
        let ack = reply(&[(codes::SERVER_IDENTIFIER, &[10, 0, 0, 1])]);
        let mut dictionary = OptionMap::new();
        dictionary.insert(codes::REQUESTED_IP_ADDRESS, vec![10, 0, 0, 9]);

        let renewal = DhcpPacket::renewal(&ack, 11, MAC, false, &dictionary);
        assert_eq!(renewal.ciaddr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(renewal.message_type(), Some(MessageType::Request));
        assert!(!renewal.options.contains_key(&codes::REQUESTED_IP_ADDRESS));
        assert!(!renewal.options.contains_key(&codes::SERVER_IDENTIFIER));
    }

    #[test]
    fn test_release_builder() {
        let ack = reply(&[(codes::SERVER_IDENTIFIER, &[10, 0, 0, 1])]);
        let release = DhcpPacket::release_of(&ack, 13, MAC, &OptionMap::new());

        assert_eq!(release.ciaddr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(release.message_type(), Some(MessageType::Release));
        assert_eq!(
            release.options.get(&codes::SERVER_IDENTIFIER).unwrap(),
            &vec![10, 0, 0, 1]
        );
    }
}
