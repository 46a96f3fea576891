//! SOCKS5 wire codec (RFC 1928).
//!
//! Pure compose/interpret functions over byte slices. Nothing here touches a
//! socket: the proxy layer reads frames off the client connection and feeds
//! them through these functions. All multi-byte fields are big-endian.
//!
//! Request/response layout:
//!
//! ```text
//!   +----+-----+-------+------+----------+----------+
//!   |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//!   +----+-----+-------+------+----------+----------+
//!   | 1  |  1  | X'00' |  1   | Variable |    2     |
//!   +----+-----+-------+------+----------+----------+
//! ```

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Protocol version byte; only SOCKS5 is spoken here.
pub const SOCKS_VERSION: u8 = 0x05;

/// Smallest well-formed request or response frame (IPv4 destination).
const MIN_TCP_FRAME: usize = 9;
/// Smallest well-formed UDP datagram header plus one destination byte.
const MIN_UDP_FRAME: usize = 10;

/// Authentication methods from the METHOD negotiation.
///
/// IANA-assigned and private ids outside the named set round-trip through
/// `Other` rather than failing the whole handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth,
    Gssapi,
    UserPass,
    Other(u8),
    NoneAcceptable,
}

impl AuthMethod {
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0x00 => AuthMethod::NoAuth,
            0x01 => AuthMethod::Gssapi,
            0x02 => AuthMethod::UserPass,
            0xFF => AuthMethod::NoneAcceptable,
            other => AuthMethod::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AuthMethod::NoAuth => 0x00,
            AuthMethod::Gssapi => 0x01,
            AuthMethod::UserPass => 0x02,
            AuthMethod::Other(byte) => byte,
            AuthMethod::NoneAcceptable => 0xFF,
        }
    }
}

/// Request commands (CMD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(Error::malformed(format!("unknown SOCKS command: {other}"))),
        }
    }
}

/// Reply field (REP) of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Succeeded = 0x00,
    Failure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    UnsupportedCommand = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Reply::Succeeded),
            0x01 => Ok(Reply::Failure),
            0x02 => Ok(Reply::NotAllowed),
            0x03 => Ok(Reply::NetworkUnreachable),
            0x04 => Ok(Reply::HostUnreachable),
            0x05 => Ok(Reply::ConnectionRefused),
            0x06 => Ok(Reply::TtlExpired),
            0x07 => Ok(Reply::UnsupportedCommand),
            0x08 => Ok(Reply::AddressTypeNotSupported),
            other => Err(Error::malformed(format!("unknown SOCKS reply: {other}"))),
        }
    }
}

/// Address type tag (ATYP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    Dns = 0x03,
    Ipv6 = 0x04,
}

/// A host and port, with the host kept as a string whether it is an IP
/// literal or a DNS name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Endpoint {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The destination sub-structure shared by requests, responses and UDP
/// datagrams. `byte_length` records how many bytes the encoded form
/// occupies, so a caller can find the data that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address_type: AddressType,
    pub endpoint: Endpoint,
    pub byte_length: usize,
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    pub endpoint: Endpoint,
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub reply: Reply,
    pub endpoint: Endpoint,
}

impl Response {
    /// A non-success reply carries the unspecified endpoint.
    pub fn failure(reply: Reply) -> Self {
        Response {
            reply,
            endpoint: Endpoint::new("0.0.0.0", 0),
        }
    }
}

/// One datagram of a UDP association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    pub fragment: u8,
    pub destination: Destination,
    pub payload: Vec<u8>,
}

/// Compose the client's `[VER, NMETHODS, METHODS...]` greeting.
pub fn compose_auth_handshake(methods: &[AuthMethod]) -> Result<Vec<u8>> {
    if methods.is_empty() {
        return Err(Error::malformed(
            "auth handshake needs at least one method",
        ));
    }
    if methods.len() > 255 {
        return Err(Error::malformed("auth handshake lists too many methods"));
    }
    let mut bytes = Vec::with_capacity(2 + methods.len());
    bytes.push(SOCKS_VERSION);
    bytes.push(methods.len() as u8);
    bytes.extend(methods.iter().map(|m| m.to_u8()));
    Ok(bytes)
}

/// Interpret the client's greeting into its offered auth methods.
pub fn interpret_auth_handshake(bytes: &[u8]) -> Result<Vec<AuthMethod>> {
    if bytes.len() < 2 {
        return Err(Error::malformed("auth handshake too short"));
    }
    if bytes[0] != SOCKS_VERSION {
        return Err(Error::malformed(format!(
            "unsupported SOCKS version: {}",
            bytes[0]
        )));
    }
    let count = bytes[1] as usize;
    if bytes.len() < 2 + count {
        return Err(Error::malformed("auth handshake truncated"));
    }
    Ok(bytes[2..2 + count]
        .iter()
        .map(|&b| AuthMethod::from_u8(b))
        .collect())
}

/// Compose the server's 2-byte `[VER, METHOD]` method selection.
pub fn compose_auth_response(method: AuthMethod) -> Vec<u8> {
    vec![SOCKS_VERSION, method.to_u8()]
}

/// Interpret the server's method selection. Must be exactly two bytes.
pub fn interpret_auth_response(bytes: &[u8]) -> Result<AuthMethod> {
    if bytes.len() != 2 {
        return Err(Error::malformed(
            "auth response must be exactly 2 bytes long",
        ));
    }
    if bytes[0] != SOCKS_VERSION {
        return Err(Error::malformed(format!(
            "unsupported SOCKS version: {}",
            bytes[0]
        )));
    }
    Ok(AuthMethod::from_u8(bytes[1]))
}

/// Compose a request frame.
pub fn compose_request(request: &Request) -> Result<Vec<u8>> {
    let destination = destination_from_endpoint(&request.endpoint)?;
    let mut bytes = Vec::with_capacity(3 + destination.byte_length);
    bytes.push(SOCKS_VERSION);
    bytes.push(request.command as u8);
    bytes.push(0x00); // reserved
    bytes.extend(compose_destination(&destination)?);
    Ok(bytes)
}

/// Interpret a request frame. All three RFC 1928 commands decode; policy
/// about which are serviced lives upstream.
pub fn interpret_request(bytes: &[u8]) -> Result<Request> {
    if bytes.len() < MIN_TCP_FRAME {
        return Err(Error::malformed("SOCKS request too short"));
    }
    if bytes[0] != SOCKS_VERSION {
        return Err(Error::malformed(format!(
            "unsupported SOCKS version: {}",
            bytes[0]
        )));
    }
    let command = Command::from_u8(bytes[1])?;
    let destination = interpret_destination(&bytes[3..])?;
    Ok(Request {
        command,
        endpoint: destination.endpoint,
    })
}

/// Compose a response frame.
pub fn compose_response(response: &Response) -> Result<Vec<u8>> {
    let destination = destination_from_endpoint(&response.endpoint)?;
    let mut bytes = Vec::with_capacity(3 + destination.byte_length);
    bytes.push(SOCKS_VERSION);
    bytes.push(response.reply as u8);
    bytes.push(0x00); // reserved
    bytes.extend(compose_destination(&destination)?);
    Ok(bytes)
}

/// Interpret a response frame.
pub fn interpret_response(bytes: &[u8]) -> Result<Response> {
    if bytes.len() < MIN_TCP_FRAME {
        return Err(Error::malformed("SOCKS response too short"));
    }
    if bytes[0] != SOCKS_VERSION {
        return Err(Error::malformed(format!(
            "unsupported SOCKS version: {}",
            bytes[0]
        )));
    }
    let reply = Reply::from_u8(bytes[1])?;
    let destination = interpret_destination(&bytes[3..])?;
    Ok(Response {
        reply,
        endpoint: destination.endpoint,
    })
}

/// Compose a UDP association datagram:
///
/// ```text
///   +----+------+------+----------+----------+----------+
///   |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
///   +----+------+------+----------+----------+----------+
///   | 2  |  1   |  1   | Variable |    2     | Variable |
///   +----+------+------+----------+----------+----------+
/// ```
pub fn compose_udp_message(message: &UdpMessage) -> Result<Vec<u8>> {
    if message.fragment != 0 {
        return Err(Error::protocol("fragmentation not supported"));
    }
    let encoded = compose_destination(&message.destination)?;
    let mut bytes = Vec::with_capacity(3 + encoded.len() + message.payload.len());
    bytes.extend_from_slice(&[0x00, 0x00, message.fragment]);
    bytes.extend(encoded);
    bytes.extend_from_slice(&message.payload);
    Ok(bytes)
}

/// Interpret a UDP association datagram. Fragmented datagrams (FRAG != 0)
/// are rejected.
pub fn interpret_udp_message(bytes: &[u8]) -> Result<UdpMessage> {
    if bytes.len() < MIN_UDP_FRAME {
        return Err(Error::malformed("UDP request too short"));
    }
    let fragment = bytes[2];
    if fragment != 0 {
        return Err(Error::protocol("fragmentation not supported"));
    }
    let destination = interpret_destination(&bytes[3..])?;
    let payload = bytes[3 + destination.byte_length..].to_vec();
    Ok(UdpMessage {
        fragment,
        destination,
        payload,
    })
}

/// Interpret the `[ATYP, DST.ADDR, DST.PORT]` sub-structure found in
/// requests, responses and UDP datagrams.
pub fn interpret_destination(bytes: &[u8]) -> Result<Destination> {
    if bytes.is_empty() {
        return Err(Error::malformed("destination is empty"));
    }
    let (address_type, address, port_offset) = match bytes[0] {
        0x01 => {
            if bytes.len() < 1 + 4 + 2 {
                return Err(Error::malformed("IPv4 destination truncated"));
            }
            let octets: [u8; 4] = bytes[1..5].try_into().expect("slice length checked");
            (AddressType::Ipv4, Ipv4Addr::from(octets).to_string(), 5)
        }
        0x03 => {
            if bytes.len() < 2 {
                return Err(Error::malformed("DNS destination truncated"));
            }
            let name_len = bytes[1] as usize;
            if bytes.len() < 2 + name_len + 2 {
                return Err(Error::malformed("DNS destination truncated"));
            }
            let name = String::from_utf8(bytes[2..2 + name_len].to_vec())
                .map_err(|_| Error::malformed("DNS name is not valid UTF-8"))?;
            (AddressType::Dns, name, 2 + name_len)
        }
        0x04 => {
            if bytes.len() < 1 + 16 + 2 {
                return Err(Error::malformed("IPv6 destination truncated"));
            }
            let octets: [u8; 16] = bytes[1..17].try_into().expect("slice length checked");
            (AddressType::Ipv6, Ipv6Addr::from(octets).to_string(), 17)
        }
        other => {
            return Err(Error::malformed(format!(
                "unsupported SOCKS address type: {other}"
            )));
        }
    };
    let port = u16::from_be_bytes([bytes[port_offset], bytes[port_offset + 1]]);
    Ok(Destination {
        address_type,
        endpoint: Endpoint::new(address, port),
        byte_length: port_offset + 2,
    })
}

/// Encode a destination back into its wire form.
pub fn compose_destination(destination: &Destination) -> Result<Vec<u8>> {
    let endpoint = &destination.endpoint;
    let mut bytes = Vec::with_capacity(destination.byte_length);
    match destination.address_type {
        AddressType::Ipv4 => {
            let addr: Ipv4Addr = endpoint
                .address
                .parse()
                .map_err(|_| Error::malformed(format!("not an IPv4 address: {}", endpoint.address)))?;
            bytes.push(AddressType::Ipv4 as u8);
            bytes.extend_from_slice(&addr.octets());
        }
        AddressType::Dns => {
            let name = endpoint.address.as_bytes();
            if name.is_empty() || name.len() > 255 {
                return Err(Error::malformed(format!(
                    "DNS name length out of range: {}",
                    name.len()
                )));
            }
            bytes.push(AddressType::Dns as u8);
            bytes.push(name.len() as u8);
            bytes.extend_from_slice(name);
        }
        AddressType::Ipv6 => {
            let addr: Ipv6Addr = endpoint
                .address
                .parse()
                .map_err(|_| Error::malformed(format!("not an IPv6 address: {}", endpoint.address)))?;
            bytes.push(AddressType::Ipv6 as u8);
            bytes.extend_from_slice(&addr.octets());
        }
    }
    bytes.extend_from_slice(&endpoint.port.to_be_bytes());
    Ok(bytes)
}

/// Classify an endpoint's address as IPv4, IPv6 or DNS and size its
/// encoding.
pub fn destination_from_endpoint(endpoint: &Endpoint) -> Result<Destination> {
    let (address_type, byte_length) = if endpoint.address.parse::<Ipv4Addr>().is_ok() {
        (AddressType::Ipv4, 1 + 4 + 2)
    } else if endpoint.address.parse::<Ipv6Addr>().is_ok() {
        (AddressType::Ipv6, 1 + 16 + 2)
    } else {
        if endpoint.address.is_empty() || endpoint.address.len() > 255 {
            return Err(Error::malformed(format!(
                "DNS name length out of range: {}",
                endpoint.address.len()
            )));
        }
        (AddressType::Dns, 1 + 1 + endpoint.address.len() + 2)
    };
    Ok(Destination {
        address_type,
        endpoint: endpoint.clone(),
        byte_length,
    })
}
