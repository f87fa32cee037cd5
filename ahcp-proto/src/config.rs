use core::fmt::{self, Display};
use core::net::{Ipv4Addr, Ipv6Addr};

use heapless::Vec;

use log::debug;

use crate::{BytesIn, BytesOut, Error};

/// Upper bound on the number of records carried per option list.
/// Excess records on the wire are silently dropped.
pub const MAX_LIST: usize = 8;

/// Client-side cap on the advertised lifetime.
pub const MAX_EXPIRES: u32 = 25 * 3600;

/// How strictly a TLV body is interpreted.
///
/// `Client` is for stateless replies and the authority file: a lifetime is
/// required and unknown mandatory options poison the whole body. `Server`
/// is for the bodies of stateful requests, which carry no lifetime and may
/// contain options from newer clients that an old server must tolerate.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mode {
    Client,
    Server,
}

/// An IPv6 prefix as carried in 17-byte wire records.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Ipv6Prefix {
    pub addr: Ipv6Addr,
    pub plen: u8,
}

impl Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.plen)
    }
}

/// An IPv4 prefix as carried in 5-byte wire records.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Ipv4Prefix {
    pub addr: Ipv4Addr,
    pub plen: u8,
}

impl Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.plen)
    }
}

/// The routing protocol a network announces, with its sub-options.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RoutingProtocol {
    Static {
        gateways: Vec<Ipv6Addr, MAX_LIST>,
    },
    Olsr {
        multicast: Ipv6Addr,
        /// Link-quality level; only 0, 1 and 2 are legal on the wire.
        link_quality: Option<u8>,
    },
    Babel {
        multicast: Ipv6Addr,
        port: Option<u16>,
        /// Hello interval in centiseconds.
        hello_interval: Option<u16>,
    },
    Unknown(u8),
}

/// A decoded configuration payload.
///
/// Every field is optional; `None` means the option was absent, which is
/// distinct from an empty list (empty lists never occur — see `decode`).
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Config {
    pub expires: Option<u32>,
    pub origin_time: Option<u32>,
    pub ipv6_prefix: Option<Vec<Ipv6Prefix, MAX_LIST>>,
    pub ipv6_address: Option<Vec<Ipv6Addr, MAX_LIST>>,
    pub ipv4_address: Option<Vec<Ipv4Addr, MAX_LIST>>,
    pub ipv6_prefix_delegation: Option<Vec<Ipv6Prefix, MAX_LIST>>,
    pub ipv4_prefix_delegation: Option<Vec<Ipv4Prefix, MAX_LIST>>,
    pub name_server: Option<Vec<Ipv6Addr, MAX_LIST>>,
    pub ntp_server: Option<Vec<Ipv6Addr, MAX_LIST>>,
    pub routing_protocol: Option<RoutingProtocol>,
    pub stateful_server: Option<Vec<Ipv6Addr, MAX_LIST>>,
    pub server_ipv6: Option<Vec<Ipv6Addr, MAX_LIST>>,
    pub server_ipv4: Option<Vec<Ipv4Addr, MAX_LIST>>,
}

impl Config {
    /// Parses a TLV option body.
    ///
    /// Zero-length list options are treated as absent. Duplicate `EXPIRES`
    /// and `ORIGIN_TIME` options take the minimum of the values seen;
    /// duplicate list options extend the list, preserving order.
    pub fn decode(body: &[u8], mode: Mode) -> Result<Self, Error> {
        let mut config = Self::default();
        let mut bytes = BytesIn::new(body);
        let mut mandatory = false;

        while !bytes.is_empty() {
            let opt = bytes.byte()?;

            if opt == OPT_PAD {
                mandatory = false;
                continue;
            } else if opt == OPT_MANDATORY {
                mandatory = true;
                continue;
            }

            let len = bytes.byte().map_err(|_| Error::TruncatedOption)? as usize;
            let value = bytes.slice(len)?;

            match opt {
                OPT_EXPIRES => {
                    let secs = decode_u32(value)?;
                    config.expires = Some(config.expires.map_or(secs, |e| e.min(secs)));
                }
                OPT_ORIGIN_TIME => {
                    let when = decode_u32(value)?;
                    config.origin_time =
                        Some(config.origin_time.map_or(when, |o| o.min(when)));
                }
                OPT_IPV6_PREFIX => extend_p6(&mut config.ipv6_prefix, value)?,
                OPT_IPV6_PREFIX_DELEGATION => {
                    extend_p6(&mut config.ipv6_prefix_delegation, value)?
                }
                OPT_IPV4_PREFIX_DELEGATION => {
                    extend_p4(&mut config.ipv4_prefix_delegation, value)?
                }
                OPT_IPV6_ADDRESS => extend_v6(&mut config.ipv6_address, value)?,
                OPT_IPV4_ADDRESS => extend_v4(&mut config.ipv4_address, value)?,
                OPT_NAME_SERVER => extend_v6(&mut config.name_server, value)?,
                OPT_NTP_SERVER => extend_v6(&mut config.ntp_server, value)?,
                OPT_MY_IPV6_ADDRESS => extend_v6(&mut config.server_ipv6, value)?,
                OPT_MY_IPV4_ADDRESS => extend_v4(&mut config.server_ipv4, value)?,
                OPT_STATEFUL_SERVER => extend_v6(&mut config.stateful_server, value)?,
                OPT_ROUTING_PROTOCOL => {
                    config.routing_protocol = Some(decode_routing(value, mode)?);
                }
                _ => {
                    if mandatory && matches!(mode, Mode::Client) {
                        return Err(Error::UnknownMandatory);
                    }

                    debug!("Skipping unknown option {opt} ({len} bytes)");
                }
            }

            mandatory = false;
        }

        if matches!(mode, Mode::Client) {
            match config.expires {
                None | Some(0) => return Err(Error::Expired),
                Some(secs) => config.expires = Some(secs.min(MAX_EXPIRES)),
            }
        }

        Ok(config)
    }

    /// Encodes the TLV option body, returning the number of bytes written.
    ///
    /// The lifetime goes first, flagged mandatory, then addresses and
    /// prefixes, then servers, then the sender's own identity. No option
    /// is ever partially written: each is emitted only if it fits whole.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut out = BytesOut::new(buf);

        if let Some(expires) = self.expires {
            if out.remaining() < 7 {
                return Err(Error::BufferFull);
            }
            out.byte(OPT_MANDATORY)?;
            emit(&mut out, OPT_EXPIRES, &expires.to_be_bytes())?;
        }

        if let Some(origin) = self.origin_time {
            emit(&mut out, OPT_ORIGIN_TIME, &origin.to_be_bytes())?;
        }

        emit_p6(&mut out, OPT_IPV6_PREFIX, &self.ipv6_prefix)?;
        emit_v6(&mut out, OPT_IPV6_ADDRESS, &self.ipv6_address)?;
        emit_v4(&mut out, OPT_IPV4_ADDRESS, &self.ipv4_address)?;
        emit_p6(
            &mut out,
            OPT_IPV6_PREFIX_DELEGATION,
            &self.ipv6_prefix_delegation,
        )?;
        emit_p4(
            &mut out,
            OPT_IPV4_PREFIX_DELEGATION,
            &self.ipv4_prefix_delegation,
        )?;
        emit_v6(&mut out, OPT_NAME_SERVER, &self.name_server)?;
        emit_v6(&mut out, OPT_NTP_SERVER, &self.ntp_server)?;

        if let Some(routing) = self.routing_protocol.as_ref() {
            encode_routing(&mut out, routing)?;
        }

        emit_v6(&mut out, OPT_STATEFUL_SERVER, &self.stateful_server)?;
        emit_v6(&mut out, OPT_MY_IPV6_ADDRESS, &self.server_ipv6)?;
        emit_v4(&mut out, OPT_MY_IPV4_ADDRESS, &self.server_ipv4)?;

        Ok(out.len())
    }

    /// Whether replacing `self` with `other` can skip reconfiguring the
    /// host.
    ///
    /// Only the address- and prefix-carrying fields participate: same
    /// presence and element-wise equal lists. Name servers, NTP servers,
    /// routing sub-options and the expiry metadata may differ freely —
    /// their new values simply replace the old ones without a stop/start
    /// cycle.
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.ipv4_address == other.ipv4_address
            && self.ipv6_address == other.ipv6_address
            && self.ipv6_prefix == other.ipv6_prefix
            && self.ipv4_prefix_delegation == other.ipv4_prefix_delegation
            && self.ipv6_prefix_delegation == other.ipv6_prefix_delegation
    }
}

/// Builds the body of a stateful request or acknowledgement: a single
/// IPv4 address option, empty when no address is suggested.
pub fn encode_stateful_body(ipv4: Option<Ipv4Addr>, buf: &mut [u8]) -> Result<usize, Error> {
    let mut out = BytesOut::new(buf);

    out.byte(OPT_IPV4_ADDRESS)?;
    match ipv4 {
        Some(addr) => {
            out.byte(4)?;
            out.push(&addr.octets())?;
        }
        None => {
            out.byte(0)?;
        }
    }

    Ok(out.len())
}

fn decode_u32(value: &[u8]) -> Result<u32, Error> {
    let arr: [u8; 4] = value.try_into().map_err(|_| Error::BadLength)?;

    Ok(u32::from_be_bytes(arr))
}

fn extend_v6(
    list: &mut Option<Vec<Ipv6Addr, MAX_LIST>>,
    value: &[u8],
) -> Result<(), Error> {
    if value.len() % 16 != 0 {
        return Err(Error::BadLength);
    }

    if value.is_empty() {
        return Ok(());
    }

    let list = list.get_or_insert_with(Vec::new);
    for record in value.chunks_exact(16) {
        let octets: [u8; 16] = record.try_into().unwrap();
        if list.push(octets.into()).is_err() {
            break;
        }
    }

    Ok(())
}

fn extend_v4(
    list: &mut Option<Vec<Ipv4Addr, MAX_LIST>>,
    value: &[u8],
) -> Result<(), Error> {
    if value.len() % 4 != 0 {
        return Err(Error::BadLength);
    }

    if value.is_empty() {
        return Ok(());
    }

    let list = list.get_or_insert_with(Vec::new);
    for record in value.chunks_exact(4) {
        let octets: [u8; 4] = record.try_into().unwrap();
        if list.push(octets.into()).is_err() {
            break;
        }
    }

    Ok(())
}

fn extend_p6(
    list: &mut Option<Vec<Ipv6Prefix, MAX_LIST>>,
    value: &[u8],
) -> Result<(), Error> {
    if value.len() % 17 != 0 {
        return Err(Error::BadLength);
    }

    if value.is_empty() {
        return Ok(());
    }

    let list = list.get_or_insert_with(Vec::new);
    for record in value.chunks_exact(17) {
        let octets: [u8; 16] = record[..16].try_into().unwrap();
        let prefix = Ipv6Prefix {
            addr: octets.into(),
            plen: record[16],
        };
        if list.push(prefix).is_err() {
            break;
        }
    }

    Ok(())
}

fn extend_p4(
    list: &mut Option<Vec<Ipv4Prefix, MAX_LIST>>,
    value: &[u8],
) -> Result<(), Error> {
    if value.len() % 5 != 0 {
        return Err(Error::BadLength);
    }

    if value.is_empty() {
        return Ok(());
    }

    let list = list.get_or_insert_with(Vec::new);
    for record in value.chunks_exact(5) {
        let octets: [u8; 4] = record[..4].try_into().unwrap();
        let prefix = Ipv4Prefix {
            addr: octets.into(),
            plen: record[4],
        };
        if list.push(prefix).is_err() {
            break;
        }
    }

    Ok(())
}

fn decode_routing(value: &[u8], mode: Mode) -> Result<RoutingProtocol, Error> {
    let mut bytes = BytesIn::new(value);
    let id = bytes.byte().map_err(|_| Error::BadLength)?;

    let mut gateways: Option<Vec<Ipv6Addr, MAX_LIST>> = None;
    let mut multicast: Option<Ipv6Addr> = None;
    let mut link_quality: Option<u8> = None;
    let mut port: Option<u16> = None;
    let mut hello_interval: Option<u16> = None;

    let mut mandatory = false;
    while !bytes.is_empty() {
        let opt = bytes.byte()?;

        if opt == OPT_PAD {
            mandatory = false;
            continue;
        } else if opt == OPT_MANDATORY {
            mandatory = true;
            continue;
        }

        let len = bytes.byte().map_err(|_| Error::TruncatedOption)? as usize;
        let sub = bytes.slice(len)?;

        let known = match (id, opt) {
            (ROUTING_STATIC, STATIC_DEFAULT_GATEWAY) => {
                extend_v6(&mut gateways, sub)?;
                true
            }
            (ROUTING_OLSR, OLSR_MULTICAST_ADDRESS)
            | (ROUTING_BABEL, BABEL_MULTICAST_ADDRESS) => {
                let octets: [u8; 16] = sub.try_into().map_err(|_| Error::BadLength)?;
                multicast = Some(octets.into());
                true
            }
            (ROUTING_OLSR, OLSR_LINK_QUALITY) => {
                if sub.len() != 1 || sub[0] > 2 {
                    return Err(Error::BadLength);
                }
                link_quality = Some(sub[0]);
                true
            }
            (ROUTING_BABEL, BABEL_PORT_NUMBER) => {
                let arr: [u8; 2] = sub.try_into().map_err(|_| Error::BadLength)?;
                port = Some(u16::from_be_bytes(arr));
                true
            }
            (ROUTING_BABEL, BABEL_HELLO_INTERVAL) => {
                let arr: [u8; 2] = sub.try_into().map_err(|_| Error::BadLength)?;
                hello_interval = Some(u16::from_be_bytes(arr));
                true
            }
            _ => false,
        };

        if !known {
            if mandatory && matches!(mode, Mode::Client) {
                return Err(Error::UnknownMandatory);
            }

            debug!("Skipping unknown routing sub-option {opt} for protocol {id}");
        }

        mandatory = false;
    }

    let routing = match id {
        ROUTING_STATIC => RoutingProtocol::Static {
            gateways: gateways.unwrap_or_default(),
        },
        ROUTING_OLSR => RoutingProtocol::Olsr {
            multicast: multicast.ok_or(Error::BadLength)?,
            link_quality,
        },
        ROUTING_BABEL => RoutingProtocol::Babel {
            multicast: multicast.ok_or(Error::BadLength)?,
            port,
            hello_interval,
        },
        other => RoutingProtocol::Unknown(other),
    };

    Ok(routing)
}

fn encode_routing(out: &mut BytesOut, routing: &RoutingProtocol) -> Result<(), Error> {
    let mut sub = [0; 160];
    let mut body = BytesOut::new(&mut sub);

    let id = match routing {
        RoutingProtocol::Static { gateways } => {
            let gateways = (!gateways.is_empty()).then(|| gateways.clone());
            emit_v6(&mut body, STATIC_DEFAULT_GATEWAY, &gateways)?;

            ROUTING_STATIC
        }
        RoutingProtocol::Olsr {
            multicast,
            link_quality,
        } => {
            emit(&mut body, OLSR_MULTICAST_ADDRESS, &multicast.octets())?;
            if let Some(lq) = link_quality {
                emit(&mut body, OLSR_LINK_QUALITY, &[*lq])?;
            }

            ROUTING_OLSR
        }
        RoutingProtocol::Babel {
            multicast,
            port,
            hello_interval,
        } => {
            emit(&mut body, BABEL_MULTICAST_ADDRESS, &multicast.octets())?;
            if let Some(port) = port {
                emit(&mut body, BABEL_PORT_NUMBER, &port.to_be_bytes())?;
            }
            if let Some(hello) = hello_interval {
                emit(&mut body, BABEL_HELLO_INTERVAL, &hello.to_be_bytes())?;
            }

            ROUTING_BABEL
        }
        // Nothing useful can be said about a protocol we do not know
        RoutingProtocol::Unknown(_) => return Ok(()),
    };

    let len = body.len();
    if len + 1 > u8::MAX as usize || out.remaining() < 3 + len {
        return Err(Error::BufferFull);
    }

    out.byte(OPT_ROUTING_PROTOCOL)?;
    out.byte((len + 1) as u8)?;
    out.byte(id)?;
    out.push(&sub[..len])?;

    Ok(())
}

fn emit(out: &mut BytesOut, opt: u8, value: &[u8]) -> Result<(), Error> {
    if value.len() > u8::MAX as usize || out.remaining() < 2 + value.len() {
        return Err(Error::BufferFull);
    }

    out.byte(opt)?;
    out.byte(value.len() as u8)?;
    out.push(value)?;

    Ok(())
}

fn emit_v6(
    out: &mut BytesOut,
    opt: u8,
    list: &Option<Vec<Ipv6Addr, MAX_LIST>>,
) -> Result<(), Error> {
    let Some(list) = list.as_ref() else {
        return Ok(());
    };

    let len = list.len() * 16;
    if out.remaining() < 2 + len {
        return Err(Error::BufferFull);
    }

    out.byte(opt)?;
    out.byte(len as u8)?;
    for addr in list {
        out.push(&addr.octets())?;
    }

    Ok(())
}

fn emit_v4(
    out: &mut BytesOut,
    opt: u8,
    list: &Option<Vec<Ipv4Addr, MAX_LIST>>,
) -> Result<(), Error> {
    let Some(list) = list.as_ref() else {
        return Ok(());
    };

    let len = list.len() * 4;
    if out.remaining() < 2 + len {
        return Err(Error::BufferFull);
    }

    out.byte(opt)?;
    out.byte(len as u8)?;
    for addr in list {
        out.push(&addr.octets())?;
    }

    Ok(())
}

fn emit_p6(
    out: &mut BytesOut,
    opt: u8,
    list: &Option<Vec<Ipv6Prefix, MAX_LIST>>,
) -> Result<(), Error> {
    let Some(list) = list.as_ref() else {
        return Ok(());
    };

    let len = list.len() * 17;
    if out.remaining() < 2 + len {
        return Err(Error::BufferFull);
    }

    out.byte(opt)?;
    out.byte(len as u8)?;
    for prefix in list {
        out.push(&prefix.addr.octets())?;
        out.byte(prefix.plen)?;
    }

    Ok(())
}

fn emit_p4(
    out: &mut BytesOut,
    opt: u8,
    list: &Option<Vec<Ipv4Prefix, MAX_LIST>>,
) -> Result<(), Error> {
    let Some(list) = list.as_ref() else {
        return Ok(());
    };

    let len = list.len() * 5;
    if out.remaining() < 2 + len {
        return Err(Error::BufferFull);
    }

    out.byte(opt)?;
    out.byte(len as u8)?;
    for prefix in list {
        out.push(&prefix.addr.octets())?;
        out.byte(prefix.plen)?;
    }

    Ok(())
}

// Pseudo-options
pub(crate) const OPT_PAD: u8 = 0;
pub(crate) const OPT_MANDATORY: u8 = 1;

// Option types
pub(crate) const OPT_EXPIRES: u8 = 2;
pub(crate) const OPT_IPV6_PREFIX: u8 = 3;
pub(crate) const OPT_ROUTING_PROTOCOL: u8 = 4;
pub(crate) const OPT_NAME_SERVER: u8 = 5;
pub(crate) const OPT_NTP_SERVER: u8 = 6;
pub(crate) const OPT_ORIGIN_TIME: u8 = 7;
pub(crate) const OPT_MY_IPV6_ADDRESS: u8 = 8;
pub(crate) const OPT_MY_IPV4_ADDRESS: u8 = 9;
pub(crate) const OPT_IPV6_ADDRESS: u8 = 10;
pub(crate) const OPT_IPV4_ADDRESS: u8 = 11;
pub(crate) const OPT_IPV6_PREFIX_DELEGATION: u8 = 12;
pub(crate) const OPT_IPV4_PREFIX_DELEGATION: u8 = 13;
pub(crate) const OPT_STATEFUL_SERVER: u8 = 14;

// Routing protocol identifiers
pub(crate) const ROUTING_STATIC: u8 = 0;
pub(crate) const ROUTING_OLSR: u8 = 1;
pub(crate) const ROUTING_BABEL: u8 = 2;

// Static sub-options
pub(crate) const STATIC_DEFAULT_GATEWAY: u8 = 2;

// OLSR sub-options
pub(crate) const OLSR_MULTICAST_ADDRESS: u8 = 2;
pub(crate) const OLSR_LINK_QUALITY: u8 = 11;

// Babel sub-options
pub(crate) const BABEL_MULTICAST_ADDRESS: u8 = 2;
pub(crate) const BABEL_PORT_NUMBER: u8 = 3;
pub(crate) const BABEL_HELLO_INTERVAL: u8 = 4;
