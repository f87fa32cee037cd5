use core::net::Ipv4Addr;

use heapless::Vec;

use log::debug;

use crate::config::{self, Mode};
use crate::{Config, Error, Opcode, Reply, Stateful, MAX_BODY};

/// The stateless data an authority serves: the raw option body exactly as
/// loaded from the authority file, flooded byte-identical, plus its decoded
/// form for local use.
#[derive(Clone, Debug)]
pub struct Authority {
    body: Vec<u8, MAX_BODY>,
    config: Config,
    expires_delay: u32,
}

impl Authority {
    /// Validates and adopts an option body. The body must decode under the
    /// strict rules; authorities have no business serving data they cannot
    /// parse themselves.
    pub fn new(body: &[u8], expires_delay: u32) -> Result<Self, Error> {
        let config = Config::decode(body, Mode::Client)?;
        let body = Vec::from_slice(body).map_err(|_| Error::BufferFull)?;

        Ok(Self {
            body,
            config,
            expires_delay,
        })
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn expires_delay(&self) -> u32 {
        self.expires_delay
    }

    /// Stamps a flood of the authoritative data: the data originates here
    /// and now, so the age is zero and the expiry runs from `now`.
    pub fn reply(&self, now: u32) -> Reply<'_> {
        Reply {
            origin: now,
            expires: now.saturating_add(self.expires_delay),
            age: 0,
            body: &self.body,
        }
    }
}

/// The seam between the stateful server and whatever persists its leases.
pub trait LeaseAllocator {
    /// Grants or renews a lease for `client_id`, preferring `suggested`.
    /// Returns the address and the granted lease time, or `None` when no
    /// address can be offered.
    fn take(
        &mut self,
        client_id: &[u8],
        suggested: Option<Ipv4Addr>,
        lease_time: u16,
    ) -> Option<(Ipv4Addr, u16)>;

    /// Returns a lease ahead of its expiry.
    fn release(&mut self, ipv4: Option<Ipv4Addr>, client_id: &[u8]);
}

/// Handles a stateful REQUEST or RELEASE, returning the encoded ACK or
/// NAK to send back to the requester, if any.
pub fn handle_stateful<'o, A>(
    allocator: &mut A,
    msg: &Stateful<'_>,
    buf: &'o mut [u8],
) -> Result<Option<&'o [u8]>, Error>
where
    A: LeaseAllocator,
{
    let request = Config::decode(msg.body, Mode::Server)?;
    let suggested = request
        .ipv4_address
        .as_ref()
        .and_then(|list| list.first().copied());

    match msg.opcode {
        Opcode::StatefulRequest => {
            let reply = match allocator.take(msg.unique_id, suggested, msg.lease_time) {
                Some((ipv4, granted)) => {
                    debug!("Granting {ipv4} for {granted}s");

                    let mut body = [0; 8];
                    let len = config::encode_stateful_body(Some(ipv4), &mut body)?;

                    Stateful {
                        opcode: Opcode::StatefulAck,
                        lease_time: granted,
                        unique_id: msg.unique_id,
                        body: &body[..len],
                    }
                    .encode(buf)?
                }
                None => {
                    debug!("Refusing lease request");

                    Stateful {
                        opcode: Opcode::StatefulNak,
                        lease_time: 0,
                        unique_id: msg.unique_id,
                        body: &[],
                    }
                    .encode(buf)?
                }
            };

            Ok(Some(reply))
        }
        Opcode::StatefulRelease => {
            allocator.release(suggested, msg.unique_id);

            Ok(None)
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::Packet;

    #[test]
    fn authority_floods_its_exact_body() {
        let mut body = [0; 64];
        let config = Config {
            expires: Some(3600),
            ..Default::default()
        };
        let len = config.encode(&mut body).unwrap();

        let authority = Authority::new(&body[..len], 7200).unwrap();
        assert_eq!(authority.body(), &body[..len]);

        let reply = authority.reply(1_300_000_000);
        assert_eq!(reply.origin, 1_300_000_000);
        assert_eq!(reply.expires, 1_300_007_200);
        assert_eq!(reply.age, 0);
        assert_eq!(reply.body, &body[..len]);
    }

    #[test]
    fn authority_rejects_garbage() {
        // A body without a lifetime is not servable
        assert!(matches!(Authority::new(&[], 3600), Err(Error::Expired)));
        assert!(Authority::new(&[config::OPT_EXPIRES, 4, 0], 3600).is_err());
    }

    struct FixedAllocator {
        grant: Option<Ipv4Addr>,
        released: Option<(Option<Ipv4Addr>, std::vec::Vec<u8>)>,
    }

    impl LeaseAllocator for FixedAllocator {
        fn take(
            &mut self,
            _client_id: &[u8],
            _suggested: Option<Ipv4Addr>,
            lease_time: u16,
        ) -> Option<(Ipv4Addr, u16)> {
            self.grant.map(|ipv4| (ipv4, lease_time.min(3600)))
        }

        fn release(&mut self, ipv4: Option<Ipv4Addr>, client_id: &[u8]) {
            self.released = Some((ipv4, client_id.to_vec()));
        }
    }

    fn request(opcode: Opcode, id: &[u8], suggested: Option<Ipv4Addr>) -> std::vec::Vec<u8> {
        let mut body = [0; 8];
        let len = config::encode_stateful_body(suggested, &mut body).unwrap();

        let mut buf = [0; 600];
        Stateful {
            opcode,
            lease_time: 1800,
            unique_id: id,
            body: &body[..len],
        }
        .encode(&mut buf)
        .unwrap()
        .to_vec()
    }

    #[test]
    fn request_is_acked_with_the_granted_address() {
        let mut allocator = FixedAllocator {
            grant: Some(Ipv4Addr::new(10, 0, 0, 42)),
            released: None,
        };

        let id = [7; 16];
        let data = request(Opcode::StatefulRequest, &id, None);
        let msg = match Packet::decode(&data).unwrap() {
            Packet::Stateful(msg) => msg,
            other => panic!("unexpected packet {other:?}"),
        };

        let mut buf = [0; 600];
        let reply = handle_stateful(&mut allocator, &msg, &mut buf)
            .unwrap()
            .unwrap();

        match Packet::decode(reply).unwrap() {
            Packet::Stateful(ack) => {
                assert_eq!(ack.opcode, Opcode::StatefulAck);
                assert_eq!(ack.lease_time, 1800);
                assert_eq!(ack.unique_id, &id);

                let granted = Config::decode(ack.body, Mode::Server).unwrap();
                assert_eq!(
                    granted.ipv4_address.as_deref(),
                    Some(&[Ipv4Addr::new(10, 0, 0, 42)][..])
                );
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn exhaustion_naks_back_to_the_requester() {
        let mut allocator = FixedAllocator {
            grant: None,
            released: None,
        };

        let id = [9; 16];
        let data = request(Opcode::StatefulRequest, &id, None);
        let msg = match Packet::decode(&data).unwrap() {
            Packet::Stateful(msg) => msg,
            other => panic!("unexpected packet {other:?}"),
        };

        let mut buf = [0; 600];
        let reply = handle_stateful(&mut allocator, &msg, &mut buf)
            .unwrap()
            .unwrap();

        match Packet::decode(reply).unwrap() {
            Packet::Stateful(nak) => {
                assert_eq!(nak.opcode, Opcode::StatefulNak);
                assert_eq!(nak.unique_id, &id);
                assert!(nak.body.is_empty());
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn release_is_forwarded_and_unanswered() {
        let mut allocator = FixedAllocator {
            grant: Some(Ipv4Addr::new(10, 0, 0, 42)),
            released: None,
        };

        let id = [3; 16];
        let released = Ipv4Addr::new(10, 0, 0, 42);
        let data = request(Opcode::StatefulRelease, &id, Some(released));
        let msg = match Packet::decode(&data).unwrap() {
            Packet::Stateful(msg) => msg,
            other => panic!("unexpected packet {other:?}"),
        };

        let mut buf = [0; 600];
        assert!(handle_stateful(&mut allocator, &msg, &mut buf)
            .unwrap()
            .is_none());

        assert_eq!(
            allocator.released,
            Some((Some(released), id.to_vec()))
        );
    }
}
