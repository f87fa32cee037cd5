use core::net::{Ipv4Addr, Ipv6Addr};

use embassy_time::Duration;

use heapless::Vec;

use crate::config::MAX_LIST;
use crate::Error;

/// Delay before the very first query after an interface comes up.
pub const QUERY_DELAY: Duration = Duration::from_millis(1000);
/// First retransmit timeout of the query regime.
pub const INITIAL_QUERY_TIMEOUT: Duration = Duration::from_millis(2000);
/// Ceiling of the query backoff.
pub const MAX_QUERY_TIMEOUT: Duration = Duration::from_millis(30000);
/// Query cadence while valid data is held, as a keep-alive probe.
pub const CONFIGURED_QUERY_INTERVAL: Duration = Duration::from_secs(600);

/// Delay before the first stateful request after servers become known.
pub const STATEFUL_REQUEST_DELAY: Duration = Duration::from_millis(8000);
/// First retransmit timeout of the stateful request regime.
pub const INITIAL_STATEFUL_TIMEOUT: Duration = Duration::from_millis(2000);
/// Ceiling of the stateful request backoff.
pub const MAX_STATEFUL_TIMEOUT: Duration = Duration::from_millis(60000);

/// Leases shorter than this are noise and are ignored.
pub const MIN_LEASE_TIME: u16 = 4;

/// Seconds before expiry at which the query regime wakes up again.
pub const EXPIRY_QUERY_LEAD: u32 = 50;

/// A clock that predates the protocol's deployment has not been set.
pub fn clock_broken(now: u32) -> bool {
    now < 1_200_000_000
}

/// Remaining validity, in seconds, of data carrying the freshness triple
/// `(origin, expires, age)` when the local wall clock reads `now`.
///
/// The age bound applies regardless of the local clock; the absolute
/// expiry bound only applies when the local clock can be trusted.
pub fn validity(now: u32, origin: u32, expires: u32, age: u32) -> u32 {
    if age >= expires.wrapping_sub(origin) || origin > expires {
        return 0;
    }

    let by_age = expires - origin - age;

    if clock_broken(now) {
        by_age
    } else if now >= expires {
        0
    } else {
        by_age.min(expires - now)
    }
}

/// Sanity windows for the freshness stamps of a received reply: data from
/// more than 300 s in the future or expired for more than 600 s points at
/// somebody's broken clock. Suppressed when it might be ours.
pub fn check_reply_times(now: u32, origin: u32, expires: u32) -> Result<(), Error> {
    if origin > expires {
        return Err(Error::InconsistentTimes);
    }

    if !clock_broken(now) {
        if origin > now.saturating_add(300) {
            return Err(Error::InconsistentTimes);
        }
        if expires.saturating_add(600) < now {
            return Err(Error::Expired);
        }
    }

    Ok(())
}

/// The freshness state of the data we currently hold.
///
/// `age_origin` is the local wall-clock second at which the data was zero
/// seconds old, so the current age is simply `now - age_origin`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Freshness {
    pub origin: u32,
    pub expires: u32,
    pub age_origin: u32,
}

impl Freshness {
    /// Derives the local freshness state from a just-accepted reply.
    pub fn from_reply(now: u32, origin: u32, expires: u32, age: u16) -> Self {
        let mut age_origin = now.saturating_sub(age as u32);
        if age_origin > origin {
            age_origin = origin;
        }

        Self {
            origin,
            expires,
            age_origin,
        }
    }

    pub fn age(&self, now: u32) -> u32 {
        now.saturating_sub(self.age_origin)
    }

    pub fn validity(&self, now: u32) -> u32 {
        validity(now, self.origin, self.expires, self.age(now))
    }
}

/// What to do with an incoming stateless reply.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Verdict {
    /// Fresher than what we hold; adopt it.
    Accept,
    /// Nothing to learn from it.
    Ignore,
    /// The sender is re-flooding stale data while we hold fresh data;
    /// schedule a reply soon to bring it up to date.
    TeachSender,
}

/// Origin election. A reply wins over the current data when it is valid
/// and strictly newer at the origin. When two authorities disagree about
/// the payload, hysteresis keeps us from flapping: while our data still
/// has at least 10 s to live, a different payload is only adopted once it
/// has at least half of its `(expires - origin)` window left.
pub fn evaluate(
    now: u32,
    origin: u32,
    expires: u32,
    age: u16,
    current: Option<&Freshness>,
    differs: bool,
) -> Verdict {
    let incoming = validity(now, origin, expires, age as u32);

    if incoming == 0 {
        if age > 0 && current.is_some() {
            return Verdict::TeachSender;
        }

        return Verdict::Ignore;
    }

    let Some(held) = current else {
        return Verdict::Accept;
    };

    if origin <= held.origin {
        return Verdict::Ignore;
    }

    if differs && held.validity(now) >= 10 && incoming < (expires - origin) / 2 {
        return Verdict::Ignore;
    }

    Verdict::Accept
}

/// Exponential retransmit schedule for queries: 2 s doubling to 30 s.
#[derive(Copy, Clone, Debug)]
pub struct QueryBackoff {
    timeout: Duration,
}

impl Default for QueryBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryBackoff {
    pub const fn new() -> Self {
        Self {
            timeout: INITIAL_QUERY_TIMEOUT,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub const fn current(&self) -> Duration {
        self.timeout
    }

    /// Doubles the timeout and returns the delay until the next query.
    pub fn advance(&mut self) -> Duration {
        self.timeout = (self.timeout * 2).min(MAX_QUERY_TIMEOUT);
        self.timeout
    }
}

/// Outcome of a stateful acknowledgement.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AckOutcome {
    /// Install the address; re-request at `renew`, give it up at `expire`.
    Granted {
        ipv4: Ipv4Addr,
        expire: Duration,
        renew: Duration,
    },
    /// The acknowledgement was unusable; retry after the returned delay.
    Backoff(Duration),
    /// Too-short lease, not worth acting on.
    Ignored,
}

/// The stateful (DHCP-like) client: a list of candidate servers tried
/// round-robin, an exponential request backoff, and the current lease.
#[derive(Clone, Debug)]
pub struct StatefulClient {
    servers: Vec<Ipv6Addr, MAX_LIST>,
    current: usize,
    selected: Option<usize>,
    timeout: Duration,
    lease: Option<Ipv4Addr>,
}

impl StatefulClient {
    pub fn new(servers: Vec<Ipv6Addr, MAX_LIST>) -> Self {
        Self {
            servers,
            current: 0,
            selected: None,
            timeout: INITIAL_STATEFUL_TIMEOUT,
            lease: None,
        }
    }

    pub fn lease(&self) -> Option<Ipv4Addr> {
        self.lease
    }

    /// The server requests are currently directed at: the one that granted
    /// our lease if any, otherwise the round-robin candidate.
    pub fn server(&self) -> Ipv6Addr {
        let index = self.selected.unwrap_or(self.current);

        self.servers[index % self.servers.len()]
    }

    /// Whether a stateful reply source is one of the known servers.
    pub fn is_server(&self, addr: &Ipv6Addr) -> bool {
        self.servers.contains(addr)
    }

    /// Called right after a request went out; returns the retransmit
    /// delay. Doubling clamps at the ceiling; once it is reached the
    /// round-robin moves on to the next candidate (when there is one)
    /// with a fresh backoff.
    pub fn on_request_sent(&mut self) -> Duration {
        let delay = self.timeout;
        let doubled = delay * 2;

        if doubled > MAX_STATEFUL_TIMEOUT {
            if self.selected.is_none() && self.servers.len() > 1 {
                self.current = (self.current + 1) % self.servers.len();
                self.timeout = INITIAL_STATEFUL_TIMEOUT;
            } else {
                self.timeout = MAX_STATEFUL_TIMEOUT;
            }
        } else {
            self.timeout = doubled;
        }

        delay
    }

    pub fn on_ack(&mut self, lease_time: u16, ipv4: Option<Ipv4Addr>) -> AckOutcome {
        if lease_time < MIN_LEASE_TIME {
            return AckOutcome::Ignored;
        }

        let Some(ipv4) = ipv4 else {
            self.selected = None;
            self.timeout = MAX_STATEFUL_TIMEOUT;

            return AckOutcome::Backoff(MAX_STATEFUL_TIMEOUT);
        };

        self.selected = Some(self.current);
        self.lease = Some(ipv4);
        self.timeout = INITIAL_STATEFUL_TIMEOUT;

        AckOutcome::Granted {
            ipv4,
            expire: Duration::from_secs(lease_time as _),
            renew: Duration::from_millis(lease_time as u64 * 2000 / 3)
                .min(Duration::from_secs(3600)),
        }
    }

    /// Adopts a fresh server list from newly accepted data. The lease
    /// survives; the selection does too as long as its server is still
    /// announced.
    pub fn set_servers(&mut self, servers: Vec<Ipv6Addr, MAX_LIST>) {
        let granting = self
            .selected
            .map(|i| self.servers[i % self.servers.len()]);

        self.servers = servers;
        self.current = 0;
        self.timeout = INITIAL_STATEFUL_TIMEOUT;
        self.selected = granting.and_then(|addr| {
            self.servers.iter().position(|server| *server == addr)
        });
    }

    pub fn on_nak(&mut self) -> Duration {
        self.timeout = MAX_STATEFUL_TIMEOUT;

        MAX_STATEFUL_TIMEOUT
    }

    /// The host refused the granted address; drop it and back off hard.
    pub fn on_install_failed(&mut self) -> Duration {
        self.lease = None;
        self.selected = None;
        self.timeout = MAX_STATEFUL_TIMEOUT;

        MAX_STATEFUL_TIMEOUT
    }

    /// The lease ran out without a renewal; back to requesting.
    pub fn on_expired(&mut self) -> Duration {
        self.lease = None;
        self.selected = None;
        self.timeout = INITIAL_STATEFUL_TIMEOUT;

        STATEFUL_REQUEST_DELAY
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validity_formula() {
        assert_eq!(validity(1200, 1000, 1600, 100), 400);
        assert_eq!(validity(1700, 1000, 1600, 100), 0);
        assert_eq!(validity(1200, 1000, 1600, 700), 0);

        // Broken local clock: only the age bound applies
        assert_eq!(validity(500_000, 1000, 1600, 100), 500);
    }

    #[test]
    fn reply_time_sanity() {
        let now = 1_300_000_000;

        assert!(check_reply_times(now, now, now + 600).is_ok());
        assert!(matches!(
            check_reply_times(now, now + 10, now),
            Err(Error::InconsistentTimes)
        ));
        assert!(matches!(
            check_reply_times(now, now + 301, now + 900),
            Err(Error::InconsistentTimes)
        ));
        assert!(matches!(
            check_reply_times(now, now - 2000, now - 601),
            Err(Error::Expired)
        ));

        // All but the internal consistency check vanish on a broken clock
        assert!(check_reply_times(1000, 2_000_000_000, 2_000_000_600).is_ok());
        assert!(matches!(
            check_reply_times(1000, 20, 10),
            Err(Error::InconsistentTimes)
        ));
    }

    #[test]
    fn election_prefers_newer_origins() {
        let held = Freshness {
            origin: 1_300_000_000,
            expires: 1_300_001_000,
            age_origin: 1_300_000_000,
        };
        let now = 1_300_000_200;

        // No data at all: anything valid wins
        assert_eq!(
            evaluate(now, held.origin, held.expires, 0, None, false),
            Verdict::Accept
        );

        // Older or equal origin: ignored
        assert_eq!(
            evaluate(now, held.origin, held.expires + 500, 0, Some(&held), false),
            Verdict::Ignore
        );

        // Newer origin, same payload: adopted
        assert_eq!(
            evaluate(
                now,
                held.origin + 100,
                held.expires + 100,
                0,
                Some(&held),
                false
            ),
            Verdict::Accept
        );
    }

    #[test]
    fn election_hysteresis() {
        // The worked example: held (origin 1000, expires 2000) at now 1200,
        // incoming differs with origin 1500. Incoming is only adopted with
        // at least half of its window left.
        let held = Freshness {
            origin: 1000,
            expires: 2000,
            age_origin: 1000,
        };

        assert_eq!(
            evaluate(1200, 1500, 2100, 0, Some(&held), true),
            Verdict::Accept
        );

        // validity = 200 < (1700 - 1500) / 2 is false; 200 >= 100.
        // Shrink the incoming window so validity < half: origin 1500,
        // expires 1700, age 450 -> validity min(250-450<0 => 0)... use age
        // to cut validity below half the window instead.
        assert_eq!(
            evaluate(1200, 1500, 2100, 450, Some(&held), true),
            Verdict::Ignore
        );

        // Same payload skips the hysteresis entirely
        assert_eq!(
            evaluate(1200, 1500, 2100, 450, Some(&held), false),
            Verdict::Accept
        );
    }

    #[test]
    fn stale_senders_get_taught() {
        let held = Freshness {
            origin: 1000,
            expires: 2000,
            age_origin: 1000,
        };

        // age exhausts the window: invalid, and age > 0 means a forwarder
        assert_eq!(
            evaluate(1200, 1000, 1500, 600, Some(&held), false),
            Verdict::TeachSender
        );

        // Invalid data with age 0 is just ignored
        assert_eq!(
            evaluate(1200, 1000, 1000, 0, Some(&held), false),
            Verdict::Ignore
        );

        // Nothing held: nothing to teach with
        assert_eq!(evaluate(1200, 1000, 1500, 600, None, false), Verdict::Ignore);
    }

    #[test]
    fn query_backoff_doubles_to_ceiling() {
        let mut backoff = QueryBackoff::new();

        assert_eq!(backoff.current(), Duration::from_secs(2));
        assert_eq!(backoff.advance(), Duration::from_secs(4));
        assert_eq!(backoff.advance(), Duration::from_secs(8));
        assert_eq!(backoff.advance(), Duration::from_secs(16));
        assert_eq!(backoff.advance(), Duration::from_secs(30));
        assert_eq!(backoff.advance(), Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(2));
    }

    fn servers(n: u16) -> Vec<Ipv6Addr, MAX_LIST> {
        (1..=n)
            .map(|i| Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, i))
            .collect()
    }

    #[test]
    fn stateful_backoff_sequence() {
        let mut client = StatefulClient::new(servers(1));
        let only = client.server();

        let mut delays = heapless::Vec::<u64, 8>::new();
        for _ in 0..8 {
            assert_eq!(client.server(), only);
            delays.push(client.on_request_sent().as_secs()).unwrap();
        }

        assert_eq!(&delays[..], &[2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn stateful_round_robin_on_exhaustion() {
        let mut client = StatefulClient::new(servers(2));
        let first = client.server();

        for _ in 0..5 {
            assert_eq!(client.server(), first);
            client.on_request_sent();
        }

        // Backoff exhausted: next candidate, fresh 2 s timeout
        assert_ne!(client.server(), first);
        assert_eq!(client.on_request_sent(), Duration::from_secs(2));
    }

    #[test]
    fn ack_grants_and_schedules_renewal() {
        let mut client = StatefulClient::new(servers(2));
        let granted = Ipv4Addr::new(10, 0, 0, 9);

        assert_eq!(client.on_ack(3, Some(granted)), AckOutcome::Ignored);
        assert!(client.lease().is_none());

        match client.on_ack(600, Some(granted)) {
            AckOutcome::Granted {
                ipv4,
                expire,
                renew,
            } => {
                assert_eq!(ipv4, granted);
                assert_eq!(expire, Duration::from_secs(600));
                assert_eq!(renew, Duration::from_secs(400));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(client.lease(), Some(granted));

        // Renewal of very long leases happens hourly regardless
        match client.on_ack(7200, Some(granted)) {
            AckOutcome::Granted { renew, .. } => {
                assert_eq!(renew, Duration::from_secs(3600))
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // Once granted, requests stick to the granting server
        let selected = client.server();
        for _ in 0..8 {
            client.on_request_sent();
            assert_eq!(client.server(), selected);
        }

        assert_eq!(client.on_nak(), MAX_STATEFUL_TIMEOUT);

        assert_eq!(client.on_expired(), STATEFUL_REQUEST_DELAY);
        assert!(client.lease().is_none());
    }
}
