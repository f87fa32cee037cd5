//! The protocol engine: a single cooperative loop owning the socket, the
//! per-interface timers and the whole client/authority/stateful state.
//! One blocking wait per iteration; everything else is straight-line
//! processing of whichever event ended the wait.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::path::PathBuf;

use async_io::Async;

use embassy_futures::select::{select3, Either3};
use embassy_time::{Duration, Instant, Timer};

use edge_nal::{MulticastV6, UdpReceive, UdpSend};
use embedded_io_async::ErrorType;

use log::{debug, info, warn};

use rand_core::RngCore;

use ahcp_proto::client::{
    self, clock_broken, evaluate, AckOutcome, Freshness, QueryBackoff, StatefulClient,
    Verdict, EXPIRY_QUERY_LEAD,
};
use ahcp_proto::server::{self, Authority, LeaseAllocator};
use ahcp_proto::{config, Config, Mode, Opcode, Packet, Reply, Stateful, BUFFER_SIZE};

use ahcp_lease::LeaseStore;

use crate::clock::{self, ClockMonitor};
use crate::persist;
use crate::script::{Action, Configurator, ScriptError};
use crate::signal::{Signal, Signals};

/// The well-known link-scoped protocol group.
pub const PROTOCOL_GROUP: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0xcca6, 0xc0f9, 0xe182, 0x5359);

/// The default protocol port.
pub const PROTOCOL_PORT: u16 = 5359;

/// At most this many monitored interfaces.
pub const MAX_INTERFACES: usize = 20;

const CHECK_NETWORKS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum EngineError {
    Io(io::Error),
    Script(ScriptError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Script(err) => write!(f, "Configurator failure: {err}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ScriptError> for EngineError {
    fn from(err: ScriptError) -> Self {
        Self::Script(err)
    }
}

/// Binds the protocol socket: IPv6-only, address reuse for restarts,
/// multicast loopback off (we would only hear ourselves), hop limit 1
/// (everything is link-scoped).
pub fn bind(port: u16) -> io::Result<edge_nal_std::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_loop_v6(false)?;
    socket.set_multicast_hops_v6(1)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into())?;

    Ok(edge_nal_std::UdpSocket::new(Async::new(socket.into())?))
}

/// Resolves an interface name to its index; 0 when it does not exist.
pub fn if_nametoindex(name: &str) -> u32 {
    let Ok(name) = std::ffi::CString::new(name) else {
        return 0;
    };

    unsafe { libc::if_nametoindex(name.as_ptr()) }
}

/// Adapts the persistent lease store to the protocol's allocator seam,
/// turning store errors into refusals.
pub struct StoreAllocator<R>(pub LeaseStore<R>);

impl<R> LeaseAllocator for StoreAllocator<R>
where
    R: RngCore,
{
    fn take(
        &mut self,
        client_id: &[u8],
        suggested: Option<Ipv4Addr>,
        lease_time: u16,
    ) -> Option<(Ipv4Addr, u16)> {
        match self.0.take(client_id, suggested, lease_time, clock::wall_now()) {
            Ok(grant) => Some(grant),
            Err(err) => {
                info!("Refusing lease: {err}");

                None
            }
        }
    }

    fn release(&mut self, ipv4: Option<Ipv4Addr>, client_id: &[u8]) {
        if let Err(err) = self.0.release(ipv4, client_id, clock::wall_now()) {
            info!("Ignoring release: {err}");
        }
    }
}

pub struct Options {
    pub port: u16,
    pub group: Ipv6Addr,
    pub unique_id: [u8; 16],
    pub no_stateful: bool,
    pub log_file: Option<PathBuf>,
}

struct Interface {
    name: String,
    index: u32,
    query_time: Option<Instant>,
    reply_time: Option<Instant>,
}

/// Data accepted from the network: the body exactly as received (it is
/// re-flooded byte-identical), its decoded form, and its freshness.
struct NetData {
    raw: Vec<u8>,
    config: Config,
    fresh: Freshness,
}

pub struct Engine<S, A, R> {
    opts: Options,
    socket: S,
    signals: Signals,
    configurator: Configurator,
    authority: Option<Authority>,
    allocator: Option<A>,
    ifindex: fn(&str) -> u32,
    rng: R,
    clock: ClockMonitor,

    interfaces: Vec<Interface>,
    data: Option<NetData>,
    backoff: QueryBackoff,
    stateful: Option<StatefulClient>,
    installed_ipv4: Option<Ipv4Addr>,

    stateful_request_time: Option<Instant>,
    stateful_expire_time: Option<Instant>,
    check_networks_time: Option<Instant>,
}

enum Event {
    Packet(io::Result<(usize, SocketAddr)>),
    Timer,
    Signal,
}

impl<S, A, R> Engine<S, A, R>
where
    S: UdpReceive + UdpSend + MulticastV6 + ErrorType<Error = io::Error>,
    A: LeaseAllocator,
    R: RngCore,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opts: Options,
        socket: S,
        signals: Signals,
        configurator: Configurator,
        authority: Option<Authority>,
        allocator: Option<A>,
        interfaces: Vec<String>,
        ifindex: fn(&str) -> u32,
        rng: R,
    ) -> Self {
        let interfaces = interfaces
            .into_iter()
            .take(MAX_INTERFACES)
            .map(|name| Interface {
                name,
                index: 0,
                query_time: None,
                reply_time: None,
            })
            .collect();

        Self {
            opts,
            socket,
            signals,
            configurator,
            authority,
            allocator,
            ifindex,
            rng,
            clock: ClockMonitor::new(),
            interfaces,
            data: None,
            backoff: QueryBackoff::new(),
            stateful: None,
            installed_ipv4: None,
            stateful_request_time: None,
            stateful_expire_time: None,
            check_networks_time: None,
        }
    }

    /// Runs the daemon until an exit signal arrives, then tears down and
    /// returns. Per-packet problems are logged, never propagated; only
    /// startup configuration and the final unconfigure can fail the run.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let mut buf = [0; BUFFER_SIZE];

        if let Some(authority) = self.authority.as_ref() {
            // The authority's own data is applied to this host too
            self.configurator
                .run(Action::Start, authority.config(), None)?;

            if !self.opts.no_stateful {
                if let Some(servers) = authority.config().stateful_server.clone() {
                    self.stateful = Some(StatefulClient::new(servers));
                    schedule(
                        &mut self.stateful_request_time,
                        &mut self.rng,
                        client::STATEFUL_REQUEST_DELAY,
                        true,
                    );
                }
            }
        }

        for i in 0..self.interfaces.len() {
            self.check_network(i).await;

            if self.interfaces[i].index == 0 {
                warn!("Unknown interface {}", self.interfaces[i].name);
            }
        }

        schedule(
            &mut self.check_networks_time,
            &mut self.rng,
            CHECK_NETWORKS_INTERVAL,
            true,
        );

        debug!("Entering main loop");

        loop {
            let mut deadline = self.next_deadline();
            if clock_broken(clock::wall_now()) {
                // Somebody (NTP?) is likely about to step the clock;
                // wake up soon regardless, just in case.
                deadline = deadline.min(Instant::now() + Duration::from_secs(30));
            }

            let event = {
                let Self {
                    socket, signals, ..
                } = self;

                match select3(socket.receive(&mut buf), Timer::at(deadline), signals.wait())
                    .await
                {
                    Either3::First(result) => Event::Packet(result),
                    Either3::Second(()) => Event::Timer,
                    Either3::Third(result) => {
                        if let Err(err) = result {
                            warn!("Signal pipe: {err}");
                        }

                        Event::Signal
                    }
                }
            };

            if let Some(step) = self.clock.observe() {
                warn!("Clock stepped by {step} seconds");
            }

            match event {
                Event::Packet(Ok((len, remote))) => {
                    let len = len.min(buf.len());
                    self.handle_packet(&buf[..len], remote).await;
                }
                Event::Packet(Err(err)) => {
                    warn!("Receive: {err}");
                    Timer::after(Duration::from_secs(5)).await;
                }
                Event::Timer | Event::Signal => {}
            }

            while let Some(signal) = self.signals.take() {
                match signal {
                    Signal::Exit => return self.shutdown().await,
                    Signal::Dump => self.dump_status(),
                    Signal::Reload => self.reload().await,
                }
            }

            self.expire_client_data();
            self.fire_timers().await;
        }
    }

    /// The exit path: release the stateful lease (once, to the server
    /// that granted it), withdraw the IPv4, then unconfigure. A failed
    /// unconfigure means the host is left in an unknown state, which is
    /// fatal.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        if let Some(stateful) = self.stateful.take() {
            if let Some(ipv4) = stateful.lease() {
                let mut body = [0; 8];
                let mut packet = [0; 64];

                let len = config::encode_stateful_body(Some(ipv4), &mut body)
                    .expect("stateful body fits");
                let release = Stateful {
                    opcode: Opcode::StatefulRelease,
                    lease_time: 0,
                    unique_id: &self.opts.unique_id,
                    body: &body[..len],
                };

                if let Ok(data) = release.encode(&mut packet) {
                    let data = data.to_vec();
                    info!("Releasing {ipv4}");
                    let target =
                        SocketAddrV6::new(stateful.server(), self.opts.port, 0, 0);
                    self.send(target, &data).await;
                }
            }
        }

        if let Some(ipv4) = self.installed_ipv4.take() {
            let config = self.active_config().cloned().unwrap_or_default();
            if let Err(err) = self.configurator.run(Action::StopIpv4, &config, Some(ipv4)) {
                warn!("Couldn't withdraw {ipv4}: {err}");
            }
        }

        let config = match (&self.data, &self.authority) {
            (Some(data), _) => Some(data.config.clone()),
            (None, Some(authority)) => Some(authority.config().clone()),
            (None, None) => None,
        };

        if let Some(config) = config {
            self.configurator.run(Action::Stop, &config, None)?;
        }

        Ok(())
    }

    fn holding(&self) -> bool {
        self.authority.is_some() || self.data.is_some()
    }

    fn active_config(&self) -> Option<&Config> {
        self.data
            .as_ref()
            .map(|data| &data.config)
            .or_else(|| self.authority.as_ref().map(|a| a.config()))
    }

    async fn check_network(&mut self, i: usize) {
        let index = (self.ifindex)(&self.interfaces[i].name);

        if index == self.interfaces[i].index {
            return;
        }

        self.interfaces[i].index = index;

        if index == 0 {
            return;
        }

        if let Err(err) = self.socket.join_v6(self.opts.group, index).await {
            warn!(
                "Couldn't join {} on {}: {err}",
                self.opts.group, self.interfaces[i].name
            );
            self.interfaces[i].index = 0;

            return;
        }

        info!("Interface {} is up ({index})", self.interfaces[i].name);

        if self.authority.is_some() {
            for j in 0..self.interfaces.len() {
                cancel(&mut self.interfaces[j].query_time);
                schedule(
                    &mut self.interfaces[j].reply_time,
                    &mut self.rng,
                    Duration::from_millis(5000),
                    true,
                );
            }
        } else {
            for j in 0..self.interfaces.len() {
                schedule(
                    &mut self.interfaces[j].query_time,
                    &mut self.rng,
                    client::QUERY_DELAY,
                    true,
                );
                cancel(&mut self.interfaces[j].reply_time);
            }
        }
    }

    async fn reload(&mut self) {
        for i in 0..self.interfaces.len() {
            self.check_network(i).await;
        }

        schedule(
            &mut self.check_networks_time,
            &mut self.rng,
            CHECK_NETWORKS_INTERVAL,
            true,
        );

        if let Some(path) = self.opts.log_file.clone() {
            if let Err(err) = persist::reopen_log_file(&path) {
                warn!("Couldn't reopen log file: {err}");
            }
        }
    }

    fn dump_status(&self) {
        if self.authority.is_some() {
            info!("Authoritative stateless data.");
        } else if let Some(data) = self.data.as_ref() {
            info!(
                "Stateless data valid for {} seconds.",
                data.fresh.validity(clock::wall_now())
            );
        } else {
            info!("No stateless data.");
        }

        match self.installed_ipv4 {
            Some(ipv4) => {
                let now = Instant::now();
                let left = self
                    .stateful_expire_time
                    .filter(|t| *t > now)
                    .map(|t| (t - now).as_secs())
                    .unwrap_or(0);
                info!("Stateful data {ipv4}, valid for {left} seconds.");
            }
            None => info!("No stateful data."),
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut next: Option<Instant> = None;

        for interface in &self.interfaces {
            next = sooner(next, interface.query_time);
            next = sooner(next, interface.reply_time);
        }
        next = sooner(next, self.stateful_request_time);
        next = sooner(next, self.stateful_expire_time);
        next = sooner(next, self.check_networks_time);

        // Wake shortly before the stateless data expires so a query goes
        // out while there is still time for an answer.
        if self.authority.is_none() {
            if let Some(data) = self.data.as_ref() {
                let valid = data.fresh.validity(clock::wall_now());
                let lead = if valid >= EXPIRY_QUERY_LEAD {
                    valid - EXPIRY_QUERY_LEAD
                } else {
                    valid
                };

                next = sooner(
                    next,
                    Some(Instant::now() + Duration::from_secs(lead as u64)),
                );
            }
        }

        next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
    }

    async fn handle_packet(&mut self, data: &[u8], remote: SocketAddr) {
        let SocketAddr::V6(remote) = remote else {
            return;
        };

        // Link-local traffic is mapped to the interface it arrived on;
        // stateful unicast may come from further away.
        let net = if link_local(remote.ip()) {
            let Some(net) = self
                .interfaces
                .iter()
                .position(|i| i.index != 0 && i.index == remote.scope_id())
            else {
                info!("Received packet on unknown network");
                return;
            };

            Some(net)
        } else {
            None
        };

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                info!("Received corrupted packet from {remote}: {err}");
                return;
            }
        };

        match packet {
            Packet::Query => {
                let Some(net) = net else {
                    info!("Received non-local query");
                    return;
                };

                debug!("Received query on {}", self.interfaces[net].name);

                // Peers retransmit after 2 s; answering within 1 s (after
                // jitter, at most ~1.5 s) keeps them quiet.
                if self.holding() {
                    schedule(
                        &mut self.interfaces[net].reply_time,
                        &mut self.rng,
                        Duration::from_millis(1000),
                        false,
                    );
                }
            }
            Packet::Reply(reply) => {
                let Some(net) = net else {
                    info!("Received non-local reply");
                    return;
                };

                debug!("Received reply on {}", self.interfaces[net].name);

                self.handle_reply(net, reply).await;
            }
            Packet::Stateful(msg) => match msg.opcode {
                Opcode::StatefulRequest | Opcode::StatefulRelease => {
                    self.handle_stateful_server(&msg, remote).await;
                }
                Opcode::StatefulAck | Opcode::StatefulNak => {
                    self.handle_stateful_reply(&msg, remote).await;
                }
                Opcode::Query | Opcode::Reply => unreachable!(),
            },
        }
    }

    async fn handle_reply(&mut self, net: usize, reply: Reply<'_>) {
        let now = clock::wall_now();

        if let Err(err) = client::check_reply_times(now, reply.origin, reply.expires) {
            info!(
                "Rejecting reply (origin = {}, expires = {}, now = {now}): {err}",
                reply.origin, reply.expires
            );
            return;
        }

        if client::validity(now, reply.origin, reply.expires, reply.age as u32) == 0 {
            // Somebody is flooding stale data; if it is second-hand and we
            // know better, teach the link soon.
            if reply.age > 0 && self.holding() {
                schedule(
                    &mut self.interfaces[net].reply_time,
                    &mut self.rng,
                    Duration::from_millis(10000),
                    false,
                );
            }
            return;
        }

        if self.authority.is_some() {
            return;
        }

        let differs = self
            .data
            .as_ref()
            .map_or(true, |data| data.raw != reply.body);

        let verdict = evaluate(
            now,
            reply.origin,
            reply.expires,
            reply.age,
            self.data.as_ref().map(|data| &data.fresh),
            differs,
        );

        if verdict != Verdict::Accept {
            return;
        }

        let config = match Config::decode(reply.body, Mode::Client) {
            Ok(config) => config,
            Err(err) => {
                info!("Couldn't parse reply body: {err}");
                return;
            }
        };

        self.accept_data(&reply, config, differs, now).await;
    }

    async fn accept_data(
        &mut self,
        reply: &Reply<'_>,
        config: Config,
        changed: bool,
        now: u32,
    ) {
        if changed {
            if let Some(data) = self.data.as_ref() {
                if !data.config.is_compatible(&config) {
                    if let Err(err) =
                        self.configurator.run(Action::Stop, &data.config, None)
                    {
                        warn!("Couldn't unconfigure: {err}");
                    }
                    self.data = None;
                }
            }

            if self.data.is_none() {
                if let Err(err) = self.configurator.run(Action::Start, &config, None) {
                    warn!("Dropping configuration, start failed: {err}");
                    return;
                }
            }
        }

        info!("Accepted stateless data (origin = {})", reply.origin);

        self.data = Some(NetData {
            raw: reply.body.to_vec(),
            config,
            fresh: Freshness::from_reply(now, reply.origin, reply.expires, reply.age),
        });

        for i in 0..self.interfaces.len() {
            cancel(&mut self.interfaces[i].query_time);
        }

        if changed {
            // Fresh content: flood it onward
            for i in 0..self.interfaces.len() {
                schedule(
                    &mut self.interfaces[i].reply_time,
                    &mut self.rng,
                    Duration::from_millis(3000),
                    false,
                );
            }
        }

        let servers = self
            .data
            .as_ref()
            .and_then(|data| data.config.stateful_server.clone())
            .filter(|_| !self.opts.no_stateful);

        match servers {
            Some(servers) => {
                match self.stateful.as_mut() {
                    Some(stateful) => stateful.set_servers(servers),
                    None => self.stateful = Some(StatefulClient::new(servers)),
                }
                schedule(
                    &mut self.stateful_request_time,
                    &mut self.rng,
                    client::STATEFUL_REQUEST_DELAY,
                    true,
                );
            }
            None => {
                cancel(&mut self.stateful_request_time);
                if self
                    .stateful
                    .as_ref()
                    .map_or(false, |stateful| stateful.lease().is_none())
                {
                    self.stateful = None;
                }
            }
        }
    }

    async fn handle_stateful_server(&mut self, msg: &Stateful<'_>, remote: SocketAddrV6) {
        let Some(allocator) = self.allocator.as_mut() else {
            return;
        };

        debug!("Received stateful {:?} from {remote}", msg.opcode);

        if clock_broken(clock::wall_now()) {
            return;
        }

        let mut out = [0; BUFFER_SIZE];
        match server::handle_stateful(allocator, msg, &mut out) {
            Ok(Some(reply)) => {
                let reply = reply.to_vec();
                self.send(remote, &reply).await;
            }
            Ok(None) => {}
            Err(err) => info!("Unacceptable stateful request: {err}"),
        }
    }

    async fn handle_stateful_reply(&mut self, msg: &Stateful<'_>, remote: SocketAddrV6) {
        let Some(stateful) = self.stateful.as_mut() else {
            info!("Received unexpected stateful reply");
            return;
        };

        if !stateful.is_server(remote.ip()) {
            info!("Received stateful reply from unknown server {}", remote.ip());
            return;
        }

        if msg.unique_id != &self.opts.unique_id[..] {
            info!("Received stateful reply not for me");
            return;
        }

        debug!("Received stateful {:?}", msg.opcode);

        if msg.opcode == Opcode::StatefulNak {
            let delay = stateful.on_nak();
            schedule(&mut self.stateful_request_time, &mut self.rng, delay, true);
            return;
        }

        let granted = Config::decode(msg.body, Mode::Server)
            .ok()
            .and_then(|config| config.ipv4_address)
            .and_then(|list| list.first().copied());

        match stateful.on_ack(msg.lease_time, granted) {
            AckOutcome::Granted {
                ipv4,
                expire,
                renew,
            } => {
                if self.installed_ipv4 != Some(ipv4) {
                    let config = self.active_config().cloned().unwrap_or_default();

                    if let Some(old) = self.installed_ipv4.take() {
                        if let Err(err) =
                            self.configurator.run(Action::StopIpv4, &config, Some(old))
                        {
                            warn!("Couldn't withdraw {old}: {err}");
                        }
                    }

                    if let Err(err) =
                        self.configurator.run(Action::StartIpv4, &config, Some(ipv4))
                    {
                        warn!("Couldn't install {ipv4}: {err}");

                        let delay = self
                            .stateful
                            .as_mut()
                            .map(|s| s.on_install_failed())
                            .unwrap_or(client::MAX_STATEFUL_TIMEOUT);
                        schedule(
                            &mut self.stateful_request_time,
                            &mut self.rng,
                            delay,
                            true,
                        );
                        cancel(&mut self.stateful_expire_time);
                        return;
                    }

                    self.installed_ipv4 = Some(ipv4);
                    info!("Installed {ipv4}");
                }

                schedule(&mut self.stateful_expire_time, &mut self.rng, expire, true);
                schedule(&mut self.stateful_request_time, &mut self.rng, renew, true);
            }
            AckOutcome::Backoff(delay) => {
                schedule(&mut self.stateful_request_time, &mut self.rng, delay, true);
            }
            AckOutcome::Ignored => {}
        }
    }

    /// Notices stateless data running out: a last-minute query burst when
    /// it is about to, a full teardown when it has.
    fn expire_client_data(&mut self) {
        if self.authority.is_some() {
            return;
        }

        let Some(data) = self.data.take() else {
            return;
        };

        let valid = data.fresh.validity(clock::wall_now());

        if valid == 0 {
            info!("Stateless data expired");

            if let Some(ipv4) = self.installed_ipv4.take() {
                if let Err(err) =
                    self.configurator.run(Action::StopIpv4, &data.config, Some(ipv4))
                {
                    warn!("Couldn't withdraw {ipv4}: {err}");
                }
            }
            self.stateful = None;
            cancel(&mut self.stateful_request_time);
            cancel(&mut self.stateful_expire_time);

            if let Err(err) = self.configurator.run(Action::Stop, &data.config, None) {
                warn!("Couldn't unconfigure: {err}");
            }

            self.backoff.reset();
            for i in 0..self.interfaces.len() {
                cancel(&mut self.interfaces[i].reply_time);
                schedule(
                    &mut self.interfaces[i].query_time,
                    &mut self.rng,
                    self.backoff.current(),
                    false,
                );
            }

            return;
        }

        self.data = Some(data);

        if valid <= EXPIRY_QUERY_LEAD {
            debug!("Stateless data about to expire");

            for i in 0..self.interfaces.len() {
                schedule(
                    &mut self.interfaces[i].query_time,
                    &mut self.rng,
                    Duration::from_millis(10000),
                    false,
                );
            }
        }
    }

    async fn fire_timers(&mut self) {
        let now = Instant::now();

        for i in 0..self.interfaces.len() {
            if due(self.interfaces[i].reply_time, now) {
                self.send_reply(i).await;
            }
            if due(self.interfaces[i].query_time, now) {
                self.send_query(i).await;
            }
        }

        if due(self.stateful_request_time, now) {
            self.send_stateful_request().await;
        }

        if due(self.stateful_expire_time, now) {
            self.expire_stateful();
        }

        if due(self.check_networks_time, now) {
            for i in 0..self.interfaces.len() {
                self.check_network(i).await;
            }
            schedule(
                &mut self.check_networks_time,
                &mut self.rng,
                CHECK_NETWORKS_INTERVAL,
                true,
            );
        }
    }

    async fn send_reply(&mut self, i: usize) {
        cancel(&mut self.interfaces[i].reply_time);

        let index = self.interfaces[i].index;
        if index == 0 {
            return;
        }

        let now = clock::wall_now();
        let mut packet = [0; BUFFER_SIZE];

        let (data, next) = match (&self.authority, &self.data) {
            (Some(authority), _) => {
                let reply = authority.reply(now);
                let Ok(data) = reply.encode(&mut packet) else {
                    warn!("Authority data does not fit a packet");
                    return;
                };

                let next = Duration::from_millis(authority.expires_delay() as u64 * 125)
                    .max(Duration::from_secs(30));

                (data.to_vec(), next)
            }
            (None, Some(data)) => {
                let age = data.fresh.age(now).saturating_add(1).min(u16::MAX as u32);
                let reply = Reply {
                    origin: data.fresh.origin,
                    expires: data.fresh.expires,
                    age: age as u16,
                    body: &data.raw,
                };
                let Ok(encoded) = reply.encode(&mut packet) else {
                    warn!("Held data does not fit a packet");
                    return;
                };

                let window = data.fresh.expires.saturating_sub(data.fresh.origin);
                let next = Duration::from_millis(window as u64 * 125)
                    .max(Duration::from_secs(120));

                (encoded.to_vec(), next)
            }
            // Expired in the meantime
            (None, None) => return,
        };

        debug!("Sending reply on {}", self.interfaces[i].name);

        let target = SocketAddrV6::new(self.opts.group, self.opts.port, 0, index);
        self.send(target, &data).await;

        schedule(&mut self.interfaces[i].reply_time, &mut self.rng, next, true);
    }

    async fn send_query(&mut self, i: usize) {
        cancel(&mut self.interfaces[i].query_time);

        let index = self.interfaces[i].index;
        if index == 0 {
            return;
        }

        if self.authority.is_some() {
            return;
        }

        let mut packet = [0; 16];
        let data = Packet::encode_query(&mut packet)
            .expect("query fits")
            .to_vec();

        debug!("Sending query on {}", self.interfaces[i].name);

        let target = SocketAddrV6::new(self.opts.group, self.opts.port, 0, index);
        self.send(target, &data).await;

        let next = if self.data.is_some() {
            client::CONFIGURED_QUERY_INTERVAL
        } else {
            self.backoff.advance()
        };

        schedule(&mut self.interfaces[i].query_time, &mut self.rng, next, true);
    }

    async fn send_stateful_request(&mut self) {
        cancel(&mut self.stateful_request_time);

        let Some(stateful) = self.stateful.as_mut() else {
            debug!("Stateful request timer with no servers");
            return;
        };

        let target = stateful.server();
        let suggested = stateful.lease();
        let delay = stateful.on_request_sent();

        let mut body = [0; 8];
        let mut packet = [0; 64];

        let len = config::encode_stateful_body(suggested, &mut body)
            .expect("stateful body fits");
        let request = Stateful {
            opcode: Opcode::StatefulRequest,
            lease_time: 1800,
            unique_id: &self.opts.unique_id,
            body: &body[..len],
        };
        let data = request.encode(&mut packet).expect("request fits").to_vec();

        debug!("Sending stateful request to {target}");

        self.send(SocketAddrV6::new(target, self.opts.port, 0, 0), &data)
            .await;

        schedule(&mut self.stateful_request_time, &mut self.rng, delay, true);
    }

    fn expire_stateful(&mut self) {
        cancel(&mut self.stateful_expire_time);

        info!("Stateful data expired");

        let Some(stateful) = self.stateful.as_mut() else {
            return;
        };

        let delay = stateful.on_expired();

        if let Some(ipv4) = self.installed_ipv4.take() {
            let config = self.active_config().cloned().unwrap_or_default();
            if let Err(err) = self.configurator.run(Action::StopIpv4, &config, Some(ipv4)) {
                warn!("Couldn't withdraw {ipv4}: {err}");
            }
        }

        schedule(&mut self.stateful_request_time, &mut self.rng, delay, true);
    }

    async fn send(&mut self, target: SocketAddrV6, data: &[u8]) {
        if let Err(err) = self.socket.send(SocketAddr::V6(target), data).await {
            if err.raw_os_error() == Some(libc::ENETUNREACH) {
                schedule(
                    &mut self.check_networks_time,
                    &mut self.rng,
                    Duration::from_millis(0),
                    false,
                );
            }

            warn!("Send to {target}: {err}");
        }
    }
}

/// Arms a timer slot `delay` from now, jittered into `[d/2, 3d/2)`.
/// Without `override_`, an already-armed earlier firing time is kept.
fn schedule(
    slot: &mut Option<Instant>,
    rng: &mut impl RngCore,
    delay: Duration,
    override_: bool,
) {
    let ms = delay.as_millis();
    let jittered = if ms == 0 { 0 } else { ms / 2 + rng.next_u64() % ms };
    let target = Instant::now() + Duration::from_millis(jittered);

    if override_ || slot.map_or(true, |armed| armed > target) {
        *slot = Some(target);
    }
}

fn cancel(slot: &mut Option<Instant>) {
    *slot = None;
}

fn due(slot: Option<Instant>, now: Instant) -> bool {
    slot.map_or(false, |armed| armed <= now)
}

fn link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

fn sooner(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
