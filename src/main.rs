use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context};

use clap::Parser;

use log::warn;

use rand::rngs::OsRng;

use ahcp_proto::server::Authority;

use ahcp_lease::LeaseStore;

use ahcpd::clock::{self, clock_broken};
use ahcpd::engine::{self, Engine, Options, StoreAllocator, MAX_INTERFACES};
use ahcpd::persist;
use ahcpd::script::Configurator;
use ahcpd::signal::Signals;

/// Autoconfiguration daemon for IPv6 mesh and ad-hoc networks.
#[derive(Debug, Parser)]
#[command(name = "ahcpd", version)]
struct Args {
    /// Serve authoritative data from this file (a raw option body).
    #[arg(short = 'a', long = "authority")]
    authority: Option<PathBuf>,

    /// Protocol multicast group.
    #[arg(short = 'm', long = "multicast", default_value = "ff02::cca6:c0f9:e182:5359")]
    multicast: Ipv6Addr,

    /// Protocol UDP port.
    #[arg(short = 'p', long = "port", default_value_t = engine::PROTOCOL_PORT)]
    port: u16,

    /// Lifetime, in seconds, stamped on authoritative floods.
    #[arg(short = 'e', long = "expires", default_value_t = 3600)]
    expires: u32,

    /// Do not hand name servers to the configuration script.
    #[arg(short = 'N', long = "no-dns")]
    no_dns: bool,

    /// Never act as a stateful client, even when servers are announced.
    #[arg(short = 's', long = "no-stateful")]
    no_stateful: bool,

    /// Tell the configuration script not to start a routing protocol.
    #[arg(short = 'r', long = "no-routing")]
    no_routing: bool,

    /// Configuration script invoked to apply and withdraw state.
    #[arg(short = 'c', long = "script")]
    script: Option<PathBuf>,

    /// Debug level (0 quiet, 3 very verbose).
    #[arg(short = 'd', long = "debug", default_value_t = 1)]
    debug: u8,

    /// Where the persistent unique id lives.
    #[arg(
        short = 'i',
        long = "unique-id-file",
        default_value = "/var/lib/ahcpd-unique-id"
    )]
    unique_id_file: PathBuf,

    /// Serve stateful IPv4 leases: first address, last address, directory.
    #[arg(short = 'S', long = "lease", num_args = 3, value_names = ["FIRST", "LAST", "DIR"])]
    lease: Option<Vec<String>>,

    /// Detach from the terminal.
    #[arg(short = 'D', long = "daemonise")]
    daemonise: bool,

    /// Append logs to this file instead of the terminal.
    #[arg(short = 'L', long = "log-file")]
    log_file: Option<PathBuf>,

    /// Write the daemon's pid here, removed on exit.
    #[arg(short = 'I', long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Interfaces to monitor.
    #[arg(required = true)]
    interfaces: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();

    let filter = match args.debug {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, filter),
    );

    if args.interfaces.len() > MAX_INTERFACES {
        bail!("Too many interfaces");
    }

    if args.expires <= 30 {
        bail!("Expiry delta must exceed 30 seconds");
    }

    let authority = args
        .authority
        .as_deref()
        .map(|path| {
            let body = persist::load_authority_body(path)?;

            Authority::new(&body, args.expires).map_err(anyhow::Error::from)
        })
        .transpose()
        .context("Couldn't configure from authority data")?;

    let allocator = args
        .lease
        .as_deref()
        .map(|spec| {
            let now = clock::wall_now();
            if clock_broken(now) {
                bail!("Cannot run a stateful server with a broken clock");
            }

            let first: Ipv4Addr = spec[0].parse().context("Bad first address")?;
            let last: Ipv4Addr = spec[1].parse().context("Bad last address")?;
            let store = LeaseStore::open(&spec[2], first, last, now, rand::thread_rng())
                .context("Couldn't initialise lease database")?;

            Ok(StoreAllocator(store))
        })
        .transpose()?;

    if args.daemonise && args.log_file.is_none() {
        args.log_file = Some("/var/log/ahcpd.log".into());
    }

    if let Some(path) = args.log_file.as_deref() {
        persist::reopen_log_file(path).context("Couldn't open log file")?;
    }

    if args.daemonise {
        daemonise().context("Couldn't daemonise")?;
    }

    if let Some(path) = args.pid_file.as_deref() {
        persist::write_pid_file(path).context("Couldn't write pid file")?;
    }

    let now = clock::wall_now();
    if clock_broken(now) {
        warn!("Your clock is broken (now = {now})");
    }

    let unique_id = persist::load_unique_id(&args.unique_id_file, &mut OsRng);

    let result = run(&args, authority, allocator, unique_id);

    if let Some(path) = args.pid_file.as_deref() {
        persist::remove_pid_file(path);
    }

    result
}

fn run(
    args: &Args,
    authority: Option<Authority>,
    allocator: Option<StoreAllocator<rand::rngs::ThreadRng>>,
    unique_id: [u8; 16],
) -> anyhow::Result<()> {
    let socket = engine::bind(args.port).context("Couldn't bind protocol socket")?;
    let signals = Signals::new().context("Couldn't install signal handlers")?;

    let configurator = Configurator {
        script: args.script.clone(),
        interfaces: args.interfaces.clone(),
        debug_level: args.debug,
        no_dns: args.no_dns,
        no_routing: args.no_routing,
    };

    let options = Options {
        port: args.port,
        group: args.multicast,
        unique_id,
        no_stateful: args.no_stateful,
        log_file: args.log_file.clone(),
    };

    let mut engine = Engine::new(
        options,
        socket,
        signals,
        configurator,
        authority,
        allocator,
        args.interfaces.clone(),
        engine::if_nametoindex,
        rand::thread_rng(),
    );

    futures_lite::future::block_on(engine.run()).context("Daemon failed")
}

fn daemonise() -> io::Result<()> {
    // Must happen before any reactor or timer thread exists
    unsafe {
        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => process::exit(0),
        }

        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}
