//! The bridge to the external configuration script: the daemon itself
//! never touches routes, addresses or resolver files. It hands the
//! decided configuration to the script as environment variables, with a
//! single positional action argument, and waits for it to finish.

use std::fmt::{self, Display};
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Command;

use log::debug;

use ahcp_proto::config::RoutingProtocol;
use ahcp_proto::Config;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Action {
    Start,
    Stop,
    StartIpv4,
    StopIpv4,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::StartIpv4 => "start-ipv4",
            Self::StopIpv4 => "stop-ipv4",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum ScriptError {
    Io(io::Error),
    /// The script ran and reported failure.
    Failed(i32),
    /// The script died on a signal.
    Killed,
}

impl Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "Couldn't run script: {err}"),
            Self::Failed(code) => write!(f, "Script returned error status {code}"),
            Self::Killed => write!(f, "Script died violently"),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<io::Error> for ScriptError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Invokes the configuration script synchronously. With no script
/// configured every action trivially succeeds, which keeps dry runs and
/// tests simple.
pub struct Configurator {
    pub script: Option<PathBuf>,
    pub interfaces: Vec<String>,
    pub debug_level: u8,
    pub no_dns: bool,
    pub no_routing: bool,
}

impl Configurator {
    pub fn run(
        &self,
        action: Action,
        config: &Config,
        ipv4: Option<Ipv4Addr>,
    ) -> Result<(), ScriptError> {
        let Some(script) = self.script.as_ref() else {
            return Ok(());
        };

        let mut command = Command::new(script);
        command.arg(action.as_str());

        command.env("AHCP_DAEMON_PID", std::process::id().to_string());
        command.env("AHCP_INTERFACES", self.interfaces.join(" "));
        command.env("AHCP_DEBUG_LEVEL", self.debug_level.to_string());

        match config.routing_protocol.as_ref() {
            Some(RoutingProtocol::Static { gateways }) => {
                command.env("AHCP_ROUTING_PROTOCOL", "static");
                if !gateways.is_empty() {
                    command.env("AHCP_STATIC_DEFAULT_GATEWAY", join(gateways.iter()));
                }
            }
            Some(RoutingProtocol::Olsr {
                multicast,
                link_quality,
            }) => {
                command.env("AHCP_ROUTING_PROTOCOL", "OLSR");
                command.env("AHCP_OLSR_MULTICAST_ADDRESS", multicast.to_string());
                if let Some(lq) = link_quality {
                    command.env("AHCP_OLSR_LINK_QUALITY", lq.to_string());
                }
            }
            Some(RoutingProtocol::Babel {
                multicast,
                port,
                hello_interval,
            }) => {
                command.env("AHCP_ROUTING_PROTOCOL", "Babel");
                command.env("AHCP_BABEL_MULTICAST_ADDRESS", multicast.to_string());
                if let Some(port) = port {
                    command.env("AHCP_BABEL_PORT_NUMBER", port.to_string());
                }
                if let Some(hello) = hello_interval {
                    command.env("AHCP_BABEL_HELLO_INTERVAL", hello.to_string());
                }
            }
            Some(RoutingProtocol::Unknown(_)) | None => {}
        }

        if let Some(prefixes) = config.ipv6_prefix.as_ref() {
            command.env("AHCP_IPv6_PREFIX", join(prefixes.iter()));
        }
        if let Some(addresses) = config.ipv6_address.as_ref() {
            command.env("AHCP_IPv6_ADDRESS", join(addresses.iter()));
        }
        if let Some(prefixes) = config.ipv6_prefix_delegation.as_ref() {
            command.env("AHCP_IPv6_PREFIX_DELEGATION", join(prefixes.iter()));
        }
        if let Some(prefixes) = config.ipv4_prefix_delegation.as_ref() {
            command.env("AHCP_IPv4_PREFIX_DELEGATION", join(prefixes.iter()));
        }
        if !self.no_dns {
            if let Some(servers) = config.name_server.as_ref() {
                command.env("AHCP_NAMESERVER", join(servers.iter()));
            }
        }
        if let Some(servers) = config.ntp_server.as_ref() {
            command.env("AHCP_NTP_SERVER", join(servers.iter()));
        }
        if let Some(ipv4) = ipv4 {
            command.env("AHCP_IPv4_ADDRESS", ipv4.to_string());
        }
        if self.no_routing {
            command.env("AHCP_DONT_START_ROUTING_PROTOCOL", "true");
        }

        debug!("Running `{} {}`", script.display(), action);

        let status = command.status()?;

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(ScriptError::Failed(code)),
            None => Err(ScriptError::Killed),
        }
    }
}

fn join<T: Display>(items: impl Iterator<Item = T>) -> String {
    let mut out = String::new();

    for item in items {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&item.to_string());
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;
    use std::net::Ipv6Addr;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use ahcp_proto::config::Ipv6Prefix;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("configurator.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        path
    }

    #[test]
    fn environment_and_action_reach_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let script = write_script(
            dir.path(),
            &format!(
                "echo \"$1 $AHCP_INTERFACES $AHCP_ROUTING_PROTOCOL \
                 $AHCP_IPv6_PREFIX $AHCP_NAMESERVER $AHCP_BABEL_PORT_NUMBER\" > {}",
                out.display()
            ),
        );

        let configurator = Configurator {
            script: Some(script),
            interfaces: vec!["eth0".into(), "wlan0".into()],
            debug_level: 1,
            no_dns: false,
            no_routing: false,
        };

        let config = Config {
            expires: Some(3600),
            ipv6_prefix: Some(
                [Ipv6Prefix {
                    addr: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0),
                    plen: 64,
                }]
                .into_iter()
                .collect(),
            ),
            name_server: Some(
                [Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x53)]
                    .into_iter()
                    .collect(),
            ),
            routing_protocol: Some(RoutingProtocol::Babel {
                multicast: Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 6),
                port: Some(6696),
                hello_interval: None,
            }),
            ..Default::default()
        };

        configurator.run(Action::Start, &config, None).unwrap();

        let logged = fs::read_to_string(&out).unwrap();
        assert_eq!(
            logged.trim(),
            "start eth0 wlan0 Babel fd00::/64 fd00::53 6696"
        );
    }

    #[test]
    fn dns_publication_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let script = write_script(
            dir.path(),
            &format!("echo \"ns=$AHCP_NAMESERVER\" > {}", out.display()),
        );

        let configurator = Configurator {
            script: Some(script),
            interfaces: vec!["eth0".into()],
            debug_level: 0,
            no_dns: true,
            no_routing: false,
        };

        let config = Config {
            name_server: Some(
                [Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x53)]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };

        configurator.run(Action::Start, &config, None).unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "ns=");
    }

    #[test]
    fn ipv4_actions_carry_the_address() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let script = write_script(
            dir.path(),
            &format!("echo \"$1 $AHCP_IPv4_ADDRESS\" > {}", out.display()),
        );

        let configurator = Configurator {
            script: Some(script),
            interfaces: vec!["eth0".into()],
            debug_level: 0,
            no_dns: false,
            no_routing: false,
        };

        configurator
            .run(
                Action::StartIpv4,
                &Config::default(),
                Some(Ipv4Addr::new(10, 0, 0, 9)),
            )
            .unwrap();

        assert_eq!(
            fs::read_to_string(&out).unwrap().trim(),
            "start-ipv4 10.0.0.9"
        );
    }

    #[test]
    fn failures_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 42");

        let configurator = Configurator {
            script: Some(script),
            interfaces: vec![],
            debug_level: 0,
            no_dns: false,
            no_routing: false,
        };

        assert!(matches!(
            configurator.run(Action::Stop, &Config::default(), None),
            Err(ScriptError::Failed(42))
        ));
    }

    #[test]
    fn no_script_means_success() {
        let configurator = Configurator {
            script: None,
            interfaces: vec![],
            debug_level: 0,
            no_dns: false,
            no_routing: false,
        };

        assert!(configurator
            .run(Action::Start, &Config::default(), None)
            .is_ok());
    }
}
