//! Session configuration.
//!
//! Configuration is a small typed struct populated either directly or
//! through the string key/value surface of [`Config::insert`], which
//! mirrors the classic `zp_config_insert` keys.

use picozen_core::error::{ZError, ZResult};
use picozen_core::id::WhatAmI;
use picozen_core::locator::Locator;

/// Compile-time protocol tunables.
pub mod defaults {
    /// Default transport lease in milliseconds.
    pub const TRANSPORT_LEASE_MS: u64 = 10_000;
    /// A peer is lost after `lease * LEASE_EXPIRE_FACTOR` of silence;
    /// keep-alives are emitted every `lease / LEASE_EXPIRE_FACTOR`.
    pub const LEASE_EXPIRE_FACTOR: f64 = 3.5;
    /// Multicast Join advertisement interval in milliseconds.
    pub const JOIN_INTERVAL_MS: u64 = 2_500;
    /// Handshake socket timeout in milliseconds.
    pub const SOCKET_TIMEOUT_MS: u64 = 2_000;
    /// Default multicast scouting/advertisement locator.
    pub const MULTICAST_LOCATOR: &str = "udp/224.0.0.224:7447";
    /// Default scouting timeout in milliseconds.
    pub const SCOUTING_TIMEOUT_MS: u64 = 3_000;
    /// Default client-side query timeout in milliseconds.
    pub const QUERY_TIMEOUT_MS: u64 = 10_000;
    /// Upper bound on unicast peers of one session.
    pub const MAX_PEERS: usize = 16;
    /// Upper bound on links of one unicast transport.
    pub const MAX_LINKS: usize = 4;
}

/// String configuration keys accepted by [`Config::insert`].
pub mod keys {
    pub const MODE: &str = "mode";
    pub const CONNECT: &str = "connect";
    pub const LISTENER: &str = "listener";
    pub const USER: &str = "user";
    pub const PASSWORD: &str = "password";
    pub const MULTICAST_SCOUTING: &str = "multicast_scouting";
    pub const MULTICAST_INTERFACE: &str = "multicast_interface";
    pub const MULTICAST_ADDRESS: &str = "multicast_address";
    pub const SCOUTING_TIMEOUT_MS: &str = "scouting_timeout_ms";
    pub const ADD_TIMESTAMP: &str = "add_timestamp";
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local role. Router is not a supported local role.
    pub mode: WhatAmI,
    /// Locator of the router or peer to connect to.
    pub connect: Option<Locator>,
    /// Locator to listen on for incoming unicast links.
    pub listener: Option<Locator>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub multicast_scouting: bool,
    pub multicast_interface: Option<String>,
    /// Multicast group used for scouting and peer-to-peer traffic.
    pub multicast_address: Locator,
    pub scouting_timeout_ms: u64,
    /// Stamp outgoing publications with a local timestamp.
    pub add_timestamp: bool,

    /// Lease advertised to peers, in milliseconds.
    pub lease_ms: u64,
    /// Handshake timeout in milliseconds; zero disables the timeout.
    pub socket_timeout_ms: u64,
    /// Spawn background read/lease/scheduler tasks. When false the
    /// application drives the session cooperatively via
    /// `Session::read_once` and friends.
    pub background_tasks: bool,
    /// Poll interval of the background scheduler task, in milliseconds.
    pub scheduler_poll_ms: u64,
    /// Loop local publications back to local subscribers.
    pub local_subscriber: bool,
    /// Declare the admin-space queryable at open time.
    pub auto_start_admin_space: bool,
    /// Register connectivity listeners with history replay by default.
    pub connectivity_history: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: WhatAmI::Client,
            connect: None,
            listener: None,
            user: None,
            password: None,
            multicast_scouting: true,
            multicast_interface: None,
            multicast_address: Locator::parse(defaults::MULTICAST_LOCATOR)
                .expect("default multicast locator parses"),
            scouting_timeout_ms: defaults::SCOUTING_TIMEOUT_MS,
            add_timestamp: false,
            lease_ms: defaults::TRANSPORT_LEASE_MS,
            socket_timeout_ms: defaults::SOCKET_TIMEOUT_MS,
            background_tasks: true,
            scheduler_poll_ms: 100,
            local_subscriber: true,
            auto_start_admin_space: false,
            connectivity_history: false,
        }
    }
}

fn parse_bool(value: &str) -> ZResult<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ZError::Config(format!("expected bool, got {other:?}"))),
    }
}

impl Config {
    /// Set a configuration entry from its string key/value form.
    ///
    /// Unknown keys are refused, as are values that fail to parse.
    pub fn insert(&mut self, key: &str, value: &str) -> ZResult<()> {
        match key {
            keys::MODE => {
                self.mode = match value {
                    "client" => WhatAmI::Client,
                    "peer" => WhatAmI::Peer,
                    other => {
                        return Err(ZError::Config(format!("unsupported mode {other:?}")))
                    }
                };
            }
            keys::CONNECT => {
                self.connect = Some(
                    Locator::parse(value)
                        .map_err(|e| ZError::InvalidLocator(e.to_string()))?,
                );
            }
            keys::LISTENER => {
                self.listener = Some(
                    Locator::parse(value)
                        .map_err(|e| ZError::InvalidLocator(e.to_string()))?,
                );
            }
            keys::USER => self.user = Some(value.to_string()),
            keys::PASSWORD => self.password = Some(value.to_string()),
            keys::MULTICAST_SCOUTING => self.multicast_scouting = parse_bool(value)?,
            keys::MULTICAST_INTERFACE => {
                self.multicast_interface = Some(value.to_string());
            }
            keys::MULTICAST_ADDRESS => {
                self.multicast_address = Locator::parse(value)
                    .map_err(|e| ZError::InvalidLocator(e.to_string()))?;
            }
            keys::SCOUTING_TIMEOUT_MS => {
                self.scouting_timeout_ms = value
                    .parse()
                    .map_err(|_| ZError::ParseString(value.to_string()))?;
            }
            keys::ADD_TIMESTAMP => self.add_timestamp = parse_bool(value)?,
            other => return Err(ZError::Config(format!("unknown key {other:?}"))),
        }
        Ok(())
    }

    /// Interval between keep-alives for the configured lease.
    #[must_use]
    pub fn keep_alive_interval_ms(&self) -> u64 {
        ((self.lease_ms as f64) / defaults::LEASE_EXPIRE_FACTOR) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_surface_roundtrip() {
        let mut config = Config::default();
        config.insert(keys::MODE, "peer").unwrap();
        config.insert(keys::CONNECT, "tcp/127.0.0.1:7447").unwrap();
        config.insert(keys::MULTICAST_SCOUTING, "false").unwrap();
        config.insert(keys::SCOUTING_TIMEOUT_MS, "5000").unwrap();
        config.insert(keys::ADD_TIMESTAMP, "true").unwrap();

        assert_eq!(config.mode, WhatAmI::Peer);
        assert_eq!(config.connect.unwrap().to_string(), "tcp/127.0.0.1:7447");
        assert!(!config.multicast_scouting);
        assert_eq!(config.scouting_timeout_ms, 5000);
        assert!(config.add_timestamp);
    }

    #[test]
    fn router_mode_rejected() {
        let mut config = Config::default();
        assert!(config.insert(keys::MODE, "router").is_err());
    }

    #[test]
    fn bad_locator_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.insert(keys::CONNECT, "bogus"),
            Err(ZError::InvalidLocator(_))
        ));
    }

    #[test]
    fn unknown_key_rejected() {
        let mut config = Config::default();
        assert!(config.insert("no_such_key", "1").is_err());
    }

    #[test]
    fn keep_alive_interval_matches_factor() {
        let mut config = Config::default();
        config.lease_ms = 1000;
        // 1000 / 3.5 ~= 285 ms
        assert_eq!(config.keep_alive_interval_ms(), 285);
    }
}
