//! Locator parsing for transport-agnostic link addressing.
//!
//! A locator names where a link driver should connect or listen:
//! `<protocol>/<address>[?<k=v>(&<k=v>)*][#<k=v>(&<k=v>)*]`.
//! Metadata (after `?`) is protocol-agnostic; config (after `#`) is
//! interpreted by the link driver owning the protocol.

use std::fmt;
use std::str::FromStr;

/// Link protocols a locator may name. The drivers themselves live outside
/// this crate; the core only routes on the protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Tls,
    Ws,
    Serial,
    Bt,
    RawEth,
}

impl Protocol {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Tls => "tls",
            Self::Ws => "ws",
            Self::Serial => "serial",
            Self::Bt => "bt",
            Self::RawEth => "raweth",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "tls" => Some(Self::Tls),
            "ws" => Some(Self::Ws),
            "serial" => Some(Self::Serial),
            "bt" => Some(Self::Bt),
            "raweth" => Some(Self::RawEth),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub protocol: Protocol,
    pub address: String,
    /// Protocol-agnostic `k=v` pairs from the `?` section.
    pub metadata: Vec<(String, String)>,
    /// Protocol-specific `k=v` pairs from the `#` section.
    pub config: Vec<(String, String)>,
}

impl Locator {
    /// Parse a locator from a string.
    ///
    /// Supported forms:
    /// - `tcp/127.0.0.1:7447`
    /// - `udp/224.0.0.224:7447?iface=lo`
    /// - `serial/ttyUSB0#baudrate=115200`
    pub fn parse(s: &str) -> Result<Self, LocatorError> {
        s.parse()
    }

    /// Look up a metadata value by key.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up a config value by key.
    #[must_use]
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_pairs(section: &str) -> Result<Vec<(String, String)>, LocatorError> {
    let mut out = Vec::new();
    for pair in section.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| LocatorError::InvalidPair(pair.to_string()))?;
        if k.is_empty() {
            return Err(LocatorError::InvalidPair(pair.to_string()));
        }
        out.push((k.to_string(), v.to_string()));
    }
    Ok(out)
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto_str, rest) = s
            .split_once('/')
            .ok_or_else(|| LocatorError::MissingProtocol(s.to_string()))?;
        let protocol = Protocol::parse(proto_str)
            .ok_or_else(|| LocatorError::UnknownProtocol(proto_str.to_string()))?;

        // Config comes last so metadata never contains '#'
        let (rest, config) = match rest.split_once('#') {
            Some((r, c)) => (r, parse_pairs(c)?),
            None => (rest, Vec::new()),
        };
        let (address, metadata) = match rest.split_once('?') {
            Some((a, m)) => (a, parse_pairs(m)?),
            None => (rest, Vec::new()),
        };

        if address.is_empty() {
            return Err(LocatorError::EmptyAddress(s.to_string()));
        }

        Ok(Self {
            protocol,
            address: address.to_string(),
            metadata,
            config,
        })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.address)?;
        for (i, (k, v)) in self.metadata.iter().enumerate() {
            write!(f, "{}{k}={v}", if i == 0 { '?' } else { '&' })?;
        }
        for (i, (k, v)) in self.config.iter().enumerate() {
            write!(f, "{}{k}={v}", if i == 0 { '#' } else { '&' })?;
        }
        Ok(())
    }
}

/// Errors that can occur when parsing a locator.
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    #[error("Locator has no protocol separator: {0}")]
    MissingProtocol(String),

    #[error("Unknown locator protocol: {0}")]
    UnknownProtocol(String),

    #[error("Locator address is empty: {0}")]
    EmptyAddress(String),

    #[error("Invalid k=v pair: {0}")]
    InvalidPair(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp() {
        let loc = Locator::parse("tcp/127.0.0.1:7447").unwrap();
        assert_eq!(loc.protocol, Protocol::Tcp);
        assert_eq!(loc.address, "127.0.0.1:7447");
        assert_eq!(loc.to_string(), "tcp/127.0.0.1:7447");
    }

    #[test]
    fn parse_with_metadata_and_config() {
        let loc = Locator::parse("udp/224.0.0.224:7447?iface=lo#ttl=1&join=true").unwrap();
        assert_eq!(loc.protocol, Protocol::Udp);
        assert_eq!(loc.metadata_value("iface"), Some("lo"));
        assert_eq!(loc.config_value("ttl"), Some("1"));
        assert_eq!(loc.config_value("join"), Some("true"));
        assert_eq!(
            loc.to_string(),
            "udp/224.0.0.224:7447?iface=lo#ttl=1&join=true"
        );
    }

    #[test]
    fn unknown_protocol_rejected() {
        assert!(matches!(
            Locator::parse("quic/127.0.0.1:7447"),
            Err(LocatorError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn missing_protocol_rejected() {
        assert!(matches!(
            Locator::parse("127.0.0.1:7447"),
            Err(LocatorError::MissingProtocol(_))
        ));
    }

    #[test]
    fn empty_address_rejected() {
        assert!(matches!(
            Locator::parse("tcp/"),
            Err(LocatorError::EmptyAddress(_))
        ));
    }

    #[test]
    fn malformed_pair_rejected() {
        assert!(matches!(
            Locator::parse("tcp/1.2.3.4:1?novalue"),
            Err(LocatorError::InvalidPair(_))
        ));
    }
}
