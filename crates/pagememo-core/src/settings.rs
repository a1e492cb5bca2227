//! User settings consumed by the sync coordinator
//!
//! Settings are persisted as a single JSON value in the `settings` table of
//! [`Storage`](crate::storage::Storage) and edited from the CLI.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::scope::UrlScope;
use crate::types::PeerId;

/// Default address of the rendezvous/relay server
pub const DEFAULT_RELAY_ADDRESS: &str = "127.0.0.1:7878";

/// Which link implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct peer sockets negotiated through the rendezvous
    Direct,
    /// All traffic forwarded through the relay server
    #[default]
    Relay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Relay => write!(f, "relay"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(TransportKind::Direct),
            "relay" => Ok(TransportKind::Relay),
            other => Err(format!("unknown transport '{}', expected direct or relay", other)),
        }
    }
}

/// Sharing configuration for one installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Whether annotations are shared with peers at all
    pub sharing_enabled: bool,
    /// Rendezvous/relay server address (`host:port`)
    pub relay_address: String,
    /// Peers this installation wants to be linked with
    #[serde(default)]
    pub desired_peers: BTreeSet<PeerId>,
    /// Drop query strings when computing a page's scope key
    #[serde(default)]
    pub strip_query_string: bool,
    /// Link implementation
    #[serde(default)]
    pub transport: TransportKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sharing_enabled: false,
            relay_address: DEFAULT_RELAY_ADDRESS.to_string(),
            desired_peers: BTreeSet::new(),
            strip_query_string: false,
            transport: TransportKind::default(),
        }
    }
}

impl Settings {
    /// The URL scope rule these settings imply
    pub fn scope(&self) -> UrlScope {
        UrlScope::new(self.strip_query_string)
    }

    /// Builder-style: enable sharing with the given peers
    pub fn sharing_with<I, P>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PeerId>,
    {
        self.sharing_enabled = true;
        self.desired_peers = peers.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style: set the relay address
    pub fn with_relay(mut self, address: impl Into<String>) -> Self {
        self.relay_address = address.into();
        self
    }

    /// Builder-style: set the transport kind
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// True when a change from `self` to `next` requires a new transport
    pub fn transport_changed(&self, next: &Settings) -> bool {
        self.relay_address != next.relay_address || self.transport != next.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(!settings.sharing_enabled);
        assert_eq!(settings.relay_address, DEFAULT_RELAY_ADDRESS);
        assert!(settings.desired_peers.is_empty());
        assert_eq!(settings.transport, TransportKind::Relay);
    }

    #[test]
    fn test_json_uses_camel_case_and_tolerates_missing_fields() {
        let settings: Settings =
            serde_json::from_str(r#"{"sharingEnabled":true,"relayAddress":"h:1"}"#).unwrap();
        assert!(settings.sharing_enabled);
        assert!(!settings.strip_query_string);
        assert_eq!(settings.transport, TransportKind::Relay);

        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("desiredPeers"));
        assert!(json.contains("stripQueryString"));
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("Direct".parse::<TransportKind>(), Ok(TransportKind::Direct));
        assert_eq!("relay".parse::<TransportKind>(), Ok(TransportKind::Relay));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_transport_changed() {
        let a = Settings::default();
        let b = a.clone().sharing_with(["memo-bbb"]);
        assert!(!a.transport_changed(&b));
        assert!(a.transport_changed(&b.clone().with_relay("other:1")));
        assert!(a.transport_changed(&b.with_transport(TransportKind::Direct)));
    }
}
