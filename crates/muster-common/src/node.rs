//! The `host:port` address model for cluster members

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One cluster member, identified by its network address.
///
/// A `Node` is only ever constructed by parsing a `host:port` string; the
/// port is kept as a string so the value round-trips byte-for-byte through
/// `Display`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: String,
}

impl Node {
    /// Parse a `host:port` address.
    ///
    /// The split happens at the last colon, so IPv6 hosts such as
    /// `[::1]:8080` keep their inner colons. Anything without a separable
    /// port fails with [`Error::InvalidAddress`].
    pub fn parse(address: &str) -> Result<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
        if host.is_empty() || port.is_empty() {
            return Err(Error::InvalidAddress(address.to_string()));
        }
        Ok(Node {
            host: host.to_string(),
            port: port.to_string(),
        })
    }
}

impl FromStr for Node {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Node::parse(s)
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_valid_address() {
        let node = Node::parse("10.0.0.1:2375").unwrap();
        assert_eq!(node.host, "10.0.0.1");
        assert_eq!(node.port, "2375");
    }

    #[test]
    fn test_parse_hostname_address() {
        let node = Node::parse("worker-1.internal:4243").unwrap();
        assert_eq!(node.host, "worker-1.internal");
        assert_eq!(node.port, "4243");
    }

    #[test]
    fn test_parse_splits_at_last_colon() {
        let node = Node::parse("[::1]:8080").unwrap();
        assert_eq!(node.host, "[::1]");
        assert_eq!(node.port, "8080");
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!(matches!(
            Node::parse("10.0.0.1"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(Node::parse(""), Err(Error::InvalidAddress(_))));
        assert!(matches!(
            Node::parse("10.0.0.1:"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(Node::parse(":2375"), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_parse_rejects_structured_garbage() {
        // A JSON blob or URI without a separable port must not slip through.
        assert!(Node::parse(r#"{"host": "10.0.0.1"}"#).is_err());
        assert!(Node::parse("http://example.com/").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for addr in ["1.1.1.1:1111", "example.com:80", "[fe80::1]:2375"] {
            let node = Node::parse(addr).unwrap();
            assert_eq!(node.to_string(), addr);
        }
    }

    #[test]
    fn test_from_str() {
        let node: Node = "2.2.2.2:2222".parse().unwrap();
        assert_eq!(node.port, "2222");
    }

    proptest! {
        #[test]
        fn prop_parse_format_round_trip(
            host in "[a-z0-9.-]{1,32}",
            port in "[0-9]{1,5}",
        ) {
            let addr = format!("{}:{}", host, port);
            let node = Node::parse(&addr).unwrap();
            prop_assert_eq!(node.to_string(), addr);
        }

        #[test]
        fn prop_no_colon_never_parses(addr in "[a-z0-9./]{0,32}") {
            prop_assert!(Node::parse(&addr).is_err());
        }
    }
}
