//! Port-forwarding rule data structures
//!
//! A [`ForwardRule`] is one forwarding intent: traffic arriving on
//! `external_port` over `protocol` is rewritten to
//! `destination:destination_port`. Rules are plain values; two rules are equal
//! when all four fields are equal.
//!
//! # Wire Format
//!
//! The rule file stores one rule per line as four whitespace-separated
//! fields:
//!
//! ```text
//! tcp 8080 10.0.0.5 80
//! ```
//!
//! Validation guarantees no field contains whitespace, so the line form
//! round-trips without quoting.
//!
//! # Example
//!
//! ```
//! use natfwd::core::forward::{ForwardRule, Protocol};
//!
//! let rule = ForwardRule::parse("tcp", "8080", "10.0.0.5", "80").unwrap();
//! assert_eq!(rule.protocol, Protocol::Tcp);
//! assert_eq!(rule.to_string(), "tcp 8080 10.0.0.5 80");
//! assert_eq!("tcp 8080 10.0.0.5 80".parse::<ForwardRule>().unwrap(), rule);
//! ```

use crate::core::error::{Error, Result};
use crate::validators;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Maximum number of rules allowed in a single store
///
/// Each rule costs two nft invocations on reconciliation; far beyond this the
/// tool is the wrong vehicle anyway.
pub const MAX_RULES: usize = 1000;

/// Transport protocol a forwarding rule matches
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum Protocol {
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    /// Lowercase protocol name as used by nft payload expressions
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// Parses exactly "tcp" or "udp".
    ///
    /// Matching is exact; "TCP" or " tcp" are format errors so the rule file
    /// only ever contains the canonical spelling.
    pub fn parse(input: &str) -> Result<Self> {
        use strum::IntoEnumIterator;

        input.parse().map_err(|_| {
            let allowed: Vec<&str> = Self::iter().map(Self::as_str).collect();
            Error::format(
                "protocol",
                format!("'{input}' is not one of: {}", allowed.join(", ")),
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardRule {
    pub protocol: Protocol,
    /// Port on this host that receives inbound traffic
    pub external_port: u16,
    /// Address traffic is forwarded to
    pub destination: Ipv4Addr,
    /// Port on the destination host
    pub destination_port: u16,
}

impl ForwardRule {
    /// Builds a rule from already-typed fields.
    ///
    /// Ports are still range-checked since `u16` admits 0.
    pub fn new(
        protocol: Protocol,
        external_port: u16,
        destination: Ipv4Addr,
        destination_port: u16,
    ) -> Result<Self> {
        validators::validate_port(external_port)
            .map_err(|e| Error::format("external port", e))?;
        validators::validate_port(destination_port)
            .map_err(|e| Error::format("destination port", e))?;

        Ok(Self {
            protocol,
            external_port,
            destination,
            destination_port,
        })
    }

    /// Parses and validates the four user-supplied fields.
    ///
    /// Fails with [`Error::Format`] naming the first offending field.
    pub fn parse(protocol: &str, external_port: &str, host: &str, port: &str) -> Result<Self> {
        let protocol = Protocol::parse(protocol)?;
        let external_port = validators::parse_port(external_port)
            .map_err(|e| Error::format("external port", e))?;
        let destination =
            validators::parse_ipv4(host).map_err(|e| Error::format("destination host", e))?;
        let destination_port = validators::parse_port(port)
            .map_err(|e| Error::format("destination port", e))?;

        Self::new(protocol, external_port, destination, destination_port)
    }

    /// True when both rules claim the same inbound (protocol, port) pair
    pub fn conflicts_with(&self, other: &ForwardRule) -> bool {
        self.protocol == other.protocol && self.external_port == other.external_port
    }

    /// Comment attached to both nft directives of this rule.
    ///
    /// Used to find the directives again on removal, so it must be unique per
    /// rule and stable across runs.
    pub fn tag(&self) -> String {
        format!(
            "natfwd:{}:{}:{}:{}",
            self.protocol, self.external_port, self.destination, self.destination_port
        )
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.protocol, self.external_port, self.destination, self.destination_port
        )
    }
}

impl FromStr for ForwardRule {
    type Err = Error;

    /// Parses one rule-file line; surrounding whitespace is ignored.
    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [protocol, external_port, host, port] => {
                Self::parse(protocol, external_port, host, port)
            }
            _ => Err(Error::format(
                "rule line",
                format!("expected 4 fields, found {}", fields.len()),
            )),
        }
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    prop_compose! {
        fn arb_port()(port in 1u16..=65535) -> u16 {
            port
        }
    }

    prop_compose! {
        fn arb_rule()(
            protocol in prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp)],
            external_port in arb_port(),
            octets in any::<[u8; 4]>(),
            destination_port in arb_port(),
        ) -> ForwardRule {
            ForwardRule::new(protocol, external_port, Ipv4Addr::from(octets), destination_port)
                .unwrap()
        }
    }

    proptest! {
        #[test]
        fn test_line_roundtrip(rule in arb_rule()) {
            let line = rule.to_string();
            prop_assert_eq!(line.parse::<ForwardRule>().unwrap(), rule);
            prop_assert_eq!(line.split_whitespace().count(), 4);
        }

        #[test]
        fn test_parse_never_panics(
            a in "\\PC{0,12}",
            b in "\\PC{0,12}",
            c in "\\PC{0,20}",
            d in "\\PC{0,12}"
        ) {
            let _ = ForwardRule::parse(&a, &b, &c, &d);
        }
    }
}
