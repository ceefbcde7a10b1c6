//! Input validation and sanitization functions for natfwd
//!
//! Everything that ends up in an nft batch or in the rule file passes through
//! here first. Validators return `Err(String)` with a short human-readable
//! reason; callers wrap it in the field-specific error.

use std::net::Ipv4Addr;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Parses a decimal port number in 1..=65535.
///
/// Signs, whitespace and non-digit characters are rejected so the value can
/// be written back to the rule file verbatim.
pub fn parse_port(input: &str) -> Result<u16, String> {
    if input.is_empty() {
        return Err("Port is empty".to_string());
    }
    if !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("'{input}' is not a number"));
    }

    // Anything with more than 5 digits cannot fit; avoid overflow messages
    let value: u32 = if input.len() > 5 {
        u32::MAX
    } else {
        input.parse().map_err(|_| format!("'{input}' is not a number"))?
    };

    match u16::try_from(value) {
        Ok(port) => validate_port(port),
        Err(_) => Err(format!("{input} is out of range (1-65535)")),
    }
}

/// Parses a plain IPv4 dotted-quad address.
///
/// No CIDR suffix, no hostnames, no leading zeros (the std parser rejects
/// octal-looking octets).
pub fn parse_ipv4(input: &str) -> Result<Ipv4Addr, String> {
    if input.is_empty() {
        return Err("Address is empty".to_string());
    }
    if input.contains('/') {
        return Err("Expected a single address, not a network".to_string());
    }
    input
        .parse::<Ipv4Addr>()
        .map_err(|_| format!("'{input}' is not a valid IPv4 address"))
}

/// Checks a forwarding destination and returns an informational warning.
///
/// Informational only; the rule is still accepted.
pub fn check_destination(addr: Ipv4Addr) -> Option<String> {
    if addr.is_unspecified() {
        return Some("0.0.0.0 is not a routable destination".to_string());
    }
    if addr.is_loopback() {
        return Some(
            "Loopback destination - DNAT to 127.x needs route_localnet=1".to_string(),
        );
    }
    if addr.is_broadcast() || addr.is_multicast() {
        return Some("Broadcast/multicast destination will not receive forwarded traffic".to_string());
    }
    None
}

/// Validates an nftables table name.
///
/// nft identifiers start with a letter and continue with letters, digits,
/// underscores, dashes or dots. Max 64 chars keeps comments short.
pub fn validate_table_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Table name cannot be empty".to_string());
    }

    if name.len() > 64 {
        return Err("Table name too long (max 64 characters)".to_string());
    }

    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err("Table name must start with a letter".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err("Table name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}
