//! Handshake field encoding: filenames and offer addresses.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use super::error::{DccError, Result};

/// Everything but the RFC 3986 unreserved characters is escaped.
const FILENAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Encode a description for the wire. Backslashes are dropped first.
pub fn url_encode(s: &str) -> String {
    let stripped: String = s.chars().filter(|&c| c != '\\').collect();
    utf8_percent_encode(&stripped, FILENAME).to_string()
}

/// Decode a wire description. Leading dots become underscores so a peer
/// cannot plant a hidden file.
pub fn url_decode(s: &str) -> String {
    let decoded = percent_decode_str(s).decode_utf8_lossy();
    mangle_leading_dots(&decoded)
}

fn mangle_leading_dots(s: &str) -> String {
    let dots = s.bytes().take_while(|&b| b == b'.').count();
    let mut out = "_".repeat(dots);
    out.push_str(&s[dots..]);
    out
}

/// Strip directory components and neutralise a leading dot.
pub fn normalize_description(s: &str) -> String {
    let last = s.rsplit('/').next().unwrap_or(s);
    match last.strip_prefix('.') {
        Some(rest) => format!("_{rest}"),
        None => last.to_string(),
    }
}

/// Parse the host and port fields of an offer.
///
/// The host is a decimal 32-bit IPv4 address, or any textual IPv4/IPv6 form.
pub fn parse_offer_addr(host: &str, port: &str) -> Result<SocketAddr> {
    let mangled = || DccError::Address(format!("{host} {port}"));
    let ip = if let Ok(n) = host.parse::<u32>() {
        IpAddr::V4(Ipv4Addr::from(n))
    } else {
        host.parse::<IpAddr>().map_err(|_| mangled())?
    };
    let port: u16 = port.parse().map_err(|_| mangled())?;
    Ok(SocketAddr::new(ip, port))
}

/// Host field for an outbound offer.
pub fn format_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => u32::from(v4).to_string(),
        IpAddr::V6(v6) => v6.to_string(),
    }
}
