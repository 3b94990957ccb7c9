//! Outbound URL policy for the remote-image proxy.
//!
//! Every URL the server fetches on a client's behalf passes this gate.
//! Blocks requests to:
//! - non-HTTPS schemes
//! - localhost and loopback addresses (127.0.0.0/8, ::1)
//! - Private network ranges (10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, fc00::/7)
//! - Link-local addresses (169.254.0.0/16, fe80::/10)
//! - Cloud metadata endpoints (169.254.169.254)
//! - any hostname outside a short allow-list
//!
//! The allow-list is the primary defense; the address-range checks (applied
//! to literal IPs and to DNS resolutions of allow-listed names) close the
//! retargeting gap left by redirects and DNS rebinding. Recognized Google
//! Drive share links are rewritten into their direct-download form, keeping
//! only the opaque file identifier.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use url::{Host, Url};

static DRIVE_FILE_PATH: OnceLock<Regex> = OnceLock::new();

/// Matches the `/file/d/{id}` share-link path shape.
fn drive_file_path_re() -> &'static Regex {
    DRIVE_FILE_PATH.get_or_init(|| Regex::new(r"^/file/d/([^/]+)").expect("static regex is valid"))
}

/// Why an outbound URL was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid url: {0}")]
    Malformed(String),

    #[error("disallowed url scheme: {0}")]
    SchemeNotAllowed(String),

    #[error("url has no host")]
    HostMissing,

    #[error("host is not on the fetch allow-list: {0}")]
    HostNotAllowed(String),

    #[error("fetch target is a private or local address: {0}")]
    PrivateAddress(String),
}

/// Validate an outbound fetch URL and normalize known share links.
///
/// Checks run in order: URL syntax, scheme, public-address policy (literal
/// IPs and DNS resolutions), hostname allow-list. On success the returned
/// URL is the one to fetch, which for recognized share links differs from
/// the input.
pub fn validate_fetch_url(raw: &str, allowed_hosts: &[String]) -> Result<Url, PolicyError> {
    let parsed = Url::parse(raw).map_err(|e| PolicyError::Malformed(e.to_string()))?;
    let host = ensure_public_target(&parsed)?;

    if !allowed_hosts.iter().any(|allowed| *allowed == host) {
        return Err(PolicyError::HostNotAllowed(host));
    }

    Ok(rewrite_share_url(&parsed).unwrap_or(parsed))
}

/// Scheme and address checks without the allow-list, returning the host.
///
/// Also run against the final URL after redirects: a redirect may legally
/// hop between allow-listed CDN hosts, but it must never land on a private
/// or local address.
pub fn ensure_public_target(url: &Url) -> Result<String, PolicyError> {
    if url.scheme() != "https" {
        return Err(PolicyError::SchemeNotAllowed(url.scheme().to_string()));
    }

    match url.host() {
        None => Err(PolicyError::HostMissing),
        Some(Host::Ipv4(ip)) => {
            if is_private_or_local(&IpAddr::V4(ip)) {
                return Err(PolicyError::PrivateAddress(ip.to_string()));
            }
            Ok(ip.to_string())
        }
        Some(Host::Ipv6(ip)) => {
            if is_private_or_local(&IpAddr::V6(ip)) {
                return Err(PolicyError::PrivateAddress(ip.to_string()));
            }
            Ok(ip.to_string())
        }
        Some(Host::Domain(domain)) => {
            let domain = domain.to_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(PolicyError::PrivateAddress(domain));
            }
            // DNS resolution catches rebinding: an external-looking name
            // pointed at an internal address.
            if let Ok(addrs) = (domain.as_str(), 443u16).to_socket_addrs() {
                for addr in addrs {
                    if is_private_or_local(&addr.ip()) {
                        return Err(PolicyError::PrivateAddress(format!(
                            "{} resolves to {}",
                            domain,
                            addr.ip()
                        )));
                    }
                }
            }
            Ok(domain)
        }
    }
}

/// Check if an IP address is private, loopback, or otherwise non-public.
fn is_private_or_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(*v4),
        IpAddr::V6(v6) => is_private_v6(*v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        // Cloud metadata endpoint, already link-local but named for clarity
        || ip.octets() == [169, 254, 169, 254]
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    // IPv4-mapped addresses are judged by the embedded IPv4
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    // Unique local (fc00::/7) and link-local (fe80::/10)
    (ip.segments()[0] & 0xfe00) == 0xfc00 || (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Rewrite the two recognized Drive share-link shapes into the direct
/// download form, discarding everything but the file identifier:
/// `/file/d/{id}/...` and `/open?id={id}` both become
/// `https://drive.google.com/uc?export=download&id={id}`.
fn rewrite_share_url(url: &Url) -> Option<Url> {
    if url.host_str()? != "drive.google.com" {
        return None;
    }

    let id = if let Some(caps) = drive_file_path_re().captures(url.path()) {
        caps.get(1)?.as_str().to_string()
    } else if url.path() == "/open" {
        url.query_pairs()
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned())?
    } else {
        return None;
    };

    if id.is_empty() {
        return None;
    }

    let direct = format!(
        "https://drive.google.com/uc?export=download&id={}",
        urlencoding::encode(&id)
    );
    Url::parse(&direct).ok()
}
