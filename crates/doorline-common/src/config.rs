//! Door configuration.
//!
//! The signaling endpoint is mandatory: a door without one cannot place a
//! call, so a missing or malformed value is reported as [`Error::Config`]
//! before anything is started.

use tracing::warn;
use url::{Host, Url};

use crate::error::{Error, Result};

pub const SIGNALING_URL_ENV: &str = "DOORLINE_SIGNALING_WS_URL";
pub const ICE_SERVERS_ENV: &str = "DOORLINE_ICE_SERVERS";
pub const ALLOW_INSECURE_CAPTURE_ENV: &str = "DOORLINE_ALLOW_INSECURE_CAPTURE";

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct DoorConfig {
    pub signaling_url: Url,
    pub ice_servers: Vec<String>,
    pub allow_insecure_capture: bool,
}

impl DoorConfig {
    /// Builds a config for `signaling_url` with default ICE servers.
    pub fn new(signaling_url: &str) -> Result<Self> {
        Ok(Self {
            signaling_url: parse_signaling_url(signaling_url)?,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            allow_insecure_capture: false,
        })
    }

    /// Replaces the ICE server list; an empty list keeps the default STUN server.
    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        if !servers.is_empty() {
            self.ice_servers = servers;
        }
        self
    }

    pub fn with_insecure_capture(mut self, allow: bool) -> Self {
        if allow && !is_secure_endpoint(&self.signaling_url) {
            warn!(
                "capture allowed over insecure signaling endpoint {}",
                self.signaling_url
            );
        }
        self.allow_insecure_capture = allow;
        self
    }

    /// Whether local capture may be opened under this configuration.
    pub fn secure_context(&self) -> bool {
        self.allow_insecure_capture || is_secure_endpoint(&self.signaling_url)
    }
}

fn parse_signaling_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::config(format!("{SIGNALING_URL_ENV} must not be empty")));
    }
    let url = Url::parse(trimmed)
        .map_err(|e| Error::config(format!("invalid signaling URL `{trimmed}`: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(Error::config(format!(
                "signaling URL must use ws:// or wss://, got {other}://"
            )))
        }
    }
    if url.host().is_none() {
        return Err(Error::config(format!("signaling URL `{trimmed}` has no host")));
    }
    Ok(url)
}

/// `wss://` anywhere, or plain `ws://` to a loopback host.
pub fn is_secure_endpoint(url: &Url) -> bool {
    if url.scheme() == "wss" {
        return true;
    }
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}
