//! Runtime configuration assembled from CLI flags and environment.

use std::time::Duration;

use url::Url;

use crate::cli::Cli;
use crate::session::{SessionError, SessionTunables};

#[derive(Debug, Clone)]
pub struct Config {
    pub directory_server: String,
    pub relay_server: String,
    pub auth_token: Option<String>,
    pub security_mode: String,
    pub heartbeat_interval: Option<Duration>,
    pub poll_interval: Option<Duration>,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            directory_server: cli.directory_server.clone(),
            relay_server: cli.relay_server.clone(),
            auth_token: cli
                .auth_token
                .as_ref()
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            security_mode: cli.session.security_mode.clone(),
            heartbeat_interval: cli.session.heartbeat_ms.map(Duration::from_millis),
            poll_interval: cli.session.poll_ms.map(Duration::from_millis),
        }
    }

    /// Builds validated session tunables for a record with the given name.
    pub fn tunables(&self, record_name: &str) -> Result<SessionTunables, SessionError> {
        let mut tunables = SessionTunables {
            record_name: record_name.to_string(),
            security_mode: self.security_mode.clone(),
            ..SessionTunables::default()
        };
        if let Some(interval) = self.heartbeat_interval {
            tunables.heartbeat_interval = interval;
        }
        if let Some(interval) = self.poll_interval {
            tunables.poll_interval = interval;
        }
        tunables.validate()?;
        Ok(tunables)
    }
}

/// Normalizes a service base URL: trims, infers a scheme for bare hosts and
/// guarantees a trailing slash so endpoint joins append instead of replace.
pub(crate) fn service_base_url(raw: &str) -> Result<Url, String> {
    let mut base = raw.trim().to_string();
    if base.is_empty() {
        return Err("base url cannot be empty".into());
    }
    if !base.contains("://") {
        let scheme = infer_scheme(&base);
        base = format!("{scheme}{base}");
    }
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|err| format!("invalid url: {err}"))
}

fn infer_scheme(base: &str) -> &'static str {
    let authority = base.split('/').next().unwrap_or(base);
    // Bracketed IPv6 first so the port split cannot cut inside the address;
    // an unbracketed host with more than one colon is itself an address.
    let host_lower = if let Some(rest) = authority.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest).to_ascii_lowercase()
    } else if authority.matches(':').count() > 1 {
        authority.to_ascii_lowercase()
    } else {
        authority
            .split(':')
            .next()
            .unwrap_or(authority)
            .to_ascii_lowercase()
    };
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower == "::1"
        || host_lower.starts_with("127.")
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .is_some_and(|octet| (16..32).contains(&octet))
    {
        "http://"
    } else {
        "https://"
    }
}
