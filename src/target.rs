//! Connection target descriptors.
//!
//! Accepts `postgres://` URLs, libpq `key=value` strings and ADO-style
//! `Server=...;Database=...` strings. Everything here is a pure function.

use crate::error::{DiagnosticError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

pub const DEFAULT_PORT: u16 = 5432;

const PROTOCOL_PREFIXES: &[&str] = &["tcp:", "np:", "lpc:", "admin:"];
const LOOPBACK_ALIASES: &[&str] = &[".", "(local)", "localhost", "127.0.0.1", "::1", "0:0:0:0:0:0:0:1"];

const HOST_KEYS: &[&str] = &["host", "hostaddr", "server", "data source", "address", "addr", "network address"];
const PORT_KEYS: &[&str] = &["port"];
const DATABASE_KEYS: &[&str] = &["dbname", "database", "initial catalog"];
const USER_KEYS: &[&str] = &["user", "username", "user id", "uid"];
const PASSWORD_KEYS: &[&str] = &["password", "pwd"];

/// Network host (and optional port) a target resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostEndpoint {
    pub host: String,
    pub port: Option<u16>,
}

impl HostEndpoint {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => write!(f, "{host}:{port}"),
            None => write!(f, "{host}"),
        }
    }
}

/// A parsed connection descriptor. The raw string is retained for hashing
/// and for handing to the driver, but never printed.
#[derive(Clone)]
pub struct ConnectionTarget {
    raw: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    password: Option<String>,
    /// Remaining options with lowercase keys.
    pub options: BTreeMap<String, String>,
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("options", &self.options)
            .finish()
    }
}

impl ConnectionTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DiagnosticError::invalid_input("target cannot be empty"));
        }

        if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
            Self::parse_url(trimmed)
        } else if trimmed.contains('=') {
            Self::parse_key_value(trimmed)
        } else {
            Ok(Self {
                raw: trimmed.to_string(),
                host: Some(trimmed.to_string()),
                port: None,
                database: None,
                username: None,
                password: None,
                options: BTreeMap::new(),
            })
        }
    }

    fn parse_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| DiagnosticError::invalid_input(format!("invalid target URL: {e}")))?;

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty());

        let username = Some(url.username().to_string()).filter(|u| !u.is_empty());
        let password = url.password().map(str::to_string);
        let database = Some(url.path().trim_start_matches('/').to_string()).filter(|d| !d.is_empty());

        let mut options: BTreeMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.to_lowercase(), v.into_owned()))
            .collect();

        // libpq allows `?host=/var/run/postgresql` for socket directories.
        let host = host.or_else(|| options.remove("host"));

        Ok(Self {
            raw: raw.to_string(),
            host,
            port: url.port(),
            database,
            username,
            password,
            options,
        })
    }

    fn parse_key_value(raw: &str) -> Result<Self> {
        let pairs: Vec<&str> = if raw.contains(';') {
            raw.split(';').collect()
        } else {
            raw.split_whitespace().collect()
        };

        let mut options = BTreeMap::new();
        for pair in pairs.into_iter().map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                DiagnosticError::invalid_input(format!("malformed target segment '{pair}'"))
            })?;
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return Err(DiagnosticError::invalid_input("target contains an empty key"));
            }
            let value = value.trim().trim_matches('\'').trim_matches('"').to_string();
            options.insert(key, value);
        }

        let take = |options: &mut BTreeMap<String, String>, keys: &[&str]| {
            keys.iter()
                .find_map(|k| options.remove(*k))
                .filter(|v| !v.is_empty())
        };

        let host = take(&mut options, HOST_KEYS);
        let port = match take(&mut options, PORT_KEYS) {
            Some(port) => Some(port.parse::<u16>().map_err(|_| {
                DiagnosticError::invalid_input(format!("invalid port '{port}'"))
            })?),
            None => None,
        };
        let database = take(&mut options, DATABASE_KEYS);
        let username = take(&mut options, USER_KEYS);
        let password = take(&mut options, PASSWORD_KEYS);

        Ok(Self {
            raw: raw.to_string(),
            host,
            port,
            database,
            username,
            password,
            options,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// SHA-256 of the raw descriptor, used to key baselines without storing credentials.
    pub fn target_hash(&self) -> String {
        hash_target(&self.raw)
    }

    /// `pooling=false` (any of false/no/0/off) disables pooling; enabled otherwise.
    pub fn pooling_enabled(&self) -> bool {
        match self.options.get("pooling") {
            Some(value) => !matches!(value.to_lowercase().as_str(), "false" | "no" | "0" | "off"),
            None => true,
        }
    }

    pub fn application_name(&self) -> Option<&str> {
        self.options
            .get("application_name")
            .or_else(|| self.options.get("application name"))
            .map(String::as_str)
    }

    /// Network endpoint for ping-style probes, `None` for socket paths or missing hosts.
    pub fn endpoint(&self) -> Option<HostEndpoint> {
        let host = self.host.as_deref()?;
        let mut endpoint = parse_host_endpoint(host)?;
        if endpoint.port.is_none() {
            endpoint.port = self.port;
        }
        Some(endpoint)
    }

    /// Redacted identifier safe for reports and logs.
    pub fn display_name(&self) -> String {
        let host = match self.endpoint() {
            Some(endpoint) => endpoint.to_string(),
            None => self.host.clone().unwrap_or_else(|| "localhost".to_string()),
        };
        match &self.database {
            Some(db) => format!("{host}/{db}"),
            None => host,
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

pub fn hash_target(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.trim().as_bytes()))
}

/// Extract host and optional port from a host expression, stripping protocol
/// prefixes, instance names and IPv6 brackets, and canonicalizing loopback.
pub fn parse_host_endpoint(input: &str) -> Option<HostEndpoint> {
    let mut rest = input.trim();
    if rest.is_empty() || rest.starts_with('/') || rest.starts_with('@') {
        return None;
    }

    for prefix in PROTOCOL_PREFIXES {
        if rest
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        {
            rest = &rest[prefix.len()..];
            break;
        }
    }

    // Named pipe form: \\host\pipe\...
    if let Some(pipe) = rest.strip_prefix("\\\\") {
        rest = pipe.split('\\').next().unwrap_or_default();
    }

    let mut port = None;

    if let Some((head, tail)) = rest.rsplit_once(',') {
        let tail = tail.trim();
        if let Ok(p) = tail.parse::<u16>() {
            port = Some(p);
            rest = head;
        } else {
            // libpq multi-host list: probe the first host.
            rest = rest.split(',').next().unwrap_or_default();
        }
    }

    let host = if let Some(bracketed) = rest.strip_prefix('[') {
        let (inner, after) = bracketed.split_once(']')?;
        if let Some(p) = after.strip_prefix(':').and_then(|p| p.parse::<u16>().ok()) {
            port = Some(p);
        }
        inner.to_string()
    } else if rest.matches(':').count() == 1 {
        let (head, tail) = rest.split_once(':')?;
        match tail.parse::<u16>() {
            Ok(p) => {
                port = Some(p);
                head.to_string()
            }
            Err(_) => head.to_string(),
        }
    } else {
        rest.to_string()
    };

    let host = host.split('\\').next().unwrap_or_default().trim().to_string();
    if host.is_empty() {
        return None;
    }

    Some(HostEndpoint::new(canonical_host(&host), port))
}

fn canonical_host(host: &str) -> String {
    let lower = host.to_lowercase();
    if LOOPBACK_ALIASES.contains(&lower.as_str()) {
        "localhost".to_string()
    } else {
        host.to_string()
    }
}
