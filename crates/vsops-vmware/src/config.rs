//! Connection configuration.
//!
//! Built from the invocation's flat parameter map. Every connection key has
//! an environment fallback; explicit parameters win.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use vsops_core::{VsError, VsResult};

pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 3600;

/// Certificate verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Platform trust store plus hostname check.
    Verify,
    Insecure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProtocol {
    Http,
    #[default]
    Https,
}

impl ProxyProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

/// Everything needed to open a [`Session`](crate::session::Session).
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub tls: TlsPolicy,
    pub proxy: Option<ProxyConfig>,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
    /// Default deadline for awaited tasks.
    pub task_timeout: Duration,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("tls", &self.tls)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    /// Build from parameters, falling back to the process environment.
    pub fn from_params(params: &Map<String, Value>) -> VsResult<Self> {
        Self::from_params_with(params, |key| std::env::var(key).ok())
    }

    /// Build from parameters with an injectable environment lookup.
    pub fn from_params_with(
        params: &Map<String, Value>,
        env: impl Fn(&str) -> Option<String>,
    ) -> VsResult<Self> {
        let lookup = |key: &str, var: Option<&str>| -> Option<String> {
            param_string(params, key)
                .or_else(|| var.and_then(&env))
                .filter(|s| !s.is_empty())
        };
        let required = |key: &str, var: &str| -> VsResult<String> {
            lookup(key, Some(var)).ok_or_else(|| {
                VsError::config_missing(format!(
                    "missing required connection option '{key}' (or env {var})"
                ))
            })
        };

        let hostname = required("hostname", "VMWARE_HOST")?;
        let username = required("username", "VMWARE_USER")?;
        let password = SecretString::new(required("password", "VMWARE_PASSWORD")?);

        let port = match lookup("port", Some("VMWARE_PORT")) {
            Some(p) => parse_port("port", &p)?,
            None => DEFAULT_PORT,
        };
        let validate = match lookup("validate_certs", Some("VMWARE_VALIDATE_CERTS")) {
            Some(v) => parse_bool("validate_certs", &v)?,
            None => true,
        };

        let proxy = match lookup("proxy_host", Some("VMWARE_PROXY_HOST")) {
            Some(host) => {
                let port = lookup("proxy_port", Some("VMWARE_PROXY_PORT")).ok_or_else(|| {
                    VsError::config_missing(
                        "'proxy_port' (or env VMWARE_PROXY_PORT) is required with 'proxy_host'",
                    )
                })?;
                let protocol = match lookup("proxy_protocol", None).as_deref() {
                    None | Some("https") => ProxyProtocol::Https,
                    Some("http") => ProxyProtocol::Http,
                    Some(other) => {
                        return Err(VsError::protocol(format!(
                            "proxy_protocol must be 'http' or 'https', got '{other}'"
                        )))
                    }
                };
                Some(ProxyConfig {
                    host,
                    port: parse_port("proxy_port", &port)?,
                    protocol,
                })
            }
            None => None,
        };

        let secs = |key: &str, default: u64| -> VsResult<Duration> {
            match lookup(key, None) {
                Some(v) => v.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                    VsError::protocol(format!("'{key}' must be a whole number of seconds"))
                }),
                None => Ok(Duration::from_secs(default)),
            }
        };

        Ok(Self {
            hostname,
            port,
            username,
            password,
            tls: if validate {
                TlsPolicy::Verify
            } else {
                TlsPolicy::Insecure
            },
            proxy,
            timeout: secs("timeout", DEFAULT_TIMEOUT_SECS)?,
            task_timeout: secs("task_timeout", DEFAULT_TASK_TIMEOUT_SECS)?,
        })
    }

    /// `host:port`, plus ` [proxy: h:p]` when a proxy is configured. Used as
    /// the prefix of every transport error.
    pub fn endpoint_label(&self) -> String {
        match &self.proxy {
            Some(p) => format!("{}:{} [proxy: {}:{}]", self.hostname, self.port, p.host, p.port),
            None => format!("{}:{}", self.hostname, self.port),
        }
    }

    pub fn base_url(&self) -> String {
        if self.port == DEFAULT_PORT {
            format!("https://{}", self.hostname)
        } else {
            format!("https://{}:{}", self.hostname, self.port)
        }
    }

    /// A fresh copy of the password for a login body.
    pub fn password(&self) -> SecretString {
        SecretString::new(self.password.expose_secret().clone())
    }
}

/// Read a parameter as a string; numbers and bools are rendered.
pub fn param_string(params: &Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn parse_bool(key: &str, v: &str) -> VsResult<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        other => Err(VsError::protocol(format!(
            "'{key}' must be a boolean, got '{other}'"
        ))),
    }
}

fn parse_port(key: &str, v: &str) -> VsResult<u16> {
    v.trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| VsError::protocol(format!("'{key}' must be a TCP port, got '{v}'")))
}
