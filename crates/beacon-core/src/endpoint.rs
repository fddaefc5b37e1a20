//! Transport endpoint URLs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing an endpoint URL.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// No `scheme://` prefix.
    #[error("endpoint `{0}` has no scheme")]
    MissingScheme(String),
    /// The scheme is not one beacon can connect with.
    #[error("endpoint `{url}` uses unsupported scheme `{scheme}`")]
    UnsupportedScheme {
        /// The rejected URL.
        url: String,
        /// The scheme that was found.
        scheme: String,
    },
    /// Nothing after `scheme://`.
    #[error("endpoint `{0}` has no host")]
    MissingHost(String),
}

/// Supported endpoint schemes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
    /// In-process broker.
    Memory,
}

impl Scheme {
    /// The scheme as written in URLs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
            Self::Memory => "memory",
        }
    }
}

/// A validated broadcast transport URL, the identity of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    url: String,
    scheme: Scheme,
}

impl Endpoint {
    /// Parse and validate an endpoint URL.
    pub fn parse(url: &str) -> Result<Self, EndpointError> {
        let url = url.trim();
        let Some((scheme, rest)) = url.split_once("://") else {
            return Err(EndpointError::MissingScheme(url.to_owned()));
        };
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            "memory" => Scheme::Memory,
            other => {
                return Err(EndpointError::UnsupportedScheme {
                    url: url.to_owned(),
                    scheme: other.to_owned(),
                });
            }
        };
        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if host.is_empty() {
            return Err(EndpointError::MissingHost(url.to_owned()));
        }
        Ok(Self {
            url: url.to_owned(),
            scheme,
        })
    }

    /// The full URL.
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// The URL scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// `host[:port]` portion of the URL.
    pub fn authority(&self) -> &str {
        let rest = self.url.split_once("://").map_or("", |(_, rest)| rest);
        rest.split(['/', '?', '#']).next().unwrap_or_default()
    }

    /// Whether the connection is encrypted.
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Wss
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.url
    }
}
