//! Partition key derivation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Header carrying the caller's API credential.
pub const API_KEY_HEADER: &str = "X-API-Key";
/// Header carrying the caller's username. Informational, never validated.
pub const USERNAME_HEADER: &str = "X-Username";

const KEY_PREFIX: &str = "rate";
const CREDENTIAL_SEGMENT: &str = "key";
const UNKNOWN_PEER: &str = "unknown";

/// Failure to derive a partition key from a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The credential header is absent or empty
    #[error("missing API key: {header} header is required")]
    MissingCredential { header: &'static str },
}

/// The identity-bearing attributes of one inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestIdentity<'a> {
    /// Caller network address
    pub peer: Option<IpAddr>,
    /// Value of the credential header
    pub api_key: Option<&'a str>,
    /// Value of the username header
    pub username: Option<&'a str>,
    /// HTTP method, upper case
    pub method: &'a str,
    /// Route template the request matched (e.g. `/api/v1/uploads/:id`)
    pub route: &'a str,
}

impl<'a> RequestIdentity<'a> {
    /// Identity carrying only a network address.
    pub fn from_peer(peer: IpAddr) -> Self {
        Self {
            peer: Some(peer),
            api_key: None,
            username: None,
            method: "GET",
            route: "/",
        }
    }
}

/// The string that scopes one rate-limit counter.
///
/// Caller-supplied components are escaped before being joined with `:`, so
/// distinct inputs can never produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey(String);

impl PartitionKey {
    fn builder(segment: &str) -> KeyBuilder {
        let mut key = String::with_capacity(64);
        key.push_str(KEY_PREFIX);
        key.push(':');
        key.push_str(segment);
        KeyBuilder(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct KeyBuilder(String);

impl KeyBuilder {
    fn push(mut self, component: &str) -> Self {
        self.0.push(':');
        for c in component.chars() {
            match c {
                '%' => self.0.push_str("%25"),
                ':' => self.0.push_str("%3A"),
                c => self.0.push(c),
            }
        }
        self
    }

    fn finish(self) -> PartitionKey {
        PartitionKey(self.0)
    }
}

/// How a route group maps requests to partition keys.
///
/// Chosen once per route group at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// `rate:<ip>`. Always succeeds.
    NetworkAddress,
    /// `rate:key:<api key>:<username>:<method>:<route>`. Requires the
    /// credential header. Including the method and route keeps one
    /// exhausted endpoint from starving the caller's other endpoints.
    Credential,
}

impl KeyStrategy {
    /// Derive the partition key for `identity`. Pure.
    pub fn derive(&self, identity: &RequestIdentity<'_>) -> Result<PartitionKey, KeyError> {
        match self {
            KeyStrategy::NetworkAddress => Ok(network_address_key(identity)),
            KeyStrategy::Credential => credential_key(identity),
        }
    }
}

fn network_address_key(identity: &RequestIdentity<'_>) -> PartitionKey {
    match identity.peer {
        Some(ip) => PartitionKey(format!("{}:{}", KEY_PREFIX, ip)),
        None => PartitionKey(format!("{}:{}", KEY_PREFIX, UNKNOWN_PEER)),
    }
}

fn credential_key(identity: &RequestIdentity<'_>) -> Result<PartitionKey, KeyError> {
    let api_key = identity
        .api_key
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(KeyError::MissingCredential {
            header: API_KEY_HEADER,
        })?;

    Ok(PartitionKey::builder(CREDENTIAL_SEGMENT)
        .push(api_key)
        .push(identity.username.unwrap_or_default())
        .push(identity.method)
        .push(identity.route)
        .finish())
}
