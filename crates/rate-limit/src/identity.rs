//! Identities name the subject a bucket limits.

use std::{fmt, net::IpAddr, sync::Arc};

use config::{BucketConfig, IdentityConfig};
use http::{HeaderName, request::Parts};

use crate::error::{IdentityError, RateLimitError};

/// The limited subject within one bucket, e.g. a user id or an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// A string key.
    Str(String),
    /// A numeric key.
    Num(i64),
    /// A structured key made of several parts.
    Composite(Vec<Identity>),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Str(value) => f.write_str(value),
            Identity::Num(value) => write!(f, "{value}"),
            Identity::Composite(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }

                    write!(f, "{part}")?;
                }

                Ok(())
            }
        }
    }
}

impl Identity {
    /// The identity as it appears in storage keys.
    ///
    /// Parts are separated by `:`, so `:` and `\` inside a string are escaped with a backslash.
    /// Nested composites are flattened into their parent.
    pub fn storage_key(&self) -> String {
        match self {
            Identity::Str(value) => escape(value),
            Identity::Num(value) => value.to_string(),
            Identity::Composite(parts) => parts.iter().map(Identity::storage_key).collect::<Vec<_>>().join(":"),
        }
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for c in value.chars() {
        if matches!(c, ':' | '\\') {
            escaped.push('\\');
        }

        escaped.push(c);
    }

    escaped
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Identity::Str(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Identity::Str(value)
    }
}

impl From<i64> for Identity {
    fn from(value: i64) -> Self {
        Identity::Num(value)
    }
}

impl From<IpAddr> for Identity {
    fn from(value: IpAddr) -> Self {
        Identity::Str(value.to_string())
    }
}

/// The client address, inserted into the request extensions by the host server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Computes the identity of a request for one bucket.
///
/// Implemented for every `Fn(&Parts) -> Result<Identity, IdentityError>`.
pub trait Identifier: Send + Sync {
    /// Computes the identity.
    fn identify(&self, parts: &Parts) -> Result<Identity, IdentityError>;
}

impl<F> Identifier for F
where
    F: Fn(&Parts) -> Result<Identity, IdentityError> + Send + Sync,
{
    fn identify(&self, parts: &Parts) -> Result<Identity, IdentityError> {
        self(parts)
    }
}

struct Global;

impl Identifier for Global {
    fn identify(&self, _: &Parts) -> Result<Identity, IdentityError> {
        Ok(Identity::from("global"))
    }
}

struct ClientAddress;

impl Identifier for ClientAddress {
    fn identify(&self, parts: &Parts) -> Result<Identity, IdentityError> {
        parts
            .extensions
            .get::<ClientIp>()
            .map(|ClientIp(ip)| Identity::from(*ip))
            .ok_or(IdentityError::MissingClientIp)
    }
}

struct Header(HeaderName);

impl Identifier for Header {
    fn identify(&self, parts: &Parts) -> Result<Identity, IdentityError> {
        let value = parts
            .headers
            .get(&self.0)
            .ok_or_else(|| IdentityError::MissingHeader(self.0.to_string()))?;

        let value = value
            .to_str()
            .map_err(|_| IdentityError::InvalidHeader(self.0.to_string()))?;

        Ok(Identity::from(value))
    }
}

/// Builds the identifier configured for a bucket.
pub(crate) fn from_config(bucket: &BucketConfig) -> Result<Arc<dyn Identifier>, RateLimitError> {
    match &bucket.identity {
        IdentityConfig::Global => Ok(Arc::new(Global)),
        IdentityConfig::ClientIp => Ok(Arc::new(ClientAddress)),
        IdentityConfig::Header { name } => {
            let name = HeaderName::try_from(name.as_str()).map_err(|e| RateLimitError::InvalidBucket {
                name: bucket.name.clone(),
                reason: format!("invalid identity header '{name}': {e}"),
            })?;

            Ok(Arc::new(Header(name)))
        }
    }
}
