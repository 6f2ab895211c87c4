//! Core type definitions shared by the codec and the session engine.

use std::{fmt, time::Duration};

use crate::error::{TlcpError, TlcpResult};

/// Identifier correlating a request with its `REQOK`/`REQERR` reply.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Request id of the subscribe request for `id`.
    pub fn subscribe(id: SubscriptionId) -> Self {
        Self(format!("s{id}"))
    }

    /// Request id of the unsubscribe request for `id`.
    pub fn unsubscribe(id: SubscriptionId) -> Self {
        Self(format!("u{id}"))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Client-assigned subscription identifier, unique within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u32);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical server endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    /// Resolve a server-provided control link against this address.
    ///
    /// The link has the form `host[:port]`; a missing port defaults to the
    /// well-known port of this address' scheme.
    pub fn with_control_link(&self, link: &str) -> TlcpResult<Self> {
        let (host, port) = match link.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| TlcpError::decode(format!("Invalid control link: {link}")))?;
                (host, port)
            }
            None => (link, if self.secure { 443 } else { 80 }),
        };
        if host.is_empty() {
            return Err(TlcpError::decode(format!("Invalid control link: {link}")));
        }
        Ok(Self::new(host, port, self.secure))
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// User credential sent on session creation.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Time-to-live requested for a session that has no bound stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Ttl {
    /// Let the server decide.
    #[default]
    Unknown,
    Unlimited,
    Millis(u64),
}

impl Ttl {
    pub fn from_duration(duration: Duration) -> Self {
        Self::Millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Incremental update formats understood by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiffFormat {
    /// Positional copy/add/delete diff.
    TlcpDiff,
    /// RFC 6902 JSON patch.
    JsonPatch,
}

impl DiffFormat {
    /// Wire code used in update values and in `LS_supported_diffs`.
    pub fn code(self) -> char {
        match self {
            Self::TlcpDiff => 'T',
            Self::JsonPatch => 'P',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'T' => Some(Self::TlcpDiff),
            'P' => Some(Self::JsonPatch),
            _ => None,
        }
    }
}

/// Formats this client can decode and advertises on session creation.
pub const SUPPORTED_DIFFS: &[DiffFormat] = &[DiffFormat::TlcpDiff];

/// Subscription mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    Command,
    Distinct,
    Merge,
    Raw,
}

impl SubscriptionMode {
    /// Whether the server can deliver an initial snapshot in this mode.
    pub fn supports_snapshot(self) -> bool {
        !matches!(self, Self::Raw)
    }

    /// Whether the server marks the end of the snapshot in this mode.
    pub fn supports_end_of_snapshot(self) -> bool {
        matches!(self, Self::Command | Self::Distinct)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "COMMAND",
            Self::Distinct => "DISTINCT",
            Self::Merge => "MERGE",
            Self::Raw => "RAW",
        }
    }
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
