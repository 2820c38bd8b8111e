use std::fmt;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::utils::error::ConnectionError;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_USERNAME: &str = "guest";
pub const DEFAULT_VHOST: &str = "/";

/// A parsed `ws://user:password@host:port/vhost` broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUri {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub vhost: String,
}

fn invalid(uri: &str, reason: impl Into<String>) -> ConnectionError {
    ConnectionError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.into(),
    }
}

fn decode(uri: &str, raw: &str) -> Result<String, ConnectionError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| invalid(uri, e.to_string()))
}

impl ConnectionUri {
    pub fn parse(raw: &str) -> Result<Self, ConnectionError> {
        let url = Url::parse(raw).map_err(|e| invalid(raw, e.to_string()))?;

        match url.scheme() {
            "ws" => {}
            "wss" => return Err(invalid(raw, "tls (wss) is not supported")),
            other => return Err(invalid(raw, format!("unsupported scheme `{other}`"))),
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid(raw, "missing host"))?
            .to_string();

        let username = match url.username() {
            "" => DEFAULT_USERNAME.to_string(),
            user => decode(raw, user)?,
        };
        let password = url.password().map(|p| decode(raw, p)).transpose()?;

        // `/` and `` both name the default vhost; `/%2F` spells it explicitly
        let path = url.path().strip_prefix('/').unwrap_or(url.path());
        let vhost = if path.is_empty() {
            DEFAULT_VHOST.to_string()
        } else {
            decode(raw, path)?
        };

        // `url` drops an explicit `:80` for ws, so it reads as unset here
        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username,
            password,
            vhost,
        })
    }

    /// The WebSocket endpoint to dial. Credentials and vhost travel in the
    /// `hello` frame, never in the handshake.
    pub fn endpoint(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

impl FromStr for ConnectionUri {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Renders the address with the password masked, safe to log.
impl fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws://{}", self.username)?;
        if self.password.is_some() {
            write!(f, ":***")?;
        }
        write!(f, "@{}:{}/", self.host, self.port)?;
        if self.vhost != DEFAULT_VHOST {
            write!(f, "{}", self.vhost)?;
        }
        Ok(())
    }
}
