//! # Core Type Definitions
//!
//! Connection keys and per-command options shared by the pool and the
//! gateway facade.
//!
//! ## Design Principles
//!
//! 1. **Canonical Keys**: `(host, port)` is normalized once at construction so
//!    two spellings of the same peer always index the same registry slot.
//!
//! 2. **Validated Options**: `CommandOptions` can only be built with a positive
//!    timeout and a known encoding; the executor never re-validates.
//!
//! 3. **Protocol Agnostic**: The delimiter is an arbitrary string. An empty
//!    delimiter switches the executor to grace-period completion.
//!
//! ## Canonical Key Forms
//!
//! ```text
//! ("Example.COM ", 7000) -> "example.com:7000"
//! ("::1", 7000)          -> "[::1]:7000"
//! ("[::1]", 7000)        -> "[::1]:7000"
//! ```

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};

/// Default command timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default response delimiter.
pub const DEFAULT_DELIMITER: &str = "\n";

/// Upper bound of the no-delimiter grace period in milliseconds.
pub const GRACE_PERIOD_CAP_MS: u64 = 1_000;

/// Canonical `(host, port)` identifier of a pooled connection.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    host: String,
    port: u16,
}

impl ConnectionKey {
    /// Creates a key from a raw host and port.
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` when the host is empty or contains
    /// whitespace, or when the port is outside `1..=65535`.
    ///
    /// # Examples
    /// ```rust
    /// use tgw_common::ConnectionKey;
    ///
    /// let key = ConnectionKey::new("LocalHost", 7000).expect("valid key");
    /// assert_eq!(key.to_string(), "localhost:7000");
    /// assert!(ConnectionKey::new("localhost", 0).is_err());
    /// ```
    pub fn new(host: &str, port: u32) -> GatewayResult<Self> {
        let trimmed = host.trim();
        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(trimmed);

        if unbracketed.is_empty() {
            return Err(GatewayError::validation("host must not be empty"));
        }
        if unbracketed.chars().any(char::is_whitespace) {
            return Err(GatewayError::validation(format!(
                "host {:?} must not contain whitespace",
                host
            )));
        }
        let port = match u16::try_from(port) {
            Ok(port) if port != 0 => port,
            _ => {
                return Err(GatewayError::validation(format!(
                    "port {} is outside 1-65535",
                    port
                )))
            }
        };

        Ok(ConnectionKey {
            host: unbracketed.to_ascii_lowercase(),
            port,
        })
    }

    /// Returns the normalized host (without IPv6 brackets).
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    fn is_ipv6(&self) -> bool {
        Ipv6Addr::from_str(&self.host).is_ok()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionKey({})", self)
    }
}

/// Text encoding applied to inbound bytes before delimiter matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// UTF-8; invalid sequences become U+FFFD.
    #[default]
    Utf8,
    /// 7-bit ASCII; the high bit of every byte is dropped.
    Ascii,
    /// ISO-8859-1, one char per byte.
    Latin1,
    /// Lowercase hexadecimal.
    Hex,
}

impl Encoding {
    /// Decodes raw bytes into text.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Ascii => bytes.iter().map(|b| (b & 0x7f) as char).collect(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Hex => hex::encode(bytes),
        }
    }

    /// Wire bytes of a delimiter written in this encoding.
    ///
    /// Hex delimiters name raw bytes (`"0d0a"` is CR LF); every other
    /// encoding sends the delimiter text as UTF-8.
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` for a hex delimiter that is not an
    /// even-length hex string.
    pub fn delimiter_bytes(self, delimiter: &str) -> GatewayResult<Vec<u8>> {
        match self {
            Encoding::Hex => hex::decode(delimiter).map_err(|err| {
                GatewayError::validation(format!("invalid hex delimiter {:?}: {}", delimiter, err))
            }),
            _ => Ok(delimiter.as_bytes().to_vec()),
        }
    }

    /// Returns the canonical encoding name.
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin1",
            Encoding::Hex => "hex",
        }
    }
}

impl FromStr for Encoding {
    type Err = GatewayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "ascii" => Ok(Encoding::Ascii),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "hex" => Ok(Encoding::Hex),
            other => Err(GatewayError::validation(format!(
                "unsupported encoding {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-command options for the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    timeout: Duration,
    encoding: Encoding,
    delimiter: String,
}

impl Default for CommandOptions {
    fn default() -> Self {
        CommandOptions {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            encoding: Encoding::Utf8,
            delimiter: DEFAULT_DELIMITER.to_string(),
        }
    }
}

impl CommandOptions {
    /// Builds options from optional caller-supplied parts, filling defaults.
    ///
    /// `delimiter: Some("")` selects grace-period mode; `None` keeps `"\n"`.
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` for a zero timeout, an unknown
    /// encoding name, or a delimiter the encoding cannot express.
    pub fn from_parts(
        timeout_ms: Option<u64>,
        encoding: Option<&str>,
        delimiter: Option<&str>,
    ) -> GatewayResult<Self> {
        let mut options = CommandOptions::default();
        if let Some(ms) = timeout_ms {
            options = options.with_timeout_ms(ms)?;
        }
        if let Some(name) = encoding {
            options.encoding = name.parse()?;
        }
        if let Some(delimiter) = delimiter {
            options.delimiter = delimiter.to_string();
        }
        options.delimiter_bytes()?;
        Ok(options)
    }

    /// Replaces the timeout.
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` when `ms` is zero.
    pub fn with_timeout_ms(mut self, ms: u64) -> GatewayResult<Self> {
        if ms == 0 {
            return Err(GatewayError::validation("timeout must be greater than 0"));
        }
        self.timeout = Duration::from_millis(ms);
        Ok(self)
    }

    /// Replaces the encoding.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Replaces the delimiter. An empty string selects grace-period mode.
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[inline]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    #[inline]
    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Delimiter as written to and matched on the wire.
    ///
    /// # Errors
    /// See [`Encoding::delimiter_bytes`].
    pub fn delimiter_bytes(&self) -> GatewayResult<Vec<u8>> {
        self.encoding.delimiter_bytes(&self.delimiter)
    }

    /// Grace period used when no delimiter is configured: `min(timeout, 1s)`.
    pub fn grace_period(&self) -> Duration {
        self.timeout.min(Duration::from_millis(GRACE_PERIOD_CAP_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalization() {
        let key = ConnectionKey::new("  Example.COM ", 7000).unwrap();
        assert_eq!(key.host(), "example.com");
        assert_eq!(key.port(), 7000);
        assert_eq!(key.to_string(), "example.com:7000");
        assert_eq!(key, ConnectionKey::new("example.com", 7000).unwrap());
    }

    #[test]
    fn test_key_ipv6_brackets() {
        let bare = ConnectionKey::new("::1", 9000).unwrap();
        let bracketed = ConnectionKey::new("[::1]", 9000).unwrap();
        assert_eq!(bare, bracketed);
        assert_eq!(bare.host(), "::1");
        assert_eq!(bare.to_string(), "[::1]:9000");
    }

    #[test]
    fn test_key_rejects_bad_input() {
        assert!(ConnectionKey::new("", 80).is_err());
        assert!(ConnectionKey::new("   ", 80).is_err());
        assert!(ConnectionKey::new("bad host", 80).is_err());
        assert!(ConnectionKey::new("localhost", 0).is_err());
        assert!(ConnectionKey::new("localhost", 65_536).is_err());
        assert!(ConnectionKey::new("localhost", 65_535).is_ok());
    }

    #[test]
    fn test_encoding_parse() {
        assert_eq!("utf-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("UTF8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("binary".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert_eq!("hex".parse::<Encoding>().unwrap(), Encoding::Hex);
        let err = "ebcdic".parse::<Encoding>().unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn test_encoding_decode() {
        let bytes = [b'o', b'k', 0xE9];
        assert_eq!(Encoding::Latin1.decode(&bytes), "oké");
        assert_eq!(Encoding::Ascii.decode(&bytes), "ok\u{69}");
        assert_eq!(Encoding::Hex.decode(&bytes), "6f6be9");
        assert_eq!(Encoding::Utf8.decode("héllo".as_bytes()), "héllo");
        assert_eq!(Encoding::Utf8.decode(&bytes), "ok\u{FFFD}");
    }

    #[test]
    fn test_default_options() {
        let options = CommandOptions::default();
        assert_eq!(options.timeout_ms(), DEFAULT_TIMEOUT_MS);
        assert_eq!(options.encoding(), Encoding::Utf8);
        assert_eq!(options.delimiter(), "\n");
        assert_eq!(options.grace_period(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_options_from_parts() {
        let options = CommandOptions::from_parts(Some(250), Some("latin1"), Some("")).unwrap();
        assert_eq!(options.timeout(), Duration::from_millis(250));
        assert_eq!(options.encoding(), Encoding::Latin1);
        assert_eq!(options.delimiter(), "");
        // Short timeouts shrink the grace period with them.
        assert_eq!(options.grace_period(), Duration::from_millis(250));

        assert!(CommandOptions::from_parts(Some(0), None, None).is_err());
        assert!(CommandOptions::from_parts(None, Some("utf16"), None).is_err());
    }

    #[test]
    fn test_hex_delimiter_names_raw_bytes() {
        let options = CommandOptions::from_parts(None, Some("hex"), Some("0D0a")).unwrap();
        assert_eq!(options.delimiter_bytes().unwrap(), vec![0x0d, 0x0a]);
        assert_eq!(CommandOptions::default().delimiter_bytes().unwrap(), b"\n".to_vec());

        let err = CommandOptions::from_parts(None, Some("hex"), Some("0a1")).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
        assert!(CommandOptions::from_parts(None, Some("hex"), Some("zz")).is_err());
    }
}
