//! Retry-attempt counter carried in message headers.
//!
//! The wire contract is a single header named `retries` whose value is the
//! ASCII decimal attempt count (`"1"`, `"2"`, ...). The header is parsed into
//! an [`AttemptCount`] at the boundary; a missing or malformed header counts
//! as zero attempts so a message with a corrupted counter is retried instead
//! of being lost.

use std::fmt;

use tracing::warn;

use crate::message::Headers;

/// Header name for the attempt counter.
pub const RETRIES_HEADER: &str = "retries";

/// Number of retry publishes a logical message has already gone through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttemptCount(u32);

impl AttemptCount {
    pub const ZERO: AttemptCount = AttemptCount(0);

    pub fn new(count: u32) -> Self {
        Self(count)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// The attempt that follows this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Parse a raw header value. `None` when it is not a decimal `u32`.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .map(Self)
    }

    /// Read the counter from the last `retries` header, falling back to zero.
    pub fn from_headers(headers: &Headers) -> Self {
        match headers.last(RETRIES_HEADER) {
            None => Self::ZERO,
            Some(raw) => Self::parse(raw).unwrap_or_else(|| {
                warn!(
                    header = RETRIES_HEADER,
                    raw = %String::from_utf8_lossy(raw),
                    "invalid retries header value; treating as attempt 0"
                );
                Self::ZERO
            }),
        }
    }

    pub fn to_header_value(self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }

    /// Set (or replace) the `retries` header.
    pub fn write_to(self, headers: &mut Headers) {
        headers.set(RETRIES_HEADER, self.to_header_value());
    }
}

impl fmt::Display for AttemptCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
