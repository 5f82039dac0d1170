//! Trace identifiers and the cross-process carrier.
//!
//! A `SpanContext` travels between processes as a W3C `traceparent` string:
//! `00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static TRACEPARENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-f]{2})-([0-9a-f]{32})-([0-9a-f]{16})-([0-9a-f]{2})$").unwrap()
});

/// Sampled bit of the trace flags.
pub const FLAG_SAMPLED: u8 = 0x01;

/// 128-bit trace identifier shared by every span of one trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(pub u128);

impl TraceId {
    /// A random, non-zero trace id.
    pub fn random() -> Self {
        loop {
            let id: u128 = rand::random();
            if id != 0 {
                return Self(id);
            }
        }
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl std::str::FromStr for TraceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 32 {
            return Err(Error::InvalidCarrier(format!("trace id must be 32 hex chars: {s}")));
        }
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| Error::InvalidCarrier(format!("invalid trace id: {s}")))
    }
}

/// 64-bit span identifier, unique within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(pub u64);

impl SpanId {
    /// A random, non-zero span id.
    pub fn random() -> Self {
        loop {
            let id: u64 = rand::random();
            if id != 0 {
                return Self(id);
            }
        }
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::str::FromStr for SpanId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 16 {
            return Err(Error::InvalidCarrier(format!("span id must be 16 hex chars: {s}")));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| Error::InvalidCarrier(format!("invalid span id: {s}")))
    }
}

macro_rules! hex_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_serde!(TraceId);
hex_serde!(SpanId);

/// The portion of a span that crosses process boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub flags: u8,
}

impl SpanContext {
    pub fn is_sampled(&self) -> bool {
        self.flags & FLAG_SAMPLED != 0
    }

    /// Serialize into a `traceparent` carrier string.
    pub fn to_carrier(&self) -> String {
        format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, self.flags)
    }

    /// Reconstruct a remote parent context from a carrier string.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidCarrier` if the string is malformed, uses the
    /// forbidden version `ff`, or carries an all-zero trace or span id.
    pub fn from_carrier(carrier: &str) -> Result<Self> {
        let carrier = carrier.trim().to_ascii_lowercase();
        let caps = TRACEPARENT
            .captures(&carrier)
            .ok_or_else(|| Error::InvalidCarrier(carrier.clone()))?;

        if &caps[1] == "ff" {
            return Err(Error::InvalidCarrier(format!("unsupported version: {carrier}")));
        }

        let trace_id: TraceId = caps[2].parse()?;
        let span_id: SpanId = caps[3].parse()?;
        if trace_id.0 == 0 || span_id.0 == 0 {
            return Err(Error::InvalidCarrier(format!("all-zero id: {carrier}")));
        }
        let flags = u8::from_str_radix(&caps[4], 16)
            .map_err(|_| Error::InvalidCarrier(carrier.clone()))?;

        Ok(Self {
            trace_id,
            span_id,
            flags,
        })
    }
}

impl std::fmt::Display for SpanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_carrier())
    }
}
