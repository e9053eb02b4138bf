//! Metadata fingerprints.
//!
//! An image is identified by a SHA-256 digest over its metadata rather than
//! its path, so renamed, copied or moved files hit the same cache record.
//! The digest covers, pipe-delimited and in this order:
//!
//! ```text
//! capture-time | make | width | height | size | brightness | latitude | longitude
//! ```
//!
//! Changing the field order or formatting invalidates every cached record and
//! must come with a bump of [`CACHE_VERSION`](crate::cache::CACHE_VERSION).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::metadata::ImageMetadata;

/// Written for missing GPS coordinates.
const MISSING_COORDINATE: &str = "None";

/// A 256-bit metadata fingerprint, hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint already-read metadata.
    #[must_use]
    pub fn from_metadata(meta: &ImageMetadata) -> Self {
        Self::from_fields(&fingerprint_input(meta))
    }

    /// Digest a preassembled fingerprint input string.
    #[must_use]
    pub fn from_fields(input: &str) -> Self {
        Self(Sha256::digest(input.as_bytes()).into())
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        use std::fmt::Write;
        self.0.iter().fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// Error parsing a hex fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fingerprint '{0}': expected 64 hex characters")]
pub struct ParseFingerprintError(pub String);

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseFingerprintError(s.to_string());
        if s.len() != 64 || !s.is_ascii() {
            return Err(err());
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| err())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Fingerprint the image at `path`.
///
/// Never fails: unreadable metadata contributes empty or sentinel fields.
/// The path string itself is not part of the digest.
#[must_use]
pub fn fingerprint(path: &Path) -> Fingerprint {
    Fingerprint::from_metadata(&ImageMetadata::read(path))
}

/// Assemble the pipe-delimited digest input.
#[must_use]
pub fn fingerprint_input(meta: &ImageMetadata) -> String {
    let brightness = meta.brightness.map(float_field).unwrap_or_default();
    let (lat, lon) = match meta.gps {
        Some((lat, lon)) => (float_field(lat), float_field(lon)),
        None => (MISSING_COORDINATE.to_string(), MISSING_COORDINATE.to_string()),
    };
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        meta.timestamp_field(),
        meta.make.as_deref().unwrap_or_default(),
        meta.width,
        meta.height,
        meta.size,
        brightness,
        lat,
        lon
    )
}

/// Shortest round-trip decimal, always with a fractional part, switching to
/// `1e-05` / `1e+16` style exponents outside `[1e-4, 1e16)`. Existing cache
/// files were keyed with this rendering.
fn float_field(value: f64) -> String {
    if !value.is_finite() {
        return if value.is_nan() {
            "nan".to_string()
        } else if value > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        };
    }
    let abs = value.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let sci = format!("{value:e}");
        let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(digits) => ('-', digits),
            None => ('+', exponent),
        };
        return format!("{mantissa}e{sign}{digits:0>2}");
    }
    let plain = value.to_string();
    if plain.contains('.') {
        plain
    } else {
        format!("{plain}.0")
    }
}
