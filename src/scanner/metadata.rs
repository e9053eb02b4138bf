//! Image metadata extraction.
//!
//! Reads the handful of EXIF fields the fingerprint and the scan counters
//! need. Every field is optional: a PNG without EXIF, a HEIC the decoder does
//! not understand, or a file that vanished between listing and reading all
//! produce an [`ImageMetadata`] with fallbacks rather than an error.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Local, NaiveDateTime, SubsecRound, Timelike};
use exif::{Exif, In, Reader, Tag, Value};

/// Device label used when the camera make and model are unknown.
pub const UNKNOWN_DEVICE: &str = "Unknown";

const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Metadata read from one image file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    /// Raw EXIF `DateTimeOriginal` string, if present.
    pub date_time_original: Option<String>,
    /// File modification time.
    pub modified: Option<SystemTime>,
    /// Camera make.
    pub make: Option<String>,
    /// Camera model.
    pub model: Option<String>,
    /// Pixel width (0 if unknown).
    pub width: u32,
    /// Pixel height (0 if unknown).
    pub height: u32,
    /// File size in bytes (0 if the file could not be stat'ed).
    pub size: u64,
    /// EXIF `BrightnessValue` in APEX units.
    pub brightness: Option<f64>,
    /// Latitude / longitude in signed decimal degrees.
    pub gps: Option<(f64, f64)>,
}

impl ImageMetadata {
    /// Read metadata from `path`.
    ///
    /// Opens the file read-only. Never fails; missing pieces are left empty
    /// and logged at debug level.
    #[must_use]
    pub fn read(path: &Path) -> Self {
        let mut meta = Self::default();

        match fs::metadata(path) {
            Ok(fs_meta) => {
                meta.size = fs_meta.len();
                meta.modified = fs_meta.modified().ok();
            }
            Err(e) => log::debug!("Cannot stat {}: {}", path.display(), e),
        }

        if let Ok((w, h)) = image::image_dimensions(path) {
            meta.width = w;
            meta.height = h;
        }

        match read_exif(path) {
            Ok(exif) => meta.apply_exif(&exif),
            Err(e) => log::trace!("No EXIF for {}: {}", path.display(), e),
        }

        meta
    }

    fn apply_exif(&mut self, exif: &Exif) {
        self.date_time_original = ascii_field(exif, Tag::DateTimeOriginal);
        self.make = ascii_field(exif, Tag::Make);
        self.model = ascii_field(exif, Tag::Model);
        self.brightness = exif
            .get_field(Tag::BrightnessValue, In::PRIMARY)
            .and_then(|f| rational_at(&f.value, 0));
        self.gps = gps_coordinates(exif);

        // Formats the header reader does not understand (HEIC) still carry
        // their pixel size in EXIF.
        if self.width == 0 || self.height == 0 {
            let x = exif
                .get_field(Tag::PixelXDimension, In::PRIMARY)
                .and_then(|f| f.value.get_uint(0));
            let y = exif
                .get_field(Tag::PixelYDimension, In::PRIMARY)
                .and_then(|f| f.value.get_uint(0));
            if let (Some(x), Some(y)) = (x, y) {
                self.width = x;
                self.height = y;
            }
        }
    }

    /// Capture time: EXIF `DateTimeOriginal`, else the modification time.
    #[must_use]
    pub fn captured_at(&self) -> Option<NaiveDateTime> {
        self.date_time_original
            .as_deref()
            .and_then(|s| NaiveDateTime::parse_from_str(s.trim(), EXIF_DATETIME_FORMAT).ok())
            .or_else(|| self.modified.map(|m| DateTime::<Local>::from(m).naive_local()))
    }

    /// Capture year, used for the per-year scan counters.
    #[must_use]
    pub fn capture_year(&self) -> Option<i32> {
        self.captured_at().map(|dt| dt.year())
    }

    /// `"<Make> <Model>"`, or [`UNKNOWN_DEVICE`].
    #[must_use]
    pub fn device(&self) -> String {
        let parts: Vec<&str> = [self.make.as_deref(), self.model.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            UNKNOWN_DEVICE.to_string()
        } else {
            parts.join(" ")
        }
    }

    /// The timestamp field of the fingerprint.
    ///
    /// The raw EXIF string when present, else the modification time as local
    /// ISO-8601, else empty. The fallback is rounded to microseconds and the
    /// fraction is omitted when it is zero (`2020-09-13T12:26:40`).
    #[must_use]
    pub fn timestamp_field(&self) -> String {
        if let Some(dto) = &self.date_time_original {
            return dto.clone();
        }
        self.modified
            .map(|m| {
                let local = DateTime::<Local>::from(m).naive_local().round_subsecs(6);
                let format = if local.nanosecond() == 0 {
                    "%Y-%m-%dT%H:%M:%S"
                } else {
                    "%Y-%m-%dT%H:%M:%S%.6f"
                };
                local.format(format).to_string()
            })
            .unwrap_or_default()
    }
}

fn read_exif(path: &Path) -> Result<Exif, exif::Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    Reader::new().read_from_container(&mut reader)
}

fn ascii_field(exif: &Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Ascii(values) => values.first().map(|v| {
            String::from_utf8_lossy(v)
                .trim_end_matches('\0')
                .trim()
                .to_string()
        }),
        _ => None,
    }
    .filter(|s| !s.is_empty())
}

fn rational_at(value: &Value, index: usize) -> Option<f64> {
    let v = match value {
        Value::Rational(values) => values.get(index).filter(|r| r.denom != 0)?.to_f64(),
        Value::SRational(values) => values.get(index).filter(|r| r.denom != 0)?.to_f64(),
        _ => return None,
    };
    v.is_finite().then_some(v)
}

fn degrees(exif: &Exif, tag: Tag) -> Option<f64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let d = rational_at(&field.value, 0)?;
    let m = rational_at(&field.value, 1).unwrap_or(0.0);
    let s = rational_at(&field.value, 2).unwrap_or(0.0);
    Some(d + m / 60.0 + s / 3600.0)
}

fn gps_coordinates(exif: &Exif) -> Option<(f64, f64)> {
    let lat = degrees(exif, Tag::GPSLatitude)?;
    let lon = degrees(exif, Tag::GPSLongitude)?;
    let lat_ref = ascii_field(exif, Tag::GPSLatitudeRef)?;
    let lon_ref = ascii_field(exif, Tag::GPSLongitudeRef)?;

    let lat = if lat_ref.eq_ignore_ascii_case("S") { -lat } else { lat };
    let lon = if lon_ref.eq_ignore_ascii_case("W") { -lon } else { lon };
    Some((lat, lon))
}
