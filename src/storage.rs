//! Frame persistence.
//!
//! A [`FrameSink`] takes the frames of one run plus a typed [`CaptureHeader`]
//! and writes one self-contained file. [`FitsWriter`] writes a single FITS
//! primary HDU:
//!
//! ```text
//! SIMPLE  = T            file format valid
//! BITPIX  = 16           unsigned 16-bit via BZERO = 32768
//! NAXIS   = 2 | 3        NAXIS1 = columns, NAXIS2 = rows, NAXIS3 = frames
//! READMODE, EXPTIME, EMGAIN, ...   from the applied configuration
//! COMMENT ...            operator notes, one card per line
//! END
//! <big-endian i16 pixel data, padded to 2880-byte blocks>
//! ```
//!
//! Files are named `{YYYYmmdd_HHMMSS}_{serial}.fits`. If that name exists a
//! `_1`, `_2`, ... suffix is appended; existing files are never overwritten.

use crate::acquisition::FrameStack;
use crate::camera_config::CameraConfiguration;
use crate::error::{AppResult, CameraError};
use crate::session::CameraIdentity;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;
const MAX_STRING_VALUE: usize = 68;
const MAX_COMMENT_TEXT: usize = 72;
const MAX_NAME_ATTEMPTS: usize = 1000;
const BZERO: i32 = 32768;

/// Keys the writer emits itself.
const RESERVED_KEYS: [&str; 11] = [
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "NAXIS3", "EXTEND", "BZERO", "BSCALE",
    "END", "COMMENT",
];

/// A typed header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Logical(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Logical(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Integer(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Integer(i64::from(value))
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Integer(i64::from(value))
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

/// One `KEY = value / comment` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderCard {
    pub key: String,
    pub value: HeaderValue,
    pub comment: String,
}

/// Metadata written alongside the frames of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureHeader {
    cards: Vec<HeaderCard>,
    notes: Vec<String>,
    captured_at: Option<DateTime<Utc>>,
}

impl CaptureHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header for a run, built from the camera identity and the applied configuration.
    pub fn for_capture(
        identity: &CameraIdentity,
        config: &CameraConfiguration,
        captured_at: DateTime<Utc>,
        notes: &str,
    ) -> Self {
        let mut header = Self {
            captured_at: Some(captured_at),
            ..Self::default()
        };
        let timestamp = captured_at.format("%Y-%m-%dT%H:%M:%S%.3f").to_string();

        header.insert("READMODE", config.readout_mode.to_uppercase(), "readout mode");
        header.insert("ACQMODE", config.acquisition_mode.as_str(), "acquisition mode");
        header.insert("DATE-OBS", timestamp, "capture start (UTC)");
        header.insert("EXPTIME", config.exposure_time, "exposure time [s]");
        if config.is_kinetic() {
            if let Some(cycle_time) = config.cycle_time {
                header.insert("KINCYCLE", cycle_time, "kinetic cycle time [s]");
            }
            if let Some(accumulations) = config.accumulation_count {
                header.insert("NACCUM", accumulations, "accumulations per frame");
            }
        }
        header.insert("TRIGGER", config.triggering.as_str(), "trigger mode");
        header.insert("EMGAINON", config.em_gain.enabled, "EM gain enabled");
        header.insert(
            "EMGAIN",
            if config.em_gain.enabled {
                config.em_gain.level
            } else {
                0
            },
            "EM gain level",
        );
        header.insert("FRAMETRF", config.frame_transfer, "frame transfer mode");
        header.insert(
            "HSSPEED",
            config.horizontal_shift.readout_rate.as_str(),
            "horizontal readout rate",
        );
        header.insert(
            "PREAMP",
            config.horizontal_shift.pre_amp_gain.as_str(),
            "pre-amplifier gain",
        );
        header.insert(
            "OUTAMP",
            config.horizontal_shift.output_amp.as_str(),
            "output amplifier",
        );
        header.insert(
            "VSSPEED",
            config.vertical_shift.speed_selector.as_str(),
            "vertical shift speed [us/row]",
        );
        if let Some(amplitude) = &config.vertical_shift.clock_voltage_amplitude {
            header.insert("VSAMPL", amplitude.as_str(), "vertical clock amplitude");
        }
        header.insert("SHUTTER", config.shutter.as_str(), "shutter mode");
        header.insert("SETTEMP", config.temperature_setpoint, "cooler setpoint [C]");
        header.insert(
            "SERIALNO",
            identity.serial_number.as_str(),
            "camera serial number",
        );
        header.insert("HEADMODL", identity.head_model.as_str(), "camera head model");
        header.insert(
            "CONTROLR",
            identity.controller_mode.as_str(),
            "controller mode",
        );
        header.add_notes(notes);
        header
    }

    fn insert(&mut self, key: &str, value: impl Into<HeaderValue>, comment: &str) {
        let card = HeaderCard {
            key: key.to_string(),
            value: value.into(),
            comment: comment.to_string(),
        };
        match self.cards.iter_mut().find(|c| c.key == key) {
            Some(existing) => *existing = card,
            None => self.cards.push(card),
        }
    }

    /// Sets a card, replacing any card with the same key.
    ///
    /// Keys are upper-cased and must be 1-8 characters of `A-Z`, `0-9`, `-`
    /// or `_`. Structural keys written by the writer itself are refused.
    pub fn set(
        &mut self,
        key: &str,
        value: impl Into<HeaderValue>,
        comment: &str,
    ) -> AppResult<()> {
        let key = key.trim().to_uppercase();
        let valid = !key.is_empty()
            && key.len() <= 8
            && key
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid || RESERVED_KEYS.contains(&key.as_str()) {
            return Err(CameraError::InvalidConfig {
                field: "header key".to_string(),
                value: key,
            });
        }
        self.insert(&key, value, comment);
        Ok(())
    }

    /// Appends free-text notes as COMMENT cards, one or more per line.
    pub fn add_notes(&mut self, text: &str) {
        for line in text.lines() {
            let chars: Vec<char> = line.chars().filter(|c| c.is_ascii() && !c.is_control()).collect();
            if chars.is_empty() {
                continue;
            }
            for chunk in chars.chunks(MAX_COMMENT_TEXT) {
                self.notes.push(chunk.iter().collect());
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.cards.iter().find(|c| c.key == key).map(|c| &c.value)
    }

    pub fn cards(&self) -> &[HeaderCard] {
        &self.cards
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.captured_at
    }
}

/// Writes the frames of one run to durable storage.
pub trait FrameSink: Send + Sync {
    /// Writes `frames` with `header` into `destination` and returns the file path.
    fn save(
        &self,
        frames: &FrameStack,
        header: &CaptureHeader,
        destination: &Path,
        serial: &str,
    ) -> AppResult<PathBuf>;
}

/// FITS file name for a capture: `{YYYYmmdd_HHMMSS}_{serial}[_{n}].fits`.
pub fn capture_file_name(captured_at: DateTime<Utc>, serial: &str, attempt: usize) -> String {
    let serial: String = serial
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stamp = captured_at.format("%Y%m%d_%H%M%S");
    if attempt == 0 {
        format!("{stamp}_{serial}.fits")
    } else {
        format!("{stamp}_{serial}_{attempt}.fits")
    }
}

fn format_value(value: &HeaderValue) -> String {
    match value {
        HeaderValue::Logical(flag) => format!("{:>20}", if *flag { "T" } else { "F" }),
        HeaderValue::Integer(n) => format!("{n:>20}"),
        HeaderValue::Float(x) if x.is_finite() => format!("{:>20}", format!("{x:.6E}")),
        HeaderValue::Float(x) => format_string(&x.to_string()),
        HeaderValue::Text(text) => format_string(text),
    }
}

fn format_string(text: &str) -> String {
    let mut escaped: String = text
        .chars()
        .filter(|c| c.is_ascii() && !c.is_control())
        .collect::<String>()
        .replace('\'', "''");
    if escaped.len() > MAX_STRING_VALUE {
        escaped.truncate(MAX_STRING_VALUE);
        // Never leave half of an escaped quote pair
        if escaped.ends_with('\'') && !escaped.ends_with("''") {
            escaped.pop();
        }
    }
    format!("'{escaped:<8}'")
}

fn push_card(out: &mut Vec<u8>, text: &str) {
    let mut card = format!("{:<width$}", text, width = CARD_SIZE);
    card.truncate(CARD_SIZE);
    out.extend_from_slice(card.as_bytes());
}

fn push_value_card(out: &mut Vec<u8>, key: &str, value: &HeaderValue, comment: &str) {
    let mut text = format!("{key:<8}= {}", format_value(value));
    if !comment.is_empty() {
        text.push_str(" / ");
        text.push_str(comment);
    }
    push_card(out, &text);
}

fn pad_header(out: &mut Vec<u8>) {
    let remainder = out.len() % BLOCK_SIZE;
    if remainder != 0 {
        out.resize(out.len() + BLOCK_SIZE - remainder, b' ');
    }
}

/// Writes one FITS primary HDU per run.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitsWriter;

impl FitsWriter {
    pub fn new() -> Self {
        Self
    }

    /// Encodes the header unit, padded to whole blocks.
    pub fn encode_header(frames: &FrameStack, header: &CaptureHeader) -> Vec<u8> {
        let (rows, cols) = frames.frame_shape();
        let mut out = Vec::with_capacity(BLOCK_SIZE);

        push_value_card(&mut out, "SIMPLE", &HeaderValue::Logical(true), "file conforms to FITS standard");
        push_value_card(&mut out, "BITPIX", &HeaderValue::Integer(16), "16-bit pixels");
        match frames {
            FrameStack::Single(_) => {
                push_value_card(&mut out, "NAXIS", &HeaderValue::Integer(2), "number of axes");
            }
            FrameStack::Series(_) => {
                push_value_card(&mut out, "NAXIS", &HeaderValue::Integer(3), "number of axes");
            }
        }
        push_value_card(&mut out, "NAXIS1", &HeaderValue::Integer(cols as i64), "columns");
        push_value_card(&mut out, "NAXIS2", &HeaderValue::Integer(rows as i64), "rows");
        if let FrameStack::Series(_) = frames {
            push_value_card(
                &mut out,
                "NAXIS3",
                &HeaderValue::Integer(frames.frame_count() as i64),
                "frames",
            );
        }
        push_value_card(&mut out, "EXTEND", &HeaderValue::Logical(true), "");
        push_value_card(&mut out, "BZERO", &HeaderValue::Integer(i64::from(BZERO)), "unsigned 16-bit offset");
        push_value_card(&mut out, "BSCALE", &HeaderValue::Integer(1), "");

        for card in header.cards() {
            push_value_card(&mut out, &card.key, &card.value, &card.comment);
        }
        for note in header.notes() {
            push_card(&mut out, &format!("COMMENT {note}"));
        }
        push_card(&mut out, "END");
        pad_header(&mut out);
        out
    }

    /// Streams pixel data as big-endian signed 16-bit values offset by BZERO,
    /// zero-padded to a whole block. Returns the number of bytes written.
    pub fn write_data<W: Write>(out: &mut W, frames: &FrameStack) -> io::Result<usize> {
        let mut written = 0;
        for pixel in frames.pixels() {
            let stored = (i32::from(pixel) - BZERO) as i16;
            out.write_all(&stored.to_be_bytes())?;
            written += 2;
        }
        let remainder = written % BLOCK_SIZE;
        if remainder != 0 {
            out.write_all(&[0u8; BLOCK_SIZE][..BLOCK_SIZE - remainder])?;
            written += BLOCK_SIZE - remainder;
        }
        Ok(written)
    }

    fn create_unique(
        destination: &Path,
        captured_at: DateTime<Utc>,
        serial: &str,
    ) -> AppResult<(PathBuf, fs::File)> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = destination.join(capture_file_name(captured_at, serial, attempt));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CameraError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free file name for {serial} in {}", destination.display()),
        )))
    }
}

impl FrameSink for FitsWriter {
    fn save(
        &self,
        frames: &FrameStack,
        header: &CaptureHeader,
        destination: &Path,
        serial: &str,
    ) -> AppResult<PathBuf> {
        fs::create_dir_all(destination)?;
        let captured_at = header.captured_at().unwrap_or_else(Utc::now);
        let (path, file) = Self::create_unique(destination, captured_at, serial)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(&Self::encode_header(frames, header))?;
        Self::write_data(&mut writer, frames)?;
        writer.flush()?;

        tracing::info!(
            path = %path.display(),
            frames = frames.frame_count(),
            "Frames saved"
        );
        Ok(path)
    }
}
