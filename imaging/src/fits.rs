//! FITS I/O for guider frames.
//!
//! Single-HDU 16-bit images only, which is everything the guide cameras
//! produce. Layout per the FITS standard (NASA/Science Office of Standards
//! and Technology):
//!
//! - 2880-byte blocks
//! - Header of 80-character keyword records, fixed value format
//! - Unsigned pixels stored as big-endian signed with BZERO = 32768

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const BLOCK: usize = 2880;
const RECORD: usize = 80;

/// Headers larger than this are not headers, they are garbage input.
const MAX_HEADER_BLOCKS: usize = 64;

/// Keywords the writer owns; user cards with these names are skipped.
const RESERVED: &[&str] = &[
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "BZERO", "BSCALE", "END",
];

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum FitsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid FITS format: {0}")]
    InvalidFormat(String),

    #[error("unsupported BITPIX {0}, only 16-bit images are handled")]
    UnsupportedBitpix(i64),

    #[error("missing required keyword {0}")]
    MissingKeyword(String),
}

pub type FitsResult<T> = Result<T, FitsError>;

// =============================================================================
// HEADER MODEL
// =============================================================================

/// A header card value.
#[derive(Debug, Clone, PartialEq)]
pub enum FitsValue {
    String(String),
    Integer(i64),
    Float(f64),
    Logical(bool),
}

impl FitsValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FitsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FitsValue::Integer(i) => Some(*i),
            FitsValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FitsValue::Float(f) => Some(*f),
            FitsValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FitsValue::Logical(b) => Some(*b),
            _ => None,
        }
    }
}

/// One keyword record: keyword, value, optional comment.
#[derive(Debug, Clone)]
pub struct Card {
    pub keyword: String,
    pub value: FitsValue,
    pub comment: Option<String>,
}

/// Ordered header cards. Setting an existing keyword replaces it in place
/// so card order is stable across updates.
#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    cards: Vec<Card>,
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&mut self, key: &str, value: FitsValue, comment: Option<&str>) {
        let keyword = key.to_uppercase();
        let comment = comment.map(|c| c.to_string());
        if let Some(card) = self.cards.iter_mut().find(|c| c.keyword == keyword) {
            card.value = value;
            card.comment = comment;
        } else {
            self.cards.push(Card { keyword, value, comment });
        }
    }

    pub fn set_string(&mut self, key: &str, value: &str, comment: Option<&str>) {
        self.set(key, FitsValue::String(value.to_string()), comment);
    }

    pub fn set_int(&mut self, key: &str, value: i64, comment: Option<&str>) {
        self.set(key, FitsValue::Integer(value), comment);
    }

    pub fn set_float(&mut self, key: &str, value: f64, comment: Option<&str>) {
        self.set(key, FitsValue::Float(value), comment);
    }

    pub fn set_logical(&mut self, key: &str, value: bool, comment: Option<&str>) {
        self.set(key, FitsValue::Logical(value), comment);
    }

    pub fn get(&self, key: &str) -> Option<&FitsValue> {
        let keyword = key.to_uppercase();
        self.cards.iter().find(|c| c.keyword == keyword).map(|c| &c.value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }
}

/// A decoded single-HDU 16-bit image.
#[derive(Debug, Clone)]
pub struct FitsImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
    pub header: FitsHeader,
}

// =============================================================================
// WRITING
// =============================================================================

/// Write one 16-bit image as a single-HDU FITS file.
///
/// Mandatory cards are generated here; `header` supplies the rest in
/// order. Pixels go out big-endian signed with the BZERO = 32768 offset.
pub fn write_u16_fits(
    path: &Path,
    width: u32,
    height: u32,
    pixels: &[u16],
    header: &FitsHeader,
) -> FitsResult<()> {
    let count = (width as usize) * (height as usize);
    if pixels.len() != count {
        return Err(FitsError::InvalidFormat(format!(
            "pixel count {} does not match {}x{}",
            pixels.len(),
            width,
            height
        )));
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let mut head: Vec<u8> = Vec::with_capacity(BLOCK);
    push_card(&mut head, "SIMPLE", &FitsValue::Logical(true), None);
    push_card(&mut head, "BITPIX", &FitsValue::Integer(16), None);
    push_card(&mut head, "NAXIS", &FitsValue::Integer(2), None);
    push_card(&mut head, "NAXIS1", &FitsValue::Integer(width as i64), None);
    push_card(&mut head, "NAXIS2", &FitsValue::Integer(height as i64), None);
    push_card(&mut head, "BZERO", &FitsValue::Integer(32768), None);
    push_card(&mut head, "BSCALE", &FitsValue::Integer(1), None);

    for card in header.cards() {
        if RESERVED.contains(&card.keyword.as_str()) {
            continue;
        }
        push_card(&mut head, &card.keyword, &card.value, card.comment.as_deref());
    }

    let mut end = [b' '; RECORD];
    end[..3].copy_from_slice(b"END");
    head.extend_from_slice(&end);
    head.resize(head.len().div_ceil(BLOCK) * BLOCK, b' ');
    writer.write_all(&head)?;

    let mut data: Vec<u8> = Vec::with_capacity(count * 2);
    for &pixel in pixels {
        let signed = (pixel as i32 - 32768) as i16;
        data.extend_from_slice(&signed.to_be_bytes());
    }
    data.resize(data.len().div_ceil(BLOCK) * BLOCK, 0u8);
    writer.write_all(&data)?;
    writer.flush()?;

    tracing::debug!(path = %path.display(), width, height, "wrote FITS image");
    Ok(())
}

fn push_card(out: &mut Vec<u8>, keyword: &str, value: &FitsValue, comment: Option<&str>) {
    out.extend_from_slice(&format_card(keyword, value, comment));
}

/// Render one 80-byte record: keyword left in bytes 0..8, `= ` indicator,
/// strings from byte 10, numbers right-justified to byte 30, comment after.
fn format_card(keyword: &str, value: &FitsValue, comment: Option<&str>) -> [u8; RECORD] {
    let mut record = [b' '; RECORD];
    let kw = keyword.as_bytes();
    let kw_len = kw.len().min(8);
    record[..kw_len].copy_from_slice(&kw[..kw_len]);
    record[8] = b'=';

    let value_end = match value {
        FitsValue::String(s) => {
            let quoted = format!("'{:<8}'", s.replace('\'', "''"));
            let bytes = quoted.as_bytes();
            let len = bytes.len().min(RECORD - 10);
            record[10..10 + len].copy_from_slice(&bytes[..len]);
            10 + len
        }
        other => {
            let text = match other {
                FitsValue::Integer(i) => i.to_string(),
                FitsValue::Float(f) => format_float(*f),
                FitsValue::Logical(b) => (if *b { "T" } else { "F" }).to_string(),
                FitsValue::String(_) => unreachable!(),
            };
            let bytes = text.as_bytes();
            let len = bytes.len().min(20);
            record[30 - len..30].copy_from_slice(&bytes[..len]);
            30
        }
    };

    if let Some(comment) = comment {
        let start = value_end.max(30);
        if start + 3 < RECORD {
            record[start..start + 3].copy_from_slice(b" / ");
            let bytes = comment.as_bytes();
            let len = bytes.len().min(RECORD - start - 3);
            record[start + 3..start + 3 + len].copy_from_slice(&bytes[..len]);
        }
    }
    record
}

/// Fixed-point where it stays readable, exponent form otherwise. Headers
/// get eyeballed by observers; `-40.0` beats `-4.0E1`.
fn format_float(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1.0e10 {
        return format!("{:.1}", value);
    }
    if value.abs() >= 1.0e-4 && value.abs() < 1.0e10 {
        let plain = format!("{}", value);
        // The fixed-format value field holds 20 characters.
        if plain.len() <= 20 {
            return plain;
        }
    }
    format!("{:.6E}", value)
}

// =============================================================================
// READING
// =============================================================================

/// Read a single-HDU 16-bit FITS file back into memory.
pub fn read_u16_fits(path: &Path) -> FitsResult<FitsImage> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let header = read_header(&mut reader)?;

    let bitpix = header
        .get_int("BITPIX")
        .ok_or_else(|| FitsError::MissingKeyword("BITPIX".to_string()))?;
    if bitpix != 16 {
        return Err(FitsError::UnsupportedBitpix(bitpix));
    }
    let width = header
        .get_int("NAXIS1")
        .ok_or_else(|| FitsError::MissingKeyword("NAXIS1".to_string()))? as u32;
    let height = header
        .get_int("NAXIS2")
        .ok_or_else(|| FitsError::MissingKeyword("NAXIS2".to_string()))? as u32;

    let bzero = header.get_float("BZERO").unwrap_or(0.0);
    let bscale = header.get_float("BSCALE").unwrap_or(1.0);

    let count = (width as usize) * (height as usize);
    let mut raw = vec![0u8; count * 2];
    reader.read_exact(&mut raw)?;

    let pixels: Vec<u16> = raw
        .chunks_exact(2)
        .map(|chunk| {
            let signed = i16::from_be_bytes([chunk[0], chunk[1]]);
            if bzero == 32768.0 && bscale == 1.0 {
                (signed as i32 + 32768) as u16
            } else {
                (signed as f64 * bscale + bzero).clamp(0.0, 65535.0) as u16
            }
        })
        .collect();

    Ok(FitsImage { width, height, pixels, header })
}

/// Read header blocks until the END record.
fn read_header<R: Read>(reader: &mut R) -> FitsResult<FitsHeader> {
    let mut header = FitsHeader::new();
    let mut block = [0u8; BLOCK];

    for _ in 0..MAX_HEADER_BLOCKS {
        reader.read_exact(&mut block)?;
        for raw in block.chunks_exact(RECORD) {
            let record = String::from_utf8_lossy(raw);
            let keyword = record[..8].trim();
            if keyword == "END" {
                return Ok(header);
            }
            if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
                continue;
            }
            if &record[8..10] == "= " {
                let (value, comment) = parse_card_value(&record[10..]);
                header.cards.push(Card {
                    keyword: keyword.to_string(),
                    value,
                    comment,
                });
            }
        }
    }
    Err(FitsError::InvalidFormat(
        "no END record within the first 64 header blocks".to_string(),
    ))
}

/// Parse the value and comment portion of a record (bytes 10..).
fn parse_card_value(text: &str) -> (FitsValue, Option<String>) {
    let text = text.trim();

    if let Some(rest) = text.strip_prefix('\'') {
        // Doubled quotes inside the string are literal quotes.
        let mut value = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    value.push('\'');
                } else {
                    break;
                }
            } else {
                value.push(c);
            }
        }
        let tail: String = chars.collect();
        let comment = tail
            .split_once('/')
            .map(|(_, comment)| comment.trim().to_string());
        return (FitsValue::String(value.trim_end().to_string()), comment);
    }

    let (value_part, comment) = match text.split_once('/') {
        Some((value, comment)) => (value.trim(), Some(comment.trim().to_string())),
        None => (text, None),
    };

    let value = if value_part == "T" {
        FitsValue::Logical(true)
    } else if value_part == "F" {
        FitsValue::Logical(false)
    } else if let Ok(i) = value_part.parse::<i64>() {
        FitsValue::Integer(i)
    } else if let Ok(f) = value_part.replace(['D', 'd'], "E").parse::<f64>() {
        FitsValue::Float(f)
    } else {
        FitsValue::String(value_part.to_string())
    };
    (value, comment)
}
