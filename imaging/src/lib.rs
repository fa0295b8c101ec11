//! Guider Frame Output
//!
//! FITS I/O for the guide camera pipeline.
//!
//! ## Features
//!
//! - Single-HDU 16-bit FITS writing (2880-byte blocks, BZERO = 32768)
//! - Ordered header cards with per-card comments
//! - Compact reader for round-trip checks and offline tooling

mod fits;

pub use fits::{
    read_u16_fits, write_u16_fits, Card, FitsError, FitsHeader, FitsImage, FitsResult, FitsValue,
};
