//! Slide format handling.
//!
//! - [`detect`]: the Format Detector, mapping a file to a [`FormatTag`]
//! - [`tiff`]: TIFF/BigTIFF structure parsing and pyramid inspection

pub mod detect;
pub mod tiff;

pub use detect::{detect_format, detect_tiff_vendor, is_tiff_header, FormatTag};
