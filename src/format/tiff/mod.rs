//! TIFF parser for Whole Slide Images.
//!
//! Most scanner formats (Aperio SVS, Leica SCN, Philips TIFF, Ventana BIF,
//! Hamamatsu NDPI, generic pyramidal TIFF) are TIFF containers. This module
//! reads just enough of them to tell vendors apart and to count pyramid
//! levels; pixel data is never decoded.
//!
//! - **Byte order**: II = little-endian, MM = big-endian, declared in the header.
//! - **Classic TIFF vs BigTIFF**: 32-bit vs 64-bit offsets, handled transparently.
//! - **IFD**: one per image (pyramid level, label, macro, thumbnail).

mod parser;
mod pyramid;
mod tags;

pub use parser::{
    read_entry_bytes, read_header, read_ifd, ByteOrder, Ifd, IfdEntry, TiffHeader,
    BIGTIFF_HEADER_SIZE, TIFF_HEADER_SIZE,
};
pub use pyramid::{PyramidLevel, TiffPyramid};
pub use tags::{FieldType, TiffTag};
