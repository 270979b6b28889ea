//! TIFF pyramid level identification.
//!
//! A WSI file holds many IFDs, but not all are pyramid levels: labels,
//! macro overviews, and thumbnails sit alongside them. The Library engine
//! needs the native level count to decide whether missing levels have to be
//! synthesized, and `inspect` reports per-level geometry.
//!
//! # Identification Heuristics
//!
//! Pyramid levels:
//! 1. Must be tiled (have TileWidth/TileLength/TileOffsets tags)
//! 2. Are at least 256 pixels on each side
//! 3. Downsample from the largest image by roughly a power of two
//!
//! Small, square-ish tiled images are treated as labels and skipped.

use serde::Serialize;

use crate::error::TiffError;
use crate::io::RangeReader;

use super::parser::{read_header, read_ifd, ByteOrder, Ifd, TiffHeader};
use super::tags::TiffTag;

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of IFDs to walk (safety limit against cyclic chains)
const MAX_IFDS: usize = 100;

/// Images smaller than this on either side are likely thumbnails
const MIN_PYRAMID_DIMENSION: u32 = 256;

/// Square-ish tiled images at or below this size are treated as labels
const MAX_LABEL_DIMENSION: u32 = 1000;

// =============================================================================
// PyramidLevel
// =============================================================================

/// A single level in the image pyramid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PyramidLevel {
    /// Index in the pyramid (0 = full resolution)
    pub level_index: usize,

    /// Index of the backing IFD in the file
    pub ifd_index: usize,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Tile width in pixels
    pub tile_width: u32,

    /// Tile height in pixels
    pub tile_height: u32,

    /// Downsample factor relative to level 0
    pub downsample: f64,
}

impl PyramidLevel {
    /// Build a level candidate from a tiled IFD.
    ///
    /// Returns `None` if the IFD lacks any of the geometry or tile tags.
    fn from_ifd(ifd: &Ifd, ifd_index: usize, byte_order: ByteOrder) -> Option<Self> {
        ifd.get_entry_by_tag(TiffTag::TileOffsets)?;

        Some(PyramidLevel {
            level_index: 0,
            ifd_index,
            width: ifd.get_u32(TiffTag::ImageWidth, byte_order)?,
            height: ifd.get_u32(TiffTag::ImageLength, byte_order)?,
            tile_width: ifd.get_u32(TiffTag::TileWidth, byte_order)?,
            tile_height: ifd.get_u32(TiffTag::TileLength, byte_order)?,
            downsample: 1.0,
        })
    }

    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

// =============================================================================
// TiffPyramid
// =============================================================================

/// Pyramid structure of a TIFF-based slide.
#[derive(Debug, Clone)]
pub struct TiffPyramid {
    /// The TIFF header
    pub header: TiffHeader,

    /// Pyramid levels, sorted by resolution (0 = highest)
    pub levels: Vec<PyramidLevel>,

    /// Number of IFDs that were not pyramid levels (label, macro, thumbnail)
    pub associated_images: usize,
}

impl TiffPyramid {
    /// Parse a TIFF file and identify its pyramid levels.
    pub async fn parse<R: RangeReader>(reader: &R) -> Result<Self, TiffError> {
        let header = read_header(reader).await?;
        let ifds = Self::parse_all_ifds(reader, &header).await?;
        Ok(Self::build_pyramid(header, &ifds))
    }

    /// Parse all IFDs following the next-IFD chain.
    async fn parse_all_ifds<R: RangeReader>(
        reader: &R,
        header: &TiffHeader,
    ) -> Result<Vec<Ifd>, TiffError> {
        let mut ifds = Vec::new();
        let mut offset = header.first_ifd_offset;

        while offset != 0 && ifds.len() < MAX_IFDS {
            let ifd = read_ifd(reader, header, offset).await?;
            offset = ifd.next_ifd_offset;
            ifds.push(ifd);
        }

        Ok(ifds)
    }

    fn build_pyramid(header: TiffHeader, ifds: &[Ifd]) -> Self {
        let mut candidates: Vec<PyramidLevel> = ifds
            .iter()
            .enumerate()
            .filter(|(_, ifd)| ifd.is_tiled())
            .filter_map(|(i, ifd)| PyramidLevel::from_ifd(ifd, i, header.byte_order))
            .filter(Self::is_pyramid_candidate)
            .collect();

        // Largest first = level 0
        candidates.sort_by_key(|level| std::cmp::Reverse(level.area()));

        let levels = Self::filter_pyramid_levels(candidates);
        let associated_images = ifds.len() - levels.len();

        TiffPyramid {
            header,
            levels,
            associated_images,
        }
    }

    fn is_pyramid_candidate(level: &PyramidLevel) -> bool {
        if level.width < MIN_PYRAMID_DIMENSION || level.height < MIN_PYRAMID_DIMENSION {
            return false;
        }

        if level.width <= MAX_LABEL_DIMENSION && level.height <= MAX_LABEL_DIMENSION {
            let aspect_ratio = level.width as f64 / level.height as f64;
            if aspect_ratio > 0.5 && aspect_ratio < 2.0 {
                return false;
            }
        }

        true
    }

    /// Keep only levels whose downsample from level 0 is close to a power of two.
    fn filter_pyramid_levels(candidates: Vec<PyramidLevel>) -> Vec<PyramidLevel> {
        let Some(base) = candidates.first() else {
            return candidates;
        };
        let base_width = base.width as f64;
        let base_height = base.height as f64;

        let mut levels: Vec<PyramidLevel> = Vec::new();
        for mut level in candidates {
            let downsample =
                (base_width / level.width as f64 + base_height / level.height as f64) / 2.0;

            if Self::is_valid_downsample(downsample, levels.len())
                && levels
                    .last()
                    .map_or(true, |prev| downsample > prev.downsample * 1.5)
            {
                level.level_index = levels.len();
                level.downsample = downsample;
                levels.push(level);
            }
        }

        levels
    }

    fn is_valid_downsample(downsample: f64, level_idx: usize) -> bool {
        if level_idx == 0 {
            return (downsample - 1.0).abs() < 0.1;
        }

        let rounded = downsample.log2().round();
        if rounded < 1.0 {
            return false;
        }

        // 20% tolerance around the nearest power of two
        let ratio = downsample / 2.0_f64.powf(rounded);
        ratio > 0.8 && ratio < 1.2
    }

    /// Number of pyramid levels.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Dimensions of level 0.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.levels.first().map(|l| (l.width, l.height))
    }
}
