//! Format detection for Whole Slide Image files.
//!
//! Detection runs two probes in order:
//!
//! 1. **Pyramidal image probe**: the vendor formats OpenSlide understands.
//!    TIFF containers are told apart by markers in their first IFD (Aperio
//!    ImageDescription, Leica SCN XML, Philips `DPUfsImport` XML, Ventana
//!    `iScan` XMP, Trestle `MedScan` software tag, Hamamatsu NDPI private tag);
//!    any other tiled TIFF is generic. Hamamatsu VMS/VMU and MIRAX are
//!    recognised by their index files.
//! 2. **Container probe**: Philips iSyntax, an XML header followed by a
//!    proprietary payload.
//!
//! Unreadable or unrecognised input is not an error: [`detect_format`]
//! returns `None` and the caller treats that as "unknown".

use std::fmt;
use std::path::Path;

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::TiffError;
use crate::io::{FileRangeReader, RangeReader};

use super::tiff::{
    read_entry_bytes, read_header, read_ifd, ByteOrder, Ifd, TiffHeader, TiffTag,
    TIFF_HEADER_SIZE,
};

// =============================================================================
// FormatTag
// =============================================================================

/// Detected slide format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatTag {
    /// Aperio SVS (TIFF with "Aperio" ImageDescription)
    Aperio,

    /// Hamamatsu NDPI, VMS or VMU
    Hamamatsu,

    /// Leica SCN (TIFF with Leica XML description)
    Leica,

    /// 3DHistech MIRAX (`.mrxs` index plus data directory)
    Mirax,

    /// Philips TIFF export
    Philips,

    /// Trestle TIFF
    Trestle,

    /// Ventana BIF
    Ventana,

    /// Any other tiled TIFF
    GenericTiff,

    /// Philips iSyntax container
    Isyntax,
}

impl FormatTag {
    /// Vendor name as OpenSlide reports it.
    pub const fn name(&self) -> &'static str {
        match self {
            FormatTag::Aperio => "aperio",
            FormatTag::Hamamatsu => "hamamatsu",
            FormatTag::Leica => "leica",
            FormatTag::Mirax => "mirax",
            FormatTag::Philips => "philips",
            FormatTag::Trestle => "trestle",
            FormatTag::Ventana => "ventana",
            FormatTag::GenericTiff => "generic-tiff",
            FormatTag::Isyntax => "isyntax",
        }
    }

    /// Whether the format is a TIFF container the pyramid parser can read.
    pub const fn is_tiff(&self) -> bool {
        matches!(
            self,
            FormatTag::Aperio
                | FormatTag::Hamamatsu
                | FormatTag::Leica
                | FormatTag::Philips
                | FormatTag::Trestle
                | FormatTag::Ventana
                | FormatTag::GenericTiff
        )
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Markers
// =============================================================================

/// Maximum bytes to read from string tags; markers sit near the start.
const MAX_DESCRIPTION_BYTES: usize = 4096;

/// Bytes scanned for the iSyntax XML header.
const ISYNTAX_PROBE_BYTES: usize = 4096;

const APERIO_MARKER: &[u8] = b"Aperio";
const LEICA_MARKER: &[u8] = b"leica-microsystems.com/scn";
const PHILIPS_MARKER: &[u8] = b"DPUfsImport";
const VENTANA_MARKER: &[u8] = b"iScan";
const TRESTLE_MARKER: &[u8] = b"MedScan";
const ISYNTAX_ROOT_MARKER: &[u8] = b"<DataObject";
const VMS_HEADER: &[u8] = b"[Virtual Microscope Specimen]";

/// File MIRAX keeps in its data directory.
const MIRAX_SLIDEDAT: &str = "Slidedat.ini";

// =============================================================================
// Format Detection
// =============================================================================

/// Detect the format of the slide at `path`.
///
/// Returns `None` when neither probe recognises the input, including when
/// the file cannot be read at all.
pub async fn detect_format(path: &Path) -> Option<FormatTag> {
    if let Some(format) = probe_pyramidal(path).await {
        debug!(path = %path.display(), format = %format, "detected slide format");
        return Some(format);
    }

    if probe_isyntax(path).await {
        debug!(path = %path.display(), "detected iSyntax container");
        return Some(FormatTag::Isyntax);
    }

    debug!(path = %path.display(), "no slide format recognised");
    None
}

/// Primary probe: OpenSlide-style vendor formats.
async fn probe_pyramidal(path: &Path) -> Option<FormatTag> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }

    match extension_lowercase(path).as_deref() {
        Some("mrxs") => return probe_mirax(path).await,
        Some("vms") | Some("vmu") => return probe_vms(path).await,
        _ => {}
    }

    let reader = FileRangeReader::open(path).await.ok()?;
    match detect_tiff_vendor(&reader).await {
        Ok(format) => format,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "TIFF probe failed");
            None
        }
    }
}

/// MIRAX needs its index file plus a same-name directory holding Slidedat.ini.
async fn probe_mirax(path: &Path) -> Option<FormatTag> {
    let data_dir = path.with_extension("");
    let slidedat = data_dir.join(MIRAX_SLIDEDAT);
    match tokio::fs::metadata(&slidedat).await {
        Ok(m) if m.is_file() => Some(FormatTag::Mirax),
        _ => None,
    }
}

async fn probe_vms(path: &Path) -> Option<FormatTag> {
    let head = read_prefix(path, VMS_HEADER.len() + 3).await?;
    // Tolerate a UTF-8 BOM
    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&head[..]);
    head.starts_with(VMS_HEADER).then_some(FormatTag::Hamamatsu)
}

/// Secondary probe: iSyntax XML header.
async fn probe_isyntax(path: &Path) -> bool {
    match read_prefix(path, ISYNTAX_PROBE_BYTES).await {
        Some(head) => is_isyntax_header(&head),
        None => false,
    }
}

/// Classify a TIFF container by the markers in its first IFD.
///
/// Returns `Ok(None)` for input that is not TIFF or is an untiled TIFF
/// without vendor markers.
pub async fn detect_tiff_vendor<R: RangeReader>(
    reader: &R,
) -> Result<Option<FormatTag>, TiffError> {
    if reader.size() < TIFF_HEADER_SIZE as u64 {
        return Ok(None);
    }
    let magic = reader.read_exact_at(0, TIFF_HEADER_SIZE).await?;
    if !is_tiff_header(&magic) {
        return Ok(None);
    }

    let header = read_header(reader).await?;
    let ifd = read_ifd(reader, &header, header.first_ifd_offset).await?;

    let description = read_string_tag(reader, &header, &ifd, TiffTag::ImageDescription).await?;
    if contains_marker(&description, APERIO_MARKER) {
        return Ok(Some(FormatTag::Aperio));
    }
    if contains_marker(&description, LEICA_MARKER) {
        return Ok(Some(FormatTag::Leica));
    }
    if contains_marker(&description, PHILIPS_MARKER) {
        return Ok(Some(FormatTag::Philips));
    }

    if ifd.get_entry_by_tag(TiffTag::NdpiFormatFlag).is_some() {
        return Ok(Some(FormatTag::Hamamatsu));
    }

    let xmp = read_string_tag(reader, &header, &ifd, TiffTag::XmlPacket).await?;
    if contains_marker(&xmp, VENTANA_MARKER) {
        return Ok(Some(FormatTag::Ventana));
    }

    let software = read_string_tag(reader, &header, &ifd, TiffTag::Software).await?;
    if software.starts_with(TRESTLE_MARKER) {
        return Ok(Some(FormatTag::Trestle));
    }

    if ifd.is_tiled() {
        return Ok(Some(FormatTag::GenericTiff));
    }

    Ok(None)
}

/// Read a string-ish tag, returning an empty buffer when it is absent.
async fn read_string_tag<R: RangeReader>(
    reader: &R,
    header: &TiffHeader,
    ifd: &Ifd,
    tag: TiffTag,
) -> Result<Vec<u8>, TiffError> {
    match ifd.get_entry_by_tag(tag) {
        Some(entry) => read_entry_bytes(reader, header, entry, MAX_DESCRIPTION_BYTES).await,
        None => Ok(Vec::new()),
    }
}

async fn read_prefix(path: &Path, max_len: usize) -> Option<Vec<u8>> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut buf = Vec::with_capacity(max_len);
    file.take(max_len as u64).read_to_end(&mut buf).await.ok()?;
    Some(buf)
}

fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Check if bytes contain a marker.
fn contains_marker(data: &[u8], marker: &[u8]) -> bool {
    data.windows(marker.len()).any(|window| window == marker)
}

/// iSyntax files open with an XML `DataObject` of type `DPUfsImport`.
fn is_isyntax_header(head: &[u8]) -> bool {
    !is_tiff_header(head)
        && contains_marker(head, ISYNTAX_ROOT_MARKER)
        && contains_marker(head, PHILIPS_MARKER)
}

/// Check if bytes represent a valid TIFF header.
pub fn is_tiff_header(bytes: &[u8]) -> bool {
    if bytes.len() < TIFF_HEADER_SIZE {
        return false;
    }

    let byte_order = match [bytes[0], bytes[1]] {
        [0x49, 0x49] => ByteOrder::LittleEndian,
        [0x4D, 0x4D] => ByteOrder::BigEndian,
        _ => return false,
    };

    let version = byte_order.read_u16(&bytes[2..4]);
    version == 42 || version == 43
}

// =============================================================================
// Tests
// =============================================================================
