use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IoError;

/// Random-access reads over a slide file.
///
/// The TIFF parser and the format probes only look at headers and directory
/// tables, so they fetch small ranges instead of whole multi-gigabyte slides.
#[async_trait]
pub trait RangeReader: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Fails if the range runs past the end of the resource.
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError>;

    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Name used in log lines and errors.
    fn identifier(&self) -> &str;
}
