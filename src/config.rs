//! Command-line and environment configuration.
//!
//! Every setting can be given as a flag or through an environment variable
//! with the `DICOMIZER_` prefix:
//!
//! - `DICOMIZER_STORAGE_ROOT` - directory holding the `wsi` and `dicoms` stores (default: ./storage)
//! - `DICOMIZER_SCRATCH_DIR` - parent of per-request scratch directories (default: system temp dir)
//! - `DICOMIZER_CONVERTER` - external converter executable (default: OrthancWSIDicomizer)
//! - `DICOMIZER_OPENSLIDE` - OpenSlide library passed to the converter (default: libopenslide.so.1)
//! - `DICOMIZER_MAX_SIZE` - converter `--max-size` value (default: 10)
//! - `DICOMIZER_LIBRARY_BRIDGE` - WSI library bridge executable (default: wsi-library-bridge)
//! - `DICOMIZER_TIMEOUT` - per-slide conversion timeout in seconds (default: 3600)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::dicomizer::{
    DicomizerSet, LibraryBridge, LibraryDicomizer, SubprocessDicomizer, SubprocessSettings,
};
use crate::error::StoreError;
use crate::pipeline::StudyPipeline;
use crate::store::{Stores, DICOMS_STORE, WSI_STORE};

// =============================================================================
// Default Values
// =============================================================================

/// Default storage root.
pub const DEFAULT_STORAGE_ROOT: &str = "./storage";

/// Default external converter executable.
pub const DEFAULT_CONVERTER: &str = "OrthancWSIDicomizer";

/// Default OpenSlide library handed to the converter.
pub const DEFAULT_OPENSLIDE: &str = "libopenslide.so.1";

/// Default converter `--max-size`.
pub const DEFAULT_MAX_SIZE: u32 = 10;

/// Default library bridge executable.
pub const DEFAULT_LIBRARY_BRIDGE: &str = "wsi-library-bridge";

/// Default per-slide conversion timeout (1 hour).
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

// =============================================================================
// CLI Arguments
// =============================================================================

/// WSI Dicomizer - converts Whole Slide Images into DICOM studies.
#[derive(Parser, Debug, Clone)]
#[command(name = "wsi-dicomizer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Storage
    // =========================================================================
    /// Directory holding the `wsi` and `dicoms` stores.
    #[arg(long, default_value = DEFAULT_STORAGE_ROOT, env = "DICOMIZER_STORAGE_ROOT", global = true)]
    pub storage_root: PathBuf,

    /// Parent directory for per-request scratch space.
    ///
    /// Defaults to the system temporary directory.
    #[arg(long, env = "DICOMIZER_SCRATCH_DIR", global = true)]
    pub scratch_dir: Option<PathBuf>,

    // =========================================================================
    // Converters
    // =========================================================================
    /// External converter executable.
    #[arg(long, default_value = DEFAULT_CONVERTER, env = "DICOMIZER_CONVERTER", global = true)]
    pub converter: PathBuf,

    /// OpenSlide shared library passed to the external converter.
    #[arg(long, default_value = DEFAULT_OPENSLIDE, env = "DICOMIZER_OPENSLIDE", global = true)]
    pub openslide: PathBuf,

    /// Value of the external converter's `--max-size` flag.
    #[arg(long, default_value_t = DEFAULT_MAX_SIZE, env = "DICOMIZER_MAX_SIZE", global = true)]
    pub max_size: u32,

    /// WSI library bridge executable.
    #[arg(long, default_value = DEFAULT_LIBRARY_BRIDGE, env = "DICOMIZER_LIBRARY_BRIDGE", global = true)]
    pub library_bridge: PathBuf,

    /// Per-slide conversion timeout in seconds; the converter is killed when it expires.
    #[arg(long = "timeout", default_value_t = DEFAULT_TIMEOUT_SECS, env = "DICOMIZER_TIMEOUT", global = true)]
    pub timeout_secs: u64,

    // =========================================================================
    // Logging
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false, global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Store a slide or a ZIP of slides in the `wsi` store.
    Ingest {
        /// Slide file or ZIP archive
        path: PathBuf,
    },

    /// Convert a study request and store the resulting archive.
    Convert {
        /// JSON request file, or `-` for stdin
        request: PathBuf,
    },

    /// Copy a stored study archive out of the `dicoms` store.
    Fetch {
        /// Study Instance UID (or legacy archive id)
        study_uid: String,

        /// Destination file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show the detected format and pyramid of a stored slide.
    Inspect {
        wsi_id: String,
    },

    /// List the contents of a store.
    List {
        #[arg(value_enum, default_value_t = StoreName::Wsi)]
        store: StoreName,

        /// Subdirectory to list
        #[arg(default_value = "")]
        dir: String,
    },

    /// Delete a stored slide.
    Delete {
        wsi_id: String,
    },

    /// Validate configuration and locate the converter executables.
    Check,
}

/// Named stores addressable from the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreName {
    Wsi,
    Dicoms,
}

impl StoreName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Wsi => WSI_STORE,
            StoreName::Dicoms => DICOMS_STORE,
        }
    }
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(
                "Storage root is required. Set --storage-root or DICOMIZER_STORAGE_ROOT".to_string(),
            );
        }
        if self.storage_root.is_file() {
            return Err(format!(
                "Storage root {} is a file, expected a directory",
                self.storage_root.display()
            ));
        }
        if let Some(scratch) = &self.scratch_dir {
            if !scratch.is_dir() {
                return Err(format!(
                    "Scratch directory {} does not exist",
                    scratch.display()
                ));
            }
        }

        if self.converter.as_os_str().is_empty() {
            return Err("converter executable must not be empty".to_string());
        }
        if self.library_bridge.as_os_str().is_empty() {
            return Err("library bridge executable must not be empty".to_string());
        }
        if self.max_size == 0 {
            return Err("max_size must be greater than 0".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("timeout must be greater than 0 seconds".to_string());
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Scratch parent directory.
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn subprocess_settings(&self) -> SubprocessSettings {
        SubprocessSettings {
            executable: self.converter.clone(),
            openslide: self.openslide.clone(),
            max_size: self.max_size,
            timeout: self.timeout(),
            scratch_dir: self.scratch_root(),
        }
    }

    /// Both conversion engines as configured.
    pub fn dicomizers(&self) -> DicomizerSet {
        let subprocess = SubprocessDicomizer::new(self.subprocess_settings());
        let bridge = LibraryBridge::new(
            self.library_bridge.clone(),
            self.timeout(),
            self.scratch_root(),
        );
        DicomizerSet::new(
            Arc::new(subprocess),
            Arc::new(LibraryDicomizer::new(Arc::new(bridge))),
        )
    }

    /// Open (creating if needed) the stores under the storage root.
    pub fn stores(&self) -> Result<Stores, StoreError> {
        Stores::under(&self.storage_root)
    }

    pub fn pipeline(&self) -> Result<StudyPipeline, StoreError> {
        Ok(StudyPipeline::new(
            self.stores()?,
            self.dicomizers(),
            self.scratch_root(),
        ))
    }
}

/// Locate an executable: paths with a directory component are checked
/// directly, bare names are searched on `PATH`.
pub fn resolve_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

// =============================================================================
// Tests
// =============================================================================
