use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which region could not be placed when laying out an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overflow {
    /// The assembled header does not fit in the offset budget.
    HeaderBudget { needed: usize, offset: usize },
    /// The header would start before the bootloader ends.
    BootloaderVsApplication { bootloader_end: u64, header_start: u64 },
    /// The loader would start before the bootloader ends.
    BootloaderVsLoader { bootloader_end: u64, loader_start: u64 },
    /// The header would start before the loader ends.
    LoaderVsApplication { loader_end: u64, header_start: u64 },
}

impl fmt::Display for Overflow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Overflow::HeaderBudget { needed, offset } => write!(
                f,
                "header needs {} bytes but the offset budget is {} bytes",
                needed, offset
            ),
            Overflow::BootloaderVsApplication {
                bootloader_end,
                header_start,
            } => write!(
                f,
                "bootloader is too large to merge with application (bootloader ends at {:#x}, header starts at {:#x})",
                bootloader_end, header_start
            ),
            Overflow::BootloaderVsLoader {
                bootloader_end,
                loader_start,
            } => write!(
                f,
                "bootloader is too large to merge with loader (bootloader ends at {:#x}, loader starts at {:#x})",
                bootloader_end, loader_start
            ),
            Overflow::LoaderVsApplication {
                loader_end,
                header_start,
            } => write!(
                f,
                "loader is too large to merge with application (loader ends at {:#x}, header starts at {:#x})",
                loader_end, header_start
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The key cannot perform the requested operation.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("invalid length for {what}: expected {expected}, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: String,
        actual: usize,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("layout overflow: {0}")]
    LayoutOverflow(Overflow),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("range error: {0}")]
    Range(String),

    /// The cryptographic provider rejected an operation or could not draw
    /// entropy.
    #[error("cryptographic provider failure: {0}")]
    Crypto(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed ELF file: {0}")]
    Elf(#[from] elf::ParseError),
}

impl Error {
    pub fn io(path: &Path, source: io::Error) -> Self {
        Error::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Process exit code for this error. The merge overlap checks keep
    /// distinct codes so build scripts can tell the regions apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::LayoutOverflow(Overflow::BootloaderVsLoader { .. }) => 2,
            Error::LayoutOverflow(Overflow::LoaderVsApplication { .. }) => 3,
            _ => 1,
        }
    }
}
