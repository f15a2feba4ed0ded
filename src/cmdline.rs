use crate::convert::ImageKind;
use crate::diff::{DiffOptions, DEFAULT_ALIGN};
use crate::error::{Error, Result};
use crate::keys::{ExportKind, KeyKind};
use crate::util::parse_auto_int;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_MAGIC: &str = "SFUM";
pub const DEFAULT_PROTOCOL: u16 = 1;
pub const DEFAULT_RESERVED: usize = 8;
pub const DEFAULT_OFFSET: usize = 512;
pub const DEFAULT_FILL: u8 = 0xff;

/// Parse a decimal or `0x` prefixed number that has to fit in `T`.
fn parse_number<T: TryFrom<u64>>(s: &str) -> std::result::Result<T, String> {
    let value = parse_auto_int(s)?;
    T::try_from(value).map_err(|_| format!("{} is out of range", s))
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Prepare signed firmware images, install headers and delta patches for a secure bootloader."
)]
pub struct Opt {
    // `-v` is taken by the header version and the merge fill byte.
    #[arg(long = "verbose", global = true, help = "Be verbose")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a new key
    Keygen {
        #[arg(short, long, value_name = "FILE")]
        key: PathBuf,
        #[arg(short = 't', long = "type", value_enum)]
        kind: KeyKind,
    },

    /// Print the public part of a key as hex
    Getpub {
        #[arg(short, long, value_name = "FILE")]
        key: PathBuf,
    },

    /// Compute the authentication tag (AES-GCM) or signature (ECDSA) of a file
    Sign {
        #[arg(short, long, value_name = "FILE")]
        key: PathBuf,
        #[arg(short, long, value_name = "FILE", help = "Nonce file, created when missing")]
        nonce: Option<PathBuf>,
        infile: PathBuf,
        outfile: PathBuf,
    },

    /// Hash a file with SHA-256
    Sha256 { infile: PathBuf, outfile: PathBuf },

    /// Encrypt a file
    Enc {
        #[arg(short, long, value_name = "FILE")]
        key: PathBuf,
        #[arg(short, long, value_name = "FILE", help = "Nonce file, created when missing")]
        nonce: Option<PathBuf>,
        #[arg(short, long, value_name = "FILE", help = "IV file, created when missing")]
        iv: Option<PathBuf>,
        infile: PathBuf,
        outfile: PathBuf,
    },

    /// Build the install header consumed by `merge`
    Header(HeaderArgs),

    /// Build an update file: signed header followed by the firmware
    Pack(HeaderArgs),

    /// Merge bootloader, install header and application into one binary
    Merge(MergeArgs),

    /// Compute the differing blocks between two binaries
    Diff(DiffArgs),

    /// Inject key bytes into a source template
    Inject {
        #[arg(short, long, value_name = "FILE")]
        key: PathBuf,
        #[arg(short, long, help = "Marker replaced by the key initializer")]
        pattern: String,
        #[arg(short = 'f', long = "file", value_name = "FILE")]
        template: PathBuf,
        #[arg(short = 't', long = "type", value_enum, default_value_t = ExportKind::Public)]
        export: ExportKind,
        outfile: PathBuf,
    },

    /// Print the value of a #define from a C header
    Conf {
        #[arg(short, long, default_value = crate::conf::DEFAULT_DEFINE)]
        define: String,
        infile: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct HeaderArgs {
    #[arg(short, long, value_name = "FILE")]
    pub key: PathBuf,

    #[arg(short, long, value_name = "FILE")]
    pub nonce: Option<PathBuf>,

    #[arg(short, long, value_name = "FILE")]
    pub iv: Option<PathBuf>,

    #[arg(short, long, value_name = "FILE", help = "Firmware the header describes")]
    pub firmware: PathBuf,

    #[arg(short, long, value_name = "FILE", help = "Authentication tag of the firmware")]
    pub tag: PathBuf,

    #[arg(short = 'v', long, value_parser = parse_number::<u16>)]
    pub version: u16,

    #[arg(short, long, default_value = DEFAULT_MAGIC)]
    pub magic: String,

    #[arg(short, long, default_value_t = DEFAULT_PROTOCOL, value_parser = parse_number::<u16>)]
    pub protocol: u16,

    #[arg(short, long, default_value_t = DEFAULT_RESERVED, value_parser = parse_number::<usize>)]
    pub reserved: usize,

    #[arg(
        short,
        long,
        default_value_t = DEFAULT_OFFSET,
        value_parser = parse_number::<usize>,
        help = "Offset between start of header and firmware"
    )]
    pub offset: usize,

    #[arg(long, alias = "cert_fw_leaf", value_name = "FILE")]
    pub cert_fw_leaf: Option<PathBuf>,

    #[arg(long, alias = "cert_fw_inter", value_name = "FILE")]
    pub cert_fw_inter: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Partial firmware")]
    pub pfw: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        help = "File holding the offset at which the partial firmware applies"
    )]
    pub poffset: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Authentication tag of the partial firmware")]
    pub ptag: Option<PathBuf>,

    pub outfile: PathBuf,
}

/// Files describing a partial update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialFiles {
    pub firmware: PathBuf,
    pub offset: PathBuf,
    pub tag: PathBuf,
}

/// Header options after the checks clap cannot express.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderConfig {
    pub key: PathBuf,
    /// Nonce (AES-GCM) or IV (AES-CBC) file, whichever was given.
    pub nonce: Option<PathBuf>,
    pub firmware: PathBuf,
    pub tag: PathBuf,
    pub version: u16,
    pub magic: String,
    pub protocol: u16,
    pub reserved: usize,
    pub offset: usize,
    pub leaf_cert: Option<PathBuf>,
    pub intermediate_cert: Option<PathBuf>,
    pub partial: Option<PartialFiles>,
    pub output: PathBuf,
}

impl HeaderArgs {
    pub fn validate(self) -> Result<HeaderConfig> {
        let nonce = match (self.nonce, self.iv) {
            (Some(_), Some(_)) => {
                return Err(Error::Configuration(
                    "either --nonce or --iv may be given, not both".to_string(),
                ))
            }
            (nonce, iv) => nonce.or(iv),
        };
        let partial = match (self.pfw, self.poffset, self.ptag) {
            (Some(firmware), Some(offset), Some(tag)) => Some(PartialFiles {
                firmware,
                offset,
                tag,
            }),
            (None, None, None) => None,
            _ => {
                return Err(Error::Configuration(
                    "--pfw, --poffset and --ptag must be given together".to_string(),
                ))
            }
        };
        Ok(HeaderConfig {
            key: self.key,
            nonce,
            firmware: self.firmware,
            tag: self.tag,
            version: self.version,
            magic: self.magic,
            protocol: self.protocol,
            reserved: self.reserved,
            offset: self.offset,
            leaf_cert: self.cert_fw_leaf,
            intermediate_cert: self.cert_fw_inter,
            partial,
            output: self.outfile,
        })
    }
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    #[arg(short, long, value_name = "FILE", help = "Install header built by `header`")]
    pub install: PathBuf,

    #[arg(short = 's', long, alias = "sbsfu", value_name = "FILE", help = "Bootloader ELF")]
    pub bootloader: PathBuf,

    #[arg(short, long, value_name = "FILE", help = "Secondary loader ELF")]
    pub loader: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "value",
        default_value_t = DEFAULT_FILL,
        value_parser = parse_number::<u8>,
        help = "Byte filling the gaps between regions"
    )]
    pub fill: u8,

    #[arg(
        short = 'e',
        long = "elf",
        value_enum,
        default_value_t = ImageKind::LowestSection,
        help = "1 for GNU toolchains, 0 to use the first segment address"
    )]
    pub kind: ImageKind,

    #[arg(help = "Application ELF")]
    pub infile: PathBuf,

    pub outfile: PathBuf,
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    #[arg(short = '1', long, value_name = "FILE")]
    pub file1: PathBuf,

    #[arg(short = '2', long, value_name = "FILE")]
    pub file2: PathBuf,

    #[arg(
        short = 'p',
        long,
        value_name = "FILE",
        help = "Output file for the offset at which the patch applies"
    )]
    pub poffset: PathBuf,

    #[arg(short, long, default_value_t = 0, value_parser = parse_number::<usize>)]
    pub begin: usize,

    #[arg(
        short,
        long,
        default_value_t = 0,
        value_parser = parse_number::<usize>,
        help = "Last compared byte, 0 for the end of the files"
    )]
    pub end: usize,

    #[arg(short, long, default_value_t = DEFAULT_ALIGN, value_parser = parse_number::<usize>)]
    pub align: usize,

    pub outfile: PathBuf,
}

impl DiffArgs {
    pub fn options(&self) -> DiffOptions {
        DiffOptions {
            align: self.align,
            begin: self.begin,
            end: (self.end > 0).then_some(self.end),
        }
    }
}
