use crate::error::{Error, Result};
use crate::util;
use elf::endian::AnyEndian;
use elf::ElfBytes;
use std::path::Path;

/// Gaps this large usually mean a segment that belongs in RAM was marked as
/// loadable from flash.
const LARGE_GAP: u64 = 4096;

/// One loadable piece of a program: physical load address and file bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub address: u64,
    pub data: Vec<u8>,
}

/// Source of loadable segments for [`flatten`].
pub trait SegmentReader {
    /// `PT_LOAD` segments in program header order.
    fn loadable_segments(&self) -> Result<Vec<Segment>>;

    /// Start address of every section, in section header order.
    fn section_addresses(&self) -> Result<Vec<u64>>;
}

/// How the base address of a flattened image is chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ImageKind {
    /// Physical address of the first loadable segment.
    #[value(name = "0", alias = "physical")]
    Physical,
    /// Lowest non-zero section address. GNU linkers may start the first
    /// segment below the first section, so the segment is cut to match.
    #[default]
    #[value(name = "1", alias = "gnu")]
    LowestSection,
}

/// A contiguous image and the address its first byte is loaded at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatImage {
    pub base: u64,
    pub data: Vec<u8>,
}

impl FlatImage {
    /// First address after the image.
    pub fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }
}

pub struct ElfImage<'data> {
    file: ElfBytes<'data, AnyEndian>,
}

impl<'data> ElfImage<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        Ok(Self {
            file: ElfBytes::<AnyEndian>::minimal_parse(data)?,
        })
    }
}

impl SegmentReader for ElfImage<'_> {
    fn loadable_segments(&self) -> Result<Vec<Segment>> {
        let phdrs = match self.file.segments() {
            Some(phdrs) => phdrs,
            None => return Ok(Vec::new()),
        };
        phdrs
            .iter()
            .filter(|phdr| phdr.p_type == elf::abi::PT_LOAD)
            .map(|phdr| -> Result<Segment> {
                Ok(Segment {
                    address: phdr.p_paddr,
                    data: self.file.segment_data(&phdr)?.to_vec(),
                })
            })
            .collect()
    }

    fn section_addresses(&self) -> Result<Vec<u64>> {
        Ok(self
            .file
            .section_headers()
            .map(|shdrs| shdrs.iter().map(|shdr| shdr.sh_addr).collect())
            .unwrap_or_default())
    }
}

/// Read and flatten the ELF file at `path`.
pub fn flatten_elf(path: &Path, fill: u8, kind: ImageKind) -> Result<FlatImage> {
    let contents = util::read_file(path)?;
    let image = ElfImage::parse(&contents)?;
    let flat = flatten(&image, fill, kind)?;
    log::info!(
        "{}: base {:#x}, {} bytes",
        path.display(),
        flat.base,
        flat.data.len()
    );
    Ok(flat)
}

/// Place all non-empty loadable segments of `reader` into one buffer, filling
/// the gaps between them with `fill`.
pub fn flatten<R: SegmentReader + ?Sized>(reader: &R, fill: u8, kind: ImageKind) -> Result<FlatImage> {
    let segments = reader.loadable_segments()?;
    log::debug!("Number of loadable segments: {}", segments.len());

    // Segments with no file data go to RAM, not flash.
    let mut segments = segments.into_iter().filter(|segment| !segment.data.is_empty());
    let first = segments.next().ok_or_else(|| {
        Error::UnsupportedFormat("no loadable segment with data to flatten".to_string())
    })?;

    let mut image = match kind {
        ImageKind::Physical => FlatImage {
            base: first.address,
            data: first.data,
        },
        ImageKind::LowestSection => {
            let lowest = reader
                .section_addresses()?
                .into_iter()
                .filter(|addr| *addr != 0)
                .min()
                .unwrap_or(first.address);
            let cut = lowest
                .checked_sub(first.address)
                .map(|cut| cut as usize)
                .filter(|cut| *cut <= first.data.len())
                .ok_or_else(|| {
                    Error::UnsupportedFormat(format!(
                        "lowest section at {:#x} is outside the first segment [{:#x}, {:#x})",
                        lowest,
                        first.address,
                        first.address + first.data.len() as u64
                    ))
                })?;
            if cut > 0 {
                log::debug!(
                    "Dropping {} bytes before the lowest section at {:#x}",
                    cut,
                    lowest
                );
            }
            FlatImage {
                base: lowest,
                data: first.data[cut..].to_vec(),
            }
        }
    };

    let mut next_address = image.end();
    for segment in segments {
        match segment.address.checked_sub(next_address) {
            Some(padding) => {
                if padding > 0 {
                    log::debug!("Including padding between segments size={}", padding);
                    if padding >= LARGE_GAP {
                        log::warn!(
                            "Inserting a large amount of padding ({} bytes) before {:#x}",
                            padding,
                            segment.address
                        );
                    }
                    image.data.resize(image.data.len() + padding as usize, fill);
                }
            }
            None => log::warn!(
                "Segment at {:#x} starts before the previous one ends at {:#x}, not inserting padding",
                segment.address,
                next_address
            ),
        }
        log::debug!(
            "Adding segment. Address: {:#x}. Length: {} bytes.",
            segment.address,
            segment.data.len()
        );
        next_address = segment.address + segment.data.len() as u64;
        image.data.extend_from_slice(&segment.data);
    }

    Ok(image)
}
