use crate::error::{Error, Result};
use std::cmp::Ordering;

pub const DEFAULT_ALIGN: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiffOptions {
    /// Bytes per compared block.
    pub align: usize,
    /// First byte compared. Must start a block.
    pub begin: usize,
    /// Last byte compared, inclusive. Must end a block. `None` compares up to
    /// the end of the files.
    pub end: Option<usize>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            align: DEFAULT_ALIGN,
            begin: 0,
            end: None,
        }
    }
}

impl DiffOptions {
    fn validate(&self) -> Result<()> {
        if self.align == 0 {
            return Err(Error::Range(
                "alignment must be greater than 0".to_string(),
            ));
        }
        if self.begin % self.align != 0 {
            return Err(Error::Range(format!(
                "begin ({}) must be a multiple of the alignment ({})",
                self.begin, self.align
            )));
        }
        if let Some(end) = self.end {
            if end % self.align != self.align - 1 {
                return Err(Error::Range(format!(
                    "end ({}) must be the last offset of a block of {} bytes",
                    end, self.align
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    pub first_block: usize,
    pub align: usize,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diff {
    /// No difference within the compared range and nothing to append.
    Identical,
    Changed(Patch),
}

impl Diff {
    /// Byte offset at which the patch applies. Identical inputs report 0
    /// together with an empty patch.
    pub fn offset(&self) -> usize {
        match self {
            Diff::Identical => 0,
            Diff::Changed(patch) => patch.first_block * patch.align,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Diff::Identical => &[],
            Diff::Changed(patch) => &patch.data,
        }
    }
}

/// Compare `old` and `new` block by block.
///
/// When `new` is longer than the compared range, the blocks past the end of
/// `old` (up to `end`, or the end of `new`) are carried in the patch even if
/// nothing before them differs.
pub fn diff(old: &[u8], new: &[u8], options: &DiffOptions) -> Result<Diff> {
    options.validate()?;
    let align = options.align;
    for (name, data) in [("first", old), ("second", new)] {
        if data.len() % align != 0 {
            return Err(Error::Range(format!(
                "{} file size ({}) is not a multiple of the alignment ({})",
                name,
                data.len(),
                align
            )));
        }
    }
    if let Some(end) = options.end {
        if end >= new.len() {
            return Err(Error::Range(format!(
                "end ({}) must be within the second file ({} bytes)",
                end,
                new.len()
            )));
        }
    }

    // Exclusive byte bounds of the comparison and of the trailing copy.
    let end_within = |limit: usize| options.end.filter(|end| *end < limit).map(|end| end + 1);
    let (cmp_end, copy_end) = match old.len().cmp(&new.len()) {
        Ordering::Equal => (end_within(old.len()).unwrap_or(old.len()), None),
        Ordering::Greater => (end_within(new.len()).unwrap_or(new.len()), None),
        Ordering::Less => match end_within(old.len()) {
            Some(end) => (end, None),
            None => (
                old.len(),
                Some(end_within(new.len()).unwrap_or(new.len())),
            ),
        },
    };

    let mut first_diff = None;
    let mut last_diff = None;
    for block in options.begin / align..cmp_end / align {
        let range = block * align..(block + 1) * align;
        if old[range.clone()] == new[range] {
            continue;
        }
        if first_diff.is_none() {
            first_diff = Some(block);
            if let Some(copy_end) = copy_end {
                last_diff = Some(copy_end / align - 1);
                break;
            }
        }
        last_diff = Some(block);
    }

    let (first_block, last_block) = match (first_diff, last_diff, copy_end) {
        (Some(first), Some(last), _) => (first, last),
        (_, _, Some(copy_end)) => (old.len() / align, copy_end / align - 1),
        _ => {
            log::info!(
                "Input files are identical within comparison range ({}, {})",
                options.begin,
                cmp_end.saturating_sub(1)
            );
            return Ok(Diff::Identical);
        }
    };

    log::debug!(
        "Blocks {}..={} differ, patch of {} bytes",
        first_block,
        last_block,
        (last_block + 1 - first_block) * align
    );
    Ok(Diff::Changed(Patch {
        first_block,
        align,
        data: new[first_block * align..(last_block + 1) * align].to_vec(),
    }))
}
