use crate::convert::FlatImage;
use crate::error::{Error, Overflow, Result};

/// Lay out `bootloader ‖ fill ‖ [loader ‖ fill] ‖ header ‖ application`.
///
/// The header is placed directly before the application base. Every region
/// must start at or after the end of the one before it.
pub fn merge(
    bootloader: &FlatImage,
    loader: Option<&FlatImage>,
    header: &[u8],
    application: &FlatImage,
    fill: u8,
) -> Result<Vec<u8>> {
    let bootloader_end = bootloader.end();
    let header_start = application
        .base
        .checked_sub(header.len() as u64)
        .filter(|start| *start >= bootloader_end)
        .ok_or_else(|| {
            Error::LayoutOverflow(Overflow::BootloaderVsApplication {
                bootloader_end,
                header_start: application.base.saturating_sub(header.len() as u64),
            })
        })?;

    if let Some(loader) = loader {
        if loader.base < bootloader_end {
            return Err(Error::LayoutOverflow(Overflow::BootloaderVsLoader {
                bootloader_end,
                loader_start: loader.base,
            }));
        }
        if header_start < loader.end() {
            return Err(Error::LayoutOverflow(Overflow::LoaderVsApplication {
                loader_end: loader.end(),
                header_start,
            }));
        }
    }

    log::info!("Bootloader base = {:#x}", bootloader.base);
    if let Some(loader) = loader {
        log::info!("Loader base = {:#x}", loader.base);
    }
    log::info!("Writing header = {:#x}", header_start);
    log::info!("Application base = {:#x}", application.base);

    let total = application.end() - bootloader.base;
    let mut image = Vec::with_capacity(total as usize);
    image.extend_from_slice(&bootloader.data);
    if let Some(loader) = loader {
        pad_to(&mut image, bootloader.base, loader.base, fill);
        image.extend_from_slice(&loader.data);
    }
    pad_to(&mut image, bootloader.base, header_start, fill);
    image.extend_from_slice(header);
    image.extend_from_slice(&application.data);
    Ok(image)
}

/// Fill `image`, which starts at `base`, up to `address`.
fn pad_to(image: &mut Vec<u8>, base: u64, address: u64, fill: u8) {
    let len = (address - base) as usize;
    log::debug!("Padding {} bytes up to {:#x}", len - image.len(), address);
    image.resize(len, fill);
}
