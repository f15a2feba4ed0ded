use crate::error::{Error, Overflow, Result};
use crate::keys::{Key, ECDSA_SIGNATURE_LEN, GCM_TAG_LEN};
use crate::util;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;

pub const MAGIC_LEN: usize = 4;

/// Space kept free for the signature at the end of a header with
/// certificates.
pub const SIGNATURE_RESERVATION: usize = 64;

/// Each install header carries its signature three times in slots of this
/// size, so a single corrupted slot does not invalidate the image.
pub const INSTALL_SLOT_LEN: usize = 32;
pub const INSTALL_SLOT_COUNT: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderVariant {
    /// Header that directly precedes a firmware payload in an update file.
    Pack,
    /// Header written into flash by the merge step, followed by the
    /// signature slots.
    Install,
}

impl HeaderVariant {
    fn reservation(self) -> usize {
        match self {
            HeaderVariant::Pack => SIGNATURE_RESERVATION,
            HeaderVariant::Install => {
                SIGNATURE_RESERVATION + INSTALL_SLOT_COUNT * INSTALL_SLOT_LEN
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct HeaderBase {
    magic: [u8; MAGIC_LEN],
    protocol: u16,
    version: u16,
    fw_size: u32,
    partial_offset: u32,
    partial_size: u32,
}

impl HeaderBase {
    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.magic)?;
        out.write_all(&self.protocol.to_le_bytes())?;
        out.write_all(&self.version.to_le_bytes())?;
        out.write_all(&self.fw_size.to_le_bytes())?;
        out.write_all(&self.partial_offset.to_le_bytes())?;
        out.write_all(&self.partial_size.to_le_bytes())
    }
}

impl fmt::Display for HeaderBase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "
                 magic: {0:>8}
              protocol: {1:>8} {1:>#10X}
               version: {2:>8} {2:>#10X}
               fw_size: {3:>8} {3:>#10X}
        partial_offset: {4:>8} {4:>#10X}
          partial_size: {5:>8} {5:>#10X}",
            String::from_utf8_lossy(&self.magic),
            self.protocol,
            self.version,
            self.fw_size,
            self.partial_offset,
            self.partial_size,
        )
    }
}

/// Incremental install described relative to an image already in flash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialUpdate {
    pub offset: u32,
    pub size: u32,
    pub tag: Vec<u8>,
}

/// Firmware image header. All integers are little endian:
///
/// ```text
/// magic[4] protocol:u16 version:u16 fw_size:u32 partial_offset:u32
/// partial_size:u32 tag[..] partial_tag[..] nonce[..] reserved[..]
/// [leaf_cert[..]] [intermediate_cert[..]] [zero pad] signature[..]
/// ```
///
/// The bootloader reads these fields at fixed positions, so field order and
/// padding must not change.
pub struct ImageHeader {
    hdr_base: HeaderBase,
    tag: Vec<u8>,
    partial_tag: Option<Vec<u8>>,
    nonce: Option<Vec<u8>>,
    reserved: usize,
    leaf_cert: Option<Vec<u8>>,
    intermediate_cert: Option<Vec<u8>>,
}

impl ImageHeader {
    /// Start a header for a firmware of `fw_size` bytes authenticated by
    /// `tag`. Without a partial update the partial fields describe the whole
    /// firmware.
    pub fn new(magic: &str, protocol: u16, version: u16, fw_size: u32, tag: Vec<u8>) -> Result<Self> {
        let magic: [u8; MAGIC_LEN] = magic.as_bytes().try_into().map_err(|_| {
            Error::Configuration(format!(
                "header magic must be {} bytes, {:?} is {}",
                MAGIC_LEN,
                magic,
                magic.len()
            ))
        })?;
        Ok(Self {
            hdr_base: HeaderBase {
                magic,
                protocol,
                version,
                fw_size,
                partial_offset: 0,
                partial_size: fw_size,
            },
            tag,
            partial_tag: None,
            nonce: None,
            reserved: 0,
            leaf_cert: None,
            intermediate_cert: None,
        })
    }

    pub fn set_partial_update(&mut self, partial: PartialUpdate) {
        self.hdr_base.partial_offset = partial.offset;
        self.hdr_base.partial_size = partial.size;
        self.partial_tag = Some(partial.tag);
    }

    /// The nonce (AES-GCM) or IV (AES-CBC) stored in the header. Nonce based
    /// signing keys also sign the header with it.
    pub fn set_nonce(&mut self, nonce: Option<Vec<u8>>) {
        self.nonce = nonce;
    }

    /// Number of zero bytes following the nonce.
    pub fn set_reserved(&mut self, reserved: usize) {
        self.reserved = reserved;
    }

    pub fn set_certificates(&mut self, leaf: Option<Vec<u8>>, intermediate: Option<Vec<u8>>) {
        self.leaf_cert = leaf;
        self.intermediate_cert = intermediate;
    }

    fn has_certificates(&self) -> bool {
        self.leaf_cert.is_some() || self.intermediate_cert.is_some()
    }

    /// Create the header in binary form, without the signature.
    ///
    /// When certificates are included the result is zero padded so that it
    /// ends `SIGNATURE_RESERVATION` bytes (plus the install slots for
    /// [`HeaderVariant::Install`]) before `offset`.
    pub fn generate(&self, offset: usize, variant: HeaderVariant) -> Result<Vec<u8>> {
        let mut header_buf = io::Cursor::new(Vec::new());
        self.write_fields(&mut header_buf)
            .map_err(|e| Error::io(Path::new("header"), e))?;
        let mut header = header_buf.into_inner();

        if self.has_certificates() {
            let reservation = variant.reservation();
            match offset.checked_sub(reservation) {
                Some(budget) if budget >= header.len() => {
                    header.resize(budget, 0);
                }
                _ => {
                    return Err(Error::LayoutOverflow(Overflow::HeaderBudget {
                        needed: header.len() + reservation,
                        offset,
                    }))
                }
            }
        }
        Ok(header)
    }

    fn write_fields<W: Write>(&self, out: &mut W) -> io::Result<()> {
        self.hdr_base.write_to(out)?;
        out.write_all(&self.tag)?;
        out.write_all(self.partial_tag.as_ref().unwrap_or(&self.tag))?;
        if let Some(nonce) = &self.nonce {
            out.write_all(nonce)?;
        }
        util::do_pad(out, self.reserved, 0)?;
        if let Some(cert) = &self.leaf_cert {
            out.write_all(cert)?;
        }
        if let Some(cert) = &self.intermediate_cert {
            out.write_all(cert)?;
        }
        Ok(())
    }

    /// Generate the header and append a signature from `key`.
    ///
    /// Nonce based keys (AES-GCM) sign with the nonce set through
    /// [`ImageHeader::set_nonce`]; there is no fallback to a drawn or zero
    /// nonce because the bootloader could never reproduce it.
    pub fn sign(&self, key: &Key, offset: usize, variant: HeaderVariant) -> Result<SignedHeader> {
        if !key.has_sign() {
            return Err(Error::UnsupportedOperation(format!(
                "{:?} keys cannot sign a header",
                key.kind()
            )));
        }
        let nonce = if key.has_nonce() {
            match self.nonce.as_deref() {
                Some(nonce) if !nonce.is_empty() => Some(nonce),
                _ => {
                    return Err(Error::Configuration(format!(
                        "{:?} header signing requires a nonce",
                        key.kind()
                    )))
                }
            }
        } else {
            None
        };

        let mut bytes = self.generate(offset, variant)?;
        let signed = key.sign(&bytes, nonce)?;
        if nonce.is_some() && signed.nonce.as_deref() != nonce {
            return Err(Error::Crypto(
                "signing used a different nonce than the header carries".to_string(),
            ));
        }
        log::debug!(
            "Header of {} bytes signed with {:?}, signature {} bytes",
            bytes.len(),
            key.kind(),
            signed.signature.len()
        );
        bytes.extend_from_slice(&signed.signature);
        Ok(SignedHeader {
            bytes,
            signature: signed.signature,
        })
    }
}

impl fmt::Display for ImageHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Image Header:")?;
        write!(f, "{}", self.hdr_base)?;
        writeln!(
            f,
            "                   tag: {:>8} bytes
           partial_tag: {:>8} bytes
                 nonce: {:>8} bytes
              reserved: {:>8} bytes",
            self.tag.len(),
            self.partial_tag.as_ref().unwrap_or(&self.tag).len(),
            self.nonce.as_ref().map_or(0, |n| n.len()),
            self.reserved,
        )?;
        if let Some(cert) = &self.leaf_cert {
            writeln!(f, "             leaf_cert: {:>8} bytes", cert.len())?;
        }
        if let Some(cert) = &self.intermediate_cert {
            writeln!(f, "     intermediate_cert: {:>8} bytes", cert.len())?;
        }
        Ok(())
    }
}

/// A header followed by its signature. Never modified after signing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedHeader {
    bytes: Vec<u8>,
    signature: Vec<u8>,
}

impl SignedHeader {
    /// Header bytes including the trailing signature.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Install header: the signed header, the signature slot three times,
    /// then `0xFF` up to `offset`.
    pub fn install_image(&self, offset: usize) -> Result<Vec<u8>> {
        let slot = install_slot(&self.signature)?;
        let needed = self.bytes.len() + INSTALL_SLOT_COUNT * INSTALL_SLOT_LEN;
        if needed > offset {
            return Err(Error::LayoutOverflow(Overflow::HeaderBudget { needed, offset }));
        }

        let mut image = Vec::with_capacity(offset);
        image.extend_from_slice(&self.bytes);
        for _ in 0..INSTALL_SLOT_COUNT {
            image.extend_from_slice(&slot);
        }
        image.resize(offset, 0xFF);
        Ok(image)
    }

    /// Update file: the signed header, `0xFF` up to `offset`, then `payload`.
    pub fn pack_image(&self, offset: usize, payload: &[u8]) -> Result<Vec<u8>> {
        if self.bytes.len() > offset {
            return Err(Error::LayoutOverflow(Overflow::HeaderBudget {
                needed: self.bytes.len(),
                offset,
            }));
        }
        let mut image = Vec::with_capacity(offset + payload.len());
        image.extend_from_slice(&self.bytes);
        image.resize(offset, 0xFF);
        image.extend_from_slice(payload);
        Ok(image)
    }
}

/// Fit a signature into one 32 byte install slot. A GCM tag is repeated, an
/// ECDSA signature keeps its `r` half.
pub fn install_slot(signature: &[u8]) -> Result<[u8; INSTALL_SLOT_LEN]> {
    let mut slot = [0u8; INSTALL_SLOT_LEN];
    match signature.len() {
        GCM_TAG_LEN => {
            slot[..GCM_TAG_LEN].copy_from_slice(signature);
            slot[GCM_TAG_LEN..].copy_from_slice(signature);
        }
        ECDSA_SIGNATURE_LEN => slot.copy_from_slice(&signature[..INSTALL_SLOT_LEN]),
        other => {
            return Err(Error::UnsupportedFormat(format!(
                "unexpected signature size {} for an install header",
                other
            )))
        }
    }
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyKind;

    const NONCE: [u8; 12] = [0xa0; 12];

    fn sample_header() -> ImageHeader {
        let mut header = ImageHeader::new("SFUM", 1, 3, 0x1234, vec![0x11; 32]).unwrap();
        header.set_nonce(Some(NONCE.to_vec()));
        header.set_reserved(8);
        header
    }

    #[test]
    fn fields_are_serialized_in_order() {
        let header = sample_header();
        let bytes = header.generate(512, HeaderVariant::Pack).unwrap();

        let mut expected = b"SFUM".to_vec();
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.extend_from_slice(&3u16.to_le_bytes());
        expected.extend_from_slice(&0x1234u32.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&0x1234u32.to_le_bytes());
        expected.extend_from_slice(&[0x11; 32]);
        expected.extend_from_slice(&[0x11; 32]);
        expected.extend_from_slice(&NONCE);
        expected.extend_from_slice(&[0; 8]);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn partial_update_fields_replace_defaults() {
        let mut header = sample_header();
        header.set_partial_update(PartialUpdate {
            offset: 48,
            size: 16,
            tag: vec![0x22; 32],
        });
        let bytes = header.generate(512, HeaderVariant::Pack).unwrap();
        assert_eq!(&bytes[12..16], &48u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &16u32.to_le_bytes());
        assert_eq!(&bytes[20..52], &[0x11; 32]);
        assert_eq!(&bytes[52..84], &[0x22; 32]);
    }

    #[test]
    fn magic_must_be_four_bytes() {
        assert!(matches!(
            ImageHeader::new("SFU", 1, 1, 0, vec![]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn gcm_install_header_fills_offset() {
        let key = Key::AesGcm([0x5a; 16]);
        let header = sample_header();
        let signed = header.sign(&key, 512, HeaderVariant::Install).unwrap();
        assert_eq!(signed.signature().len(), 16);

        let pre_signature = &signed.as_bytes()[..signed.as_bytes().len() - 16];
        let expected = key.sign(pre_signature, Some(&NONCE[..])).unwrap();
        assert_eq!(signed.signature(), &expected.signature[..]);

        let image = signed.install_image(512).unwrap();
        assert_eq!(image.len(), 512);
        let slots = signed.as_bytes().len();
        for i in 0..INSTALL_SLOT_COUNT {
            let slot = &image[slots + i * 32..slots + (i + 1) * 32];
            assert_eq!(&slot[..16], signed.signature());
            assert_eq!(&slot[16..], signed.signature());
        }
        assert!(image[slots + 96..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn ecdsa_install_header_keeps_first_half_of_signature() {
        let key = Key::generate(KeyKind::EcdsaP256).unwrap();
        let mut header = ImageHeader::new("SFUM", 1, 1, 100, vec![0x33; 32]).unwrap();
        header.set_reserved(8);
        let signed = header.sign(&key, 256, HeaderVariant::Install).unwrap();
        assert_eq!(signed.signature().len(), 64);

        let image = signed.install_image(256).unwrap();
        assert_eq!(image.len(), 256);
        let start = signed.as_bytes().len();
        assert_eq!(&image[start..start + 32], &signed.signature()[..32]);
        assert_eq!(&image[start + 64..start + 96], &signed.signature()[..32]);
    }

    #[test]
    fn ecdsa_header_carries_cbc_iv() {
        let key = Key::generate(KeyKind::EcdsaP256).unwrap();
        let iv = [0x5cu8; 16];
        let mut header = ImageHeader::new("SFUM", 1, 1, 64, vec![0x33; 32]).unwrap();
        header.set_nonce(Some(iv.to_vec()));
        header.set_reserved(8);
        let signed = header.sign(&key, 512, HeaderVariant::Install).unwrap();

        let bytes = signed.as_bytes();
        assert_eq!(&bytes[84..100], &iv);
        assert_eq!(&bytes[100..108], &[0; 8]);
        assert_eq!(bytes.len(), 108 + 64);

        let expected = key.sign(&bytes[..108], None).unwrap();
        assert_eq!(signed.signature(), &expected.signature[..]);
    }

    #[test]
    fn certificates_pad_to_signature_reservation() {
        let key = Key::AesGcm([0x5a; 16]);
        let mut header = sample_header();
        header.set_certificates(Some(vec![0xc1; 40]), Some(vec![0xc2; 30]));

        let pack = header.generate(512, HeaderVariant::Pack).unwrap();
        assert_eq!(pack.len(), 512 - SIGNATURE_RESERVATION);
        let install = header.generate(1024, HeaderVariant::Install).unwrap();
        assert_eq!(install.len(), 1024 - SIGNATURE_RESERVATION - 96);
        assert_eq!(&install[96..136], &[0xc1; 40][..]);
        assert_eq!(&install[136..166], &[0xc2; 30][..]);
        assert!(install[166..].iter().all(|b| *b == 0));

        let signed = header.sign(&key, 1024, HeaderVariant::Install).unwrap();
        assert_eq!(signed.install_image(1024).unwrap().len(), 1024);
    }

    #[test]
    fn certificates_larger_than_budget_overflow() {
        let mut header = sample_header();
        header.set_certificates(Some(vec![0; 400]), None);
        let err = header.generate(512, HeaderVariant::Install).unwrap_err();
        assert!(matches!(
            err,
            Error::LayoutOverflow(Overflow::HeaderBudget { offset: 512, .. })
        ));
    }

    #[test]
    fn install_header_without_room_for_slots_overflows() {
        let key = Key::generate(KeyKind::EcdsaP256).unwrap();
        let header = sample_header();
        let signed = header.sign(&key, 128, HeaderVariant::Install).unwrap();
        assert!(matches!(
            signed.install_image(128),
            Err(Error::LayoutOverflow(Overflow::HeaderBudget { .. }))
        ));
    }

    #[test]
    fn nonce_key_without_nonce_is_a_configuration_error() {
        let key = Key::AesGcm([1; 16]);
        let header = ImageHeader::new("SFUM", 1, 1, 10, vec![0; 32]).unwrap();
        assert!(matches!(
            header.sign(&key, 512, HeaderVariant::Pack),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn non_signing_key_is_rejected() {
        let header = sample_header();
        assert!(matches!(
            header.sign(&Key::AesCbc([1; 16]), 512, HeaderVariant::Pack),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn install_slot_rejects_other_sizes() {
        assert!(matches!(install_slot(&[0; 32]), Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn pack_image_places_payload_at_offset() {
        let key = Key::AesGcm([0x5a; 16]);
        let signed = sample_header().sign(&key, 512, HeaderVariant::Pack).unwrap();
        let payload = vec![0xab; 100];
        let image = signed.pack_image(512, &payload).unwrap();
        assert_eq!(image.len(), 612);
        assert_eq!(&image[..signed.as_bytes().len()], signed.as_bytes());
        assert!(image[signed.as_bytes().len()..512].iter().all(|b| *b == 0xFF));
        assert_eq!(&image[512..], &payload[..]);

        assert!(matches!(
            signed.pack_image(64, &payload),
            Err(Error::LayoutOverflow(_))
        ));
    }
}
