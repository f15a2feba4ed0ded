use crate::error::{Error, Result};
use crate::util;
use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, LineEnding};
use p256::SecretKey;
use ring::aead::{self, Aad, LessSafeKey, UnboundKey, AES_128_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

pub const AES_KEY_LEN: usize = 16;
pub const AES_BLOCK_LEN: usize = 16;
pub const GCM_NONCE_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
pub const PAIRED_SECRET_LEN: usize = 32;
pub const ECDSA_SIGNATURE_LEN: usize = 64;

/// Every AES-CBC key file name must contain this, and no AES-GCM one may.
pub const CBC_FILE_MARKER: &str = "AES_CBC";

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum KeyKind {
    AesGcm,
    AesCbc,
    EcdsaP256,
    #[value(skip)]
    PairedSecret,
}

/// Which half of a key to export.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportKind {
    #[default]
    Public,
    Private,
}

/// A key file is recognised by its shape: 16 raw bytes are an AES-128 key,
/// 32 raw bytes a paired secret, anything else a PEM encoded P-256 private
/// key. An AES-CBC key file name contains `AES_CBC`; an AES-GCM one does not.
#[derive(Clone)]
pub enum Key {
    AesCbc([u8; AES_KEY_LEN]),
    AesGcm([u8; AES_KEY_LEN]),
    EcdsaP256(SecretKey),
    PairedSecret([u8; PAIRED_SECRET_LEN]),
}

/// Output of [`Key::sign`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signed {
    pub signature: Vec<u8>,
    /// The nonce actually used, for keys that need one. When the caller did
    /// not provide a nonce this is freshly drawn and has to be persisted.
    pub nonce: Option<Vec<u8>>,
}

/// Output of [`Key::encrypt`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Encrypted {
    pub ciphertext: Vec<u8>,
    /// GCM authentication tag, or SHA-256 of the plaintext for CBC.
    pub tag: Vec<u8>,
    pub nonce: Vec<u8>,
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| Error::Crypto("OS entropy source unavailable".to_string()))?;
    Ok(buf)
}

fn fixed<const N: usize>(what: &'static str, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| Error::InvalidLength {
        what,
        expected: format!("{} bytes", N),
        actual: bytes.len(),
    })
}

/// AES-128-GCM over `in_out` with `aad` bound in, returning the tag.
fn gcm_seal(
    secret: &[u8; AES_KEY_LEN],
    nonce: [u8; GCM_NONCE_LEN],
    aad: &[u8],
    in_out: &mut [u8],
) -> Result<Vec<u8>> {
    let unbound = UnboundKey::new(&AES_128_GCM, secret)
        .map_err(|_| Error::Crypto("AES-GCM key rejected".to_string()))?;
    let key = LessSafeKey::new(unbound);
    let tag = key
        .seal_in_place_separate_tag(aead::Nonce::assume_unique_for_key(nonce), Aad::from(aad), in_out)
        .map_err(|_| Error::Crypto("AES-GCM sealing failed".to_string()))?;
    Ok(tag.as_ref().to_vec())
}

impl Key {
    pub fn generate(kind: KeyKind) -> Result<Key> {
        match kind {
            KeyKind::AesCbc => Ok(Key::AesCbc(random_bytes()?)),
            KeyKind::AesGcm => Ok(Key::AesGcm(random_bytes()?)),
            KeyKind::EcdsaP256 => loop {
                // Out of range scalars (zero or >= n) are astronomically rare;
                // just draw again.
                let candidate: [u8; 32] = random_bytes()?;
                if let Ok(secret) = SecretKey::from_slice(&candidate) {
                    return Ok(Key::EcdsaP256(secret));
                }
            },
            KeyKind::PairedSecret => Err(Error::UnsupportedOperation(
                "paired secrets cannot be generated".to_string(),
            )),
        }
    }

    pub fn load(path: &Path) -> Result<Key> {
        let contents = util::read_file(path)?;
        Key::from_bytes(&contents, path)
    }

    /// Interpret key file contents. `path` is only consulted to tell AES-CBC
    /// from AES-GCM keys.
    pub fn from_bytes(contents: &[u8], path: &Path) -> Result<Key> {
        match contents.len() {
            AES_KEY_LEN => {
                let secret = fixed("AES key", contents)?;
                if is_cbc_path(path) {
                    Ok(Key::AesCbc(secret))
                } else {
                    Ok(Key::AesGcm(secret))
                }
            }
            PAIRED_SECRET_LEN => Ok(Key::PairedSecret(fixed("paired secret", contents)?)),
            _ => {
                let pem = std::str::from_utf8(contents).map_err(|_| {
                    Error::UnsupportedFormat(format!(
                        "{}: neither a 16/32 byte secret nor a PEM key",
                        path.display()
                    ))
                })?;
                SecretKey::from_sec1_pem(pem)
                    .or_else(|_| SecretKey::from_pkcs8_pem(pem))
                    .map(Key::EcdsaP256)
                    .map_err(|_| {
                        Error::UnsupportedFormat(format!(
                            "{}: not a NIST P-256 private key",
                            path.display()
                        ))
                    })
            }
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            Key::AesCbc(_) => KeyKind::AesCbc,
            Key::AesGcm(_) => KeyKind::AesGcm,
            Key::EcdsaP256(_) => KeyKind::EcdsaP256,
            Key::PairedSecret(_) => KeyKind::PairedSecret,
        }
    }

    /// True if [`Key::sign`] or [`Key::encrypt`] take a nonce (or IV).
    pub fn has_nonce(&self) -> bool {
        matches!(self, Key::AesCbc(_) | Key::AesGcm(_))
    }

    pub fn has_sign(&self) -> bool {
        matches!(self, Key::AesGcm(_) | Key::EcdsaP256(_))
    }

    pub fn has_encrypt(&self) -> bool {
        matches!(self, Key::AesCbc(_) | Key::AesGcm(_))
    }

    /// Authenticate `payload`.
    ///
    /// - ECDSA: signs the SHA-256 digest of `payload`, ignoring `nonce`, and
    ///   returns the 64 byte `r || s` signature.
    /// - AES-GCM: computes the GCM tag with `payload` as associated data and
    ///   no ciphertext. A 12 byte nonce is drawn when `nonce` is `None`.
    pub fn sign(&self, payload: &[u8], nonce: Option<&[u8]>) -> Result<Signed> {
        match self {
            Key::EcdsaP256(secret) => {
                let signature: Signature = SigningKey::from(secret).sign(payload);
                Ok(Signed {
                    signature: signature.to_bytes().to_vec(),
                    nonce: None,
                })
            }
            Key::AesGcm(secret) => {
                let nonce: [u8; GCM_NONCE_LEN] = match nonce {
                    Some(nonce) => fixed("AES-GCM nonce", nonce)?,
                    None => random_bytes()?,
                };
                let tag = gcm_seal(secret, nonce, payload, &mut [])?;
                Ok(Signed {
                    signature: tag,
                    nonce: Some(nonce.to_vec()),
                })
            }
            Key::AesCbc(_) => Err(Error::UnsupportedOperation(
                "AES-CBC keys cannot sign; the SHA-256 digest returned by encrypt authenticates the payload"
                    .to_string(),
            )),
            Key::PairedSecret(_) => Err(Error::UnsupportedOperation(
                "paired secrets cannot sign".to_string(),
            )),
        }
    }

    /// Encrypt `payload`.
    ///
    /// AES-CBC requires a whole number of 16 byte blocks (there is no
    /// ciphertext stealing) and returns SHA-256 of the plaintext as the tag.
    /// AES-GCM accepts any length. A nonce or IV is drawn when none is given.
    pub fn encrypt(&self, payload: &[u8], nonce: Option<&[u8]>) -> Result<Encrypted> {
        match self {
            Key::AesCbc(secret) => {
                if payload.len() % AES_BLOCK_LEN != 0 {
                    return Err(Error::InvalidLength {
                        what: "AES-CBC payload",
                        expected: format!("a multiple of {} bytes", AES_BLOCK_LEN),
                        actual: payload.len(),
                    });
                }
                let iv: [u8; AES_BLOCK_LEN] = match nonce {
                    Some(iv) => fixed("AES-CBC IV", iv)?,
                    None => random_bytes()?,
                };

                let ciphertext = cbc::Encryptor::<Aes128>::new(secret.into(), &iv.into())
                    .encrypt_padded_vec_mut::<NoPadding>(payload);

                Ok(Encrypted {
                    ciphertext,
                    tag: Sha256::digest(payload).to_vec(),
                    nonce: iv.to_vec(),
                })
            }
            Key::AesGcm(secret) => {
                let nonce: [u8; GCM_NONCE_LEN] = match nonce {
                    Some(nonce) => fixed("AES-GCM nonce", nonce)?,
                    None => random_bytes()?,
                };
                let mut ciphertext = payload.to_vec();
                let tag = gcm_seal(secret, nonce, &[], &mut ciphertext)?;
                Ok(Encrypted {
                    ciphertext,
                    tag,
                    nonce: nonce.to_vec(),
                })
            }
            Key::EcdsaP256(_) | Key::PairedSecret(_) => Err(Error::UnsupportedOperation(
                format!("{:?} keys cannot encrypt", self.kind()),
            )),
        }
    }

    /// Raw key material. For symmetric keys both kinds return the secret
    /// itself, so a "public" AES export must never be published.
    pub fn export(&self, kind: ExportKind) -> Result<Vec<u8>> {
        match (self, kind) {
            (Key::AesCbc(secret), _) | (Key::AesGcm(secret), _) => Ok(secret.to_vec()),
            (Key::PairedSecret(secret), _) => Ok(secret.to_vec()),
            (Key::EcdsaP256(secret), ExportKind::Public) => {
                let point = secret.public_key().to_encoded_point(false);
                // Drop the 0x04 uncompressed point tag, keep x || y.
                Ok(point.as_bytes()[1..].to_vec())
            }
            (Key::EcdsaP256(secret), ExportKind::Private) => {
                let pem = secret
                    .to_sec1_pem(LineEnding::LF)
                    .map_err(|e| Error::Crypto(format!("PEM encoding failed: {}", e)))?;
                Ok(pem.as_bytes().to_vec())
            }
        }
    }

    /// Persist the private key to `path`, enforcing the AES-CBC file name
    /// rule.
    pub fn write_private(&self, path: &Path) -> Result<()> {
        match self {
            Key::AesCbc(secret) => {
                if !is_cbc_path(path) {
                    return Err(Error::Configuration(format!(
                        "{}: AES-CBC key file names must contain {}",
                        path.display(),
                        CBC_FILE_MARKER
                    )));
                }
                util::write_file(path, secret)
            }
            Key::AesGcm(secret) => {
                if is_cbc_path(path) {
                    return Err(Error::Configuration(format!(
                        "{}: AES-GCM key file names must not contain {}",
                        path.display(),
                        CBC_FILE_MARKER
                    )));
                }
                util::write_file(path, secret)
            }
            Key::EcdsaP256(_) => util::write_file(path, &self.export(ExportKind::Private)?),
            Key::PairedSecret(_) => Err(Error::UnsupportedOperation(
                "paired secrets cannot be exported to a key file".to_string(),
            )),
        }
    }
}

fn is_cbc_path(path: &Path) -> bool {
    path.to_string_lossy().contains(CBC_FILE_MARKER)
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key({:?})", self.kind())
    }
}
