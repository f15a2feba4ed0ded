mod cmdline;
mod conf;
mod convert;
mod diff;
mod error;
mod header;
mod inject;
mod keys;
mod merge;
mod util;

use clap::Parser;
use cmdline::{Command, DiffArgs, HeaderConfig, MergeArgs};
use error::{Error, Result};
use header::{HeaderVariant, ImageHeader, PartialUpdate, SignedHeader};
use keys::{ExportKind, Key, KeyKind};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process;

fn main() {
    let opt = cmdline::Opt::parse();

    let default_level = if opt.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    if let Err(err) = run(opt.command) {
        log::error!("{}", err);
        process::exit(err.exit_code());
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Keygen { key, kind } => keygen(&key, kind),
        Command::Getpub { key } => getpub(&key),
        Command::Sign {
            key,
            nonce,
            infile,
            outfile,
        } => sign(&key, nonce.as_deref(), &infile, &outfile),
        Command::Sha256 { infile, outfile } => sha256(&infile, &outfile),
        Command::Enc {
            key,
            nonce,
            iv,
            infile,
            outfile,
        } => encrypt(&key, nonce, iv, &infile, &outfile),
        Command::Header(args) => install_header(&args.validate()?),
        Command::Pack(args) => pack(&args.validate()?),
        Command::Merge(args) => merge_images(&args),
        Command::Diff(args) => diff_binaries(&args),
        Command::Inject {
            key,
            pattern,
            template,
            export,
            outfile,
        } => inject_key(&key, &pattern, &template, export, &outfile),
        Command::Conf { define, infile } => {
            let value = find_define(&infile, &define)?;
            println!("{}", value);
            Ok(())
        }
    }
}

fn keygen(path: &Path, kind: KeyKind) -> Result<()> {
    let key = Key::generate(kind)?;
    key.write_private(path)?;
    log::info!("Generated {:?} key in {}", kind, path.display());
    Ok(())
}

fn getpub(path: &Path) -> Result<()> {
    let key = Key::load(path)?;
    println!("{}", to_hex(&key.export(ExportKind::Public)?));
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Tag a firmware file. AES-GCM keys authenticate the encrypted form of the
/// payload; a nonce drawn here is saved to `nonce_path` so that `enc` and
/// the header reuse it.
fn sign(key_path: &Path, nonce_path: Option<&Path>, infile: &Path, outfile: &Path) -> Result<()> {
    let payload = util::read_file(infile)?;
    let key = Key::load(key_path)?;
    if !key.has_sign() {
        return Err(Error::UnsupportedOperation(format!(
            "{:?} keys cannot sign",
            key.kind()
        )));
    }

    let signature = if key.has_nonce() {
        let nonce = match nonce_path {
            Some(path) => util::read_optional(path)?,
            None => None,
        };
        let encrypted = key.encrypt(&payload, nonce.as_deref())?;
        if nonce.as_deref() != Some(encrypted.nonce.as_slice()) {
            let path = nonce_path.ok_or_else(|| {
                Error::Configuration("a nonce file is required to keep the generated nonce".to_string())
            })?;
            util::write_file(path, &encrypted.nonce)?;
            log::info!("Nonce written to {}", path.display());
        }
        encrypted.tag
    } else {
        key.sign(&payload, None)?.signature
    };

    util::write_file(outfile, &signature)?;
    log::info!("{} byte tag written to {}", signature.len(), outfile.display());
    Ok(())
}

fn sha256(infile: &Path, outfile: &Path) -> Result<()> {
    let payload = util::read_file(infile)?;
    util::write_file(outfile, &Sha256::digest(&payload))
}

fn encrypt(
    key_path: &Path,
    nonce: Option<PathBuf>,
    iv: Option<PathBuf>,
    infile: &Path,
    outfile: &Path,
) -> Result<()> {
    let payload = util::read_file(infile)?;
    let key = Key::load(key_path)?;
    if !key.has_encrypt() {
        return Err(Error::UnsupportedOperation(format!(
            "{:?} keys cannot encrypt",
            key.kind()
        )));
    }

    let encrypted = if key.has_nonce() {
        let nonce_path = match (nonce, iv) {
            (Some(nonce), None) => nonce,
            (None, Some(iv)) => iv,
            _ => {
                return Err(Error::Configuration(
                    "exactly one of --nonce or --iv is required for this key".to_string(),
                ))
            }
        };
        let existing = util::read_optional(&nonce_path)?;
        let encrypted = key.encrypt(&payload, existing.as_deref())?;
        if existing.as_deref() != Some(encrypted.nonce.as_slice()) {
            util::write_file(&nonce_path, &encrypted.nonce)?;
            log::info!("Nonce written to {}", nonce_path.display());
        }
        encrypted
    } else {
        key.encrypt(&payload, None)?
    };

    util::write_file(outfile, &encrypted.ciphertext)?;
    log::info!(
        "{} bytes encrypted to {}",
        encrypted.ciphertext.len(),
        outfile.display()
    );
    Ok(())
}

fn file_size(what: &'static str, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidLength {
        what,
        expected: "at most 4 GiB".to_string(),
        actual: len,
    })
}

/// Build and sign a header from `config`. Also returns the payload an update
/// file carries: the partial firmware if there is one, else the firmware.
fn build_header(config: &HeaderConfig, variant: HeaderVariant) -> Result<(SignedHeader, Vec<u8>)> {
    let firmware = util::read_file(&config.firmware)?;
    let tag = util::read_file(&config.tag)?;
    let key = Key::load(&config.key)?;

    let mut header = ImageHeader::new(
        &config.magic,
        config.protocol,
        config.version,
        file_size("firmware", firmware.len())?,
        tag,
    )?;

    let mut payload = firmware;
    if let Some(partial) = &config.partial {
        let partial_firmware = util::read_file(&partial.firmware)?;
        header.set_partial_update(PartialUpdate {
            offset: util::read_offset(&partial.offset)?,
            size: file_size("partial firmware", partial_firmware.len())?,
            tag: util::read_file(&partial.tag)?,
        });
        payload = partial_firmware;
    }

    // Unlike `sign` and `enc`, a header never draws a nonce or IV of its own.
    if let Some(path) = &config.nonce {
        header.set_nonce(Some(util::read_required(path, "nonce/IV")?));
    }
    header.set_reserved(config.reserved);

    let leaf = config
        .leaf_cert
        .as_deref()
        .map(|path| util::read_required(path, "leaf certificate"))
        .transpose()?;
    let intermediate = config
        .intermediate_cert
        .as_deref()
        .map(|path| util::read_required(path, "intermediate certificate"))
        .transpose()?;
    match &leaf {
        Some(cert) => log::info!("Adding leaf certificate of length {}", cert.len()),
        None => log::debug!("No firmware signing leaf certificate"),
    }
    if let Some(cert) = &intermediate {
        log::info!("Adding intermediate certificate of length {}", cert.len());
    }
    header.set_certificates(leaf, intermediate);

    log::debug!("{}", header);
    let signed = header.sign(&key, config.offset, variant)?;
    log::debug!(
        "Signed header of {} bytes, signature {}",
        signed.as_bytes().len(),
        to_hex(signed.signature())
    );
    Ok((signed, payload))
}

fn install_header(config: &HeaderConfig) -> Result<()> {
    let (signed, _) = build_header(config, HeaderVariant::Install)?;
    let image = signed.install_image(config.offset)?;
    util::write_file(&config.output, &image)?;
    log::info!(
        "Install header of {} bytes written to {}",
        image.len(),
        config.output.display()
    );
    Ok(())
}

fn pack(config: &HeaderConfig) -> Result<()> {
    let (signed, payload) = build_header(config, HeaderVariant::Pack)?;
    let image = signed.pack_image(config.offset, &payload)?;
    util::write_file(&config.output, &image)?;
    log::info!(
        "Update file of {} bytes written to {}",
        image.len(),
        config.output.display()
    );
    Ok(())
}

fn merge_images(args: &MergeArgs) -> Result<()> {
    let header = util::read_file(&args.install)?;
    let application = convert::flatten_elf(&args.infile, args.fill, args.kind)?;
    let bootloader = convert::flatten_elf(&args.bootloader, args.fill, args.kind)?;
    let loader = args
        .loader
        .as_deref()
        .map(|path| convert::flatten_elf(path, args.fill, args.kind))
        .transpose()?;

    let image = merge::merge(&bootloader, loader.as_ref(), &header, &application, args.fill)?;
    util::write_file(&args.outfile, &image)?;
    log::info!("Writing to {} {}", args.outfile.display(), image.len());
    Ok(())
}

fn diff_binaries(args: &DiffArgs) -> Result<()> {
    let old = util::read_file(&args.file1)?;
    let new = util::read_file(&args.file2)?;
    let result = diff::diff(&old, &new, &args.options())?;

    util::write_file(&args.outfile, result.data())?;
    util::write_file(&args.poffset, result.offset().to_string().as_bytes())?;
    log::info!(
        "Patch of {} bytes at offset {} written to {}",
        result.data().len(),
        result.offset(),
        args.outfile.display()
    );
    Ok(())
}

fn inject_key(
    key_path: &Path,
    pattern: &str,
    template_path: &Path,
    export: ExportKind,
    outfile: &Path,
) -> Result<()> {
    let key = Key::load(key_path)?;
    let template = util::read_text(template_path)?;
    let output = inject::inject(&template, &key.export(export)?, pattern)?;
    util::write_file(outfile, output.as_bytes())
}

fn find_define(path: &Path, define: &str) -> Result<String> {
    let text = util::read_text(path)?;
    conf::find_define(&text, define).ok_or_else(|| {
        Error::Configuration(format!("#define {} not found in {}", define, path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn gcm_sign_enc_and_pack_share_one_nonce() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("aes_gcm.bin");
        let nonce_path = dir.path().join("nonce.bin");
        let fw_path = dir.path().join("fw.bin");
        let tag_path = dir.path().join("fw.tag");
        let enc_path = dir.path().join("fw.sfb");
        let out_path = dir.path().join("update.sfu");

        keygen(&key_path, KeyKind::AesGcm).unwrap();
        fs::write(&fw_path, vec![0x42u8; 100]).unwrap();

        sign(&key_path, Some(&nonce_path), &fw_path, &tag_path).unwrap();
        let nonce = fs::read(&nonce_path).unwrap();
        assert_eq!(nonce.len(), 12);
        assert_eq!(fs::read(&tag_path).unwrap().len(), 16);

        encrypt(&key_path, Some(nonce_path.clone()), None, &fw_path, &enc_path).unwrap();
        assert_eq!(fs::read(&nonce_path).unwrap(), nonce);

        let config = HeaderConfig {
            key: key_path,
            nonce: Some(nonce_path),
            firmware: enc_path.clone(),
            tag: tag_path,
            version: 2,
            magic: cmdline::DEFAULT_MAGIC.to_string(),
            protocol: cmdline::DEFAULT_PROTOCOL,
            reserved: cmdline::DEFAULT_RESERVED,
            offset: cmdline::DEFAULT_OFFSET,
            leaf_cert: None,
            intermediate_cert: None,
            partial: None,
            output: out_path.clone(),
        };
        pack(&config).unwrap();
        let update = fs::read(&out_path).unwrap();
        assert_eq!(&update[..4], b"SFUM");
        assert_eq!(&update[512..], &fs::read(&enc_path).unwrap()[..]);

        let install_path = dir.path().join("install.bin");
        install_header(&HeaderConfig {
            output: install_path.clone(),
            ..config
        })
        .unwrap();
        assert_eq!(fs::read(&install_path).unwrap().len(), 512);
    }

    #[test]
    fn header_requires_named_iv_and_certificate_files() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("ecc.pem");
        let fw_path = dir.path().join("fw.bin");
        let tag_path = dir.path().join("fw.sha256");
        let iv_path = dir.path().join("iv.bin");
        keygen(&key_path, KeyKind::EcdsaP256).unwrap();
        fs::write(&fw_path, [0u8; 64]).unwrap();
        sha256(&fw_path, &tag_path).unwrap();

        let config = HeaderConfig {
            key: key_path,
            nonce: Some(iv_path.clone()),
            firmware: fw_path,
            tag: tag_path,
            version: 1,
            magic: cmdline::DEFAULT_MAGIC.to_string(),
            protocol: cmdline::DEFAULT_PROTOCOL,
            reserved: cmdline::DEFAULT_RESERVED,
            offset: cmdline::DEFAULT_OFFSET,
            leaf_cert: None,
            intermediate_cert: None,
            partial: None,
            output: dir.path().join("install.bin"),
        };
        assert!(matches!(install_header(&config), Err(Error::Configuration(_))));
        assert!(matches!(pack(&config), Err(Error::Configuration(_))));
        assert!(!config.output.exists());

        fs::write(&iv_path, [0x5cu8; 16]).unwrap();
        install_header(&config).unwrap();
        let image = fs::read(&config.output).unwrap();
        assert_eq!(&image[84..100], &[0x5c; 16]);

        let with_cert = HeaderConfig {
            leaf_cert: Some(dir.path().join("leaf.der")),
            ..config
        };
        let err = install_header(&with_cert).unwrap_err();
        assert!(matches!(&err, Error::Configuration(msg) if msg.contains("leaf.der")));
    }

    #[test]
    fn encrypt_requires_exactly_one_nonce_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key_AES_CBC.bin");
        let fw_path = dir.path().join("fw.bin");
        keygen(&key_path, KeyKind::AesCbc).unwrap();
        fs::write(&fw_path, [0u8; 32]).unwrap();

        let out = dir.path().join("out.bin");
        assert!(matches!(
            encrypt(&key_path, None, None, &fw_path, &out),
            Err(Error::Configuration(_))
        ));
        let iv = dir.path().join("iv.bin");
        encrypt(&key_path, None, Some(iv.clone()), &fw_path, &out).unwrap();
        assert_eq!(fs::read(&iv).unwrap().len(), 16);
        assert_eq!(fs::read(&out).unwrap().len(), 32);
    }

    #[test]
    fn cbc_key_cannot_sign() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key_AES_CBC.bin");
        let fw_path = dir.path().join("fw.bin");
        keygen(&key_path, KeyKind::AesCbc).unwrap();
        fs::write(&fw_path, [0u8; 16]).unwrap();
        assert!(matches!(
            sign(&key_path, None, &fw_path, &dir.path().join("tag")),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn diff_writes_patch_and_offset() {
        let dir = tempfile::tempdir().unwrap();
        let old: Vec<u8> = (0..128).collect();
        let mut new = old.clone();
        new[50] = 0;
        let args = DiffArgs {
            file1: dir.path().join("old.bin"),
            file2: dir.path().join("new.bin"),
            poffset: dir.path().join("offset.txt"),
            begin: 0,
            end: 0,
            align: 16,
            outfile: dir.path().join("patch.bin"),
        };
        fs::write(&args.file1, &old).unwrap();
        fs::write(&args.file2, &new).unwrap();

        diff_binaries(&args).unwrap();
        assert_eq!(fs::read_to_string(&args.poffset).unwrap(), "48");
        assert_eq!(fs::read(&args.outfile).unwrap(), &new[48..64]);
        assert_eq!(util::read_offset(&args.poffset).unwrap(), 48);
    }

    #[test]
    fn injected_public_key_is_the_raw_point() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("ecc.pem");
        let template = dir.path().join("keys.c.in");
        let output = dir.path().join("keys.c");
        keygen(&key_path, KeyKind::EcdsaP256).unwrap();
        fs::write(&template, "uint8_t point[] = { CKA_EC_POINT, @PUB@ };\n").unwrap();

        inject_key(&key_path, "@PUB@", &template, ExportKind::Public, &output).unwrap();
        let text = fs::read_to_string(&output).unwrap();
        assert!(text.starts_with("uint8_t point[] = { CKA_EC_POINT, 66, 0x0440"));
        assert!(!text.contains("@PUB@"));
    }

    #[test]
    fn missing_define_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.h");
        fs::write(&path, "#define SECBOOT_CRYPTO_SCHEME SECBOOT_ECCDSA_WITH_AES128_CBC_SHA256\n").unwrap();
        assert_eq!(
            find_define(&path, conf::DEFAULT_DEFINE).unwrap(),
            "SECBOOT_ECCDSA_WITH_AES128_CBC_SHA256"
        );
        assert!(matches!(
            find_define(&path, "OTHER"),
            Err(Error::Configuration(_))
        ));
    }
}
