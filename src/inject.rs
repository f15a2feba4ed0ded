use crate::error::{Error, Result};

/// Attribute whose value is the raw key: `<len>, 0xB0B1B2B3, ...`.
pub const VALUE_ATTRIBUTE: &str = "CKA_VALUE";

/// Attribute whose value is a DER octet string holding an uncompressed EC
/// point: `<len + 2>, 0x04<len>B0B1U, ...`.
pub const EC_POINT_ATTRIBUTE: &str = "CKA_EC_POINT";

const UNCOMPRESSED_POINT: u8 = 0x04;

/// Group `bytes` four at a time into big endian hex words. A short last
/// chunk gives a shorter word.
fn hex_words(bytes: &[u8], suffix: &str) -> String {
    let mut out = String::new();
    for chunk in bytes.chunks(4) {
        out.push_str(" 0x");
        for byte in chunk {
            out.push_str(&format!("{:02x}", byte));
        }
        out.push_str(suffix);
        out.push(',');
    }
    out
}

fn value_initializer(key: &[u8]) -> String {
    format!("{},{}", key.len(), hex_words(key, ""))
}

fn ec_point_initializer(key: &[u8]) -> Result<String> {
    let len = u8::try_from(key.len()).map_err(|_| Error::InvalidLength {
        what: "EC point",
        expected: "at most 255 bytes".to_string(),
        actual: key.len(),
    })?;
    let mut point = Vec::with_capacity(key.len() + 2);
    point.push(UNCOMPRESSED_POINT);
    point.push(len);
    point.extend_from_slice(key);
    Ok(format!("{},{}", point.len(), hex_words(&point, "U")))
}

/// Rewrite every template line containing `pattern` and naming one of the
/// known attributes. All other lines are copied unchanged.
pub fn inject(template: &str, key: &[u8], pattern: &str) -> Result<String> {
    if pattern.is_empty() {
        return Err(Error::Configuration(
            "injection pattern must not be empty".to_string(),
        ));
    }
    let value = value_initializer(key);
    let mut ec_point = None;

    let mut out = String::with_capacity(template.len());
    let mut replaced = 0;
    for line in template.split_inclusive('\n') {
        if !line.contains(pattern) {
            out.push_str(line);
        } else if line.contains(VALUE_ATTRIBUTE) {
            out.push_str(&line.replace(pattern, &value));
            replaced += 1;
        } else if line.contains(EC_POINT_ATTRIBUTE) {
            if ec_point.is_none() {
                ec_point = Some(ec_point_initializer(key)?);
            }
            out.push_str(&line.replace(pattern, ec_point.as_deref().unwrap_or_default()));
            replaced += 1;
        } else {
            log::warn!("Pattern found on a line without a key attribute: {}", line.trim_end());
            out.push_str(line);
        }
    }

    if replaced == 0 {
        log::warn!("Pattern {:?} not found in template", pattern);
    } else {
        log::debug!("Injected {} bytes of key into {} lines", key.len(), replaced);
    }
    Ok(out)
}
