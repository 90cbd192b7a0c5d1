//! Minimal reader for NumPy `.npy` files holding one float vector.
//!
//! Supports format versions 1.0, 2.0 and 3.0 with `f4` or `f8` data in
//! either byte order. The array is flattened in storage order; Fortran
//! order is accepted only when it cannot change the element order (at most
//! one dimension larger than 1).

use anyhow::{anyhow, bail, Context, Result};

const MAGIC: &[u8] = b"\x93NUMPY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    endian: Endian,
    width: usize,
    fortran_order: bool,
    shape: Vec<usize>,
}

/// Decode an `.npy` byte buffer into a flat `f32` vector.
pub fn parse_npy(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        bail!("not an .npy file (bad magic)");
    }
    let major = bytes[6];
    let (header_len, header_start): (usize, usize) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                bail!("truncated .npy header");
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        }
        other => bail!("unsupported .npy format version {}", other),
    };

    let header_end = header_start
        .checked_add(header_len)
        .ok_or_else(|| anyhow!("truncated .npy header"))?;
    if bytes.len() < header_end {
        bail!("truncated .npy header");
    }
    let header_text = std::str::from_utf8(&bytes[header_start..header_end])
        .context("non-UTF-8 .npy header")?;
    let header = parse_header(header_text)?;

    if header.fortran_order && header.shape.iter().filter(|&&d| d > 1).count() > 1 {
        bail!("Fortran-ordered multi-dimensional arrays are not supported");
    }

    let expected = header
        .shape
        .iter()
        .try_fold(header.width, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| anyhow!(".npy shape {:?} is too large", header.shape))?;
    let data = &bytes[header_end..];
    if data.len() < expected {
        bail!(
            ".npy data truncated: expected {} bytes, found {}",
            expected,
            data.len()
        );
    }

    let values = data[..expected]
        .chunks_exact(header.width)
        .map(|chunk| decode(chunk, header.endian))
        .collect();
    Ok(values)
}

fn decode(chunk: &[u8], endian: Endian) -> f32 {
    match (chunk.len(), endian) {
        (4, Endian::Little) => f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
        (4, Endian::Big) => f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
        (_, Endian::Little) => f64::from_le_bytes(eight(chunk)) as f32,
        (_, Endian::Big) => f64::from_be_bytes(eight(chunk)) as f32,
    }
}

fn eight(chunk: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&chunk[..8]);
    buf
}

/// Parse the Python dict literal, e.g.
/// `{'descr': '<f4', 'fortran_order': False, 'shape': (1, 512), }`.
fn parse_header(text: &str) -> Result<Header> {
    let descr = dict_value(text, "descr")?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    let (endian, kind) = match descr.chars().next() {
        Some('<') | Some('|') => (Endian::Little, &descr[1..]),
        Some('=') => (native_endian(), &descr[1..]),
        Some('>') => (Endian::Big, &descr[1..]),
        _ => (native_endian(), descr),
    };
    let width = match kind {
        "f4" => 4,
        "f8" => 8,
        other => bail!("unsupported .npy dtype '{}' (expected f4 or f8)", other),
    };

    let fortran_order = match dict_value(text, "fortran_order")?.trim() {
        "True" => true,
        "False" => false,
        other => bail!("bad fortran_order value '{}'", other),
    };

    let shape_text = dict_value(text, "shape")?;
    let shape = shape_text
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| anyhow!("bad .npy shape entry '{}'", s))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Header {
        endian,
        width,
        fortran_order,
        shape,
    })
}

fn native_endian() -> Endian {
    if cfg!(target_endian = "big") {
        Endian::Big
    } else {
        Endian::Little
    }
}

/// Raw text of the value stored under `key` in the header dict.
fn dict_value<'a>(text: &'a str, key: &str) -> Result<&'a str> {
    let quoted = [format!("'{}'", key), format!("\"{}\"", key)];
    let start = quoted
        .iter()
        .find_map(|q| text.find(q.as_str()).map(|i| i + q.len()))
        .ok_or_else(|| anyhow!(".npy header has no '{}'", key))?;
    let rest = text[start..].trim_start();
    let rest = rest
        .strip_prefix(':')
        .ok_or_else(|| anyhow!("malformed .npy header near '{}'", key))?
        .trim_start();

    // A tuple value runs to its closing paren; anything else to the next comma.
    let end = if rest.starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else {
        rest.find([',', '}'])
    }
    .ok_or_else(|| anyhow!("malformed .npy header near '{}'", key))?;
    Ok(&rest[..end])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a v1 `.npy` buffer the way `numpy.save` does.
    pub(crate) fn npy_f4(shape: &str, values: &[f32]) -> Vec<u8> {
        let dict = format!(
            "{{'descr': '<f4', 'fortran_order': False, 'shape': {}, }}",
            shape
        );
        let mut header = dict.into_bytes();
        let unpadded = MAGIC.len() + 4 + header.len() + 1;
        header.extend(std::iter::repeat(b' ').take((64 - unpadded % 64) % 64));
        header.push(b'\n');

        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(&header);
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_parse_v1_row_vector() {
        let bytes = npy_f4("(1, 3)", &[0.5, -1.25, 2.0]);
        assert_eq!(parse_npy(&bytes).unwrap(), vec![0.5, -1.25, 2.0]);
    }

    #[test]
    fn test_parse_one_dimensional() {
        let bytes = npy_f4("(2,)", &[1.0, 2.0]);
        assert_eq!(parse_npy(&bytes).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_parse_v2_big_endian_f8() {
        let dict = b"{'descr': '>f8', 'fortran_order': False, 'shape': (2,), }\n";
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[2, 0]);
        bytes.extend_from_slice(&(dict.len() as u32).to_le_bytes());
        bytes.extend_from_slice(dict);
        bytes.extend_from_slice(&0.25f64.to_be_bytes());
        bytes.extend_from_slice(&(-3.0f64).to_be_bytes());
        assert_eq!(parse_npy(&bytes).unwrap(), vec![0.25, -3.0]);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse_npy(b"PK\x03\x04 definitely a zip").is_err());

        let mut truncated = npy_f4("(1, 4)", &[1.0, 2.0, 3.0, 4.0]);
        truncated.truncate(truncated.len() - 3);
        assert!(parse_npy(&truncated).is_err());

        let mut ints = npy_f4("(2,)", &[1.0, 2.0]);
        let at = ints.windows(3).position(|w| w == b"<f4").unwrap();
        ints[at + 1] = b'i';
        let err = parse_npy(&ints).unwrap_err();
        assert!(err.to_string().contains("dtype"));
    }

    #[test]
    fn test_rejects_overflowing_shape() {
        let bytes = npy_f4("(4294967296, 4294967296)", &[1.0]);
        let err = parse_npy(&bytes).unwrap_err();
        assert!(err.to_string().contains("too large"), "{}", err);

        // Wraps to zero under unchecked arithmetic.
        let bytes = npy_f4("(4611686018427387904, 4)", &[]);
        assert!(parse_npy(&bytes).is_err());
    }

    #[test]
    fn test_header_parse() {
        let header =
            parse_header("{'descr': '<f4', 'fortran_order': True, 'shape': (512,), }").unwrap();
        assert_eq!(header.shape, vec![512]);
        assert!(header.fortran_order);
        assert_eq!(header.width, 4);
    }
}
