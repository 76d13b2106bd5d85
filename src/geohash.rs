//! Geohash decoding.
//!
//! Just enough geohash support for relay selection and the proof-of-work
//! difficulty schedule: alphabet validation, lowercase normalization, and
//! cell-center decoding. Encoding is not needed; geohashes arrive from
//! the host application or from bookmarks.

use thiserror::Error;

/// The base-32 geohash alphabet (no a, i, l, o).
pub const ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest geohash accepted (sub-meter precision; anything longer is
/// either a typo or an attempt to overflow the decoder).
pub const MAX_PRECISION: usize = 12;

/// Geohash validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeohashError {
    #[error("empty geohash")]
    Empty,

    #[error("geohash longer than {MAX_PRECISION} characters")]
    TooLong,

    #[error("invalid geohash character '{0}'")]
    InvalidChar(char),
}

/// Validate and normalize a geohash to lowercase.
pub fn normalize(geohash: &str) -> Result<String, GeohashError> {
    if geohash.is_empty() {
        return Err(GeohashError::Empty);
    }
    if geohash.len() > MAX_PRECISION {
        return Err(GeohashError::TooLong);
    }
    let normalized = geohash.to_ascii_lowercase();
    for ch in normalized.chars() {
        if !ALPHABET.contains(&(ch as u8)) {
            return Err(GeohashError::InvalidChar(ch));
        }
    }
    Ok(normalized)
}

/// Decode a geohash to the center of its cell as `(lat, lon)` degrees.
pub fn decode_center(geohash: &str) -> Result<(f64, f64), GeohashError> {
    let normalized = normalize(geohash)?;

    let mut lat = (-90.0f64, 90.0f64);
    let mut lon = (-180.0f64, 180.0f64);
    let mut even_bit = true; // longitude first

    for ch in normalized.bytes() {
        let index = ALPHABET
            .iter()
            .position(|&a| a == ch)
            .expect("normalize validated the alphabet") as u8;

        for shift in (0..5).rev() {
            let bit = (index >> shift) & 1;
            let range = if even_bit { &mut lon } else { &mut lat };
            let mid = (range.0 + range.1) / 2.0;
            if bit == 1 {
                range.0 = mid;
            } else {
                range.1 = mid;
            }
            even_bit = !even_bit;
        }
    }

    Ok(((lat.0 + lat.1) / 2.0, (lon.0 + lon.1) / 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases() {
        assert_eq!(normalize("U4PRUYD").unwrap(), "u4pruyd");
    }

    #[test]
    fn test_normalize_rejects_invalid() {
        assert_eq!(normalize(""), Err(GeohashError::Empty));
        assert_eq!(normalize("u4ai"), Err(GeohashError::InvalidChar('a')));
        assert_eq!(
            normalize("0123456789bcd"),
            Err(GeohashError::TooLong)
        );
    }

    #[test]
    fn test_decode_known_cells() {
        // ezs42 is the canonical example cell near (42.6, -5.6)
        let (lat, lon) = decode_center("ezs42").unwrap();
        assert!((lat - 42.605).abs() < 0.03, "lat {}", lat);
        assert!((lon - -5.603).abs() < 0.03, "lon {}", lon);

        // u4pruydqqvj centers near (57.64911, 10.40744)
        let (lat, lon) = decode_center("u4pruydqqvj").unwrap();
        assert!((lat - 57.64911).abs() < 0.0001, "lat {}", lat);
        assert!((lon - 10.40744).abs() < 0.0001, "lon {}", lon);
    }

    #[test]
    fn test_decode_single_char_spans_hemisphere() {
        let (lat, lon) = decode_center("u").unwrap();
        // 'u' covers roughly northern Europe
        assert!((45.0..90.0).contains(&lat), "lat {}", lat);
        assert!((0.0..45.0).contains(&lon), "lon {}", lon);
    }

    #[test]
    fn test_decode_case_insensitive() {
        assert_eq!(
            decode_center("EZS42").unwrap(),
            decode_center("ezs42").unwrap()
        );
    }
}
