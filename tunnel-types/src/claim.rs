//! Claim codes: short-lived, single-use pairing tokens.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::WireError;

/// Symbols a claim code may contain. `0`, `O`, `1` and `I` are excluded.
pub const CLAIM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of symbols in a claim code.
pub const CLAIM_CODE_LEN: usize = 8;

/// A validated claim code.
///
/// Always stored in canonical form: upper case, exactly [`CLAIM_CODE_LEN`]
/// symbols from [`CLAIM_CODE_ALPHABET`], no separators.
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClaimCode(String);

impl ClaimCode {
    /// Parse user input into a claim code.
    ///
    /// Surrounding whitespace is trimmed, input is upper-cased and `-` or
    /// space separators are dropped, so `abcd-2345` and `ABCD2345` name the
    /// same code.
    pub fn parse(input: &str) -> Result<Self, WireError> {
        let canonical: String = input
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != ' ')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if canonical.len() != CLAIM_CODE_LEN
            || !canonical.bytes().all(|b| CLAIM_CODE_ALPHABET.contains(&b))
        {
            return Err(WireError::InvalidClaimCode);
        }
        Ok(Self(canonical))
    }

    /// Build a code from alphabet indices.
    ///
    /// Returns `None` if the count is wrong or an index is out of range.
    pub fn from_indices(indices: &[usize]) -> Option<Self> {
        if indices.len() != CLAIM_CODE_LEN {
            return None;
        }
        indices
            .iter()
            .map(|&i| CLAIM_CODE_ALPHABET.get(i).map(|&b| b as char))
            .collect::<Option<String>>()
            .map(Self)
    }

    /// The canonical string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Human-friendly form with a separator in the middle (`ABCD-2345`).
    pub fn grouped(&self) -> String {
        let (head, tail) = self.0.split_at(CLAIM_CODE_LEN / 2);
        format!("{head}-{tail}")
    }
}

impl FromStr for ClaimCode {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ClaimCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Codes are bearer secrets until consumed.
impl fmt::Debug for ClaimCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimCode({}****)", &self.0[..2])
    }
}

impl<'de> Deserialize<'de> for ClaimCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphabet_excludes_ambiguous_glyphs() {
        for ambiguous in [b'0', b'O', b'1', b'I'] {
            assert!(!CLAIM_CODE_ALPHABET.contains(&ambiguous));
        }
    }

    #[test]
    fn parse_normalizes_input() {
        let code = ClaimCode::parse("  abcd-2345 ").unwrap();
        assert_eq!(code.as_str(), "ABCD2345");
        assert_eq!(code.grouped(), "ABCD-2345");
        assert_eq!(ClaimCode::parse("AB CD 23 45").unwrap(), code);
    }

    #[test]
    fn parse_rejects_bad_codes() {
        assert!(ClaimCode::parse("ABCD234").is_err());
        assert!(ClaimCode::parse("ABCD23456").is_err());
        assert!(ClaimCode::parse("ABCD2340").is_err()); // zero
        assert!(ClaimCode::parse("ABCDIOOO").is_err());
        assert!(ClaimCode::parse("").is_err());
    }

    #[test]
    fn from_indices_maps_alphabet() {
        let code = ClaimCode::from_indices(&[0, 1, 2, 3, 24, 25, 26, 27]).unwrap();
        assert_eq!(code.as_str(), "ABCD2345");
        assert!(ClaimCode::from_indices(&[0; 7]).is_none());
        assert!(ClaimCode::from_indices(&[0, 0, 0, 0, 0, 0, 0, 99]).is_none());
    }

    #[test]
    fn debug_does_not_leak_code() {
        let code = ClaimCode::parse("ABCD2345").unwrap();
        let debug = format!("{code:?}");
        assert!(!debug.contains("2345"));
    }

    #[test]
    fn deserialize_validates() {
        let ok: ClaimCode = serde_json::from_str("\"wxyz-6789\"").unwrap();
        assert_eq!(ok.as_str(), "WXYZ6789");
        assert!(serde_json::from_str::<ClaimCode>("\"short\"").is_err());
    }
}
