//! Canonical UID normalization
//!
//! Every UID entering the agent — from a PC/SC reader, a remote device frame
//! or the HTTP injection endpoint — passes through [`normalize`] exactly
//! once. Downstream equality checks (tag cache, write routing) assume the
//! normalized form: uppercase hex pairs joined by `:`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UidError {
    #[error("UID is empty")]
    Empty,
    #[error("UID contains non-hex character {0:?}")]
    NonHex(char),
    #[error("UID has an odd number of hex digits")]
    OddLength,
    #[error("UID is shorter than two bytes")]
    TooShort,
}

/// Normalize a UID to uppercase colon-separated hex pairs.
///
/// Accepts `04:AB:CD:EF`, `04ABCDEF`, `04 AB CD EF` and `04-AB-CD-EF`
/// (separators may be mixed). Idempotent: feeding the output back in
/// returns it unchanged.
pub fn normalize(raw: &str) -> Result<String, UidError> {
    let mut digits = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == ':' || c == '-' || c.is_whitespace() {
            continue;
        }
        if !c.is_ascii_hexdigit() {
            return Err(UidError::NonHex(c));
        }
        digits.push(c.to_ascii_uppercase());
    }

    if digits.is_empty() {
        return Err(UidError::Empty);
    }
    if digits.len() % 2 != 0 {
        return Err(UidError::OddLength);
    }
    if digits.len() < 4 {
        return Err(UidError::TooShort);
    }

    let bytes: Vec<&str> = digits
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).expect("hex digits are ASCII"))
        .collect();
    Ok(bytes.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_all_separator_styles() {
        for raw in ["04:AB:CD:EF", "04ABCDEF", "04 AB CD EF", "04-AB-CD-EF"] {
            assert_eq!(normalize(raw).unwrap(), "04:AB:CD:EF", "input {raw:?}");
        }
    }

    #[test]
    fn uppercases_hex() {
        assert_eq!(normalize("deadbeef").unwrap(), "DE:AD:BE:EF");
    }

    #[test]
    fn is_idempotent() {
        let once = normalize("04 ab cd ef").unwrap();
        assert_eq!(normalize(&once).unwrap(), once);
    }

    #[test]
    fn output_shape() {
        let uid = normalize("0102030405060708").unwrap();
        assert!(uid.split(':').all(|p| {
            p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
        }));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(normalize(""), Err(UidError::Empty));
        assert_eq!(normalize(" :- "), Err(UidError::Empty));
        assert_eq!(normalize("04G2"), Err(UidError::NonHex('G')));
        assert_eq!(normalize("04ABC"), Err(UidError::OddLength));
        assert_eq!(normalize("04"), Err(UidError::TooShort));
    }
}
