//! Roster name normalization.
//!
//! Classifier labels come from training directory names ("nguyen_van_a"),
//! roster entries carry full display names ("Nguyễn Văn A"). Both sides are
//! reduced to a diacritic-free, separator-free, lowercase form before
//! comparison.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalize a name for roster matching: NFD-decompose, drop combining
/// marks, drop spaces and underscores, lowercase.
pub fn normalize_name(name: &str) -> String {
    name.nfd()
        .filter(|c| !is_combining_mark(*c))
        .filter(|c| *c != ' ' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_diacritics() {
        assert_eq!(normalize_name("Nguyễn Văn A"), "nguyenvana");
    }

    #[test]
    fn test_matches_ascii_variant() {
        assert_eq!(normalize_name("Nguyễn Văn A"), normalize_name("nguyen van a"));
        assert_eq!(normalize_name("Nguyễn Văn A"), normalize_name("Nguyen_Van_A"));
    }

    #[test]
    fn test_plain_ascii_passthrough() {
        assert_eq!(normalize_name("Tran Thi B"), "tranthib");
    }

    #[test]
    fn test_empty() {
        assert_eq!(normalize_name(""), "");
    }
}
