//! Filename codec: repair of non-ASCII filenames.
//!
//! Object keys and filenames reach the orchestrator through several lossy
//! channels: URL-percent-encoded, Latin-1 mojibake (UTF-8 bytes mis-decoded
//! as Latin-1 somewhere upstream), GBK, or already-correct UTF-8. The codec
//! deterministically repairs the known cases and leaves everything else
//! untouched. All functions are pure and idempotent.

use percent_encoding::percent_decode_str;
use tracing::debug;

/// Code points that only show up when UTF-8 bytes were mis-decoded through a
/// single-byte encoding. A filename containing any of these is treated as
/// mojibake and run through the repair chain.
const GARBLED_CHARS: &[char] = &[
    'ã', 'è', '§', 'é', '¢', 'æ', '°', 'º', 'å', 'ä', 'ç', 'ï', 'ì', 'í', 'î', 'ñ', 'ò', 'ó',
    'ô', 'õ', 'ö', 'ù', 'ú', 'û', 'ü', 'ý', 'ÿ', 'À', 'Á', 'Â', 'Ã', 'Ä', 'Å', 'Æ', 'Ç', 'È',
    'É', 'Ê', 'Ë', 'Ì', 'Í', 'Î', 'Ï', 'Ð', 'Ñ', 'Ò', 'Ó', 'Ô', 'Õ', 'Ö', 'Ø', 'Ù', 'Ú', 'Û',
    'Ü', 'Ý', 'Þ', 'ß', 'à', 'á', 'â',
];

/// Decode the filename component of a URL or path, repairing URL-encoding and
/// mojibake along the way.
pub fn decode_filename(url_or_path: &str) -> String {
    let filename = basename(url_or_path);

    if is_url_encoded(filename) {
        if let Ok(decoded) = percent_decode_str(filename).decode_utf8() {
            if decoded != filename && !has_garbled_chars(&decoded) {
                return decoded.into_owned();
            }
        }
    }

    if !has_garbled_chars(filename) {
        return filename.to_string();
    }

    fix_encoding(filename)
}

/// Repair mojibake in a filename or full key. Returns the input unchanged
/// when no garbled code points are present or no candidate repairs cleanly.
pub fn fix_encoding(text: &str) -> String {
    if text.is_empty() || !has_garbled_chars(text) {
        return text.to_string();
    }

    match try_encoding_fixes(text) {
        Some(fixed) if fixed != text => {
            debug!("repaired filename encoding: {} -> {}", text, fixed);
            fixed
        }
        _ => {
            debug!("could not repair garbled filename: {}", text);
            text.to_string()
        }
    }
}

fn has_garbled_chars(text: &str) -> bool {
    text.chars().any(|c| GARBLED_CHARS.contains(&c))
}

/// True when the text contains at least one `%XX` escape.
fn is_url_encoded(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.windows(3).any(|w| {
        w[0] == b'%' && w[1].is_ascii_hexdigit() && w[2].is_ascii_hexdigit()
    })
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Candidate repairs, first clean result wins:
/// 1. Latin-1 re-encode: map each code point < 0x100 back to a byte and
///    re-read the bytes as UTF-8 (covers the ISO-8859-1 and byte-cast cases).
/// 2. GBK re-encode: recover UTF-8 bytes that were mis-decoded as GBK.
fn try_encoding_fixes(text: &str) -> Option<String> {
    if let Some(fixed) = latin1_reencode(text) {
        if !has_garbled_chars(&fixed) {
            return Some(fixed);
        }
    }

    if text.chars().any(|c| !c.is_ascii()) {
        let (bytes, _, had_unmappable) = encoding_rs::GBK.encode(text);
        if !had_unmappable {
            if let Ok(fixed) = String::from_utf8(bytes.into_owned()) {
                if !has_garbled_chars(&fixed) {
                    return Some(fixed);
                }
            }
        }
    }

    None
}

fn latin1_reencode(text: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(text.len());
    for c in text.chars() {
        let cp = c as u32;
        if cp > 0xFF {
            return None;
        }
        bytes.push(cp as u8);
    }
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// "浙音文件" after its UTF-8 bytes were mis-decoded as Latin-1.
    fn latin1_mojibake(original: &str) -> String {
        original.as_bytes().iter().map(|&b| b as char).collect()
    }

    #[test]
    fn test_clean_names_pass_through() {
        assert_eq!(decode_filename("report.pdf"), "report.pdf");
        assert_eq!(decode_filename("2024本科生学生手册.pdf"), "2024本科生学生手册.pdf");
        assert_eq!(
            decode_filename("浙音文件/2024本科生学生手册.pdf"),
            "2024本科生学生手册.pdf"
        );
    }

    #[test]
    fn test_url_encoded_names() {
        assert_eq!(
            decode_filename("%E6%B5%99%E9%9F%B3%E6%96%87%E4%BB%B6.pdf"),
            "浙音文件.pdf"
        );
        assert_eq!(decode_filename("a%20b.pdf"), "a b.pdf");
        // a literal percent that is not an escape stays put
        assert_eq!(decode_filename("100%.pdf"), "100%.pdf");
    }

    #[test]
    fn test_latin1_mojibake_repair() {
        let garbled = latin1_mojibake("浙音文件.pdf");
        assert!(has_garbled_chars(&garbled));
        assert_eq!(fix_encoding(&garbled), "浙音文件.pdf");
        assert_eq!(decode_filename(&garbled), "浙音文件.pdf");
    }

    #[test]
    fn test_full_path_repair() {
        let garbled = latin1_mojibake("浙音文件/2024手册.pdf");
        assert_eq!(fix_encoding(&garbled), "浙音文件/2024手册.pdf");
    }

    #[test]
    fn test_unfixable_returns_input() {
        // Garbled marker present but the bytes never were valid UTF-8
        let input = "résumé.pdf";
        assert_eq!(fix_encoding(input), input);
    }

    #[test]
    fn test_idempotence() {
        let cases = [
            "report.pdf".to_string(),
            "2024本科生学生手册.pdf".to_string(),
            "%E6%B5%99.pdf".to_string(),
            latin1_mojibake("浙音文件.pdf"),
            "résumé.pdf".to_string(),
        ];
        for case in cases {
            let once = decode_filename(&case);
            let twice = decode_filename(&once);
            assert_eq!(once, twice, "decode not idempotent for {:?}", case);
        }
    }
}
