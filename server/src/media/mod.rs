pub mod probe;
pub mod processor;

/// Decode subtitle bytes for delivery as UTF-8 text.
///
/// Strips a UTF-8 BOM when present. Files that are not valid UTF-8 (or that
/// already carry replacement characters from an earlier bad conversion) are
/// re-decoded as Windows-1252, the most common legacy encoding for srt files
/// in the wild.
pub fn decode_subtitle_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);

    match std::str::from_utf8(bytes) {
        Ok(text) if !text.contains('\u{FFFD}') => text.to_string(),
        _ => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}
