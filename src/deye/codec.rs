//! Conversions from raw register words to physical quantities.

pub fn decode_scaled(word: u16, scale: f64) -> f64 {
    f64::from(word) * scale
}

/// Words as one big-endian unsigned integer, first word most significant.
pub fn compose_unsigned(words: &[u16]) -> u64 {
    words.iter().fold(0u64, |acc, &word| (acc << 16) | u64::from(word))
}

/// Decodes the active power reading. Each word goes out as its big-endian byte pair, the pairs are
/// concatenated last word first and the result is read as one big-endian unsigned integer.
pub fn decode_reversed_words(words: &[u16], scale: f64) -> f64 {
    let bytes: Vec<u8> = words.iter().rev().flat_map(|word| word.to_be_bytes()).collect();

    let value = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    value as f64 * scale
}
