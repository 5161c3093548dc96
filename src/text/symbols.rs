//! Symbol table shared by the text encoder and the acoustic model.
//!
//! Layout: pad, EOS, punctuation, then the Hangul conjoining jamo (leading
//! consonants, vowels, trailing consonants). The embedding table of the
//! acoustic model has exactly `SYMBOLS.len()` rows.

use std::collections::HashMap;
use std::sync::LazyLock;

pub const PAD: char = '_';
pub const EOS: char = '~';
pub const PUNCTUATION: &str = "!'(),-.:;? ";

/// Leading consonants U+1100..=U+1112.
pub const JAMO_LEADS: std::ops::RangeInclusive<u32> = 0x1100..=0x1112;
/// Vowels U+1161..=U+1175.
pub const JAMO_VOWELS: std::ops::RangeInclusive<u32> = 0x1161..=0x1175;
/// Trailing consonants U+11A8..=U+11C2.
pub const JAMO_TAILS: std::ops::RangeInclusive<u32> = 0x11A8..=0x11C2;

pub static SYMBOLS: LazyLock<Vec<char>> = LazyLock::new(|| {
    let jamo = JAMO_LEADS
        .chain(JAMO_VOWELS)
        .chain(JAMO_TAILS)
        .filter_map(char::from_u32);
    [PAD, EOS]
        .into_iter()
        .chain(PUNCTUATION.chars())
        .chain(jamo)
        .collect()
});

static SYMBOL_TO_ID: LazyLock<HashMap<char, u32>> = LazyLock::new(|| {
    SYMBOLS
        .iter()
        .enumerate()
        .map(|(id, &symbol)| (symbol, id as u32))
        .collect()
});

pub fn symbol_id(symbol: char) -> Option<u32> {
    SYMBOL_TO_ID.get(&symbol).copied()
}

pub fn pad_id() -> u32 {
    SYMBOL_TO_ID[&PAD]
}

pub fn eos_id() -> u32 {
    SYMBOL_TO_ID[&EOS]
}
