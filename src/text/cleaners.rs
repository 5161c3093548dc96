//! Named text cleaners.
//!
//! Cleaners are selected by the names listed in the `text_cleaners`
//! hyperparameter and run in order before symbol lookup.

use std::str::FromStr;

use unicode_normalization::UnicodeNormalization;

use super::numbers;
use crate::Error;

/// Hangul reading of each Latin letter, A to Z.
const LATIN_NAMES: [&str; 26] = [
    "에이", "비", "씨", "디", "이", "에프", "지", "에이치", "아이", "제이", "케이", "엘", "엠",
    "엔", "오", "피", "큐", "알", "에스", "티", "유", "브이", "더블유", "엑스", "와이", "지",
];

/// A text cleaning profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleaner {
    /// Lowercase and collapse whitespace.
    Basic,
    /// Numbers and Latin letters read out in Hangul, syllables decomposed
    /// into conjoining jamo.
    Korean,
}

impl Cleaner {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Basic => "basic_cleaners",
            Self::Korean => "korean_cleaners",
        }
    }

    pub fn clean(&self, text: &str) -> String {
        match self {
            Self::Basic => collapse_whitespace(&text.to_lowercase()),
            Self::Korean => {
                let text = normalize_punctuation(&collapse_whitespace(text));
                let text = numbers::normalize_numbers(&text);
                let text = spell_latin(&text);
                decompose_hangul(&text)
            }
        }
    }
}

impl FromStr for Cleaner {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "basic_cleaners" => Ok(Self::Basic),
            "korean_cleaners" => Ok(Self::Korean),
            other => Err(Error::Config(format!("unknown text cleaner '{other}'"))),
        }
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fold typographic punctuation onto the ASCII symbols in the table.
fn normalize_punctuation(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '“' | '”' | '"' | '‘' | '’' | '`' => '\'',
            '…' | '。' => '.',
            '，' | '、' => ',',
            '！' => '!',
            '？' => '?',
            '～' | '~' | '–' | '—' => '-',
            other => other,
        })
        .collect()
}

fn spell_latin(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphabetic() {
            let index = (c.to_ascii_uppercase() as u8 - b'A') as usize;
            out.push_str(LATIN_NAMES[index]);
        } else {
            out.push(c);
        }
    }
    out
}

/// Split precomposed Hangul syllables into leading/vowel/trailing jamo.
pub fn decompose_hangul(text: &str) -> String {
    text.nfd().collect()
}
