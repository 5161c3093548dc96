//! Text front end: cleaning and symbol encoding.
//!
//! Raw text is normalized by one or more named cleaners (see
//! [`cleaners::Cleaner`]) and then mapped character by character onto the
//! symbol table in [`symbols`]. Characters outside the table are dropped and
//! every sequence is terminated with the EOS symbol.

pub mod cleaners;
mod numbers;
pub mod symbols;

pub use cleaners::Cleaner;

use crate::{Error, Result};

/// Maps raw text to the symbol ids the acoustic model consumes.
pub trait TextEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}

/// Clean `text` with `cleaners` (in order) and convert it to symbol ids.
pub fn text_to_sequence(text: &str, cleaners: &[Cleaner]) -> Vec<u32> {
    let cleaned = cleaners
        .iter()
        .fold(text.to_string(), |acc, cleaner| cleaner.clean(&acc));

    let mut sequence: Vec<u32> = cleaned
        .chars()
        .filter(|&c| c != symbols::PAD && c != symbols::EOS)
        .filter_map(symbols::symbol_id)
        .collect();
    sequence.push(symbols::eos_id());
    sequence
}

/// Convert symbol ids back to a string of symbols.
pub fn sequence_to_text(sequence: &[u32]) -> Result<String> {
    sequence
        .iter()
        .map(|&id| {
            symbols::SYMBOLS
                .get(id as usize)
                .copied()
                .ok_or_else(|| Error::Text(format!("symbol id {id} out of range")))
        })
        .collect()
}

/// [`TextEncoder`] backed by the built-in symbol table.
#[derive(Debug, Clone)]
pub struct SymbolEncoder {
    cleaners: Vec<Cleaner>,
}

impl SymbolEncoder {
    pub fn new(cleaners: Vec<Cleaner>) -> Self {
        Self { cleaners }
    }

    /// Build from cleaner names as they appear in the hyperparameters.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let cleaners = names
            .iter()
            .map(|name| name.as_ref().parse())
            .collect::<Result<Vec<Cleaner>>>()?;
        Ok(Self::new(cleaners))
    }

    pub fn cleaners(&self) -> &[Cleaner] {
        &self.cleaners
    }
}

impl TextEncoder for SymbolEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let sequence = text_to_sequence(text, &self.cleaners);
        tracing::debug!("encoded {} chars into {} symbols", text.chars().count(), sequence.len());
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ends_with_eos() {
        let seq = text_to_sequence("안녕", &[Cleaner::Korean]);
        assert_eq!(*seq.last().unwrap(), symbols::eos_id());
        // 안 = ㅇ ㅏ ㄴ, 녕 = ㄴ ㅕ ㅇ
        assert_eq!(seq.len(), 7);
    }

    #[test]
    fn roundtrip_through_symbols() {
        let seq = text_to_sequence("안녕하세요.", &[Cleaner::Korean]);
        let text = sequence_to_text(&seq).unwrap();
        assert_eq!(
            text,
            "\u{110B}\u{1161}\u{11AB}\u{1102}\u{1167}\u{11BC}\
             \u{1112}\u{1161}\u{1109}\u{1166}\u{110B}\u{116D}.~"
        );
    }

    #[test]
    fn eos_and_pad_in_input_are_dropped() {
        let seq = text_to_sequence("a~_b", &[Cleaner::Basic]);
        // Latin letters are not in the table, so only EOS survives.
        assert_eq!(seq, vec![symbols::eos_id()]);
    }

    #[test]
    fn empty_text_is_only_eos() {
        let seq = text_to_sequence("", &[Cleaner::Korean]);
        assert_eq!(seq, vec![symbols::eos_id()]);
    }

    #[test]
    fn unknown_id_is_an_error() {
        assert!(matches!(sequence_to_text(&[10_000]), Err(Error::Text(_))));
    }

    #[test]
    fn encoder_from_names() {
        let encoder = SymbolEncoder::from_names(&["korean_cleaners"]).unwrap();
        assert_eq!(encoder.cleaners(), &[Cleaner::Korean]);
        assert!(SymbolEncoder::from_names(&["english_cleaners"]).is_err());
        let seq = encoder.encode("하나").unwrap();
        assert_eq!(seq, text_to_sequence("하나", &[Cleaner::Korean]));
    }
}
