//! Character-level vocabulary: a bijection between SMILES characters and token indices.
//!
//! The first three indices are reserved: padding, the start symbol, and the terminator.

use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    dataset::Sequence,
    error::{Error, Result},
};

pub const PAD_SYMBOL: char = ' ';
pub const START_SYMBOL: char = '&';
pub const END_SYMBOL: char = '\n';

pub const PAD_TOKEN: u32 = 0;
pub const START_TOKEN: u32 = 1;
pub const END_TOKEN: u32 = 2;

const SPECIALS: [char; 3] = [PAD_SYMBOL, START_SYMBOL, END_SYMBOL];

/// On-disk form. The index of each symbol is its position.
#[derive(Serialize, Deserialize)]
struct VocabFile {
    symbols: Vec<char>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Vocabulary {
    symbols: Vec<char>,
    index: HashMap<char, u32>,
}

impl Vocabulary {
    /// Build from a symbol list, where position = token. The reserved symbols must come first,
    /// and no symbol may repeat.
    pub fn from_symbols(symbols: Vec<char>) -> Result<Self> {
        if symbols.len() < SPECIALS.len() || symbols[..SPECIALS.len()] != SPECIALS {
            return Err(Error::InvalidVocabulary(format!(
                "the first symbols must be {SPECIALS:?}"
            )));
        }

        let mut index = HashMap::with_capacity(symbols.len());
        for (i, &sym) in symbols.iter().enumerate() {
            if index.insert(sym, i as u32).is_some() {
                return Err(Error::InvalidVocabulary(format!(
                    "symbol {sym:?} appears more than once"
                )));
            }
        }

        Ok(Self { symbols, index })
    }

    /// Collect every character used in a SMILES corpus. Characters are sorted, so the same
    /// corpus always yields the same vocabulary.
    pub fn build<'a>(corpus: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut chars = BTreeSet::new();
        for smiles in corpus {
            for c in smiles.chars() {
                if SPECIALS.contains(&c) {
                    return Err(Error::InvalidVocabulary(format!(
                        "corpus contains the reserved symbol {c:?} in {smiles:?}"
                    )));
                }
                chars.insert(c);
            }
        }

        let mut symbols = SPECIALS.to_vec();
        symbols.extend(chars);
        Self::from_symbols(symbols)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn token(&self, symbol: char) -> Option<u32> {
        self.index.get(&symbol).copied()
    }

    pub fn symbol(&self, token: u32) -> Option<char> {
        self.symbols.get(token as usize).copied()
    }

    /// Wrap a SMILES string in the start and terminator tokens.
    pub fn encode(&self, smiles: &str) -> Result<Sequence> {
        let mut tokens = Vec::with_capacity(smiles.len() + 2);
        tokens.push(START_TOKEN);
        for c in smiles.chars() {
            if SPECIALS.contains(&c) {
                return Err(Error::UnknownSymbol(c));
            }
            tokens.push(self.token(c).ok_or(Error::UnknownSymbol(c))?);
        }
        tokens.push(END_TOKEN);

        Sequence::new(tokens)
    }

    /// Convert a generated token run back to text: the leading start token and a trailing
    /// terminator are dropped; everything in between is written as-is, reserved symbols included.
    pub fn decode(&self, tokens: &[u32]) -> String {
        let body = match tokens.first() {
            Some(&START_TOKEN) => &tokens[1..],
            _ => tokens,
        };
        let body = match body.last() {
            Some(&END_TOKEN) => &body[..body.len() - 1],
            _ => body,
        };

        body.iter().filter_map(|&t| self.symbol(t)).collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(
            file,
            &VocabFile {
                symbols: self.symbols.clone(),
            },
        )?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let file: VocabFile = serde_json::from_slice(&bytes)?;
        Self::from_symbols(file.symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_tokens_come_first() {
        let vocab = Vocabulary::build(["CCO", "c1ccccc1"]).unwrap();
        assert_eq!(vocab.token(PAD_SYMBOL), Some(PAD_TOKEN));
        assert_eq!(vocab.token(START_SYMBOL), Some(START_TOKEN));
        assert_eq!(vocab.token(END_SYMBOL), Some(END_TOKEN));
        // Specials, plus '1', 'C', 'O', 'c'.
        assert_eq!(vocab.len(), 7);
        assert_eq!(vocab.symbol(3), Some('1'));
    }

    #[test]
    fn encode_decode() {
        let vocab = Vocabulary::build(["CC(=O)O"]).unwrap();
        let seq = vocab.encode("CC(=O)O").unwrap();
        assert_eq!(seq.len(), 9);
        assert_eq!(seq.tokens()[0], START_TOKEN);
        assert_eq!(*seq.tokens().last().unwrap(), END_TOKEN);
        assert_eq!(vocab.decode(seq.tokens()), "CC(=O)O");

        assert!(matches!(vocab.encode("CN"), Err(Error::UnknownSymbol('N'))));
    }

    #[test]
    fn rejects_broken_tables() {
        assert!(Vocabulary::from_symbols(vec!['C', ' ', '&', '\n']).is_err());
        assert!(Vocabulary::from_symbols(vec![' ', '&', '\n', 'C', 'C']).is_err());
        assert!(Vocabulary::build(["C&C"]).is_err());
    }

    #[test]
    fn save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");

        let vocab = Vocabulary::build(["CCN", "c1ccsc1"]).unwrap();
        vocab.save(&path).unwrap();
        assert_eq!(Vocabulary::load(&path).unwrap(), vocab);
    }
}
