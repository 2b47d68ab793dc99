//! WordPiece Tokenizer (BERT vocabularies)
//!
//! Two passes, the same as the reference BERT tokenizer:
//!
//! 1. **Basic tokenization**: drop control characters, normalize whitespace,
//!    put spaces around CJK ideographs, optionally lowercase and strip
//!    accents, then split off every punctuation character.
//! 2. **WordPiece**: greedy longest-match-first against `vocab.txt`, with
//!    continuation pieces prefixed by `##`. A word that cannot be covered
//!    (or is longer than 100 characters) becomes `[UNK]`.
//!
//! ```text
//! "Unaffable!" → ["unaffable", "!"] → ["un", "##aff", "##able", "!"]
//! ```

use crate::error::{FinetuneError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const MAX_WORD_CHARS: usize = 100;
const CONTINUATION: &str = "##";

pub struct WordPiece {
    vocab: HashMap<String, usize>,
    id_to_token: Vec<String>,
    lowercase: bool,
    unk_id: usize,
}

impl WordPiece {
    pub fn new(tokens: Vec<String>, lowercase: bool) -> Result<Self> {
        let vocab: HashMap<String, usize> = tokens
            .iter()
            .enumerate()
            .map(|(id, t)| (t.clone(), id))
            .collect();
        let unk_id = *vocab
            .get("[UNK]")
            .ok_or_else(|| FinetuneError::Tokenizer("vocabulary has no [UNK] token".into()))?;
        Ok(Self {
            vocab,
            id_to_token: tokens,
            lowercase,
            unk_id,
        })
    }

    /// Load `vocab.txt`: one token per line, id = line number.
    pub fn from_file(path: &Path, lowercase: bool) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let tokens = text
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .collect();
        Self::new(tokens, lowercase)
    }

    pub fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn token_to_id(&self, token: &str) -> Option<usize> {
        self.vocab.get(token).copied()
    }

    /// Whitespace/punctuation split with normalization applied.
    pub fn basic_tokenize(&self, text: &str) -> Vec<String> {
        let mut cleaned = String::with_capacity(text.len());
        for c in text.chars() {
            if c == '\0' || c == '\u{FFFD}' || is_control(c) {
                continue;
            }
            if is_cjk(c) {
                cleaned.push(' ');
                cleaned.push(c);
                cleaned.push(' ');
            } else if c.is_whitespace() {
                cleaned.push(' ');
            } else {
                cleaned.push(c);
            }
        }

        let mut words = Vec::new();
        for token in cleaned.split_whitespace() {
            let token = if self.lowercase {
                token
                    .to_lowercase()
                    .nfd()
                    .filter(|&c| !is_combining_mark(c))
                    .collect()
            } else {
                token.to_string()
            };

            let mut current = String::new();
            for c in token.chars() {
                if is_punctuation(c) {
                    if !current.is_empty() {
                        words.push(std::mem::take(&mut current));
                    }
                    words.push(c.to_string());
                } else {
                    current.push(c);
                }
            }
            if !current.is_empty() {
                words.push(current);
            }
        }
        words
    }

    /// Greedy longest-match-first split of one word into vocabulary ids.
    fn word_pieces(&self, word: &str) -> Vec<usize> {
        let chars: Vec<char> = word.chars().collect();
        if chars.len() > MAX_WORD_CHARS {
            return vec![self.unk_id];
        }

        let mut pieces = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let mut end = chars.len();
            let mut found = None;
            while start < end {
                let mut candidate: String = chars[start..end].iter().collect();
                if start > 0 {
                    candidate.insert_str(0, CONTINUATION);
                }
                if let Some(&id) = self.vocab.get(&candidate) {
                    found = Some(id);
                    break;
                }
                end -= 1;
            }
            match found {
                Some(id) => pieces.push(id),
                None => return vec![self.unk_id],
            }
            start = end;
        }
        pieces
    }

    /// Encode text to token ids (no special tokens).
    pub fn encode(&self, text: &str) -> Vec<usize> {
        self.basic_tokenize(text)
            .iter()
            .flat_map(|w| self.word_pieces(w))
            .collect()
    }

    /// Join tokens back into text, gluing `##` continuations to the previous piece.
    pub fn decode(&self, ids: &[usize]) -> String {
        let mut out = String::new();
        for token in ids.iter().filter_map(|&id| self.id_to_token.get(id)) {
            match token.strip_prefix(CONTINUATION) {
                Some(rest) => out.push_str(rest),
                None => {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(token);
                }
            }
        }
        out
    }
}

fn is_control(c: char) -> bool {
    if matches!(c, '\t' | '\n' | '\r') {
        return false;
    }
    c.is_control() || matches!(c, '\u{200B}'..='\u{200F}' | '\u{FEFF}')
}

/// ASCII non-alphanumerics count as punctuation even where unicode says
/// otherwise (`$`, `^`, `` ` ``).
fn is_punctuation(c: char) -> bool {
    if c.is_ascii() {
        return c.is_ascii_punctuation();
    }
    matches!(c as u32,
        0x00A1..=0x00BF
        | 0x2010..=0x2027
        | 0x2030..=0x205E
        | 0x3001..=0x3003
        | 0x3008..=0x3011
        | 0x3014..=0x301F
        | 0xFF01..=0xFF0F
        | 0xFF1A..=0xFF20
        | 0xFF3B..=0xFF40
        | 0xFF5B..=0xFF65)
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF
        | 0x3400..=0x4DBF
        | 0x20000..=0x2A6DF
        | 0x2A700..=0x2B73F
        | 0x2B740..=0x2B81F
        | 0x2B820..=0x2CEAF
        | 0xF900..=0xFAFF
        | 0x2F800..=0x2FA1F)
}
