//! Byte-Level Byte Pair Encoding (DeBERTa / GPT-2 vocabulary)
//!
//! ## How encoding works
//!
//! 1. **Pre-tokenize**: split the text into words with the GPT-2 pattern
//!    (contractions, letter runs, digit runs, other symbols, whitespace).
//! 2. **Byte mapping**: every UTF-8 byte of a word becomes one printable
//!    unicode character, so `" hello"` turns into `"Ġhello"`.
//! 3. **Merge**: repeatedly merge the adjacent pair with the lowest rank in
//!    `merges.txt` until no ranked pair remains.
//! 4. **Lookup**: each resulting symbol is looked up in `vocab.json`.
//!
//! Decoding concatenates the symbols and maps characters back to bytes.
//!
//! ## Example
//!
//! Given merges `h e`, `l l`, `he ll`, `hell o`, the word `"hello"` goes
//! `h e l l o → he l l o → he ll o → hell o → hello`.

use crate::error::{FinetuneError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

/// GPT-2 pre-tokenization pattern without the `\s+(?!\S)` look-ahead,
/// which [`ByteLevelBpe::pre_tokenize`] emulates by hand.
const PRE_TOKENIZE_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

/// The reversible byte → printable character table used by GPT-2 style vocabularies.
///
/// Printable Latin-1 bytes map to themselves; the remaining 68 bytes are
/// shifted to code points from U+0100 upwards.
pub fn bytes_to_unicode() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut shifted = 0u32;
    for byte in 0..=255u8 {
        let printable = matches!(byte, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
        let code = if printable {
            byte as u32
        } else {
            shifted += 1;
            255 + shifted
        };
        table[byte as usize] = char::from_u32(code).unwrap_or('\0');
    }
    table
}

/// A byte-level BPE tokenizer loaded from `vocab.json` + `merges.txt`.
pub struct ByteLevelBpe {
    vocab: HashMap<String, usize>,
    id_to_token: Vec<String>,
    ranks: HashMap<(String, String), usize>,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    pattern: Regex,
    unk_id: Option<usize>,
    /// Word → merged symbols; Cora abstracts repeat the same words a lot
    cache: Mutex<HashMap<String, Vec<String>>>,
}

impl ByteLevelBpe {
    /// Build from an in-memory vocabulary and ordered merge list.
    pub fn new(vocab: HashMap<String, usize>, merges: Vec<(String, String)>) -> Result<Self> {
        let pattern = Regex::new(PRE_TOKENIZE_PATTERN)
            .map_err(|e| FinetuneError::Tokenizer(format!("bad pre-tokenize pattern: {}", e)))?;

        let size = vocab.values().max().map_or(0, |&m| m + 1);
        let mut id_to_token = vec![String::new(); size];
        for (token, &id) in &vocab {
            id_to_token[id] = token.clone();
        }

        let ranks = merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank))
            .collect();

        let byte_encoder = bytes_to_unicode();
        let byte_decoder = byte_encoder
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        let unk_id = vocab.get("[UNK]").or_else(|| vocab.get("<unk>")).copied();

        Ok(Self {
            vocab,
            id_to_token,
            ranks,
            byte_encoder,
            byte_decoder,
            pattern,
            unk_id,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Load `vocab.json` (token → id) and `merges.txt` (one `a b` pair per line).
    pub fn from_files(vocab_path: &Path, merges_path: &Path) -> Result<Self> {
        let vocab: HashMap<String, usize> = serde_json::from_str(&fs::read_to_string(vocab_path)?)?;

        let merges_text = fs::read_to_string(merges_path)?;
        let mut merges = Vec::new();
        for (line_no, line) in merges_text.lines().enumerate() {
            if line.starts_with("#version") || line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split(' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(a), Some(b), None) => merges.push((a.to_string(), b.to_string())),
                _ => {
                    return Err(FinetuneError::Tokenizer(format!(
                        "{}:{}: expected two symbols, got {:?}",
                        merges_path.display(),
                        line_no + 1,
                        line
                    )))
                }
            }
        }

        Self::new(vocab, merges)
    }

    pub fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn token_to_id(&self, token: &str) -> Option<usize> {
        self.vocab.get(token).copied()
    }

    /// Split text into GPT-2 words.
    ///
    /// A whitespace run followed by more text gives up its last character,
    /// which then starts the next word (`"a  b"` → `["a", " ", " b"]`).
    pub fn pre_tokenize<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut words = Vec::new();
        let mut pos = 0;
        while let Some(m) = self.pattern.find_at(text, pos) {
            let word = m.as_str();
            let is_space = word.chars().all(char::is_whitespace);
            if is_space && m.end() < text.len() {
                let last = word.char_indices().last().map_or(0, |(i, _)| i);
                if last > 0 {
                    words.push(&word[..last]);
                    pos = m.start() + last;
                    continue;
                }
            }
            words.push(word);
            pos = m.end();
        }
        words
    }

    /// Apply ranked merges to one byte-mapped word.
    fn merge_word(&self, word: &str) -> Vec<String> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(word) {
                return hit.clone();
            }
        }

        let mut symbols: Vec<String> = word.chars().map(String::from).collect();
        // Buffer to avoid repeated allocations
        let mut merged = Vec::with_capacity(symbols.len());

        loop {
            let best = symbols
                .windows(2)
                .filter_map(|w| {
                    self.ranks
                        .get(&(w[0].clone(), w[1].clone()))
                        .map(|&rank| (rank, w[0].clone(), w[1].clone()))
                })
                .min_by_key(|(rank, _, _)| *rank);
            let Some((_, left, right)) = best else {
                break;
            };

            merged.clear();
            let mut i = 0;
            while i < symbols.len() {
                if i + 1 < symbols.len() && symbols[i] == left && symbols[i + 1] == right {
                    merged.push(format!("{}{}", left, right));
                    i += 2;
                } else {
                    merged.push(symbols[i].clone());
                    i += 1;
                }
            }
            std::mem::swap(&mut symbols, &mut merged);
            if symbols.len() == 1 {
                break;
            }
        }

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(word.to_string(), symbols.clone());
        }
        symbols
    }

    /// Encode text to token ids (no special tokens).
    ///
    /// Symbols missing from the vocabulary map to the unknown token if the
    /// vocabulary has one and are dropped otherwise.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        let mut ids = Vec::new();
        for word in self.pre_tokenize(text) {
            let mapped: String = word.bytes().map(|b| self.byte_encoder[b as usize]).collect();
            for symbol in self.merge_word(&mapped) {
                if let Some(id) = self.vocab.get(&symbol).copied().or(self.unk_id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Decode token ids back to text; unknown ids are skipped.
    pub fn decode(&self, ids: &[usize]) -> String {
        let joined: String = ids
            .iter()
            .filter_map(|&id| self.id_to_token.get(id))
            .map(String::as_str)
            .collect();
        let bytes: Vec<u8> = joined
            .chars()
            .filter_map(|c| self.byte_decoder.get(&c).copied())
            .collect();
        String::from_utf8_lossy(&bytes).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// All single byte symbols plus a few merges for "hello" and " world".
    fn tiny_bpe() -> ByteLevelBpe {
        let table = bytes_to_unicode();
        let mut vocab: HashMap<String, usize> = HashMap::new();
        for c in ["[PAD]", "[CLS]", "[SEP]", "[UNK]"] {
            vocab.insert(c.to_string(), vocab.len());
        }
        for c in table {
            vocab.insert(c.to_string(), vocab.len());
        }
        let merges: Vec<(String, String)> = [
            ("h", "e"),
            ("l", "l"),
            ("he", "ll"),
            ("hell", "o"),
            ("Ġ", "w"),
            ("o", "r"),
            ("Ġw", "or"),
        ]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect();
        for (a, b) in &merges {
            vocab.insert(format!("{}{}", a, b), vocab.len());
        }
        ByteLevelBpe::new(vocab, merges).unwrap()
    }

    #[test]
    fn test_byte_table_is_a_bijection() {
        let table = bytes_to_unicode();
        assert_eq!(table[b'A' as usize], 'A');
        assert_eq!(table[b' ' as usize], 'Ġ');
        assert_eq!(table[b'\n' as usize], 'Ċ');
        let unique: std::collections::HashSet<char> = table.iter().copied().collect();
        assert_eq!(unique.len(), 256);
    }

    #[test]
    fn test_pre_tokenize_matches_gpt2_splits() {
        let bpe = tiny_bpe();
        assert_eq!(
            bpe.pre_tokenize("Hello world, it's 2024!"),
            vec!["Hello", " world", ",", " it", "'s", " 2024", "!"]
        );
        assert_eq!(bpe.pre_tokenize("a   b"), vec!["a", "  ", " b"]);
        assert_eq!(bpe.pre_tokenize("a\nb"), vec!["a", "\n", "b"]);
        assert_eq!(bpe.pre_tokenize("end  "), vec!["end", "  "]);
    }

    #[test]
    fn test_merges_follow_rank_order() {
        let bpe = tiny_bpe();
        let ids = bpe.encode("hello world");
        assert_eq!(ids[0], bpe.token_to_id("hello").unwrap());
        assert_eq!(ids[1], bpe.token_to_id("Ġwor").unwrap());
        assert_eq!(ids.len(), 4); // hello, Ġwor, l, d
    }

    #[test]
    fn test_decode_inverts_encode() {
        let bpe = tiny_bpe();
        for text in ["hello world", "Tab\tand\nnewline", "UTF-8: café, 日本語"] {
            assert_eq!(bpe.decode(&bpe.encode(text)), text);
        }
    }

    #[test]
    fn test_cache_returns_same_symbols() {
        let bpe = tiny_bpe();
        let first = bpe.encode("hello hello hello");
        let second = bpe.encode("hello hello hello");
        assert_eq!(first, second);
        assert!(bpe.cache.lock().unwrap().contains_key("hello"));
    }

    #[test]
    fn test_from_files_rejects_malformed_merges() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = dir.path().join("vocab.json");
        let merges = dir.path().join("merges.txt");
        fs::write(&vocab, r#"{"a": 0, "b": 1, "ab": 2}"#).unwrap();
        fs::write(&merges, "#version: 0.2\na b\n").unwrap();
        let bpe = ByteLevelBpe::from_files(&vocab, &merges).unwrap();
        assert_eq!(bpe.encode("ab"), vec![2]);

        fs::write(&merges, "#version: 0.2\na b c\n").unwrap();
        assert!(ByteLevelBpe::from_files(&vocab, &merges).is_err());
    }
}
