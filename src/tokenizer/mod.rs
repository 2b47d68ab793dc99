//! Tokenization for the supported encoders.
//!
//! - [`WordPiece`] - BERT and SentenceBERT (`vocab.txt`)
//! - [`ByteLevelBpe`] - DeBERTa (`vocab.json` + `merges.txt`)
//!
//! [`LmTokenizer`] wraps both behind one interface that produces model-ready
//! [`Encoding`]s: `[CLS] tokens [SEP]`, truncated to `max_length`, with an
//! attention mask and token type ids.

mod bpe;
mod wordpiece;

pub use bpe::{bytes_to_unicode, ByteLevelBpe};
pub use wordpiece::WordPiece;

use crate::config::LmType;
use crate::error::{FinetuneError, Result};
use crate::hub::{ModelFiles, VocabFiles};
use rayon::prelude::*;

/// One tokenized sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Encoding {
    pub input_ids: Vec<usize>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<u8>,
    pub token_type_ids: Vec<usize>,
}

impl Encoding {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of non-padding tokens.
    pub fn num_tokens(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m != 0).count()
    }

    pub fn mask_f32(&self) -> Vec<f32> {
        self.attention_mask.iter().map(|&m| m as f32).collect()
    }

    /// Right-pad with `pad_id` (mask 0) up to `len`; longer sequences are left alone.
    pub fn pad_to(&mut self, len: usize, pad_id: usize) {
        if self.input_ids.len() >= len {
            return;
        }
        self.input_ids.resize(len, pad_id);
        self.attention_mask.resize(len, 0);
        self.token_type_ids.resize(len, 0);
    }
}

/// Pad every encoding to the longest one in `batch`.
pub fn pad_batch(batch: &mut [Encoding], pad_id: usize) {
    let longest = batch.iter().map(Encoding::len).max().unwrap_or(0);
    for enc in batch.iter_mut() {
        enc.pad_to(longest, pad_id);
    }
}

enum Backend {
    WordPiece(WordPiece),
    Bpe(ByteLevelBpe),
}

/// Tokenizer for one of the supported language models.
pub struct LmTokenizer {
    backend: Backend,
    cls_id: usize,
    sep_id: usize,
    pad_id: usize,
}

impl LmTokenizer {
    /// Load the tokenizer that matches `lm_type` from resolved model files.
    pub fn from_files(lm_type: LmType, files: &ModelFiles) -> Result<Self> {
        let backend = match (&files.vocab, lm_type) {
            (VocabFiles::WordPiece { vocab }, LmType::Bert | LmType::Sentencebert) => {
                Backend::WordPiece(WordPiece::from_file(vocab, lm_type.lowercase())?)
            }
            (VocabFiles::Bpe { vocab, merges }, LmType::Deberta) => {
                Backend::Bpe(ByteLevelBpe::from_files(vocab, merges)?)
            }
            (vocab, _) => {
                return Err(FinetuneError::Tokenizer(format!(
                    "{:?} vocabulary does not fit model type {}",
                    vocab,
                    lm_type.name()
                )))
            }
        };
        Self::with_backend(backend)
    }

    pub fn from_wordpiece(wordpiece: WordPiece) -> Result<Self> {
        Self::with_backend(Backend::WordPiece(wordpiece))
    }

    pub fn from_bpe(bpe: ByteLevelBpe) -> Result<Self> {
        Self::with_backend(Backend::Bpe(bpe))
    }

    fn with_backend(backend: Backend) -> Result<Self> {
        let lookup = |token: &str| {
            let id = match &backend {
                Backend::WordPiece(wp) => wp.token_to_id(token),
                Backend::Bpe(bpe) => bpe.token_to_id(token),
            };
            id.ok_or_else(|| FinetuneError::Tokenizer(format!("vocabulary has no {} token", token)))
        };
        let cls_id = lookup("[CLS]")?;
        let sep_id = lookup("[SEP]")?;
        let pad_id = lookup("[PAD]")?;
        Ok(Self {
            backend,
            cls_id,
            sep_id,
            pad_id,
        })
    }

    pub fn cls_id(&self) -> usize {
        self.cls_id
    }

    pub fn sep_id(&self) -> usize {
        self.sep_id
    }

    pub fn pad_id(&self) -> usize {
        self.pad_id
    }

    pub fn vocab_size(&self) -> usize {
        match &self.backend {
            Backend::WordPiece(wp) => wp.vocab_size(),
            Backend::Bpe(bpe) => bpe.vocab_size(),
        }
    }

    /// Token ids without special tokens.
    pub fn tokenize(&self, text: &str) -> Vec<usize> {
        match &self.backend {
            Backend::WordPiece(wp) => wp.encode(text),
            Backend::Bpe(bpe) => bpe.encode(text),
        }
    }

    pub fn decode(&self, ids: &[usize]) -> String {
        let content: Vec<usize> = ids
            .iter()
            .copied()
            .filter(|&id| id != self.cls_id && id != self.sep_id && id != self.pad_id)
            .collect();
        match &self.backend {
            Backend::WordPiece(wp) => wp.decode(&content),
            Backend::Bpe(bpe) => bpe.decode(&content),
        }
    }

    /// `[CLS] tokens [SEP]`, keeping at most `max_length` ids in total.
    pub fn encode(&self, text: &str, max_length: usize) -> Encoding {
        let mut body = self.tokenize(text);
        body.truncate(max_length.saturating_sub(2));

        let mut input_ids = Vec::with_capacity(body.len() + 2);
        input_ids.push(self.cls_id);
        input_ids.extend(body);
        input_ids.push(self.sep_id);

        let len = input_ids.len();
        Encoding {
            input_ids,
            attention_mask: vec![1; len],
            token_type_ids: vec![0; len],
        }
    }

    /// Encode many texts in parallel without padding.
    pub fn encode_all<S: AsRef<str> + Sync>(&self, texts: &[S], max_length: usize) -> Vec<Encoding> {
        texts
            .par_iter()
            .map(|t| self.encode(t.as_ref(), max_length))
            .collect()
    }

    /// Encode and pad to the longest sequence in `texts`.
    pub fn encode_batch<S: AsRef<str> + Sync>(&self, texts: &[S], max_length: usize) -> Vec<Encoding> {
        let mut batch = self.encode_all(texts, max_length);
        pad_batch(&mut batch, self.pad_id);
        batch
    }
}
