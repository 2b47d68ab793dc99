//! Locating pretrained model files.
//!
//! A model needs three things: `config.json`, `model.safetensors` and its
//! vocabulary (`vocab.txt` for WordPiece, `vocab.json` + `merges.txt` for
//! byte-level BPE). They come either from a local directory or from the
//! HuggingFace hub cache, downloading on first use.

use crate::config::LmType;
use crate::error::{FinetuneError, Result};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Vocabulary files for the two tokenizer families.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VocabFiles {
    WordPiece { vocab: PathBuf },
    Bpe { vocab: PathBuf, merges: PathBuf },
}

impl VocabFiles {
    fn names(lm_type: LmType) -> &'static [&'static str] {
        if lm_type.uses_wordpiece() {
            &["vocab.txt"]
        } else {
            &["vocab.json", "merges.txt"]
        }
    }

    fn from_paths(lm_type: LmType, mut paths: Vec<PathBuf>) -> Self {
        if lm_type.uses_wordpiece() {
            VocabFiles::WordPiece {
                vocab: paths.remove(0),
            }
        } else {
            let merges = paths.remove(1);
            VocabFiles::Bpe {
                vocab: paths.remove(0),
                merges,
            }
        }
    }
}

/// Resolved paths of everything needed to build a model and its tokenizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub vocab: VocabFiles,
}

impl ModelFiles {
    /// Use `model_dir` when given, otherwise fetch `lm_type`'s repository from the hub.
    pub fn resolve(lm_type: LmType, model_dir: Option<&Path>, cache_dir: Option<&Path>) -> Result<Self> {
        match model_dir {
            Some(dir) => Self::from_dir(lm_type, dir),
            None => Self::download(lm_type, cache_dir),
        }
    }

    /// Files from a local directory; every one of them must exist.
    pub fn from_dir(lm_type: LmType, dir: &Path) -> Result<Self> {
        let require = |name: &str| {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else if name == WEIGHTS_FILE {
                Err(missing_weights(&dir.display().to_string()))
            } else {
                Err(FinetuneError::ModelFiles(format!(
                    "{} not found in {}",
                    name,
                    dir.display()
                )))
            }
        };

        let config = require(CONFIG_FILE)?;
        let weights = require(WEIGHTS_FILE)?;
        let vocab = VocabFiles::names(lm_type)
            .iter()
            .map(|n| require(n))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            weights,
            vocab: VocabFiles::from_paths(lm_type, vocab),
        })
    }

    /// Download (or reuse cached copies of) the files from the HuggingFace hub.
    pub fn download(lm_type: LmType, cache_dir: Option<&Path>) -> Result<Self> {
        let repo_id = lm_type.model_id();
        let hub_err = |message: String| FinetuneError::Hub {
            repo: repo_id.to_string(),
            message,
        };

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        let api = builder
            .build()
            .map_err(|e| hub_err(format!("failed to initialize HF API: {}", e)))?;
        let repo = api.model(repo_id.to_string());

        log::info!("Fetching {} from the HuggingFace hub", repo_id);
        let config = fetch(&repo, CONFIG_FILE).map_err(hub_err)?;
        let weights = fetch(&repo, WEIGHTS_FILE).map_err(|e| weights_fetch_error(repo_id, &e))?;
        let vocab = VocabFiles::names(lm_type)
            .iter()
            .map(|n| fetch(&repo, n).map_err(hub_err))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            weights,
            vocab: VocabFiles::from_paths(lm_type, vocab),
        })
    }
}

fn fetch(repo: &ApiRepo, file: &str) -> std::result::Result<PathBuf, String> {
    repo.get(file)
        .map_err(|e| format!("download of {} failed: {}", file, e))
}

fn missing_weights_message(location: &str) -> String {
    format!(
        "{} has no {}; weights must be available in safetensors format \
         (convert pytorch_model.bin first)",
        location, WEIGHTS_FILE
    )
}

fn missing_weights(location: &str) -> FinetuneError {
    FinetuneError::ModelFiles(missing_weights_message(location))
}

/// Safetensors hint plus the hub's own error.
fn weights_fetch_error(repo_id: &str, cause: &str) -> FinetuneError {
    FinetuneError::ModelFiles(format!("{} ({})", missing_weights_message(repo_id), cause))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_local_dir_wordpiece() {
        let dir = tempfile::tempdir().unwrap();
        for name in [CONFIG_FILE, WEIGHTS_FILE, "vocab.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let files = ModelFiles::from_dir(LmType::Bert, dir.path()).unwrap();
        assert_eq!(
            files.vocab,
            VocabFiles::WordPiece {
                vocab: dir.path().join("vocab.txt")
            }
        );
    }

    #[test]
    fn test_local_dir_bpe() {
        let dir = tempfile::tempdir().unwrap();
        for name in [CONFIG_FILE, WEIGHTS_FILE, "vocab.json", "merges.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let files = ModelFiles::resolve(LmType::Deberta, Some(dir.path()), None).unwrap();
        assert_eq!(
            files.vocab,
            VocabFiles::Bpe {
                vocab: dir.path().join("vocab.json"),
                merges: dir.path().join("merges.txt"),
            }
        );
    }

    #[test]
    fn test_weights_download_error_keeps_hub_cause() {
        let err = weights_fetch_error(
            "bert-base-uncased",
            "download of model.safetensors failed: request error: connection refused",
        );
        let text = err.to_string();
        assert!(text.contains("safetensors format"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_missing_safetensors_explains_format() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        fs::write(dir.path().join("pytorch_model.bin"), "").unwrap();
        let err = ModelFiles::from_dir(LmType::Bert, dir.path()).unwrap_err();
        assert!(matches!(err, FinetuneError::ModelFiles(_)));
        assert!(err.to_string().contains("safetensors"));
    }
}
