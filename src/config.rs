//! Command-line arguments and run configuration.
//!
//! ```bash
//! finetune_lm --lm_type bert --epochs 4 --lr 5e-5 --batch_size 8 [--weight_decay 0.0]
//! ```
//!
//! Flags use underscores so existing invocations keep working. Everything
//! past the first five flags is optional and defaults to the published setup
//! (5 runs, 256 tokens, 2 accumulation steps, label smoothing 0.3).

use crate::classifier::Pooling;
use crate::error::{FinetuneError, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which pretrained encoder to fine-tune.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LmType {
    Bert,
    Sentencebert,
    Deberta,
}

impl LmType {
    /// HuggingFace hub repository for this model family.
    pub fn model_id(self) -> &'static str {
        match self {
            LmType::Bert => "bert-base-uncased",
            LmType::Sentencebert => "sentence-transformers/bert-base-nli-mean-tokens",
            LmType::Deberta => "microsoft/deberta-base",
        }
    }

    /// Name used on the command line and in output paths.
    pub fn name(self) -> &'static str {
        match self {
            LmType::Bert => "bert",
            LmType::Sentencebert => "sentencebert",
            LmType::Deberta => "deberta",
        }
    }

    /// Both BERT checkpoints are uncased.
    pub fn lowercase(self) -> bool {
        matches!(self, LmType::Bert | LmType::Sentencebert)
    }

    pub fn uses_wordpiece(self) -> bool {
        !matches!(self, LmType::Deberta)
    }
}

impl std::fmt::Display for LmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fine-tune a pretrained language model on Cora paper text
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(name = "finetune_lm", version)]
#[command(about = "Fine-tune BERT, SentenceBERT or DeBERTa on Cora node classification")]
pub struct Args {
    /// Model family
    #[arg(long = "lm_type", value_enum)]
    pub lm_type: LmType,

    /// Training epochs
    #[arg(long, default_value_t = 4)]
    pub epochs: usize,

    /// Peak learning rate
    #[arg(long, default_value_t = 5e-5)]
    pub lr: f32,

    /// Examples per forward pass
    #[arg(long = "batch_size", default_value_t = 8)]
    pub batch_size: usize,

    /// AdamW decoupled weight decay
    #[arg(long = "weight_decay", default_value_t = 0.0)]
    pub weight_decay: f32,

    /// Number of seeded repetitions
    #[arg(long, default_value_t = 5)]
    pub runs: usize,

    /// Token truncation length, special tokens included
    #[arg(long = "max_length", default_value_t = 256)]
    pub max_length: usize,

    /// Minibatches per optimizer step
    #[arg(long = "grad_accum", default_value_t = 2)]
    pub grad_accum: usize,

    /// Global gradient clipping norm (0 disables)
    #[arg(long = "max_grad_norm", default_value_t = 1.0)]
    pub max_grad_norm: f32,

    /// Fraction of optimizer steps spent warming up
    #[arg(long = "warmup_ratio", default_value_t = 0.0)]
    pub warmup_ratio: f32,

    /// Cross-entropy label smoothing
    #[arg(long = "label_smoothing", default_value_t = 0.3)]
    pub label_smoothing: f32,

    /// Dropout on the pooled embedding before the classifier
    #[arg(long, default_value_t = 0.0)]
    pub dropout: f32,

    /// Width of an optional bottleneck layer before the classifier
    #[arg(long = "feat_shrink")]
    pub feat_shrink: Option<usize>,

    /// Sentence embedding used by the classifier
    #[arg(long, value_enum, default_value_t = Pooling::Cls)]
    pub pooling: Pooling,

    /// Optimizer steps between log lines
    #[arg(long = "logging_steps", default_value_t = 10)]
    pub logging_steps: usize,

    /// Root of the Cora dataset (contains cora_orig/)
    #[arg(long = "dataset_dir", value_name = "PATH", default_value = "datasets")]
    pub dataset_dir: PathBuf,

    /// Root for results
    #[arg(long = "output_dir", value_name = "PATH", default_value = "results")]
    pub output_dir: PathBuf,

    /// Local directory with config.json, model.safetensors and vocabulary (skips the hub)
    #[arg(long = "model_dir", value_name = "PATH")]
    pub model_dir: Option<PathBuf>,

    /// HuggingFace hub cache directory
    #[arg(long = "cache_dir", value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Report validation accuracy after every epoch
    #[arg(long = "eval_each_epoch")]
    pub eval_each_epoch: bool,

    /// Save each fine-tuned classifier under its run directory
    #[arg(long = "save_model")]
    pub save_model: bool,

    /// Added to the run index to form the split seed
    #[arg(long = "seed_offset", default_value_t = 0)]
    pub seed_offset: u64,
}

impl Args {
    /// Arguments with every optional flag at its default.
    pub fn with_defaults(lm_type: LmType) -> Self {
        Self::parse_from(["finetune_lm", "--lm_type", lm_type.name()])
    }

    /// Reject values that would make training meaningless.
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, msg: &str| {
            if ok {
                Ok(())
            } else {
                Err(FinetuneError::InvalidConfig(msg.to_string()))
            }
        };
        check(self.epochs >= 1, "epochs must be at least 1")?;
        check(self.batch_size >= 1, "batch_size must be at least 1")?;
        check(self.grad_accum >= 1, "grad_accum must be at least 1")?;
        check(self.runs >= 1, "runs must be at least 1")?;
        check(self.lr > 0.0 && self.lr.is_finite(), "lr must be positive")?;
        check(
            (0.0..1.0).contains(&self.label_smoothing),
            "label_smoothing must be in [0, 1)",
        )?;
        check((0.0..1.0).contains(&self.dropout), "dropout must be in [0, 1)")?;
        check(self.max_length >= 2, "max_length must leave room for [CLS] and [SEP]")?;
        check(
            (0.0..=1.0).contains(&self.warmup_ratio),
            "warmup_ratio must be in [0, 1]",
        )?;
        check(self.weight_decay >= 0.0, "weight_decay must be non-negative")?;
        check(self.feat_shrink != Some(0), "feat_shrink must be positive")?;
        Ok(())
    }

    /// Directory holding this model family's results.
    pub fn results_dir(&self) -> PathBuf {
        self.output_dir.join(self.lm_type.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_underscore_flags() {
        let args = Args::try_parse_from([
            "finetune_lm",
            "--lm_type",
            "sentencebert",
            "--epochs",
            "2",
            "--lr",
            "2e-5",
            "--batch_size",
            "16",
            "--weight_decay",
            "0.01",
        ])
        .unwrap();
        assert_eq!(args.lm_type, LmType::Sentencebert);
        assert_eq!(args.epochs, 2);
        assert_eq!(args.batch_size, 16);
        assert!((args.lr - 2e-5).abs() < 1e-12);
        assert!((args.weight_decay - 0.01).abs() < 1e-9);
        assert_eq!(args.runs, 5);
        assert_eq!(args.max_length, 256);
        assert_eq!(args.grad_accum, 2);
        assert_eq!(args.pooling, Pooling::Cls);
        args.validate().unwrap();
    }

    #[test]
    fn test_rejects_unknown_model_type() {
        assert!(Args::try_parse_from(["finetune_lm", "--lm_type", "gpt2"]).is_err());
        assert!(Args::try_parse_from(["finetune_lm"]).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut args = Args::with_defaults(LmType::Bert);
        args.batch_size = 0;
        assert!(matches!(args.validate(), Err(FinetuneError::InvalidConfig(_))));

        let mut args = Args::with_defaults(LmType::Bert);
        args.label_smoothing = 1.0;
        assert!(args.validate().is_err());

        let mut args = Args::with_defaults(LmType::Deberta);
        args.max_length = 1;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_model_ids() {
        assert_eq!(LmType::Bert.model_id(), "bert-base-uncased");
        assert_eq!(LmType::Deberta.model_id(), "microsoft/deberta-base");
        assert!(!LmType::Deberta.uses_wordpiece());
        assert_eq!(
            Args::with_defaults(LmType::Deberta).results_dir(),
            PathBuf::from("results/deberta")
        );
    }
}
