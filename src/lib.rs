//! Cora Fine-Tuning: BERT-style Encoders From Scratch
//!
//! Fine-tunes pretrained BERT, SentenceBERT and DeBERTa checkpoints on the
//! Cora citation dataset (title + abstract → one of seven topics). The
//! encoders, their backward passes and the optimizer are implemented directly
//! on a small f32 tensor type; pretrained weights are read from safetensors.
//!
//! # Modules
//!
//! - [`tensor`] - row-major f32 tensors
//! - [`layers`] - encoder building blocks with forward and backward passes
//! - [`encoder`] - BERT / DeBERTa encoder stack and its `config.json`
//! - [`classifier`] - pooled classification head with label-smoothed loss
//! - [`tokenizer`] - WordPiece and byte-level BPE tokenizers
//! - [`dataset`] - Cora loading and seeded 60/20/20 splits
//! - [`hub`] - local or HuggingFace hub model files
//! - [`weights`] - pretrained import and fine-tuned checkpoints
//! - [`optimizer`] - AdamW with linear warmup/decay
//! - [`trainer`] - epoch loop, gradient accumulation, evaluation
//! - [`experiment`] - repeated seeded runs and the summary line
//!
//! # Example
//!
//! ```rust,no_run
//! use cora_finetune::{run_experiment, Args, LmType};
//!
//! let mut args = Args::with_defaults(LmType::Bert);
//! args.runs = 1;
//! let results = run_experiment(&args)?;
//! println!("{}", results.summary_line());
//! # Ok::<(), cora_finetune::FinetuneError>(())
//! ```

pub mod classifier;
pub mod config;
pub mod dataset;
pub mod encoder;
pub mod error;
pub mod experiment;
pub mod gradients;
pub mod hub;
pub mod layers;
pub mod loss;
pub mod optimizer;
pub mod tensor;
pub mod tokenizer;
pub mod trainer;
pub mod training_logger;
pub mod weights;

pub use classifier::{BertClassifier, ClassifierConfig, Pooling};
pub use config::{Args, LmType};
pub use dataset::{CoraDataset, Split};
pub use encoder::{EncoderConfig, TrainableEncoder};
pub use error::{FinetuneError, Result};
pub use experiment::{run_experiment, run_experiment_with_files, ExperimentResults, RunResult};
pub use gradients::{Gradients, Trainable};
pub use hub::ModelFiles;
pub use optimizer::{AdamW, LinearSchedule};
pub use tensor::Tensor;
pub use tokenizer::{Encoding, LmTokenizer};
pub use trainer::{EncodedDataset, Trainer, TrainingArguments};
pub use training_logger::TrainingLogger;
