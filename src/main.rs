//! Fine-tune a pretrained encoder on Cora paper classification.
//!
//! ## Usage
//!
//! ```bash
//! # Five seeded runs of bert-base-uncased
//! cargo run --release -- --lm_type bert
//!
//! # DeBERTa, saving every fine-tuned model
//! cargo run --release -- --lm_type deberta --save_model
//!
//! # Offline: a local directory holding config.json, model.safetensors and vocab files
//! cargo run --release -- --lm_type sentencebert --model_dir models/all-MiniLM-L6-v2
//! ```
//!
//! ## Prerequisites
//!
//! The Cora text release under `--dataset_dir` (default `datasets/`):
//!
//! ```text
//! datasets/cora_orig/cora/cora.content
//! datasets/cora_orig/cora/cora.cites
//! datasets/cora_orig/mccallum/cora/papers
//! datasets/cora_orig/mccallum/cora/extractions/
//! ```
//!
//! Logging goes through `RUST_LOG` (default `info`); per-run accuracies and
//! the final `# final_acc` line go to stdout.

use anyhow::Context;
use clap::Parser;
use cora_finetune::{run_experiment, Args};
use env_logger::Env;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::info!(
        "Fine-tuning {} ({}) for {} run(s)",
        args.lm_type,
        args.lm_type.model_id(),
        args.runs
    );

    run_experiment(&args)
        .with_context(|| format!("fine-tuning {} on {}", args.lm_type, args.dataset_dir.display()))?;
    Ok(())
}
