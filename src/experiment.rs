//! Repeated fine-tuning runs over seeded Cora splits.
//!
//! Run `i` uses split seed `i + seed_offset` for the data split, the head
//! initialization and the training RNG. Outputs land under
//! `<output_dir>/<lm_type>/`:
//!
//! ```text
//! results.json              per-run accuracies, mean, std, arguments
//! run_<i>/training_log.csv  step metrics
//! run_<i>/model/            fine-tuned checkpoint (--save_model)
//! ```

use crate::classifier::{BertClassifier, ClassifierConfig};
use crate::config::Args;
use crate::dataset::CoraDataset;
use crate::encoder::{EncoderConfig, TrainableEncoder};
use crate::error::{FinetuneError, Result};
use crate::hub::ModelFiles;
use crate::loss::mean_std;
use crate::tokenizer::{Encoding, LmTokenizer};
use crate::trainer::{EncodedDataset, Trainer, TrainingArguments};
use crate::training_logger::TrainingLogger;
use crate::weights::{load_pretrained, save_checkpoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const RESULTS_FILE: &str = "results.json";

/// Outcome of one seeded run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub run: usize,
    pub seed: u64,
    pub test_accuracy: f32,
    /// Validation accuracy after the last epoch, when evaluated
    pub val_accuracy: Option<f32>,
    pub train_loss: f32,
    pub global_steps: usize,
    pub train_seconds: f32,
}

/// Contents of `results.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub lm_type: String,
    pub model_id: String,
    pub accuracies: Vec<f32>,
    pub mean: f32,
    pub std: f32,
    pub runs: Vec<RunResult>,
    pub args: Args,
}

impl ExperimentResults {
    /// `# final_acc: 84.12±1.03` (percent, population std).
    pub fn summary_line(&self) -> String {
        format!("# final_acc: {:.2}±{:.2}", self.mean * 100.0, self.std * 100.0)
    }
}

/// Resolve model files (local dir or hub) and run every repetition.
pub fn run_experiment(args: &Args) -> Result<ExperimentResults> {
    args.validate()?;
    let files = ModelFiles::resolve(
        args.lm_type,
        args.model_dir.as_deref(),
        args.cache_dir.as_deref(),
    )?;
    run_experiment_with_files(args, &files)
}

/// Run every repetition with already-resolved model files.
pub fn run_experiment_with_files(args: &Args, files: &ModelFiles) -> Result<ExperimentResults> {
    args.validate()?;
    let dataset = CoraDataset::load(&args.dataset_dir)?;
    let tokenizer = LmTokenizer::from_files(args.lm_type, files)?;
    let encoder_config = EncoderConfig::from_file(&files.config)?;
    if encoder_config.position_biased_input && args.max_length > encoder_config.max_position_embeddings {
        return Err(FinetuneError::InvalidConfig(format!(
            "max_length {} exceeds the model's {} position embeddings",
            args.max_length, encoder_config.max_position_embeddings
        )));
    }

    log::info!(
        "Tokenizing {} papers (max_length {}, vocab {})",
        dataset.len(),
        args.max_length,
        tokenizer.vocab_size()
    );
    let encodings = tokenizer.encode_all(&dataset.texts, args.max_length);

    let results_dir = args.results_dir();
    fs::create_dir_all(&results_dir)?;

    let mut runs = Vec::with_capacity(args.runs);
    for run in 0..args.runs {
        let seed = run as u64 + args.seed_offset;
        let result = run_once(
            args,
            run,
            seed,
            &dataset,
            &encodings,
            &tokenizer,
            &encoder_config,
            &files.weights,
            &results_dir,
        )?;
        println!("{} {}", run, result.test_accuracy);
        runs.push(result);
    }

    let accuracies: Vec<f32> = runs.iter().map(|r| r.test_accuracy).collect();
    let (mean, std) = mean_std(&accuracies);
    let results = ExperimentResults {
        lm_type: args.lm_type.name().to_string(),
        model_id: args.lm_type.model_id().to_string(),
        accuracies,
        mean,
        std,
        runs,
        args: args.clone(),
    };
    println!("{}", results.summary_line());

    let results_path = results_dir.join(RESULTS_FILE);
    fs::write(&results_path, serde_json::to_string_pretty(&results)?)?;
    log::info!("Wrote {}", results_path.display());
    Ok(results)
}

#[allow(clippy::too_many_arguments)]
fn run_once(
    args: &Args,
    run: usize,
    seed: u64,
    dataset: &CoraDataset,
    encodings: &[Encoding],
    tokenizer: &LmTokenizer,
    encoder_config: &EncoderConfig,
    weights: &Path,
    results_dir: &Path,
) -> Result<RunResult> {
    let split = dataset.split(seed);
    log::info!(
        "Run {} (seed {}): {} train / {} val / {} test",
        run,
        seed,
        split.train.len(),
        split.val.len(),
        split.test.len()
    );
    let subset = |indices: &[usize]| {
        EncodedDataset::new(
            indices.iter().map(|&i| encodings[i].clone()).collect(),
            dataset.labels_of(indices),
        )
    };
    let train = subset(&split.train)?;
    let val = subset(&split.val)?;
    let test = subset(&split.test)?;

    let mut encoder = TrainableEncoder::new(encoder_config, seed)?;
    load_pretrained(&mut encoder, weights)?;
    let head = ClassifierConfig {
        num_classes: dataset.num_classes(),
        dropout: args.dropout,
        feat_shrink: args.feat_shrink,
        pooling: args.pooling,
        label_smoothing: args.label_smoothing,
    };
    let model = BertClassifier::new(encoder, head, seed);

    let run_dir = results_dir.join(format!("run_{}", run));
    let logger = TrainingLogger::new(&run_dir.join("training_log.csv"))?;
    let mut trainer = Trainer::new(model, TrainingArguments::from_args(args, seed), tokenizer.pad_id())
        .with_logger(logger);

    let output = trainer.train(&train, Some(&val))?;
    let predictions = trainer.predict(&test);
    let test_accuracy = predictions.accuracy();
    log::info!("Run {} test accuracy: {:.4}", run, test_accuracy);

    if args.save_model {
        let mut metrics = BTreeMap::new();
        metrics.insert("test_accuracy".to_string(), test_accuracy as f64);
        metrics.insert("train_loss".to_string(), output.train_loss as f64);
        save_checkpoint(&run_dir.join("model"), &trainer.model, metrics)?;
    }

    Ok(RunResult {
        run,
        seed,
        test_accuracy,
        val_accuracy: output.val_accuracies.last().copied(),
        train_loss: output.train_loss,
        global_steps: output.global_steps,
        train_seconds: output.train_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LmType;

    #[test]
    fn test_summary_line_format() {
        let results = ExperimentResults {
            lm_type: "bert".into(),
            model_id: LmType::Bert.model_id().into(),
            accuracies: vec![0.8, 0.82, 0.84, 0.86, 0.88],
            mean: 0.84,
            std: 0.028_284_27,
            runs: Vec::new(),
            args: Args::with_defaults(LmType::Bert),
        };
        assert_eq!(results.summary_line(), "# final_acc: 84.00±2.83");
    }
}
