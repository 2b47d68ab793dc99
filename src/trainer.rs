//! Fine-tuning loop.
//!
//! ## One optimizer step
//!
//! ```text
//! for each of grad_accum minibatches:
//!     pad batch → forward (dropout on) → label-smoothed CE → backward
//!     sum gradients
//! gradients /= grad_accum
//! clip to max_grad_norm
//! AdamW update with lr = schedule(step)
//! ```
//!
//! The training order is reshuffled every epoch from one seeded RNG, which
//! also supplies a dropout seed per example, so a run is reproducible from
//! its seed alone. Every epoch keeps its last partial minibatch and applies a
//! trailing partial accumulation, giving
//! `epochs · ceil(ceil(n / batch_size) / grad_accum)` optimizer steps.

use crate::classifier::BertClassifier;
use crate::config::Args;
use crate::error::{FinetuneError, Result};
use crate::gradients::{Gradients, Trainable};
use crate::loss::{accuracy, argmax};
use crate::optimizer::{AdamW, LinearSchedule};
use crate::tensor::Tensor;
use crate::tokenizer::{pad_batch, Encoding};
use crate::training_logger::TrainingLogger;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::time::Instant;

/// Optimization hyperparameters.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingArguments {
    pub epochs: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub grad_accum: usize,
    pub weight_decay: f32,
    /// Non-positive disables clipping
    pub max_grad_norm: f32,
    pub warmup_ratio: f32,
    /// Optimizer steps between log rows; 0 disables step logging
    pub logging_steps: usize,
    pub seed: u64,
    pub eval_each_epoch: bool,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            epochs: 4,
            learning_rate: 5e-5,
            batch_size: 8,
            grad_accum: 2,
            weight_decay: 0.0,
            max_grad_norm: 1.0,
            warmup_ratio: 0.0,
            logging_steps: 10,
            seed: 0,
            eval_each_epoch: false,
        }
    }
}

impl TrainingArguments {
    pub fn from_args(args: &Args, seed: u64) -> Self {
        Self {
            epochs: args.epochs,
            learning_rate: args.lr,
            batch_size: args.batch_size,
            grad_accum: args.grad_accum,
            weight_decay: args.weight_decay,
            max_grad_norm: args.max_grad_norm,
            warmup_ratio: args.warmup_ratio,
            logging_steps: args.logging_steps,
            seed,
            eval_each_epoch: args.eval_each_epoch,
        }
    }

    pub fn batches_per_epoch(&self, num_examples: usize) -> usize {
        num_examples.div_ceil(self.batch_size.max(1))
    }

    /// Optimizer steps over the whole run for `num_examples` training examples.
    pub fn total_steps(&self, num_examples: usize) -> usize {
        self.epochs * self.batches_per_epoch(num_examples).div_ceil(self.grad_accum.max(1))
    }
}

/// Tokenized examples with their labels.
#[derive(Clone, Debug)]
pub struct EncodedDataset {
    pub encodings: Vec<Encoding>,
    pub labels: Vec<usize>,
}

impl EncodedDataset {
    pub fn new(encodings: Vec<Encoding>, labels: Vec<usize>) -> Result<Self> {
        if encodings.len() != labels.len() {
            return Err(FinetuneError::InvalidConfig(format!(
                "{} encodings but {} labels",
                encodings.len(),
                labels.len()
            )));
        }
        Ok(Self { encodings, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Examples at `indices`, padded to the longest among them.
    pub fn batch(&self, indices: &[usize], pad_id: usize) -> (Vec<Encoding>, Vec<usize>) {
        let mut encodings: Vec<Encoding> = indices.iter().map(|&i| self.encodings[i].clone()).collect();
        pad_batch(&mut encodings, pad_id);
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        (encodings, labels)
    }
}

/// Raw model outputs on a dataset.
#[derive(Clone, Debug)]
pub struct Predictions {
    /// `[n, num_classes]`
    pub logits: Tensor,
    pub label_ids: Vec<usize>,
}

impl Predictions {
    pub fn predicted_classes(&self) -> Vec<usize> {
        argmax(&self.logits)
    }

    pub fn accuracy(&self) -> f32 {
        accuracy(&self.predicted_classes(), &self.label_ids)
    }
}

/// Summary of a finished training run.
#[derive(Clone, Debug, Default)]
pub struct TrainOutput {
    pub global_steps: usize,
    /// Mean minibatch loss over the whole run
    pub train_loss: f32,
    /// One entry per epoch when per-epoch evaluation is on
    pub val_accuracies: Vec<f32>,
    pub train_seconds: f32,
}

pub struct Trainer {
    pub model: BertClassifier,
    pub args: TrainingArguments,
    pad_id: usize,
    logger: Option<TrainingLogger>,
}

impl Trainer {
    pub fn new(model: BertClassifier, args: TrainingArguments, pad_id: usize) -> Self {
        Self {
            model,
            args,
            pad_id,
            logger: None,
        }
    }

    /// Also write step metrics to a CSV file.
    pub fn with_logger(mut self, logger: TrainingLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Fine-tune on `train`; `val` is only used for per-epoch evaluation.
    pub fn train(&mut self, train: &EncodedDataset, val: Option<&EncodedDataset>) -> Result<TrainOutput> {
        if train.is_empty() {
            return Err(FinetuneError::InvalidConfig("training set is empty".into()));
        }
        let args = self.args.clone();
        let n = train.len();
        let batches_per_epoch = args.batches_per_epoch(n);
        let total_steps = args.total_steps(n);
        let schedule = LinearSchedule::new(args.learning_rate, total_steps, args.warmup_ratio);
        let mut optimizer = AdamW::new(args.weight_decay);
        let mut rng = StdRng::seed_from_u64(args.seed);

        log::info!(
            "Training on {} examples: {} epochs, {} minibatches/epoch, {} optimizer steps, {} parameters",
            n,
            args.epochs,
            batches_per_epoch,
            total_steps,
            self.model.num_parameters()
        );

        let start = Instant::now();
        let mut output = TrainOutput::default();
        let mut run_loss = 0.0f64;
        let mut run_batches = 0usize;
        let mut window_loss = 0.0f32;
        let mut window_batches = 0usize;
        let mut step = 0usize;

        for epoch in 0..args.epochs {
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut rng);

            let mut accumulated = Gradients::new();
            let mut pending = 0usize;
            let mut epoch_loss = 0.0f32;

            for (b, chunk) in order.chunks(args.batch_size.max(1)).enumerate() {
                let (batch, labels) = train.batch(chunk, self.pad_id);
                let seeds: Vec<u64> = (0..batch.len()).map(|_| rng.gen()).collect();
                let (loss, grads) = self.model.loss_and_gradients(&batch, &labels, Some(&seeds));
                if !loss.is_finite() {
                    log::warn!("Non-finite loss {} at epoch {} minibatch {}", loss, epoch, b);
                }

                accumulated.merge(grads);
                pending += 1;
                epoch_loss += loss;
                window_loss += loss;
                window_batches += 1;
                run_loss += loss as f64;
                run_batches += 1;

                let last_in_epoch = b + 1 == batches_per_epoch;
                if pending < args.grad_accum && !last_in_epoch {
                    continue;
                }

                let mut grads = std::mem::take(&mut accumulated);
                grads.scale(1.0 / args.grad_accum as f32);
                let grad_norm = grads.clip_global_norm(args.max_grad_norm);
                let lr = schedule.lr_at(step);
                optimizer.update(&mut self.model, &grads, lr);
                step += 1;
                pending = 0;

                if args.logging_steps > 0 && step % args.logging_steps == 0 {
                    let epoch_progress = epoch as f32 + (b + 1) as f32 / batches_per_epoch as f32;
                    let mean_loss = window_loss / window_batches.max(1) as f32;
                    match &mut self.logger {
                        Some(logger) => logger.log_step(step, epoch_progress, lr, mean_loss, grad_norm)?,
                        None => log::info!(
                            "Step {} | Epoch {:.2} | LR: {:.3e} | Loss: {:.4} | Grad norm: {:.3}",
                            step,
                            epoch_progress,
                            lr,
                            mean_loss,
                            grad_norm
                        ),
                    }
                    window_loss = 0.0;
                    window_batches = 0;
                }
            }

            log::info!(
                "Epoch {}/{} done: mean loss {:.4} ({:.1}s elapsed)",
                epoch + 1,
                args.epochs,
                epoch_loss / batches_per_epoch as f32,
                start.elapsed().as_secs_f32()
            );

            if let (true, Some(val)) = (args.eval_each_epoch, val) {
                let acc = self.predict(val).accuracy();
                output.val_accuracies.push(acc);
                match &mut self.logger {
                    Some(logger) => logger.log_eval(step, (epoch + 1) as f32, acc)?,
                    None => log::info!("Epoch {} validation accuracy: {:.4}", epoch + 1, acc),
                }
            }
        }

        output.global_steps = step;
        output.train_loss = (run_loss / run_batches.max(1) as f64) as f32;
        output.train_seconds = start.elapsed().as_secs_f32();
        Ok(output)
    }

    /// Logits for every example, in dataset order, without dropout.
    pub fn predict(&self, data: &EncodedDataset) -> Predictions {
        let num_classes = self.model.config.num_classes;
        let mut logits = Vec::with_capacity(data.len() * num_classes);
        let indices: Vec<usize> = (0..data.len()).collect();
        for chunk in indices.chunks(self.args.batch_size.max(1)) {
            let (batch, _) = data.batch(chunk, self.pad_id);
            let (out, _) = self.model.forward_batch(&batch, None, None);
            logits.extend_from_slice(&out.logits.data);
        }
        Predictions {
            logits: Tensor::new(logits, vec![data.len(), num_classes]),
            label_ids: data.labels.clone(),
        }
    }
}
