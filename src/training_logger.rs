//! Training Logger
//!
//! Records training metrics to a CSV file and to the `log` facade, so a run
//! can be followed live and analyzed afterwards.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cora_finetune::TrainingLogger;
//!
//! let mut logger = TrainingLogger::new("training_log.csv".as_ref())?;
//! logger.log_step(10, 0.4, 5e-5, 1.62, 3.1)?;
//! logger.log_eval(50, 2.0, 0.81)?;
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! ## CSV Format
//!
//! - `step`: optimizer steps taken
//! - `epoch`: fractional epoch (`1.5` = halfway through the second epoch)
//! - `elapsed_seconds`: time since the logger was created
//! - `learning_rate`: rate used for the last update
//! - `train_loss`: mean training loss since the previous row
//! - `grad_norm`: global gradient norm before clipping
//! - `val_accuracy`: validation accuracy, only on evaluation rows
//!
//! Training rows leave `val_accuracy` empty; evaluation rows leave the
//! training columns empty.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

const HEADER: &str = "step,epoch,elapsed_seconds,learning_rate,train_loss,grad_norm,val_accuracy";

pub struct TrainingLogger {
    log_file: BufWriter<File>,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file (and its parent directory) and write the header.
    pub fn new(log_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut log_file = BufWriter::new(File::create(log_path)?);
        writeln!(log_file, "{}", HEADER)?;
        log_file.flush()?;

        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Record one training log row.
    pub fn log_step(
        &mut self,
        step: usize,
        epoch: f32,
        learning_rate: f32,
        train_loss: f32,
        grad_norm: f32,
    ) -> std::io::Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        writeln!(
            self.log_file,
            "{},{:.3},{:.2},{:.6e},{:.4},{:.4},",
            step, epoch, elapsed, learning_rate, train_loss, grad_norm
        )?;
        // Flushed per row so a crashed run still leaves its log behind
        self.log_file.flush()?;

        let step_time = self.last_log_time.elapsed().as_secs_f32();
        log::info!(
            "Step {:5} | Epoch {:5.2} | Time: {:7.1}s (+{:.1}s) | LR: {:.3e} | Loss: {:.4} | Grad norm: {:.3}",
            step,
            epoch,
            elapsed,
            step_time,
            learning_rate,
            train_loss,
            grad_norm
        );
        self.last_log_time = Instant::now();
        Ok(())
    }

    /// Record a validation accuracy.
    pub fn log_eval(&mut self, step: usize, epoch: f32, val_accuracy: f32) -> std::io::Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        writeln!(
            self.log_file,
            "{},{:.3},{:.2},,,,{:.4}",
            step, epoch, elapsed, val_accuracy
        )?;
        self.log_file.flush()?;
        log::info!(
            "Step {:5} | Epoch {:5.2} | Validation accuracy: {:.4}",
            step,
            epoch,
            val_accuracy
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_0").join("training_log.csv");
        let mut logger = TrainingLogger::new(&path).unwrap();
        logger.log_step(10, 0.5, 5e-5, 1.25, 2.0).unwrap();
        logger.log_eval(20, 1.0, 0.8).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);

        let columns = HEADER.split(',').count();
        let train: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(train.len(), columns);
        assert_eq!(train[0], "10");
        assert_eq!(train[4], "1.2500");
        assert_eq!(train[6], "");

        let eval: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(eval.len(), columns);
        assert_eq!(eval[6], "0.8000");
    }
}
