use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use indicatif::{ProgressBar, ProgressStyle};
use prost::Message;

use crate::{
    metrics::{ScoreRecord, StepState},
    run::RunContext,
    TrainingConfig, TrainingError,
};

const PROGRESS_TEMPLATE: &str =
    "{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta}) {msg}";

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
    pub progress_bar: bool,
    /// Minimum time between progress postfix refreshes.
    pub progress_interval: Duration,
}

impl LoggingSettings {
    /// Only the primary rank prints, draws progress or writes event files.
    pub fn for_run(config: &TrainingConfig, run: &RunContext, primary: bool) -> Self {
        Self {
            enable_stdout: primary,
            tensorboard_dir: (primary && config.tensorboard).then(|| run.log_dir()),
            tensorboard_flush_every_n: 50,
            progress_bar: primary,
            progress_interval: Duration::from_secs_f64(config.tqdm_mininterval.max(0.0)),
        }
    }

    pub fn silent() -> Self {
        Self {
            enable_stdout: false,
            tensorboard_dir: None,
            tensorboard_flush_every_n: 1,
            progress_bar: false,
            progress_interval: Duration::ZERO,
        }
    }
}

/// Metric sink for the orchestrator: stdout, progress bar and TensorBoard.
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
    progress: Option<EpochProgress>,
}

struct EpochProgress {
    bar: ProgressBar,
    last_refresh: Option<Instant>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            settings,
            tensorboard,
            progress: None,
        })
    }

    pub fn tensorboard_dir(&self) -> Option<&Path> {
        self.settings.tensorboard_dir.as_deref()
    }

    pub fn start_epoch(&mut self, epoch: usize, total_batches: usize) {
        self.finish_epoch();
        if !self.settings.progress_bar {
            return;
        }
        let bar = ProgressBar::new(total_batches as u64);
        bar.set_style(
            ProgressStyle::with_template(PROGRESS_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.set_prefix(format!("epoch {epoch}"));
        self.progress = Some(EpochProgress {
            bar,
            last_refresh: None,
        });
    }

    pub fn log_step(&mut self, state: &StepState) {
        if let Some(progress) = self.progress.as_mut() {
            progress.bar.inc(1);
            let due = progress
                .last_refresh
                .map_or(true, |at| at.elapsed() >= self.settings.progress_interval);
            if due {
                progress.bar.set_message(format!(
                    "norm:{:.4},lr:{:.4e},loss:{:.4}",
                    state.grad_norm, state.learning_rate, state.loss
                ));
                progress.last_refresh = Some(Instant::now());
            }
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = state.global_step as i64;
            let results = [
                writer.write_scalar("loss", step, state.loss),
                writer.write_scalar("lr_grad/lr", step, state.learning_rate),
                writer.write_scalar("lr_grad/grad_norm", step, state.grad_norm),
            ];
            for result in results {
                if let Err(err) = result {
                    log::warn!("{err}");
                }
            }
        }
    }

    /// Advances the progress bar for a batch that was not trained on.
    pub fn log_skipped_batch(&mut self) {
        if let Some(progress) = self.progress.as_ref() {
            progress.bar.inc(1);
        }
    }

    pub fn finish_epoch(&mut self) {
        if let Some(progress) = self.progress.take() {
            progress.bar.finish();
        }
    }

    /// `completed_epochs` is 0 for the evaluation before training starts.
    pub fn log_evaluation(
        &mut self,
        completed_epochs: usize,
        record: &ScoreRecord,
        hparams: &[(&str, f64)],
    ) {
        if self.settings.enable_stdout {
            if completed_epochs == 0 {
                println!("eval before training: {record}");
            } else {
                println!("eval after epoch {}: {record}", completed_epochs - 1);
            }
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = completed_epochs as i64;
            for (metric, value) in record.iter() {
                if let Err(err) = writer.write_scalar(&format!("eval/{metric}"), step, value) {
                    log::warn!("{err}");
                }
            }
            for (name, value) in hparams {
                if let Err(err) = writer.write_scalar(&format!("hparams/{name}"), step, *value) {
                    log::warn!("{err}");
                }
            }
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.finish_epoch();
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::persistence(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::persistence(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        // readers expect a version record first
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        self.write_event(&Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(summary),
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::persistence(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::persistence(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
