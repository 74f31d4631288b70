use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::TrainingError;

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(
        enable_stdout: bool,
        tensorboard_dir: Option<PathBuf>,
        flush_every: usize,
    ) -> Self {
        Self {
            enable_stdout,
            tensorboard_dir,
            tensorboard_flush_every_n: flush_every.max(1),
        }
    }

    /// Neither stdout lines nor an event file.
    pub fn quiet() -> Self {
        Self::from_config(false, None, 1)
    }
}

/// Scalars reported once per epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_rmse: Option<f64>,
    /// `(tag suffix, rate)` for every optimizer, e.g. `("generator", 1e-3)`.
    pub learning_rates: Vec<(String, f64)>,
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn info(&self, message: impl AsRef<str>) {
        if self.settings.enable_stdout {
            println!("{}", message.as_ref());
        }
    }

    /// Epoch-averaged generator and critic losses of a GAN run.
    pub fn log_adversarial_losses(&mut self, epoch: usize, generator: f64, discriminator: f64) {
        if self.settings.enable_stdout {
            println!(
                "generator loss {:.6}, discriminator loss {:.6}",
                generator, discriminator
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = epoch as i64;
            let _ = writer.write_scalar("train/generator_loss", step, generator);
            let _ = writer.write_scalar("train/discriminator_loss", step, discriminator);
        }
    }

    pub fn log_epoch(&mut self, report: &EpochReport) {
        if self.settings.enable_stdout {
            match report.val_rmse {
                Some(rmse) => println!(
                    "Epoch {}, train loss {:.6}, val loss {:.6}, val RMSE {:.6}",
                    report.epoch, report.train_loss, report.val_loss, rmse
                ),
                None => println!(
                    "Epoch {}, train loss {:.6}, val loss {:.6}.",
                    report.epoch, report.train_loss, report.val_loss
                ),
            }
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = report.epoch as i64;
            let _ = writer.write_scalar("train/loss", step, report.train_loss);
            let _ = writer.write_scalar("val/loss", step, report.val_loss);
            if let Some(rmse) = report.val_rmse {
                let _ = writer.write_scalar("val/rmse", step, rmse);
            }
            for (name, lr) in &report.learning_rates {
                let _ = writer.write_scalar(&format!("lr/{name}"), step, *lr);
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
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
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let timestamp = current_unix_timestamp();
        let hostname = hostname();
        let filename = format!("events.out.tfevents.{}.{}", timestamp, hostname);
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let wall_time = current_wall_time();
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time,
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len = data.len() as u64;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&len.to_le_bytes());
        let len_crc = masked_crc32(&len_bytes);
        let data_crc = masked_crc32(data.as_ref());

        let len_crc_bytes = len_crc.to_le_bytes();
        let data_crc_bytes = data_crc.to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
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
    #[prost(message, optional, tag = "3")]
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
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_file_records_are_framed() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let mut logger = Logger::new(LoggingSettings::from_config(
            false,
            Some(dir.path().to_path_buf()),
            1,
        ))?;
        logger.log_epoch(&EpochReport {
            epoch: 3,
            train_loss: 0.25,
            val_loss: 0.5,
            val_rmse: Some(0.1),
            learning_rates: vec![("generator".into(), 1e-3)],
        });
        logger.flush();

        let entry = fs::read_dir(dir.path())?
            .next()
            .ok_or_else(|| TrainingError::runtime("no event file written"))??;
        let bytes = fs::read(entry.path())?;

        let len = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes")) as usize;
        let len_crc = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes"));
        assert_eq!(len_crc, masked_crc32(&bytes[0..8]));
        let payload = &bytes[12..12 + len];
        let data_crc = u32::from_le_bytes(bytes[12 + len..16 + len].try_into().expect("4 bytes"));
        assert_eq!(data_crc, masked_crc32(payload));

        let event = Event::decode(payload).expect("decode");
        assert_eq!(event.step, 3);
        let summary = event.summary.expect("summary");
        assert_eq!(summary.value[0].tag, "train/loss");
        assert_eq!(summary.value[0].simple_value, Some(0.25));
        Ok(())
    }
}
