//! Paired structure/response dataset with min-max scaling and seeded splits.
//!
//! A CSV row holds `structure_dim` structure parameters followed by
//! `response_dim` optical response values. Every column is scaled into
//! `[0, 1]` using statistics from the full file, mirroring how the surrogate
//! and the generator were fit. Loaders hand out [`Batch`]es whose `x`/`y`
//! orientation depends on the [`ModelKind`] being trained.

use std::path::Path;

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::config::{to_runtime_error, ModelKind};
use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Per-column min-max normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxScaler {
    min: Vec<f32>,
    max: Vec<f32>,
}

impl MinMaxScaler {
    /// Fits column ranges over row-major `values` of the given `width`.
    pub fn fit(values: &[f32], width: usize) -> Result<Self> {
        if width == 0 || values.is_empty() || values.len() % width != 0 {
            return Err(TrainingError::initialization(format!(
                "cannot fit scaler on {} values with width {}",
                values.len(),
                width
            )));
        }
        let mut min = vec![f32::INFINITY; width];
        let mut max = vec![f32::NEG_INFINITY; width];
        for row in values.chunks(width) {
            for (column, value) in row.iter().enumerate() {
                min[column] = min[column].min(*value);
                max[column] = max[column].max(*value);
            }
        }
        Ok(Self { min, max })
    }

    pub fn width(&self) -> usize {
        self.min.len()
    }

    /// Maps each column into `[0, 1]`; constant columns map to `0`.
    pub fn transform(&self, values: &[f32]) -> Vec<f32> {
        self.map_columns(values, |value, min, range| {
            if range > 0.0 {
                (value - min) / range
            } else {
                0.0
            }
        })
    }

    pub fn inverse_transform(&self, values: &[f32]) -> Vec<f32> {
        self.map_columns(values, |value, min, range| value * range + min)
    }

    fn map_columns(&self, values: &[f32], f: impl Fn(f32, f32, f32) -> f32) -> Vec<f32> {
        let width = self.width();
        values
            .iter()
            .enumerate()
            .map(|(index, value)| {
                let column = index % width;
                let min = self.min[column];
                f(*value, min, self.max[column] - min)
            })
            .collect()
    }
}

/// Min-max normalized pairs of structure parameters and optical responses.
#[derive(Debug, Clone)]
pub struct PairedDataset {
    structure: Vec<f32>,
    response: Vec<f32>,
    structure_dim: usize,
    response_dim: usize,
    structure_scaler: MinMaxScaler,
    response_scaler: MinMaxScaler,
}

impl PairedDataset {
    pub fn from_csv(
        path: impl AsRef<Path>,
        structure_dim: usize,
        response_dim: usize,
        has_headers: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(TrainingError::initialization(format!(
                "dataset {} does not exist",
                path.display()
            )));
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(has_headers)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let width = structure_dim + response_dim;
        let mut structure = Vec::new();
        let mut response = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() != width {
                return Err(TrainingError::initialization(format!(
                    "{} row {}: expected {} columns, found {}",
                    path.display(),
                    row + 1,
                    width,
                    record.len()
                )));
            }
            for (column, field) in record.iter().enumerate() {
                let value: f32 = field.parse().map_err(|err| {
                    TrainingError::initialization(format!(
                        "{} row {} column {}: '{}' is not a number ({err})",
                        path.display(),
                        row + 1,
                        column + 1,
                        field
                    ))
                })?;
                if column < structure_dim {
                    structure.push(value);
                } else {
                    response.push(value);
                }
            }
        }

        Self::from_raw(structure, response, structure_dim, response_dim)
    }

    /// Builds a dataset from raw, unscaled row-major columns.
    pub fn from_raw(
        structure: Vec<f32>,
        response: Vec<f32>,
        structure_dim: usize,
        response_dim: usize,
    ) -> Result<Self> {
        if structure_dim == 0 || response_dim == 0 {
            return Err(TrainingError::initialization(
                "structure and response widths must be greater than zero",
            ));
        }
        if structure.is_empty() {
            return Err(TrainingError::initialization("dataset contains no rows"));
        }
        if structure.len() % structure_dim != 0
            || response.len() % response_dim != 0
            || structure.len() / structure_dim != response.len() / response_dim
        {
            return Err(TrainingError::initialization(
                "structure and response columns disagree on the number of rows",
            ));
        }
        if structure.iter().chain(response.iter()).any(|v| !v.is_finite()) {
            return Err(TrainingError::initialization(
                "dataset contains non-finite values",
            ));
        }

        let structure_scaler = MinMaxScaler::fit(&structure, structure_dim)?;
        let response_scaler = MinMaxScaler::fit(&response, response_dim)?;
        Ok(Self {
            structure: structure_scaler.transform(&structure),
            response: response_scaler.transform(&response),
            structure_dim,
            response_dim,
            structure_scaler,
            response_scaler,
        })
    }

    pub fn len(&self) -> usize {
        self.structure.len() / self.structure_dim
    }

    pub fn is_empty(&self) -> bool {
        self.structure.is_empty()
    }

    pub fn structure_dim(&self) -> usize {
        self.structure_dim
    }

    pub fn response_dim(&self) -> usize {
        self.response_dim
    }

    pub fn structure_scaler(&self) -> &MinMaxScaler {
        &self.structure_scaler
    }

    pub fn response_scaler(&self) -> &MinMaxScaler {
        &self.response_scaler
    }

    /// Seeded permutation of row indices into train / validation / test.
    pub fn split(
        &self,
        validation_fraction: f64,
        test_fraction: f64,
        seed: u64,
    ) -> Result<SplitIndices> {
        let total = self.len();
        let mut order: Vec<usize> = (0..total).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));

        let validation = ((total as f64 * validation_fraction).round() as usize).max(1);
        let test = (total as f64 * test_fraction).round() as usize;
        if validation + test >= total {
            return Err(TrainingError::initialization(format!(
                "dataset with {total} rows is too small for the requested splits \
                 (validation {validation}, test {test})"
            )));
        }

        let test_rows = order.split_off(total - test);
        let validation_rows = order.split_off(order.len() - validation);
        Ok(SplitIndices {
            train: order,
            validation: validation_rows,
            test: test_rows,
        })
    }

    fn gather(&self, rows: &[usize], kind: ModelKind) -> (Vec<f32>, Vec<f32>, usize, usize) {
        let structure = gather_rows(&self.structure, self.structure_dim, rows);
        let response = gather_rows(&self.response, self.response_dim, rows);
        match kind {
            ModelKind::ForwardModel => (structure, response, self.structure_dim, self.response_dim),
            ModelKind::Gan => (response, structure, self.response_dim, self.structure_dim),
        }
    }
}

fn gather_rows(values: &[f32], width: usize, rows: &[usize]) -> Vec<f32> {
    let mut out = Vec::with_capacity(rows.len() * width);
    for row in rows {
        out.extend_from_slice(&values[row * width..(row + 1) * width]);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

/// Which partition an evaluation reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
    Test,
}

/// Ordered samples sharing one optimizer step. `len` may be smaller than the
/// configured batch size for the final batch of an epoch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Tensor,
    pub y: Tensor,
    pub len: usize,
}

/// Restartable loader over one split.
#[derive(Debug)]
pub struct DataLoader {
    x: Vec<f32>,
    y: Vec<f32>,
    x_dim: usize,
    y_dim: usize,
    batch_size: usize,
    order: Vec<usize>,
    shuffle: Option<StdRng>,
    device: Device,
}

impl DataLoader {
    fn new(
        (x, y, x_dim, y_dim): (Vec<f32>, Vec<f32>, usize, usize),
        batch_size: usize,
        shuffle: Option<StdRng>,
        device: &Device,
    ) -> Self {
        let len = x.len() / x_dim;
        Self {
            x,
            y,
            x_dim,
            y_dim,
            batch_size: batch_size.max(1),
            order: (0..len).collect(),
            shuffle,
            device: device.clone(),
        }
    }

    /// Number of samples in the split.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Replaces the shuffling RNG, used when resuming mid-run.
    pub fn reseed(&mut self, seed: u64) {
        if self.shuffle.is_some() {
            self.shuffle = Some(StdRng::seed_from_u64(seed));
        }
    }

    /// Every batch of one pass. Shuffling loaders draw a fresh order per call.
    pub fn batches(&mut self) -> Result<Vec<Batch>> {
        if let Some(rng) = self.shuffle.as_mut() {
            self.order.shuffle(rng);
        }
        self.order
            .chunks(self.batch_size)
            .map(|rows| {
                let x = gather_rows(&self.x, self.x_dim, rows);
                let y = gather_rows(&self.y, self.y_dim, rows);
                Ok(Batch {
                    x: Tensor::from_vec(x, (rows.len(), self.x_dim), &self.device)
                        .map_err(to_runtime_error)?,
                    y: Tensor::from_vec(y, (rows.len(), self.y_dim), &self.device)
                        .map_err(to_runtime_error)?,
                    len: rows.len(),
                })
            })
            .collect()
    }
}

/// Loader options shared by every split.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub batch_size: usize,
    pub shuffle: bool,
    pub validation_fraction: f64,
    pub test_fraction: f64,
    pub seed: u64,
}

#[derive(Debug)]
pub struct DataLoaders {
    pub train: DataLoader,
    pub validation: DataLoader,
    pub test: DataLoader,
    pub structure_scaler: MinMaxScaler,
    pub response_scaler: MinMaxScaler,
}

impl DataLoaders {
    pub fn get_mut(&mut self, split: Split) -> &mut DataLoader {
        match split {
            Split::Train => &mut self.train,
            Split::Validation => &mut self.validation,
            Split::Test => &mut self.test,
        }
    }
}

/// Splits `dataset` and orients pairs for `kind`: the forward model sees
/// `(structure, response)`, the GAN sees `(response, structure)`.
pub fn get_dataloaders(
    kind: ModelKind,
    dataset: &PairedDataset,
    settings: &LoaderSettings,
    device: &Device,
) -> Result<DataLoaders> {
    if settings.batch_size == 0 {
        return Err(TrainingError::initialization(
            "batch size must be greater than zero",
        ));
    }
    let splits = dataset.split(
        settings.validation_fraction,
        settings.test_fraction,
        settings.seed,
    )?;
    let shuffle = settings
        .shuffle
        .then(|| StdRng::seed_from_u64(settings.seed.wrapping_add(SHUFFLE_SEED_OFFSET)));

    Ok(DataLoaders {
        train: DataLoader::new(
            dataset.gather(&splits.train, kind),
            settings.batch_size,
            shuffle,
            device,
        ),
        validation: DataLoader::new(
            dataset.gather(&splits.validation, kind),
            settings.batch_size,
            None,
            device,
        ),
        test: DataLoader::new(
            dataset.gather(&splits.test, kind),
            settings.batch_size,
            None,
            device,
        ),
        structure_scaler: dataset.structure_scaler().clone(),
        response_scaler: dataset.response_scaler().clone(),
    })
}

const SHUFFLE_SEED_OFFSET: u64 = 0x5eed;
