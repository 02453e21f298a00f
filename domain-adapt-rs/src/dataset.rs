//! Batch streams for the source and target domains.
//!
//! The training core only needs [`BatchSource`]s yielding fixed-shape
//! `(inputs, labels)` batches. [`TensorDataset`] is the in-memory
//! implementation; [`SafetensorsProvider`] builds the four streams of a
//! transfer task from one safetensors file per domain.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::sync_channel;

use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{AdaptConfig, NormalizeType};
use crate::error::{AdaptError, Result};

/// One batch of samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Inputs, `[batch, ...]`
    pub inputs: Tensor,
    /// Class labels, `[batch]` (u32)
    pub labels: Tensor,
}

impl Batch {
    /// Number of samples in the batch.
    #[must_use]
    pub fn size(&self) -> usize {
        self.labels.elem_count()
    }
}

/// Iterator over one pass of a [`BatchSource`].
pub type BatchIter = Box<dyn Iterator<Item = Result<Batch>> + Send>;

/// A re-iterable stream of batches.
pub trait BatchSource: Send + Sync {
    /// Batches produced by one pass.
    fn num_batches(&self) -> usize;

    /// Samples produced by one pass.
    fn num_samples(&self) -> usize;

    /// Start a new pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the pass cannot be started.
    fn batches(&self) -> Result<BatchIter>;
}

/// How a [`TensorDataset`] is cut into batches.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Samples per batch
    pub batch_size: usize,
    /// Reshuffle on every pass
    pub shuffle: bool,
    /// Drop the trailing incomplete batch
    pub drop_last: bool,
    /// Prefetch workers (0 produces batches inline)
    pub num_workers: usize,
    /// Base seed for the shuffle order
    pub seed: u64,
    /// Device the batches are moved to
    pub device: Device,
}

impl BatchSettings {
    /// Training-split settings: shuffled, `drop_last` from the config.
    #[must_use]
    pub fn train(config: &AdaptConfig, seed: u64, device: &Device) -> Self {
        Self {
            batch_size: config.training.batch_size,
            shuffle: true,
            drop_last: config.training.drop_last,
            num_workers: config.training.num_workers,
            seed,
            device: device.clone(),
        }
    }

    /// Validation-split settings: fixed order, every sample kept.
    #[must_use]
    pub fn eval(config: &AdaptConfig, device: &Device) -> Self {
        Self {
            batch_size: config.training.batch_size,
            shuffle: false,
            drop_last: false,
            num_workers: config.training.num_workers,
            seed: config.seed,
            device: device.clone(),
        }
    }
}

/// In-memory dataset held on the CPU and batched on demand.
#[derive(Debug)]
pub struct TensorDataset {
    inputs: Tensor,
    labels: Tensor,
    settings: BatchSettings,
    passes: AtomicU64,
}

impl TensorDataset {
    /// Wrap `inputs` (`[N, ...]`) and `labels` (`[N]`).
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Dataset`] if the sample counts disagree or the
    /// batch size is zero.
    pub fn new(inputs: Tensor, labels: Tensor, settings: BatchSettings) -> Result<Self> {
        let n = inputs.dim(0)?;
        if labels.rank() != 1 || labels.dim(0)? != n {
            return Err(AdaptError::Dataset(format!(
                "labels must be [{n}], got {:?}",
                labels.dims()
            )));
        }
        if settings.batch_size == 0 {
            return Err(AdaptError::Dataset("batch size must be > 0".into()));
        }
        Ok(Self {
            inputs: inputs.to_device(&Device::Cpu)?.to_dtype(DType::F32)?,
            labels: labels.to_device(&Device::Cpu)?.to_dtype(DType::U32)?,
            settings,
            passes: AtomicU64::new(0),
        })
    }

    fn len(&self) -> usize {
        self.inputs.dims()[0]
    }

    fn pass_order(&self) -> Vec<Vec<u32>> {
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        if self.settings.shuffle {
            let pass = self.passes.fetch_add(1, Ordering::Relaxed);
            let mut rng = StdRng::seed_from_u64(self.settings.seed.wrapping_add(pass));
            order.shuffle(&mut rng);
        }
        order
            .chunks(self.settings.batch_size)
            .filter(|chunk| !self.settings.drop_last || chunk.len() == self.settings.batch_size)
            .map(<[u32]>::to_vec)
            .collect()
    }
}

impl BatchSource for TensorDataset {
    fn num_batches(&self) -> usize {
        let (n, bs) = (self.len(), self.settings.batch_size);
        if self.settings.drop_last {
            n / bs
        } else {
            n.div_ceil(bs)
        }
    }

    fn num_samples(&self) -> usize {
        if self.settings.drop_last {
            self.num_batches() * self.settings.batch_size
        } else {
            self.len()
        }
    }

    fn batches(&self) -> Result<BatchIter> {
        let iter = Box::new(Gather {
            inputs: self.inputs.clone(),
            labels: self.labels.clone(),
            chunks: self.pass_order().into_iter(),
            device: self.settings.device.clone(),
        });
        Ok(match self.settings.num_workers {
            0 => iter,
            workers => prefetch(iter, workers * 2),
        })
    }
}

struct Gather {
    inputs: Tensor,
    labels: Tensor,
    chunks: std::vec::IntoIter<Vec<u32>>,
    device: Device,
}

impl Gather {
    fn gather(&self, chunk: Vec<u32>) -> Result<Batch> {
        let len = chunk.len();
        let ids = Tensor::from_vec(chunk, len, &Device::Cpu)?;
        Ok(Batch {
            inputs: self.inputs.index_select(&ids, 0)?.to_device(&self.device)?,
            labels: self.labels.index_select(&ids, 0)?.to_device(&self.device)?,
        })
    }
}

impl Iterator for Gather {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        Some(self.gather(chunk))
    }
}

/// Produce batches on a worker thread, `depth` batches ahead.
///
/// Dropping the returned iterator stops the worker at its next send.
fn prefetch(iter: BatchIter, depth: usize) -> BatchIter {
    let (tx, rx) = sync_channel(depth);
    std::thread::spawn(move || {
        for item in iter {
            if tx.send(item).is_err() {
                break;
            }
        }
    });
    Box::new(rx.into_iter())
}

/// The four streams of a transfer task.
pub struct DomainDatasets {
    /// Labeled source training split
    pub source_train: Box<dyn BatchSource>,
    /// Source validation split
    pub source_val: Box<dyn BatchSource>,
    /// Target training split (labels unused by the losses)
    pub target_train: Box<dyn BatchSource>,
    /// Target validation split
    pub target_val: Box<dyn BatchSource>,
    /// Number of classes
    pub num_classes: usize,
    /// Flattened width of one sample
    pub input_dim: usize,
}

/// Loads the four streams of a transfer task.
pub trait DatasetProvider {
    /// Build the streams described by `config`, placing batches on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Dataset`] if the data cannot be loaded.
    fn load(&self, config: &AdaptConfig, device: &Device) -> Result<DomainDatasets>;
}

/// Reads `{data_dir}/{domain}.safetensors` with tensors `inputs` and `labels`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsProvider;

impl SafetensorsProvider {
    /// Path of a domain file.
    #[must_use]
    pub fn domain_path(data_dir: &str, domain: &str) -> PathBuf {
        Path::new(data_dir).join(format!("{domain}.safetensors"))
    }

    fn read_domain(path: &Path, normalize: NormalizeType) -> Result<(Tensor, Tensor)> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
            AdaptError::Dataset(format!("failed to read {}: {e}", path.display()))
        })?;
        let inputs = tensors.remove("inputs").ok_or_else(|| {
            AdaptError::Dataset(format!("{} has no 'inputs' tensor", path.display()))
        })?;
        let labels = tensors.remove("labels").ok_or_else(|| {
            AdaptError::Dataset(format!("{} has no 'labels' tensor", path.display()))
        })?;
        if inputs.rank() < 2 {
            return Err(AdaptError::Dataset(format!(
                "{}: inputs must be [N, ...], got {:?}",
                path.display(),
                inputs.dims()
            )));
        }
        let inputs = normalize_samples(&inputs.to_dtype(DType::F32)?, normalize)?;
        Ok((inputs, labels.to_dtype(DType::U32)?))
    }
}

impl DatasetProvider for SafetensorsProvider {
    fn load(&self, config: &AdaptConfig, device: &Device) -> Result<DomainDatasets> {
        let data = &config.data;
        let source_path = Self::domain_path(&data.data_dir, &data.source);
        let target_path = Self::domain_path(&data.data_dir, &data.target);
        let (source_x, source_y) = Self::read_domain(&source_path, data.normalize)?;
        let (target_x, target_y) = Self::read_domain(&target_path, data.normalize)?;

        if source_x.dims()[1..] != target_x.dims()[1..] {
            return Err(AdaptError::Dataset(format!(
                "source samples {:?} and target samples {:?} differ in shape",
                &source_x.dims()[1..],
                &target_x.dims()[1..]
            )));
        }
        let input_dim = source_x.dims()[1..].iter().product();

        let max_label = source_y
            .to_vec1::<u32>()?
            .into_iter()
            .chain(target_y.to_vec1::<u32>()?)
            .max()
            .unwrap_or(0) as usize;
        let num_classes = match data.num_classes {
            Some(n) if n <= max_label => {
                return Err(AdaptError::Dataset(format!(
                    "label {max_label} out of range for {n} classes"
                )))
            }
            Some(n) => n,
            None => max_label + 1,
        };

        let (source_train, source_val) =
            stratified_split(&source_x, &source_y, data.val_split, config.seed)?;
        let (target_train, target_val) =
            stratified_split(&target_x, &target_y, data.val_split, config.seed)?;

        let source_train = TensorDataset::new(
            source_train.0,
            source_train.1,
            BatchSettings::train(config, config.seed, device),
        )?;
        let target_train = TensorDataset::new(
            target_train.0,
            target_train.1,
            BatchSettings::train(config, config.seed.wrapping_add(1), device),
        )?;
        for (name, split) in [("source", &source_train), ("target", &target_train)] {
            if split.num_batches() == 0 {
                return Err(AdaptError::Dataset(format!(
                    "{name} training split has fewer samples than one batch"
                )));
            }
        }
        let source_val =
            TensorDataset::new(source_val.0, source_val.1, BatchSettings::eval(config, device))?;
        let target_val =
            TensorDataset::new(target_val.0, target_val.1, BatchSettings::eval(config, device))?;

        tracing::info!(
            "Loaded {} -> {}: source {}/{} (train/val), target {}/{}, {} classes",
            data.source,
            data.target,
            source_train.num_samples(),
            source_val.num_samples(),
            target_train.num_samples(),
            target_val.num_samples(),
            num_classes
        );

        Ok(DomainDatasets {
            source_train: Box::new(source_train),
            source_val: Box::new(source_val),
            target_train: Box::new(target_train),
            target_val: Box::new(target_val),
            num_classes,
            input_dim,
        })
    }
}

/// Normalise every sample independently.
///
/// # Errors
///
/// Returns an error on tensor failures.
pub fn normalize_samples(inputs: &Tensor, mode: NormalizeType) -> Result<Tensor> {
    let shape = inputs.shape().clone();
    let rows = inputs.flatten_from(1)?;
    let out = match mode {
        NormalizeType::ZeroOne | NormalizeType::NegOneOne => {
            let min = rows.min_keepdim(D::Minus1)?;
            let max = rows.max_keepdim(D::Minus1)?;
            let range = max.sub(&min)?.maximum(1e-12f32)?;
            let unit = rows.broadcast_sub(&min)?.broadcast_div(&range)?;
            if mode == NormalizeType::ZeroOne {
                unit
            } else {
                unit.affine(2.0, -1.0)?
            }
        }
        NormalizeType::MeanStd => {
            let mean = rows.mean_keepdim(D::Minus1)?;
            let std = rows.var_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12f32)?;
            rows.broadcast_sub(&mean)?.broadcast_div(&std)?
        }
    };
    Ok(out.reshape(shape)?)
}

type Split = (Tensor, Tensor);

/// Seeded split keeping each class's share in both halves.
fn stratified_split(
    inputs: &Tensor,
    labels: &Tensor,
    val_split: f32,
    seed: u64,
) -> Result<(Split, Split)> {
    let mut by_class: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for (i, label) in labels.to_vec1::<u32>()?.into_iter().enumerate() {
        by_class.entry(label).or_default().push(i as u32);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut val = Vec::new();
    for indices in by_class.values_mut() {
        indices.shuffle(&mut rng);
        let n_val = (indices.len() as f32 * val_split).round() as usize;
        let n_val = n_val.min(indices.len().saturating_sub(1));
        val.extend_from_slice(&indices[..n_val]);
        train.extend_from_slice(&indices[n_val..]);
    }
    train.sort_unstable();
    val.sort_unstable();

    let take = |ids: Vec<u32>| -> Result<Split> {
        let len = ids.len();
        let ids = Tensor::from_vec(ids, len, &Device::Cpu)?;
        Ok((inputs.index_select(&ids, 0)?, labels.index_select(&ids, 0)?))
    };
    Ok((take(train)?, take(val)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(batch_size: usize, shuffle: bool, drop_last: bool) -> BatchSettings {
        BatchSettings {
            batch_size,
            shuffle,
            drop_last,
            num_workers: 0,
            seed: 7,
            device: Device::Cpu,
        }
    }

    fn dataset(n: usize, settings: BatchSettings) -> TensorDataset {
        let inputs = Tensor::arange(0f32, n as f32, &Device::Cpu)
            .unwrap()
            .reshape((n, 1))
            .unwrap();
        let labels = Tensor::from_vec((0..n as u32).map(|i| i % 2).collect(), n, &Device::Cpu)
            .unwrap();
        TensorDataset::new(inputs, labels, settings).unwrap()
    }

    fn first_column(iter: BatchIter) -> Vec<Vec<f32>> {
        iter.map(|b| b.unwrap().inputs.flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_drop_last_counts() {
        let ds = dataset(10, settings(4, false, true));
        assert_eq!(ds.num_batches(), 2);
        assert_eq!(ds.num_samples(), 8);
        assert_eq!(ds.batches().unwrap().count(), 2);

        let ds = dataset(10, settings(4, false, false));
        assert_eq!(ds.num_batches(), 3);
        assert_eq!(ds.num_samples(), 10);
        let sizes: Vec<usize> = ds.batches().unwrap().map(|b| b.unwrap().size()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_unshuffled_order_is_stable() {
        let ds = dataset(6, settings(3, false, false));
        let a = first_column(ds.batches().unwrap());
        let b = first_column(ds.batches().unwrap());
        assert_eq!(a, vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_shuffle_changes_between_passes_and_is_seeded() {
        let ds1 = dataset(64, settings(64, true, true));
        let ds2 = dataset(64, settings(64, true, true));
        let first = first_column(ds1.batches().unwrap());
        let second = first_column(ds1.batches().unwrap());
        assert_ne!(first, second);
        assert_eq!(first, first_column(ds2.batches().unwrap()));
    }

    #[test]
    fn test_prefetch_yields_same_batches() {
        let inline = dataset(9, settings(2, false, false));
        let mut prefetched = settings(2, false, false);
        prefetched.num_workers = 2;
        let prefetched = dataset(9, prefetched);
        assert_eq!(
            first_column(inline.batches().unwrap()),
            first_column(prefetched.batches().unwrap())
        );
    }

    #[test]
    fn test_mismatched_labels_rejected() {
        let inputs = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros(3, DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            TensorDataset::new(inputs, labels, settings(2, false, false)),
            Err(AdaptError::Dataset(_))
        ));
    }

    #[test]
    fn test_normalize_modes() -> Result<()> {
        let x = Tensor::new(&[[0f32, 5.0, 10.0], [2.0, 2.0, 2.0]], &Device::Cpu)?;

        let zero_one = normalize_samples(&x, NormalizeType::ZeroOne)?.to_vec2::<f32>()?;
        assert_eq!(zero_one[0], vec![0.0, 0.5, 1.0]);
        assert_eq!(zero_one[1], vec![0.0, 0.0, 0.0]);

        let sym = normalize_samples(&x, NormalizeType::NegOneOne)?.to_vec2::<f32>()?;
        assert_eq!(sym[0], vec![-1.0, 0.0, 1.0]);

        let std = normalize_samples(&x, NormalizeType::MeanStd)?.to_vec2::<f32>()?;
        assert!(std[0][1].abs() < 1e-6);
        assert!((std[0][2] - 1.0).abs() < 1e-5);
        assert!(std[1].iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_stratified_split_keeps_classes() -> Result<()> {
        let n = 20;
        let inputs = Tensor::zeros((n, 3), DType::F32, &Device::Cpu)?;
        let labels = Tensor::from_vec((0..n as u32).map(|i| i % 2).collect(), n, &Device::Cpu)?;
        let ((_, train_y), (_, val_y)) = stratified_split(&inputs, &labels, 0.2, 1)?;

        let count = |t: &Tensor, class: u32| -> usize {
            t.to_vec1::<u32>().unwrap().into_iter().filter(|&l| l == class).count()
        };
        assert_eq!(val_y.elem_count(), 4);
        assert_eq!(count(&val_y, 0), 2);
        assert_eq!(count(&val_y, 1), 2);
        assert_eq!(train_y.elem_count(), 16);
        Ok(())
    }

    #[test]
    fn test_safetensors_provider() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        for domain in ["src", "tgt"] {
            let inputs = Tensor::randn(0f32, 1.0, (20, 2, 4), &Device::Cpu)?;
            let labels = Tensor::from_vec((0..20i64).map(|i| i % 3).collect(), 20, &Device::Cpu)?;
            let tensors = HashMap::from([("inputs", inputs), ("labels", labels)]);
            candle_core::safetensors::save(&tensors, dir.path().join(format!("{domain}.safetensors")))?;
        }

        let mut config = AdaptConfig::smoke_preset();
        config.data.data_dir = dir.path().display().to_string();
        config.data.source = "src".into();
        config.data.target = "tgt".into();
        config.training.batch_size = 4;
        config.training.drop_last = false;

        let datasets = SafetensorsProvider.load(&config, &Device::Cpu)?;
        assert_eq!(datasets.num_classes, 3);
        assert_eq!(datasets.input_dim, 8);
        assert_eq!(datasets.source_train.num_samples() + datasets.source_val.num_samples(), 20);
        let batch = datasets.source_train.batches()?.next().unwrap()?;
        assert_eq!(batch.inputs.dims(), &[4, 2, 4]);
        assert_eq!(batch.labels.dtype(), DType::U32);
        Ok(())
    }

    #[test]
    fn test_safetensors_provider_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = AdaptConfig::smoke_preset();
        config.data.data_dir = dir.path().display().to_string();
        assert!(matches!(
            SafetensorsProvider.load(&config, &Device::Cpu),
            Err(AdaptError::Dataset(_))
        ));
    }
}
