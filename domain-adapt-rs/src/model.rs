//! Model composition: feature extractor, optional bottleneck, classifier and
//! optional domain discriminator, all registered in one [`VarMap`].
//!
//! Parameter names carry the sub-module as prefix (`backbone.`, `bottleneck.`,
//! `classifier.`, `discriminator.`), which is also how the optimizer forms its
//! parameter groups and how checkpoints name their tensors.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Dropout, Linear, Module, VarBuilder, VarMap};

use crate::error::{AdaptError, Result};

/// Prefix of the feature-extractor parameters.
pub const BACKBONE: &str = "backbone";
/// Prefix of the bottleneck parameters.
pub const BOTTLENECK: &str = "bottleneck";
/// Prefix of the classifier parameters.
pub const CLASSIFIER: &str = "classifier";
/// Prefix of the discriminator parameters.
pub const DISCRIMINATOR: &str = "discriminator";

/// Whether a bottleneck sits between the feature extractor and the heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureHead {
    /// Classifier reads the extractor output directly.
    Plain,
    /// `Linear -> ReLU -> Dropout(0.5)` of the given width.
    WithBottleneck(usize),
}

/// Whether a domain discriminator is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationMode {
    /// No discriminator; only the structural term aligns the domains.
    ClassifierOnly,
    /// Gradient-reversal discriminator with the given hidden width.
    Adversarial(usize),
}

/// Produces feature vectors from a batch of raw inputs.
pub trait FeatureExtractor: Send {
    /// Width of the produced features.
    fn output_dim(&self) -> usize;

    /// Forward pass; `train` enables dropout and similar.
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor>;
}

/// Predicts the probability that each feature row comes from the source domain.
pub trait DomainDiscriminator: Send {
    /// Returns `[batch, 1]` probabilities in `(0, 1)`.
    fn forward_t(&mut self, features: &Tensor, train: bool) -> candle_core::Result<Tensor>;
}

/// Shape and schedule information handed to the discriminator factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscriminatorSpec {
    /// Feature width entering the discriminator
    pub in_features: usize,
    /// Hidden width
    pub hidden_size: usize,
    /// Training forwards over which the reversal coefficient ramps to 1
    pub max_iter: usize,
}

/// Factory for the replaceable parts of the model.
pub trait ModelProvider {
    /// Build the feature extractor under `vb`.
    ///
    /// # Errors
    ///
    /// Returns an error if variable creation fails.
    fn feature_extractor(&self, vb: VarBuilder<'_>) -> Result<Box<dyn FeatureExtractor>>;

    /// Build the domain discriminator under `vb`.
    ///
    /// Defaults to [`AdversarialNet`].
    ///
    /// # Errors
    ///
    /// Returns an error if variable creation fails.
    fn discriminator(
        &self,
        vb: VarBuilder<'_>,
        spec: DiscriminatorSpec,
    ) -> Result<Box<dyn DomainDiscriminator>> {
        Ok(Box::new(AdversarialNet::new(vb, spec)?))
    }
}

/// Reference provider: a ReLU multilayer perceptron over flattened inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlpProvider {
    /// Flattened input width
    pub input_dim: usize,
    /// Hidden layer widths; the last one is the feature width
    pub hidden_dims: Vec<usize>,
}

impl MlpProvider {
    /// Create a provider for inputs of `input_dim` features.
    #[must_use]
    pub fn new(input_dim: usize, hidden_dims: Vec<usize>) -> Self {
        Self {
            input_dim,
            hidden_dims,
        }
    }
}

impl ModelProvider for MlpProvider {
    fn feature_extractor(&self, vb: VarBuilder<'_>) -> Result<Box<dyn FeatureExtractor>> {
        Ok(Box::new(MlpBackbone::new(
            vb,
            self.input_dim,
            &self.hidden_dims,
        )?))
    }
}

/// ReLU MLP feature extractor.
pub struct MlpBackbone {
    layers: Vec<Linear>,
    output_dim: usize,
}

impl MlpBackbone {
    /// Create the layers `input_dim -> hidden_dims[0] -> ... -> hidden_dims[n-1]`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Model`] if `hidden_dims` is empty.
    pub fn new(vb: VarBuilder<'_>, input_dim: usize, hidden_dims: &[usize]) -> Result<Self> {
        if hidden_dims.is_empty() {
            return Err(AdaptError::Model(
                "feature extractor needs at least one hidden layer".into(),
            ));
        }
        let mut layers = Vec::with_capacity(hidden_dims.len());
        let mut width = input_dim;
        for (i, &out) in hidden_dims.iter().enumerate() {
            layers.push(candle_nn::linear(width, out, vb.pp(format!("fc{i}")))?);
            width = out;
        }
        Ok(Self {
            layers,
            output_dim: width,
        })
    }
}

impl FeatureExtractor for MlpBackbone {
    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn forward_t(&self, xs: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.flatten_from(1)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?.relu()?;
        }
        Ok(xs)
    }
}

/// `Linear -> ReLU -> Dropout(0.5)` projection.
pub struct Bottleneck {
    linear: Linear,
    dropout: Dropout,
}

impl Bottleneck {
    /// Create a bottleneck from `in_features` to `width`.
    pub fn new(vb: VarBuilder<'_>, in_features: usize, width: usize) -> Result<Self> {
        Ok(Self {
            linear: candle_nn::linear(in_features, width, vb.pp("fc"))?,
            dropout: Dropout::new(0.5),
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.linear.forward(xs)?.relu()?;
        self.dropout.forward(&xs, train)
    }
}

/// Gradient-reversal coefficient `2 / (1 + exp(-10 * iter / max_iter)) - 1`.
#[must_use]
pub fn reversal_coefficient(iter: usize, max_iter: usize) -> f64 {
    let progress = iter as f64 / max_iter.max(1) as f64;
    2.0 / (1.0 + (-10.0 * progress).exp()) - 1.0
}

/// Identity in the forward pass; scales the gradient by `-coeff` backwards.
pub fn grad_reverse(xs: &Tensor, coeff: f64) -> candle_core::Result<Tensor> {
    let detached = xs.detach();
    let passthrough = xs.sub(&detached)?;
    detached.add(&passthrough.affine(-coeff, 0.0)?)
}

/// Three-layer discriminator behind a gradient-reversal layer.
///
/// The reversal coefficient ramps from 0 to 1 with the number of training
/// forwards, so the adversarial signal is weak right after warm-up.
pub struct AdversarialNet {
    layer1: Linear,
    layer2: Linear,
    layer3: Linear,
    dropout1: Dropout,
    dropout2: Dropout,
    iter: usize,
    max_iter: usize,
}

impl AdversarialNet {
    /// Create the discriminator described by `spec`.
    pub fn new(vb: VarBuilder<'_>, spec: DiscriminatorSpec) -> Result<Self> {
        Ok(Self {
            layer1: candle_nn::linear(spec.in_features, spec.hidden_size, vb.pp("ad_layer1"))?,
            layer2: candle_nn::linear(spec.hidden_size, spec.hidden_size, vb.pp("ad_layer2"))?,
            layer3: candle_nn::linear(spec.hidden_size, 1, vb.pp("ad_layer3"))?,
            dropout1: Dropout::new(0.5),
            dropout2: Dropout::new(0.5),
            iter: 0,
            max_iter: spec.max_iter,
        })
    }

    /// Number of training forwards seen so far.
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.iter
    }

    /// Current gradient-reversal coefficient.
    #[must_use]
    pub fn coefficient(&self) -> f64 {
        reversal_coefficient(self.iter, self.max_iter)
    }
}

impl DomainDiscriminator for AdversarialNet {
    fn forward_t(&mut self, features: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        if train {
            self.iter += 1;
        }
        let xs = grad_reverse(features, self.coefficient())?;
        let xs = self.layer1.forward(&xs)?.relu()?;
        let xs = self.dropout1.forward(&xs, train)?;
        let xs = self.layer2.forward(&xs)?.relu()?;
        let xs = self.dropout2.forward(&xs, train)?;
        let logits = self.layer3.forward(&xs)?;
        // sigmoid
        logits.neg()?.exp()?.affine(1.0, 1.0)?.recip()
    }
}

/// The full adaptation model.
pub struct AdaptationModel {
    varmap: VarMap,
    device: Device,
    backbone: Box<dyn FeatureExtractor>,
    bottleneck: Option<Bottleneck>,
    classifier: Linear,
    discriminator: Option<Box<dyn DomainDiscriminator>>,
    num_classes: usize,
}

impl AdaptationModel {
    /// Compose the model from a provider and the configured variants.
    ///
    /// `max_iter` is the reversal-coefficient horizon handed to the
    /// discriminator; it is ignored in [`AdaptationMode::ClassifierOnly`].
    ///
    /// # Errors
    ///
    /// Returns an error if any sub-module fails to build.
    pub fn build(
        provider: &dyn ModelProvider,
        head: FeatureHead,
        mode: AdaptationMode,
        num_classes: usize,
        max_iter: usize,
        device: &Device,
    ) -> Result<Self> {
        if num_classes < 2 {
            return Err(AdaptError::Model(format!(
                "need at least two classes, got {num_classes}"
            )));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let backbone = provider.feature_extractor(vb.pp(BACKBONE))?;
        let (bottleneck, feature_dim) = match head {
            FeatureHead::Plain => (None, backbone.output_dim()),
            FeatureHead::WithBottleneck(width) => (
                Some(Bottleneck::new(vb.pp(BOTTLENECK), backbone.output_dim(), width)?),
                width,
            ),
        };
        let classifier = candle_nn::linear(feature_dim, num_classes, vb.pp(CLASSIFIER).pp("fc"))?;
        let discriminator = match mode {
            AdaptationMode::ClassifierOnly => None,
            AdaptationMode::Adversarial(hidden_size) => Some(provider.discriminator(
                vb.pp(DISCRIMINATOR),
                DiscriminatorSpec {
                    in_features: feature_dim,
                    hidden_size,
                    max_iter,
                },
            )?),
        };

        Ok(Self {
            varmap,
            device: device.clone(),
            backbone,
            bottleneck,
            classifier,
            discriminator,
            num_classes,
        })
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of output classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Whether a discriminator is attached.
    pub fn has_discriminator(&self) -> bool {
        self.discriminator.is_some()
    }

    /// Shared features for a batch (extractor plus bottleneck).
    pub fn features(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.backbone.forward_t(xs, train)?;
        Ok(match &self.bottleneck {
            Some(bottleneck) => bottleneck.forward_t(&features, train)?,
            None => features,
        })
    }

    /// Class logits for a batch of features.
    pub fn classify(&self, features: &Tensor) -> Result<Tensor> {
        Ok(self.classifier.forward(features)?)
    }

    /// Source-domain probabilities, or `None` without a discriminator.
    pub fn discriminate(&mut self, features: &Tensor, train: bool) -> Option<Result<Tensor>> {
        self.discriminator
            .as_mut()
            .map(|d| d.forward_t(features, train).map_err(AdaptError::from))
    }

    /// Sub-module prefixes present in this model, in a fixed order.
    pub fn module_names(&self) -> Vec<&'static str> {
        let mut names = vec![BACKBONE];
        if self.bottleneck.is_some() {
            names.push(BOTTLENECK);
        }
        names.push(CLASSIFIER);
        if self.discriminator.is_some() {
            names.push(DISCRIMINATOR);
        }
        names
    }

    /// Parameters of one sub-module, sorted by name.
    pub fn parameters_of(&self, module: &str) -> Result<Vec<(String, Var)>> {
        let prefix = format!("{module}.");
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| AdaptError::Training("parameter map lock poisoned".into()))?;
        let mut params: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    /// Every trainable variable.
    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Number of trainable scalars.
    pub fn param_count(&self) -> usize {
        self.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Copy of every parameter keyed by its qualified name.
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| AdaptError::Training("parameter map lock poisoned".into()))?;
        let mut state = HashMap::with_capacity(data.len());
        for (name, var) in data.iter() {
            state.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(state)
    }

    /// Overwrite every parameter from `state`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Checkpoint`] if a parameter is missing or has
    /// the wrong shape.
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| AdaptError::Training("parameter map lock poisoned".into()))?;
        for (name, var) in data.iter() {
            let tensor = state
                .get(name)
                .ok_or_else(|| AdaptError::Checkpoint(format!("missing parameter '{name}'")))?;
            if tensor.dims() != var.dims() {
                return Err(AdaptError::Checkpoint(format!(
                    "shape mismatch for '{name}': expected {:?}, found {:?}",
                    var.dims(),
                    tensor.dims()
                )));
            }
            var.set(&tensor.to_device(&self.device)?.to_dtype(var.dtype())?)?;
        }
        Ok(())
    }

    /// Load pretrained feature-extractor weights from a safetensors file.
    ///
    /// Tensor names may be stored with or without the `backbone.` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Model`] if the file lacks a backbone tensor or
    /// a shape differs.
    pub fn load_pretrained<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &self.device).map_err(|e| {
            AdaptError::Model(format!(
                "failed to read pretrained weights {}: {e}",
                path.display()
            ))
        })?;
        let prefix = format!("{BACKBONE}.");
        let mut loaded = 0;
        for (name, var) in self.parameters_of(BACKBONE)? {
            let bare = name.trim_start_matches(&prefix);
            let tensor = tensors
                .get(&name)
                .or_else(|| tensors.get(bare))
                .ok_or_else(|| {
                    AdaptError::Model(format!(
                        "pretrained file {} has no tensor for '{name}'",
                        path.display()
                    ))
                })?;
            if tensor.dims() != var.dims() {
                return Err(AdaptError::Model(format!(
                    "pretrained '{name}' has shape {:?}, expected {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(var.dtype())?)?;
            loaded += 1;
        }
        tracing::info!(
            "Loaded {} pretrained backbone tensors from {}",
            loaded,
            path.display()
        );
        Ok(loaded)
    }
}
