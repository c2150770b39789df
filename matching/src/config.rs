//! Configuration format and type registries.

use crate::{
    checkpoint::LoadCheckpoint,
    common::*,
    metric::{EvalRecord, MetricKind},
    model::{
        BasicMatching, BasicMatchingInit, MatchingGenerator, TestBatch, TestStepOptions,
        TrainBatch, TrainStepOutput,
    },
};
use serde_json::{Map, Value};

pub use generator::*;
pub use loss::*;
pub use model::*;
pub use training::*;

/// The main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    /// The device where the model runs on.
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        Self::parse(&text)
    }

    /// Parses a json5 document.
    pub fn parse(text: &str) -> Result<Self> {
        let config = json5::from_str(text)?;
        Ok(config)
    }
}

mod model {
    use super::*;

    /// The model table.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum ModelConfig {
        BasicMatching(BasicMatchingConfig),
    }

    impl ModelConfig {
        pub fn build(&self, device: Device, registry: &GeneratorRegistry) -> Result<Model> {
            let model = match self {
                Self::BasicMatching(config) => {
                    Model::BasicMatching(config.build(device, registry)?)
                }
            };
            Ok(model)
        }
    }

    /// The basic matching model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BasicMatchingConfig {
        pub generator: GeneratorConfig,
        pub train_cfg: Option<TrainConfig>,
        pub eval_cfg: Option<EvalConfig>,
        /// Optional parameter file loaded before training.
        pub pretrained: Option<PathBuf>,
    }

    impl BasicMatchingConfig {
        pub fn build(
            &self,
            device: Device,
            registry: &GeneratorRegistry,
        ) -> Result<BasicMatching> {
            let vs = nn::VarStore::new(device);
            let generator = registry.build(&vs.root(), &self.generator)?;

            BasicMatchingInit {
                train_cfg: self.train_cfg.clone(),
                eval_cfg: self.eval_cfg.clone(),
                pretrained: self.pretrained.clone(),
            }
            .build(vs, generator)
        }
    }

    /// The model built from [ModelConfig].
    #[derive(Debug)]
    pub enum Model {
        BasicMatching(BasicMatching),
    }

    impl Model {
        pub fn train_step(&mut self, batch: &TrainBatch) -> Result<TrainStepOutput> {
            match self {
                Self::BasicMatching(model) => model.train_step(batch),
            }
        }

        pub fn test_step(&self, batch: &TestBatch, options: &TestStepOptions) -> Result<Tensor> {
            match self {
                Self::BasicMatching(model) => model.test_step(batch, options),
            }
        }

        pub fn cal_for_eval(
            &self,
            pre_bbox: &Tensor,
            bbox_gt: &Tensor,
            class_id: &[String],
            file_id: &[String],
        ) -> Result<Vec<EvalRecord>> {
            match self {
                Self::BasicMatching(model) => {
                    model.cal_for_eval(pre_bbox, bbox_gt, class_id, file_id)
                }
            }
        }

        pub fn save_checkpoint(
            &self,
            checkpoint_dir: &Path,
            training_step: usize,
            loss: f64,
        ) -> Result<PathBuf> {
            match self {
                Self::BasicMatching(model) => {
                    model.save_checkpoint(checkpoint_dir, training_step, loss)
                }
            }
        }

        pub fn load_checkpoint(&mut self, checkpoint_dir: &Path) -> Result<Option<PathBuf>> {
            match self {
                Self::BasicMatching(model) => model.load_checkpoint(checkpoint_dir),
            }
        }
    }
}

mod generator {
    use super::*;

    /// Generator name and its options.
    ///
    /// The `type` field selects the builder in a [GeneratorRegistry]. Other
    /// fields are passed to the builder as is.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct GeneratorConfig {
        #[serde(rename = "type")]
        pub kind: String,
        #[serde(flatten)]
        pub options: Map<String, Value>,
    }

    impl GeneratorConfig {
        /// Deserializes the options into a builder specific type.
        pub fn options<T>(&self) -> Result<T>
        where
            T: DeserializeOwned,
        {
            let options = serde_json::from_value(Value::Object(self.options.clone()))
                .with_context(|| format!("invalid options for generator '{}'", self.kind))?;
            Ok(options)
        }
    }

    pub type GeneratorBuilder = Box<
        dyn Fn(&nn::Path, &GeneratorConfig) -> Result<Box<dyn MatchingGenerator>> + Send + Sync,
    >;

    /// Generator builders indexed by name.
    #[derive(Derivative, Default)]
    #[derivative(Debug)]
    pub struct GeneratorRegistry {
        #[derivative(Debug(format_with = "fmt_builder_names"))]
        builders: IndexMap<String, GeneratorBuilder>,
    }

    fn fmt_builder_names(
        builders: &IndexMap<String, GeneratorBuilder>,
        f: &mut std::fmt::Formatter,
    ) -> std::fmt::Result {
        f.debug_list().entries(builders.keys()).finish()
    }

    impl GeneratorRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register<F>(&mut self, name: impl Into<String>, builder: F) -> Result<()>
        where
            F: 'static
                + Fn(&nn::Path, &GeneratorConfig) -> Result<Box<dyn MatchingGenerator>>
                + Send
                + Sync,
        {
            let name = name.into();
            ensure!(
                !self.builders.contains_key(&name),
                "generator '{}' is already registered",
                name
            );
            debug!("register generator '{}'", name);
            self.builders.insert(name, Box::new(builder));
            Ok(())
        }

        pub fn contains(&self, name: &str) -> bool {
            self.builders.contains_key(name)
        }

        pub fn names(&self) -> impl Iterator<Item = &str> {
            self.builders.keys().map(|name| name.as_str())
        }

        pub fn build(
            &self,
            path: &nn::Path,
            config: &GeneratorConfig,
        ) -> Result<Box<dyn MatchingGenerator>> {
            let builder = self.builders.get(&config.kind).ok_or_else(|| {
                format_err!(
                    "unknown generator '{}', registered generators are [{}]",
                    config.kind,
                    self.names().join(", ")
                )
            })?;
            info!("build generator '{}'", config.kind);
            builder(path, config)
        }
    }
}

mod loss {
    use super::*;

    /// The loss table.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LossConfig {
        FocalLoss {
            ignore_label: Option<i64>,
            background: Option<i64>,
            alpha: Option<R64>,
            gamma: Option<R64>,
            norm_type: Option<String>,
        },
    }

    impl LossConfig {
        pub fn build(&self) -> Result<Loss> {
            let loss = match self {
                Self::FocalLoss {
                    ignore_label,
                    background,
                    alpha,
                    gamma,
                    norm_type,
                } => {
                    let default = FocalLossInit::default();
                    let norm_type = norm_type
                        .as_deref()
                        .map(NormType::parse)
                        .transpose()?
                        .unwrap_or(default.norm_type);
                    let focal = FocalLossInit {
                        ignore_label: ignore_label.unwrap_or(default.ignore_label),
                        background: background.unwrap_or(default.background),
                        alpha: alpha.map(|alpha| alpha.raw()).unwrap_or(default.alpha),
                        gamma: gamma.map(|gamma| gamma.raw()).unwrap_or(default.gamma),
                        norm_type,
                    }
                    .build()?;
                    Loss::Focal(focal)
                }
            };
            Ok(loss)
        }
    }

    /// The loss built from [LossConfig].
    #[derive(Debug, Clone)]
    pub enum Loss {
        Focal(FocalLoss),
    }

    impl Loss {
        pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
            match self {
                Self::Focal(loss) => loss.forward(input, target),
            }
        }
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TrainConfig {
        pub optimizer: OptimizerConfig,
        #[serde(default)]
        pub load_checkpoint: LoadCheckpoint,
    }

    /// The Adam optimizer options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OptimizerConfig {
        pub lr: R64,
        #[serde(default = "default_momentum")]
        pub momentum: R64,
        #[serde(default = "default_weight_decay")]
        pub weight_decay: R64,
    }

    fn default_momentum() -> R64 {
        r64(0.9)
    }

    fn default_weight_decay() -> R64 {
        r64(0.0)
    }

    impl OptimizerConfig {
        pub fn build(&self, vs: &nn::VarStore) -> Result<nn::Optimizer> {
            let Self {
                lr,
                momentum,
                weight_decay,
            } = *self;
            let optimizer = nn::Adam {
                beta1: momentum.raw(),
                beta2: 0.999,
                wd: weight_decay.raw(),
            }
            .build(vs, lr.raw())?;
            Ok(optimizer)
        }
    }

    /// The evaluation options.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EvalConfig {
        pub metrics: Vec<MetricKind>,
    }
}
