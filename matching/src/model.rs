//! The basic matching model.

use crate::{
    checkpoint,
    common::*,
    config::{EvalConfig, TrainConfig},
    decode::CenterGrid,
    metric::{self, corner_distance, evaluate_samples, EvalRecord, MetricKind},
    result::ResultWriter,
    utils::tensor_to_array2,
};

/// Dense predictions of a generator.
#[derive(Debug, TensorLike)]
pub struct GeneratorOutput {
    /// Classification scores in shape `[batch, 1, h, w]`.
    pub cls_score: Tensor,
    /// Center offsets in shape `[batch, 2, h, w]`.
    pub offsets: Tensor,
    /// Centerness scores in shape `[batch, 1, h, w]`.
    pub ctr_score: Tensor,
}

/// Scalar losses of a generator.
#[derive(Debug, TensorLike)]
pub struct GeneratorLoss {
    /// The total loss to back-propagate.
    pub loss: Tensor,
    pub loss_cls: Tensor,
    pub loss_reg: Tensor,
    pub loss_ctr: Tensor,
}

/// The backbone and head producing dense matching predictions.
pub trait MatchingGenerator
where
    Self: Debug + Send,
{
    fn forward_t(&self, sar: &Tensor, optical: &Tensor, train: bool) -> Result<GeneratorOutput>;

    /// Computes losses against `[batch, 4]` ground truth boxes.
    fn loss(&self, output: &GeneratorOutput, label: &Tensor) -> Result<GeneratorLoss>;

    fn center_grid(&self) -> &CenterGrid;

    /// Loads pretrained parameters into the var store if a file is given.
    fn init_weights(&mut self, vs: &mut nn::VarStore, pretrained: Option<&Path>) -> Result<()> {
        match pretrained {
            Some(path) => {
                info!("load pretrained weights from {}", path.display());
                vs.load_partial(path).with_context(|| {
                    format!("failed to load pretrained weights '{}'", path.display())
                })?;
            }
            None => {
                info!("pretrained weights are not specified");
            }
        }
        Ok(())
    }
}

/// Gradient synchronization across training processes.
pub trait ProcessGroup
where
    Self: Debug + Send,
{
    fn is_distributed(&self) -> bool;

    /// Averages the gradients in place across processes.
    fn all_reduce_mean(&self, grads: &mut [Tensor]) -> Result<()>;
}

/// A lone training process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn is_distributed(&self) -> bool {
        false
    }

    fn all_reduce_mean(&self, _grads: &mut [Tensor]) -> Result<()> {
        Ok(())
    }
}

/// A training batch.
#[derive(Debug, TensorLike)]
pub struct TrainBatch {
    /// Optical images in shape `[batch, channel, h, w]`.
    pub optical: Tensor,
    /// SAR patches in shape `[batch, channel, h, w]`.
    pub sar: Tensor,
    /// Ground truth boxes in shape `[batch, 4]`.
    pub label: Tensor,
}

/// A test batch.
#[derive(Debug)]
pub struct TestBatch {
    pub optical: Tensor,
    pub sar: Tensor,
    pub class_id: Vec<String>,
    pub file_id: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TestStepOptions {
    /// Append predictions to `result.txt` in `save_path`.
    pub save_image: bool,
    pub save_path: Option<PathBuf>,
    pub sample_id: Option<usize>,
}

/// Detached training statistics.
#[derive(Debug, TensorLike)]
pub struct TrainStepOutput {
    pub loss_cls: Tensor,
    pub loss_reg: Tensor,
    /// Mean L2 distance between predicted and ground truth top-left corners.
    pub mean_corner_distance: Tensor,
}

impl TrainStepOutput {
    /// Returns `[loss_cls, loss_reg, mean_corner_distance]`.
    pub fn to_vec(&self) -> Vec<Tensor> {
        vec![
            self.loss_cls.shallow_clone(),
            self.loss_reg.shallow_clone(),
            self.mean_corner_distance.shallow_clone(),
        ]
    }
}

/// Basic matching model initializer.
#[derive(Debug, Clone, Default)]
pub struct BasicMatchingInit {
    /// Training options. The model is inference only if not set.
    pub train_cfg: Option<TrainConfig>,
    pub eval_cfg: Option<EvalConfig>,
    pub pretrained: Option<PathBuf>,
}

impl BasicMatchingInit {
    /// Builds the model on a generator whose parameters live in `vs`.
    pub fn build(
        self,
        mut vs: nn::VarStore,
        mut generator: Box<dyn MatchingGenerator>,
    ) -> Result<BasicMatching> {
        let Self {
            train_cfg,
            eval_cfg,
            pretrained,
        } = self;

        generator.init_weights(&mut vs, pretrained.as_deref())?;

        let optimizer = train_cfg
            .as_ref()
            .map(|cfg| cfg.optimizer.build(&vs))
            .transpose()?;

        info!(
            "built basic matching model with {} trainable tensors, training {}",
            vs.trainable_variables().len(),
            if optimizer.is_some() {
                "enabled"
            } else {
                "disabled"
            }
        );

        Ok(BasicMatching {
            vs,
            generator,
            optimizer,
            process_group: Box::new(SingleProcess),
            train_cfg,
            eval_cfg,
        })
    }
}

/// Locates SAR patches in optical images with a generator and a box decoder.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BasicMatching {
    #[derivative(Debug = "ignore")]
    vs: nn::VarStore,
    generator: Box<dyn MatchingGenerator>,
    #[derivative(Debug = "ignore")]
    optimizer: Option<nn::Optimizer>,
    process_group: Box<dyn ProcessGroup>,
    train_cfg: Option<TrainConfig>,
    eval_cfg: Option<EvalConfig>,
}

impl BasicMatching {
    /// Replaces the process group used for gradient synchronization.
    pub fn with_process_group(mut self, process_group: Box<dyn ProcessGroup>) -> Self {
        self.process_group = process_group;
        self
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn generator(&self) -> &dyn MatchingGenerator {
        self.generator.as_ref()
    }

    pub fn train_cfg(&self) -> Option<&TrainConfig> {
        self.train_cfg.as_ref()
    }

    pub fn eval_cfg(&self) -> Option<&EvalConfig> {
        self.eval_cfg.as_ref()
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Reloads generator weights from a pretrained parameter file.
    pub fn init_weights(&mut self, pretrained: Option<&Path>) -> Result<()> {
        self.generator.init_weights(&mut self.vs, pretrained)
    }

    /// Runs one optimization step.
    pub fn train_step(&mut self, batch: &TrainBatch) -> Result<TrainStepOutput> {
        let Self {
            vs,
            generator,
            optimizer,
            process_group,
            ..
        } = self;
        let optimizer = optimizer
            .as_mut()
            .ok_or_else(|| format_err!("train_cfg is not set, the model cannot be trained"))?;
        let TrainBatch {
            optical,
            sar,
            label,
        } = batch;

        optimizer.zero_grad();
        let output = generator.forward_t(sar, optical, true)?;
        let GeneratorLoss {
            loss,
            loss_cls,
            loss_reg,
            ..
        } = generator.loss(&output, label)?;
        loss.backward();

        if process_group.is_distributed() {
            let mut grads: Vec<_> = vs
                .trainable_variables()
                .iter()
                .map(|var| var.grad())
                .collect();
            process_group.all_reduce_mean(&mut grads)?;
        }

        let mean_corner_distance = tch::no_grad(|| -> Result<_> {
            let pre_bbox = generator
                .center_grid()
                .decode_best_boxes(&output.cls_score, &output.offsets)?;
            let distance = corner_distance(&pre_bbox, label)?;
            Ok(distance.mean(Kind::Float))
        })?;

        optimizer.step();

        Ok(TrainStepOutput {
            loss_cls: loss_cls.detach(),
            loss_reg: loss_reg.detach(),
            mean_corner_distance,
        })
    }

    /// Predicts `[batch, 4]` boxes and optionally appends them to `result.txt`.
    pub fn test_step(&self, batch: &TestBatch, options: &TestStepOptions) -> Result<Tensor> {
        let TestBatch {
            optical,
            sar,
            class_id,
            file_id,
        } = batch;

        let pre_bbox = tch::no_grad(|| -> Result<_> {
            let output = self.generator.forward_t(sar, optical, false)?;
            self.generator
                .center_grid()
                .decode_best_boxes(&output.cls_score, &output.offsets)
        })?;

        if options.save_image {
            let (save_path, sample_id) = match (&options.save_path, options.sample_id) {
                (Some(save_path), Some(sample_id)) => (save_path, sample_id),
                _ => bail!(
                    "'save_path' and 'sample_id' parameters must be set when saving results"
                ),
            };
            debug!(
                "save predictions of sample {} to {}",
                sample_id,
                save_path.display()
            );
            let mut writer = ResultWriter::open(save_path)?;
            writer.write_batch(class_id, file_id, &pre_bbox)?;
        }

        Ok(pre_bbox)
    }

    /// Evaluates predicted boxes against ground truth with configured metrics.
    pub fn cal_for_eval(
        &self,
        pre_bbox: &Tensor,
        bbox_gt: &Tensor,
        class_id: &[String],
        file_id: &[String],
    ) -> Result<Vec<EvalRecord>> {
        let eval_cfg = self
            .eval_cfg
            .as_ref()
            .ok_or_else(|| format_err!("eval_cfg is not set"))?;
        ensure!(
            pre_bbox.size() == bbox_gt.size(),
            "{:?} != {:?}",
            bbox_gt.size(),
            pre_bbox.size()
        );

        let pre_bbox = tensor_to_array2(pre_bbox)?;
        let bbox_gt = tensor_to_array2(bbox_gt)?;
        evaluate_samples(
            &eval_cfg.metrics,
            pre_bbox.view(),
            bbox_gt.view(),
            class_id,
            file_id,
        )
    }

    /// Averages and logs the metrics of evaluation records.
    pub fn summarize_eval(&self, records: &[EvalRecord]) -> IndexMap<MetricKind, f64> {
        let summary = metric::summarize(records);
        summary.iter().for_each(|(metric, value)| {
            info!("eval {}: {:.5}", metric.as_ref(), value);
        });
        summary
    }

    pub fn save_checkpoint(
        &self,
        checkpoint_dir: &Path,
        training_step: usize,
        loss: f64,
    ) -> Result<PathBuf> {
        checkpoint::save_checkpoint(&self.vs, checkpoint_dir, training_step, loss)
    }

    /// Loads parameters in the way `train_cfg.load_checkpoint` specifies.
    pub fn load_checkpoint(&mut self, checkpoint_dir: &Path) -> Result<Option<PathBuf>> {
        let load_checkpoint = self
            .train_cfg
            .as_ref()
            .map(|cfg| cfg.load_checkpoint.clone())
            .unwrap_or_default();
        checkpoint::try_load_checkpoint(&mut self.vs, checkpoint_dir, &load_checkpoint)
    }
}
