use anyhow::{format_err, Result};
use approx::assert_abs_diff_eq;
use matching::{
    result::RESULT_FILE_NAME, CenterGrid, Config, GeneratorLoss, GeneratorOutput,
    GeneratorRegistry, Loss, LossConfig, MatchingGenerator, Model, ModelConfig, ProcessGroup,
    TestBatch, TestStepOptions, TrainBatch,
};
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tch::{kind::FLOAT_CPU, nn, Device, IndexOp, Kind, Tensor};

const CONFIG: &str = r#"{
    model: {
        type: "BasicMatching",
        generator: {
            type: "Toy",
            height: 4,
            width: 4,
            stride: 8.0,
            offset: 31.0,
            loss_cls: { type: "FocalLoss", norm_type: "fg" },
        },
        train_cfg: {
            optimizer: { lr: 0.1 },
        },
        eval_cfg: { metrics: ["dis"] },
    },
    device: "cpu",
}"#;

/// Ground truth top-left corner. The closest center is (39, 31).
const GT_X: f64 = 40.0;
const GT_Y: f64 = 33.0;

#[derive(Debug, Deserialize)]
struct ToyOptions {
    height: i64,
    width: i64,
    stride: f64,
    offset: f64,
    loss_cls: LossConfig,
}

/// A generator whose predictions are free parameters independent of the input.
#[derive(Debug)]
struct ToyGenerator {
    cls_logit: Tensor,
    offsets: Tensor,
    center_grid: CenterGrid,
    loss_cls: Loss,
}

impl ToyGenerator {
    fn new(path: &nn::Path, options: &ToyOptions) -> Result<Self> {
        let ToyOptions {
            height,
            width,
            stride,
            offset,
            ref loss_cls,
        } = *options;

        Ok(Self {
            cls_logit: path.zeros("cls_logit", &[1, 1, height, width]),
            offsets: path.zeros("offsets", &[1, 2, height, width]),
            center_grid: CenterGrid::new(height, width, stride, offset, path.device())?,
            loss_cls: loss_cls.build()?,
        })
    }
}

impl MatchingGenerator for ToyGenerator {
    fn forward_t(&self, sar: &Tensor, _optical: &Tensor, _train: bool) -> Result<GeneratorOutput> {
        let batch_size = sar.size()[0];
        let height = self.center_grid.height();
        let width = self.center_grid.width();

        let cls_score = self
            .cls_logit
            .expand(&[batch_size, 1, height, width], false);
        let offsets = self.offsets.expand(&[batch_size, 2, height, width], false);
        let ctr_score = cls_score.sigmoid();

        Ok(GeneratorOutput {
            cls_score,
            offsets,
            ctr_score,
        })
    }

    fn loss(&self, output: &GeneratorOutput, label: &Tensor) -> Result<GeneratorLoss> {
        let GeneratorOutput {
            cls_score, offsets, ..
        } = output;
        let (batch_size, _, height, width) = cls_score.size4()?;
        let len = height * width;
        let device = cls_score.device();

        // [1, 2, len]
        let centers = self.center_grid.xy().reshape(&[1, 2, len]);
        // [batch, 2, 1]
        let gt_xy = label.i((.., 0..2)).unsqueeze(-1);

        let target = &centers - &gt_xy;
        let positive = target
            .square()
            .sum_dim_intlist(&[1], false, Kind::Float)
            .argmin(1, false);
        let fg_mask = Tensor::arange(len, (Kind::Int64, device))
            .view([1, len])
            .eq_tensor(&positive.view([batch_size, 1]));

        let loss_cls = self.loss_cls.forward(
            &cls_score.reshape(&[batch_size, len, 1]),
            &fg_mask.to_kind(Kind::Int64),
        )?;
        let loss_reg = ((offsets.reshape(&[batch_size, 2, len]) - target).abs()
            * fg_mask.unsqueeze(1).to_kind(Kind::Float))
        .sum(Kind::Float)
            / batch_size as f64;
        let loss_ctr = Tensor::zeros(&[], (Kind::Float, device));

        Ok(GeneratorLoss {
            loss: &loss_cls + &loss_reg,
            loss_cls,
            loss_reg,
            loss_ctr,
        })
    }

    fn center_grid(&self) -> &CenterGrid {
        &self.center_grid
    }
}

#[derive(Debug, Default)]
struct CountingGroup {
    calls: Arc<AtomicUsize>,
    num_grads: Arc<AtomicUsize>,
}

impl ProcessGroup for CountingGroup {
    fn is_distributed(&self) -> bool {
        true
    }

    fn all_reduce_mean(&self, grads: &mut [Tensor]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.num_grads.store(grads.len(), Ordering::SeqCst);
        Ok(())
    }
}

fn registry() -> Result<GeneratorRegistry> {
    let mut registry = GeneratorRegistry::new();
    registry.register("Toy", |path, config| {
        let options: ToyOptions = config.options()?;
        let generator: Box<dyn MatchingGenerator> =
            Box::new(ToyGenerator::new(path, &options)?);
        Ok(generator)
    })?;
    Ok(registry)
}

fn build_model(config: &Config) -> Result<Model> {
    config.model.build(config.device, &registry()?)
}

fn train_batch(batch_size: i64) -> TrainBatch {
    let (x0, y0) = (GT_X as f32, GT_Y as f32);
    let label = Tensor::of_slice(&[x0, y0, x0 + 511.0, y0 + 511.0])
        .view([1, 4])
        .repeat(&[batch_size, 1]);
    TrainBatch {
        optical: Tensor::rand(&[batch_size, 3, 64, 64], FLOAT_CPU),
        sar: Tensor::rand(&[batch_size, 1, 32, 32], FLOAT_CPU),
        label,
    }
}

fn test_batch(batch_size: usize) -> TestBatch {
    TestBatch {
        optical: Tensor::rand(&[batch_size as i64, 3, 64, 64], FLOAT_CPU),
        sar: Tensor::rand(&[batch_size as i64, 1, 32, 32], FLOAT_CPU),
        class_id: (0..batch_size).map(|index| format!("A{}", index)).collect(),
        file_id: (0..batch_size).map(|index| format!("{:03}", index)).collect(),
    }
}

#[test]
fn train_step_reduces_corner_distance() -> Result<()> {
    let config = Config::parse(CONFIG)?;
    let mut model = build_model(&config)?;
    let batch = train_batch(2);

    let first = model.train_step(&batch)?;
    let values = first.to_vec();
    assert_eq!(values.len(), 3);
    assert!(values.iter().all(|value| value.size().is_empty()));
    // all scores tie at start so the first pixel wins, center (31, 31)
    assert_abs_diff_eq!(
        f64::from(&first.mean_corner_distance),
        (9.0f64.powi(2) + 2.0f64.powi(2)).sqrt(),
        epsilon = 1e-4
    );

    let mut last = first;
    for _ in 0..200 {
        last = model.train_step(&batch)?;
    }
    let loss_cls = f64::from(&last.loss_cls);
    let loss_reg = f64::from(&last.loss_reg);
    assert!(loss_cls.is_finite() && loss_reg.is_finite());
    assert!(f64::from(&last.mean_corner_distance) < 0.5);
    Ok(())
}

#[test]
fn gradients_are_reduced_when_distributed() -> Result<()> {
    let config = Config::parse(CONFIG)?;
    let Model::BasicMatching(model) = build_model(&config)?;

    let group = CountingGroup::default();
    let calls = group.calls.clone();
    let num_grads = group.num_grads.clone();
    let mut model = model.with_process_group(Box::new(group));

    let batch = train_batch(3);
    model.train_step(&batch)?;
    model.train_step(&batch)?;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(num_grads.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn train_step_requires_train_cfg() -> Result<()> {
    let mut config = Config::parse(CONFIG)?;
    let ModelConfig::BasicMatching(model_cfg) = &mut config.model;
    model_cfg.train_cfg = None;

    let mut model = build_model(&config)?;
    assert!(model.train_step(&train_batch(1)).is_err());
    // inference still works
    let pre_bbox = model.test_step(&test_batch(1), &TestStepOptions::default())?;
    assert_eq!(pre_bbox.size(), vec![1, 4]);
    Ok(())
}

#[test]
fn test_step_appends_results() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config::parse(CONFIG)?;
    let model = build_model(&config)?;
    let batch = test_batch(2);

    let pre_bbox = model.test_step(&batch, &TestStepOptions::default())?;
    assert_eq!(pre_bbox.size(), vec![2, 4]);
    assert_eq!(
        Vec::<f32>::from(&pre_bbox.flatten(0, -1)),
        vec![31.0, 31.0, 542.0, 542.0, 31.0, 31.0, 542.0, 542.0]
    );
    assert!(!dir.path().join(RESULT_FILE_NAME).exists());

    let options = TestStepOptions {
        save_image: true,
        save_path: Some(dir.path().to_owned()),
        sample_id: Some(0),
    };
    model.test_step(&batch, &options)?;
    model.test_step(&batch, &options)?;
    let text = std::fs::read_to_string(dir.path().join(RESULT_FILE_NAME))?;
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "A0 A0_000.tif A0_sar_000.tif 62 62");
    assert_eq!(lines[1], "A1 A1_001.tif A1_sar_001.tif 62 62");

    let options = TestStepOptions {
        save_image: true,
        save_path: Some(dir.path().to_owned()),
        sample_id: None,
    };
    let err = model.test_step(&batch, &options).unwrap_err().to_string();
    assert!(err.contains("save_path") && err.contains("sample_id"));
    Ok(())
}

#[test]
fn cal_for_eval_records() -> Result<()> {
    let config = Config::parse(CONFIG)?;
    let model = build_model(&config)?;
    let batch = test_batch(2);

    let pre_bbox = model.test_step(&batch, &TestStepOptions::default())?;
    let bbox_gt = train_batch(2).label;
    let records = model.cal_for_eval(&pre_bbox, &bbox_gt, &batch.class_id, &batch.file_id)?;
    assert_eq!(records.len(), 2);

    let json = serde_json::to_value(&records[1])?;
    assert_eq!(json["class_id"], "A1");
    assert_eq!(json["file_id"], "001");
    let distance = json["dis"]
        .as_f64()
        .ok_or_else(|| format_err!("missing distance"))?;
    assert_abs_diff_eq!(distance, 85f64.sqrt(), epsilon = 1e-6);

    let err = model
        .cal_for_eval(&pre_bbox, &bbox_gt.i(0..1), &batch.class_id, &batch.file_id)
        .unwrap_err();
    assert_eq!(err.to_string(), "[1, 4] != [2, 4]");
    Ok(())
}

#[test]
fn checkpoint_restores_predictions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_file = dir.path().join("config.json5");
    std::fs::write(&config_file, CONFIG)?;
    let config = Config::open(&config_file)?;

    let mut model = build_model(&config)?;
    let batch = train_batch(2);
    for _ in 0..50 {
        model.train_step(&batch)?;
    }
    let test_batch = test_batch(2);
    let expect = model.test_step(&test_batch, &TestStepOptions::default())?;
    let saved = model.save_checkpoint(dir.path(), 50, 0.1)?;

    let mut config = config;
    let ModelConfig::BasicMatching(model_cfg) = &mut config.model;
    let train_cfg = model_cfg
        .train_cfg
        .as_mut()
        .ok_or_else(|| format_err!("no train_cfg"))?;
    train_cfg.load_checkpoint = matching::checkpoint::LoadCheckpoint::FromRecent;

    let mut restored = build_model(&config)?;
    let fresh = restored.test_step(&test_batch, &TestStepOptions::default())?;
    assert!(!bool::from(fresh.eq_tensor(&expect).all()));

    let loaded = restored.load_checkpoint(dir.path())?;
    assert_eq!(loaded, Some(saved));
    let got = restored.test_step(&test_batch, &TestStepOptions::default())?;
    assert!(bool::from(got.eq_tensor(&expect).all()));
    Ok(())
}

#[test]
fn pretrained_weights_are_loaded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let weights_file = dir.path().join("pretrained.ot");

    // pixel 5 at row 1, column 1 wins with offset (2, -3)
    {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let cls_logit = Tensor::zeros(&[1, 1, 4, 4], FLOAT_CPU);
        let _ = cls_logit.i((0, 0, 1, 1)).fill_(1.0);
        let offsets = Tensor::of_slice(&[2.0f32, -3.0])
            .view([1, 2, 1, 1])
            .repeat(&[1, 1, 4, 4]);
        root.var_copy("cls_logit", &cls_logit);
        root.var_copy("offsets", &offsets);
        vs.save(&weights_file)?;
    }

    let mut config = Config::parse(CONFIG)?;
    let ModelConfig::BasicMatching(model_cfg) = &mut config.model;
    model_cfg.pretrained = Some(weights_file);
    let model = build_model(&config)?;

    let pre_bbox = model.test_step(&test_batch(2), &TestStepOptions::default())?;
    assert_eq!(
        Vec::<f32>::from(&pre_bbox.flatten(0, -1)),
        vec![37.0, 42.0, 548.0, 553.0, 37.0, 42.0, 548.0, 553.0]
    );

    let ModelConfig::BasicMatching(model_cfg) = &mut config.model;
    model_cfg.pretrained = Some(dir.path().join("missing.ot"));
    let err = build_model(&config).unwrap_err();
    assert!(err.to_string().contains("failed to load pretrained weights"));
    Ok(())
}

#[test]
fn unknown_generator_is_rejected() -> Result<()> {
    let config = Config::parse(&CONFIG.replace("\"Toy\"", "\"Missing\""))?;
    let err = build_model(&config).unwrap_err();
    assert!(err.to_string().contains("Missing"));
    assert!(registry()?
        .register("Toy", |_path, _config| Err(format_err!("duplicated")))
        .is_err());
    Ok(())
}
