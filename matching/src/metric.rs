//! Evaluation metrics on predicted boxes.

use crate::common::*;
use ndarray::{s, ArrayView1, ArrayView2};

/// Computes the L2 distance between the top-left corners of two boxes.
///
/// Both inputs must have equal length of at least 2.
pub fn eval_distance(pred: ArrayView1<f64>, gt: ArrayView1<f64>) -> Result<f64> {
    ensure!(
        pred.len() == gt.len(),
        "prediction length {} != ground truth length {}",
        pred.len(),
        gt.len()
    );
    ensure!(
        pred.len() >= 2,
        "expect at least 2 coordinates, but get {}",
        pred.len()
    );

    let diff = &pred.slice(s![0..2]) - &gt.slice(s![0..2]);
    Ok(diff.dot(&diff).sqrt())
}

/// Computes per-sample L2 distances between `(x0, y0)` of `[batch, 4]` boxes.
pub fn corner_distance(pred: &Tensor, gt: &Tensor) -> Result<Tensor> {
    let (pred_len, pred_dim) = pred.size2()?;
    let (gt_len, gt_dim) = gt.size2()?;
    ensure!(
        pred_len == gt_len && pred_dim >= 2 && gt_dim >= 2,
        "{:?} and {:?} are not compatible box batches",
        pred.size(),
        gt.size()
    );

    let diff = pred.i((.., 0..2)) - gt.i((.., 0..2)).to_device(pred.device());
    let kind = diff.kind();
    Ok(diff.square().sum_dim_intlist(&[1], false, kind).sqrt())
}

/// The metric table indexed by configuration names.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    AsRefStr,
    EnumString,
)]
pub enum MetricKind {
    /// Top-left corner distance.
    #[serde(rename = "dis")]
    #[strum(serialize = "dis")]
    Distance,
}

impl MetricKind {
    pub fn evaluate(&self, pred: ArrayView1<f64>, gt: ArrayView1<f64>) -> Result<f64> {
        match self {
            Self::Distance => eval_distance(pred, gt),
        }
    }
}

/// Evaluation result of one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalRecord {
    #[serde(flatten)]
    pub metrics: IndexMap<MetricKind, f64>,
    pub class_id: String,
    pub file_id: String,
}

/// Evaluates each row of `pre_bbox` against the same row of `bbox_gt`.
pub fn evaluate_samples(
    metrics: &[MetricKind],
    pre_bbox: ArrayView2<f64>,
    bbox_gt: ArrayView2<f64>,
    class_id: &[String],
    file_id: &[String],
) -> Result<Vec<EvalRecord>> {
    ensure!(
        pre_bbox.shape() == bbox_gt.shape(),
        "{:?} != {:?}",
        bbox_gt.shape(),
        pre_bbox.shape()
    );
    let num_samples = pre_bbox.nrows();
    ensure!(
        class_id.len() == num_samples && file_id.len() == num_samples,
        "expect {} class and file ids, but get {} and {}",
        num_samples,
        class_id.len(),
        file_id.len()
    );

    izip!(pre_bbox.outer_iter(), bbox_gt.outer_iter(), class_id, file_id)
        .map(|(pred, gt, class_id, file_id)| {
            let metrics: IndexMap<_, _> = metrics
                .iter()
                .map(|&metric| Ok((metric, metric.evaluate(pred, gt)?)))
                .collect::<Result<_>>()?;
            Ok(EvalRecord {
                metrics,
                class_id: class_id.clone(),
                file_id: file_id.clone(),
            })
        })
        .collect()
}

/// Averages each metric over the records.
pub fn summarize(records: &[EvalRecord]) -> IndexMap<MetricKind, f64> {
    let mut sums: IndexMap<MetricKind, (f64, usize)> = IndexMap::new();
    records
        .iter()
        .flat_map(|record| record.metrics.iter())
        .for_each(|(&metric, &value)| {
            let (sum, count) = sums.entry(metric).or_insert((0.0, 0));
            *sum += value;
            *count += 1;
        });
    sums.into_iter()
        .map(|(metric, (sum, count))| (metric, sum / count as f64))
        .collect()
}
