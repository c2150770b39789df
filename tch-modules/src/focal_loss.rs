use crate::{common::*, label::LabelScheme};

/// Computes `log(1 + exp(x))` without overflow for large `|x|`.
pub fn softplus(xs: &Tensor) -> Tensor {
    ((-xs.abs()).exp() + 1.0).log() + xs.relu()
}

/// Computes `log(sigmoid(x))` without overflow for large `|x|`.
pub fn log_sigmoid(xs: &Tensor) -> Tensor {
    -softplus(&-xs)
}

/// The normalization applied on the summed focal loss.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
)]
pub enum NormType {
    /// Return the raw sum.
    #[serde(rename = "none")]
    #[strum(serialize = "none")]
    None,
    /// Divide by the number of foreground anchors, at least one.
    #[serde(rename = "fg")]
    #[strum(serialize = "fg")]
    Fg,
}

impl NormType {
    pub fn parse(name: &str) -> Result<Self> {
        Self::from_str(name).map_err(|_| format_err!("norm type '{}' is not implemented", name))
    }
}

impl Default for NormType {
    fn default() -> Self {
        Self::None
    }
}

impl Display for NormType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Sigmoid focal loss initializer.
#[derive(Debug, Clone)]
pub struct FocalLossInit {
    /// The raw label of ignored anchors.
    pub ignore_label: i64,
    /// The raw label of background anchors.
    pub background: i64,
    /// The weight of positive samples. Negative samples are weighted by `1 - alpha`.
    pub alpha: f64,
    /// The focusing exponent.
    pub gamma: f64,
    pub norm_type: NormType,
}

impl Default for FocalLossInit {
    fn default() -> Self {
        Self {
            ignore_label: -1,
            background: 0,
            alpha: 0.25,
            gamma: 2.0,
            norm_type: NormType::None,
        }
    }
}

impl FocalLossInit {
    pub fn build(self) -> Result<FocalLoss> {
        let Self {
            ignore_label,
            background,
            alpha,
            gamma,
            norm_type,
        } = self;

        let scheme = LabelScheme::new(ignore_label, background)?;
        ensure!(
            (0.0..=1.0).contains(&alpha),
            "alpha must be in range [0, 1], but get {}",
            alpha
        );
        ensure!(
            gamma.is_finite() && gamma >= 0.0,
            "gamma must be non-negative, but get {}",
            gamma
        );

        Ok(FocalLoss {
            scheme,
            alpha,
            gamma,
            norm_type,
        })
    }
}

/// Sigmoid focal loss over per-anchor class logits and sparse labels.
///
/// See [Focal Loss for Dense Object Detection](https://arxiv.org/abs/1708.02002).
#[derive(Debug, Clone)]
pub struct FocalLoss {
    scheme: LabelScheme,
    alpha: f64,
    gamma: f64,
    norm_type: NormType,
}

impl FocalLoss {
    pub fn scheme(&self) -> &LabelScheme {
        &self.scheme
    }

    pub fn norm_type(&self) -> NormType {
        self.norm_type
    }

    /// Computes the scalar loss.
    ///
    /// The `logits` has shape `[batch, anchor, class]` and `labels` is an int64
    /// tensor in shape `[batch, anchor]`. Class id `k` corresponds to channel `k - 1`.
    pub fn forward(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (batch_size, num_anchors, num_classes) = logits
            .size3()
            .map_err(|_| format_err!("expect [batch, anchor, class] logits, but get {:?}", logits.size()))?;
        let (label_batch_size, label_anchors) = labels
            .size2()
            .map_err(|_| format_err!("expect [batch, anchor] labels, but get {:?}", labels.size()))?;
        ensure!(
            batch_size == label_batch_size && num_anchors == label_anchors,
            "logits shape {:?} does not match labels shape {:?}",
            logits.size(),
            labels.size()
        );
        ensure!(
            labels.kind() == Kind::Int64,
            "expect int64 labels, but get {:?}",
            labels.kind()
        );

        let Self {
            scheme,
            alpha,
            gamma,
            norm_type,
        } = *self;
        let kind = logits.kind();

        let scores = logits.sigmoid();
        let pos_part = -(1.0f64 - &scores).pow_tensor_scalar(gamma) * log_sigmoid(logits);
        let neg_part = -scores.pow_tensor_scalar(gamma) * log_sigmoid(&-logits);

        // [batch, anchor, class]
        let pos_mask = scheme.class_mask(labels, num_classes);
        let neg_mask = pos_mask
            .logical_not()
            .logical_and(&scheme.ignore_mask(labels).logical_not().unsqueeze(-1));

        let pos_loss = pos_mask.to_kind(kind) * pos_part * alpha;
        let neg_loss = neg_mask.to_kind(kind) * neg_part * (1.0 - alpha);
        let loss = (pos_loss + neg_loss).sum(kind);

        let loss = match norm_type {
            NormType::None => loss,
            NormType::Fg => {
                let num_fg = scheme.foreground_mask(labels).sum(kind).clamp_min(1.0);
                debug!("focal loss normalized by {} foreground anchors", f64::from(&num_fg));
                loss / num_fg
            }
        };

        Ok(loss)
    }
}

/// Builds a focal loss from `init` and applies it once.
pub fn focal_loss(logits: &Tensor, labels: &Tensor, init: &FocalLossInit) -> Result<Tensor> {
    init.clone().build()?.forward(logits, labels)
}
