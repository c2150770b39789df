use crate::common::*;

/// The kind of an anchor label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelKind {
    /// Excluded from both positive and negative loss terms.
    Ignore,
    /// Matches no class, so every class channel is a negative sample.
    Background,
    /// The one-based class id. Ids outside `1..=num_classes` match no channel.
    Class(i64),
}

/// The integer encoding of [LabelKind] used by label tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelScheme {
    /// The raw value of ignored anchors.
    pub ignore_label: i64,
    /// The raw value of background anchors.
    pub background: i64,
}

impl Default for LabelScheme {
    fn default() -> Self {
        Self {
            ignore_label: -1,
            background: 0,
        }
    }
}

impl LabelScheme {
    pub fn new(ignore_label: i64, background: i64) -> Result<Self> {
        let scheme = Self {
            ignore_label,
            background,
        };
        scheme.validate()?;
        Ok(scheme)
    }

    /// Checks that the sentinels are distinct and do not collide with class ids.
    pub fn validate(&self) -> Result<()> {
        let Self {
            ignore_label,
            background,
        } = *self;
        ensure!(
            ignore_label != background,
            "ignore_label and background must be distinct, but both are {}",
            ignore_label
        );
        ensure!(
            ignore_label < 1 && background < 1,
            "ignore_label ({}) and background ({}) must not be positive class ids",
            ignore_label,
            background
        );
        Ok(())
    }

    pub fn decode(&self, raw: i64) -> LabelKind {
        if raw == self.ignore_label {
            LabelKind::Ignore
        } else if raw == self.background {
            LabelKind::Background
        } else {
            LabelKind::Class(raw)
        }
    }

    pub fn encode(&self, kind: LabelKind) -> Result<i64> {
        let raw = match kind {
            LabelKind::Ignore => self.ignore_label,
            LabelKind::Background => self.background,
            LabelKind::Class(id) => {
                ensure!(
                    id != self.ignore_label && id != self.background,
                    "class id {} collides with a sentinel label",
                    id
                );
                id
            }
        };
        Ok(raw)
    }

    /// Decodes a `[batch, anchor]` int64 label tensor into label kinds.
    pub fn decode_tensor(&self, labels: &Tensor) -> Result<Vec<Vec<LabelKind>>> {
        let (_batch_size, num_anchors) = labels.size2()?;
        ensure!(
            labels.kind() == Kind::Int64,
            "expect int64 labels, but get {:?}",
            labels.kind()
        );
        let raw = Vec::<i64>::from(&labels.flatten(0, -1));
        if num_anchors == 0 {
            return Ok(vec![]);
        }
        let rows = raw
            .chunks(num_anchors as usize)
            .map(|row| row.iter().map(|&value| self.decode(value)).collect())
            .collect();
        Ok(rows)
    }

    /// Encodes rows of label kinds into a `[batch, anchor]` int64 tensor.
    pub fn encode_tensor<R>(&self, rows: &[R], device: Device) -> Result<Tensor>
    where
        R: Borrow<[LabelKind]>,
    {
        let num_anchors = rows.first().map(|row| row.borrow().len()).unwrap_or(0);
        ensure!(
            rows.iter().all(|row| row.borrow().len() == num_anchors),
            "all label rows must have equal length"
        );
        let raw: Vec<i64> = rows
            .iter()
            .flat_map(|row| row.borrow().iter().copied())
            .map(|kind| self.encode(kind))
            .try_collect()?;
        let labels = Tensor::of_slice(&raw)
            .view([rows.len() as i64, num_anchors as i64])
            .to_device(device);
        Ok(labels)
    }

    /// Boolean mask of ignored entries, same shape as `labels`.
    pub fn ignore_mask(&self, labels: &Tensor) -> Tensor {
        labels.eq(self.ignore_label)
    }

    /// Boolean mask of entries that are neither background nor ignored.
    pub fn foreground_mask(&self, labels: &Tensor) -> Tensor {
        labels
            .ne(self.background)
            .logical_and(&labels.ne(self.ignore_label))
    }

    /// Boolean mask in shape `[*labels.shape, num_classes]` that is set where the
    /// label equals the one-based class id of the trailing channel.
    pub fn class_mask(&self, labels: &Tensor, num_classes: i64) -> Tensor {
        let class_range = Tensor::arange(num_classes, (Kind::Int64, labels.device())) + 1;
        labels.unsqueeze(-1).eq_tensor(&class_range)
    }
}
