//! Center-offset box decoding and best-box selection.

use crate::common::*;

/// The side length added to the decoded top-left corner.
pub const BOX_SIDE: f64 = 511.0;

/// Anchor center coordinates in shape `[1, 2, height, width]`.
///
/// Channel 0 holds the x coordinates and channel 1 holds the y coordinates.
#[derive(Debug, TensorLike, Getters)]
pub struct CenterGrid {
    #[get = "pub"]
    xy: Tensor,
}

impl CenterGrid {
    /// Builds the grid `x = offset + stride * col`, `y = offset + stride * row`.
    pub fn new(height: i64, width: i64, stride: f64, offset: f64, device: Device) -> Result<Self> {
        ensure!(
            height > 0 && width > 0,
            "grid size must be positive, but get {}x{}",
            height,
            width
        );
        ensure!(
            stride.is_finite() && offset.is_finite(),
            "stride and offset must be finite"
        );

        let xy = tch::no_grad(|| {
            let xs = Tensor::arange(width, (Kind::Float, device)) * stride + offset;
            let ys = Tensor::arange(height, (Kind::Float, device)) * stride + offset;
            let grid_x = xs.view([1, width]).expand(&[height, width], false);
            let grid_y = ys.view([height, 1]).expand(&[height, width], false);
            Tensor::stack(&[grid_x, grid_y], 0).unsqueeze(0)
        });

        Ok(Self { xy })
    }

    /// Wraps an existing `[1, 2, height, width]` tensor.
    pub fn from_tensor(xy: Tensor) -> Result<Self> {
        let (one, channels, _height, _width) = xy
            .size4()
            .map_err(|_| format_err!("expect a [1, 2, h, w] center grid, but get {:?}", xy.size()))?;
        ensure!(
            one == 1 && channels == 2,
            "expect a [1, 2, h, w] center grid, but get {:?}",
            xy.size()
        );
        ensure!(
            xy.is_floating_point(),
            "center grid must be floating point, but get {:?}",
            xy.kind()
        );
        Ok(Self {
            xy: xy.detach().set_requires_grad(false),
        })
    }

    pub fn height(&self) -> i64 {
        self.xy.size()[2]
    }

    pub fn width(&self) -> i64 {
        self.xy.size()[3]
    }

    pub fn device(&self) -> Device {
        self.xy.device()
    }

    /// Decodes per-pixel boxes from a `[batch, 2, height, width]` offset map.
    ///
    /// The output has shape `[batch, 4, height, width]` holding `(x0, y0, x1, y1)`
    /// with `(x0, y0) = center - offset` and `(x1, y1) = (x0, y0) + 511`.
    pub fn decode_boxes(&self, offsets: &Tensor) -> Result<Tensor> {
        let (_batch_size, channels, height, width) = offsets
            .size4()
            .map_err(|_| format_err!("expect [batch, 2, h, w] offsets, but get {:?}", offsets.size()))?;
        ensure!(
            channels == 2 && height == self.height() && width == self.width(),
            "offsets shape {:?} does not match center grid shape {:?}",
            offsets.size(),
            self.xy.size()
        );

        let top_left = self.xy.to_device(offsets.device()) - offsets;
        let bottom_right = &top_left + BOX_SIDE;
        Ok(Tensor::cat(&[top_left, bottom_right], 1))
    }

    /// Decodes boxes and picks the best scoring one per sample.
    pub fn decode_best_boxes(&self, cls_score: &Tensor, offsets: &Tensor) -> Result<Tensor> {
        let boxes = self.decode_boxes(offsets)?;
        select_best_boxes(cls_score, &boxes)
    }
}

/// Selects the box at the maximum score location for each sample.
///
/// The `cls_score` has shape `[batch, 1, h, w]` and `boxes` has shape
/// `[batch, 4, h, w]`. Returns a `[batch, 4]` tensor.
pub fn select_best_boxes(cls_score: &Tensor, boxes: &Tensor) -> Result<Tensor> {
    let (batch_size, score_channels, height, width) = cls_score
        .size4()
        .map_err(|_| format_err!("expect [batch, 1, h, w] scores, but get {:?}", cls_score.size()))?;
    ensure!(
        score_channels == 1,
        "expect [batch, 1, h, w] scores, but get {:?}",
        cls_score.size()
    );
    let (box_batch_size, box_channels, box_height, box_width) = boxes
        .size4()
        .map_err(|_| format_err!("expect [batch, 4, h, w] boxes, but get {:?}", boxes.size()))?;
    ensure!(
        box_batch_size == batch_size
            && box_channels == 4
            && box_height == height
            && box_width == width,
        "boxes shape {:?} does not match scores shape {:?}",
        boxes.size(),
        cls_score.size()
    );

    // [batch, h * w]
    let scores = cls_score.reshape(&[batch_size, height * width]);
    // [batch, 4, h * w]
    let boxes = boxes.reshape(&[batch_size, 4, height * width]);

    let indexes = first_argmax(&scores)?;
    let gather_index = indexes
        .view([batch_size, 1, 1])
        .expand(&[batch_size, 4, 1], false);
    let selected = boxes.gather(2, &gather_index, false).view([batch_size, 4]);

    Ok(selected)
}

/// Finds the flat index of the row maximum of a `[batch, len]` tensor.
///
/// Among equal maxima the lowest index wins.
pub fn first_argmax(scores: &Tensor) -> Result<Tensor> {
    let (_batch_size, len) = scores
        .size2()
        .map_err(|_| format_err!("expect [batch, len] scores, but get {:?}", scores.size()))?;
    ensure!(len > 0, "cannot select from an empty score map");
    ensure!(
        !bool::from(scores.isnan().any()),
        "score map contains NaN values"
    );

    let indexes = tch::no_grad(|| {
        let row_max = scores.amax(&[1], true);
        let positions = Tensor::arange(len, (Kind::Int64, scores.device())).view([1, len]);
        // non-maximum positions are pushed past the end of the row
        let candidates = positions + scores.ne_tensor(&row_max).to_kind(Kind::Int64) * len;
        candidates.amin(&[1], false)
    });

    Ok(indexes)
}
