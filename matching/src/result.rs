//! The `result.txt` prediction file.

use crate::{common::*, utils::tensor_to_array2};
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write as _},
};

pub const RESULT_FILE_NAME: &str = "result.txt";
const IMAGE_SUFFIX: &str = ".tif";

/// Scales a coordinate by two and rounds half up by truncation.
fn rescale_coordinate(value: f64) -> Result<i64> {
    let scaled = value * 2.0 + 0.5;
    ensure!(
        scaled.is_finite() && scaled.abs() < i64::MAX as f64,
        "cannot convert box coordinate {} to an integer",
        value
    );
    Ok(scaled as i64)
}

/// Formats the line of one sample, including the trailing newline.
///
/// The line is `class_id`, the optical and SAR file names, then the rescaled
/// `bbox[1]` and `bbox[0]`.
pub fn format_result_line(class_id: &str, file_id: &str, bbox: &[f64]) -> Result<String> {
    ensure!(
        bbox.len() >= 2,
        "expect at least 2 box coordinates, but get {}",
        bbox.len()
    );
    let y = rescale_coordinate(bbox[1])?;
    let x = rescale_coordinate(bbox[0])?;
    Ok(format!(
        "{class} {class}_{file}{suffix} {class}_sar_{file}{suffix} {y} {x}\n",
        class = class_id,
        file = file_id,
        suffix = IMAGE_SUFFIX,
        y = y,
        x = x,
    ))
}

/// Appends prediction lines to `result.txt` in a directory.
#[derive(Debug)]
pub struct ResultWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ResultWriter {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(RESULT_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open '{}'", path.display()))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&mut self, class_id: &str, file_id: &str, bbox: &[f64]) -> Result<()> {
        let line = format_result_line(class_id, file_id, bbox)?;
        self.writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write '{}'", self.path.display()))?;
        Ok(())
    }

    /// Writes one line per row of a `[batch, 4]` box tensor.
    pub fn write_batch(
        &mut self,
        class_id: &[String],
        file_id: &[String],
        pre_bbox: &Tensor,
    ) -> Result<()> {
        let (batch_size, _) = pre_bbox.size2()?;
        ensure!(
            class_id.len() == batch_size as usize && file_id.len() == batch_size as usize,
            "expect {} class and file ids, but get {} and {}",
            batch_size,
            class_id.len(),
            file_id.len()
        );

        // format every line first so a bad box leaves the file untouched
        let boxes = tensor_to_array2(pre_bbox)?;
        let lines: Vec<_> = izip!(boxes.outer_iter(), class_id, file_id)
            .map(|(row, class_id, file_id)| format_result_line(class_id, file_id, &row.to_vec()))
            .try_collect()?;
        self.writer
            .write_all(lines.concat().as_bytes())
            .with_context(|| format!("failed to write '{}'", self.path.display()))?;
        self.flush()?;
        debug!("wrote {} lines to '{}'", batch_size, self.path.display());
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("failed to flush '{}'", self.path.display()))?;
        Ok(())
    }
}
