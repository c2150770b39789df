//! Misc utilities.

use crate::common::*;
use ndarray::Array2;

/// Copies a 2-D tensor into a host f64 array.
pub fn tensor_to_array2(tensor: &Tensor) -> Result<Array2<f64>> {
    let (rows, cols) = tensor
        .size2()
        .map_err(|_| format_err!("expect a 2-D tensor, but get {:?}", tensor.size()))?;
    let values = Vec::<f64>::from(
        &tensor
            .detach()
            .to_device(Device::Cpu)
            .to_kind(Kind::Double)
            .flatten(0, -1),
    );
    let array = Array2::from_shape_vec((rows as usize, cols as usize), values)?;
    Ok(array)
}
