// src/ops/shape.rs
use crate::autograd::{is_no_grad, Tensor};

/// Reshape with at most one `-1` dimension inferred from the element count.
pub fn reshape(input: &Tensor, shape: Vec<i32>) -> Tensor {
    let total = input.len();
    let known: usize = shape.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
    let new_shape: Vec<usize> = shape
        .iter()
        .map(|&d| if d < 0 { total / known.max(1) } else { d as usize })
        .collect();

    let reshaped = {
        let data = input.data_ref();
        data.as_standard_layout()
            .into_owned()
            .into_shape_with_order(new_shape)
            .expect("Reshape failed: Total element count mismatch")
            .into_dyn()
    };

    if is_no_grad() || !input.requires_grad() {
        return Tensor::from_data_no_grad(reshaped);
    }

    let input_clone = input.clone();
    let old_shape = input.shape();
    Tensor::from_op(
        reshaped,
        vec![input.clone()],
        Box::new(move |grad| {
            let grad_reshaped = grad
                .as_standard_layout()
                .into_owned()
                .into_shape_with_order(old_shape.clone())
                .expect("Backward Reshape failed")
                .into_dyn();
            input_clone.add_grad(grad_reshaped);
        }),
    )
}
