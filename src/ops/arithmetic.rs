// src/ops/arithmetic.rs
use crate::autograd::{is_no_grad, Tensor};
use ndarray::{ArrayD, ArrayViewD};
use std::ops::Add;

fn reduce_gradient(grad: ArrayViewD<'_, f32>, target_shape: &[usize]) -> ArrayD<f32> {
    if grad.shape() == target_shape {
        return grad.to_owned();
    }

    let mut res = grad.to_owned();
    let g_ndim = res.ndim();
    let t_ndim = target_shape.len();

    // Leading broadcast axes collapse first: [B, N] -> [N]
    if g_ndim > t_ndim {
        for _ in 0..(g_ndim - t_ndim) {
            res = res.sum_axis(ndarray::Axis(0));
        }
    }

    for i in 0..res.ndim() {
        if target_shape[i] == 1 && res.shape()[i] > 1 {
            let summed = res.sum_axis(ndarray::Axis(i));
            res = summed.insert_axis(ndarray::Axis(i));
        } else if target_shape[i] != res.shape()[i] {
            panic!(
                "Gradient shape mismatch. Grad: {:?}, Target: {:?}",
                grad.shape(),
                target_shape
            );
        }
    }

    res
}

#[inline]
fn records_graph(lhs: &Tensor, rhs: &Tensor) -> bool {
    !is_no_grad() && (lhs.requires_grad() || rhs.requires_grad())
}

impl Add for Tensor {
    type Output = Tensor;
    fn add(self, rhs: Tensor) -> Tensor {
        let data = &*self.data_ref() + &*rhs.data_ref();
        if !records_graph(&self, &rhs) {
            return Tensor::from_data_no_grad(data);
        }

        let lhs = self.clone();
        let rhs_c = rhs.clone();
        let l_shape = self.shape();
        let r_shape = rhs.shape();

        Tensor::from_op(
            data,
            vec![self, rhs],
            Box::new(move |grad| {
                lhs.add_grad(reduce_gradient(grad.view(), &l_shape));
                rhs_c.add_grad(reduce_gradient(grad.view(), &r_shape));
            }),
        )
    }
}
impl<'a, 'b> Add<&'b Tensor> for &'a Tensor {
    type Output = Tensor;
    fn add(self, rhs: &'b Tensor) -> Tensor {
        self.clone() + rhs.clone()
    }
}

/// Multiplies every element by a constant: `y = factor * x`, `dx = factor * dy`.
pub fn scale(input: &Tensor, factor: f32) -> Tensor {
    let data = input.data_ref().mapv(|x| x * factor);
    if is_no_grad() || !input.requires_grad() {
        return Tensor::from_data_no_grad(data);
    }

    let input_clone = input.clone();
    Tensor::from_op(
        data,
        vec![input.clone()],
        Box::new(move |grad| {
            input_clone.add_grad(grad.mapv(|g| g * factor));
        }),
    )
}

pub fn sum(input: &Tensor) -> Tensor {
    let sum_val = input.data_ref().sum();

    // 结果是一个 0 维标量 Tensor
    let result = ndarray::arr0(sum_val).into_dyn();
    if is_no_grad() || !input.requires_grad() {
        return Tensor::from_data_no_grad(result);
    }

    let input_clone = input.clone();
    let input_shape = input.shape();

    Tensor::from_op(
        result,
        vec![input.clone()],
        Box::new(move |grad| {
            // dL/dx = dL/dSum * 1
            let g = grad.first().copied().unwrap_or(0.0);
            input_clone.add_grad(ArrayD::from_elem(input_shape.clone(), g));
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::no_grad;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn add_broadcasts_bias_gradient() {
        let x = Tensor::parameter(arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn());
        let b = Tensor::parameter(arr1(&[0.5, -0.5]).into_dyn());
        (&x + &b).sum().backward();

        assert_eq!(x.grad().unwrap(), ArrayD::<f32>::ones(x.shape()));
        assert_eq!(b.grad().unwrap(), arr1(&[3.0, 3.0]).into_dyn());
    }

    #[test]
    fn scale_multiplies_value_and_gradient() {
        let x = Tensor::parameter(arr1(&[1.0, 2.0]).into_dyn());
        let y = x.scale(0.25);
        let values: Vec<f32> = y.data().iter().copied().collect();
        assert_abs_diff_eq!(values[1], 0.5);
        y.sum().backward();
        assert_eq!(x.grad().unwrap(), arr1(&[0.25, 0.25]).into_dyn());
    }

    #[test]
    fn no_graph_inside_no_grad() {
        let x = Tensor::parameter(arr1(&[1.0]).into_dyn());
        let y = no_grad(|| &x + &x);
        assert!(!y.requires_grad());
    }
}
