// src/loss.rs
use crate::autograd::{is_no_grad, Tensor};
use ndarray::{arr0, Array2, Ix2, Zip};
use rayon::prelude::*; // 引入并行迭代

// --- Cross Entropy Loss ---
// 针对 Batch 进行行级并行优化
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Mean softmax cross-entropy of `logits: [B, C]` against class indices.
    ///
    /// Panics if `labels.len() != B` or a label is `>= C`.
    pub fn apply(logits: &Tensor, labels: &[usize]) -> Tensor {
        let (loss_val, softmax_out) = {
            let logits_ref = logits.data_ref();
            let logits_2d = logits_ref
                .view()
                .into_dimensionality::<Ix2>()
                .expect("CrossEntropyLoss expects [Batch, Classes] logits");
            let (batch_size, classes) = logits_2d.dim();
            assert_eq!(labels.len(), batch_size, "one label per logits row");
            assert!(
                labels.iter().all(|&l| l < classes),
                "label out of range for {} classes",
                classes
            );

            // 分配内存存 Softmax 结果供 Backward 使用
            let mut softmax_out = Array2::<f32>::zeros((batch_size, classes));

            let total_loss: f32 = Zip::from(softmax_out.outer_iter_mut())
                .and(logits_2d.outer_iter())
                .and(labels)
                .into_par_iter() // Rayon 并行
                .map(|(mut sm_row, l_row, &label)| {
                    // --- Row-wise Softmax ---
                    let max_val = l_row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                    let mut sum_exp = 0.0f32;
                    for (s_val, &l_val) in sm_row.iter_mut().zip(l_row.iter()) {
                        let e = (l_val - max_val).exp();
                        *s_val = e;
                        sum_exp += e;
                    }
                    sm_row.mapv_inplace(|s| s / sum_exp);

                    // -log p[label] = log(sum_exp) - (logit[label] - max)
                    sum_exp.ln() - (l_row[label] - max_val)
                })
                .sum();

            (total_loss / batch_size as f32, softmax_out)
        };

        let result = arr0(loss_val).into_dyn();
        if is_no_grad() || !logits.requires_grad() {
            return Tensor::from_data_no_grad(result);
        }

        let input_clone = logits.clone();
        let labels = labels.to_vec();

        Tensor::from_op(
            result,
            vec![logits.clone()],
            Box::new(move |grad_output| {
                let grad_val = grad_output.first().copied().unwrap_or(0.0);
                let batch_size = labels.len() as f32;
                let factor = grad_val / batch_size;

                // Backward: (Prob - OneHot) / N * grad
                let mut grad = softmax_minus_onehot(&softmax_out, &labels);
                grad.mapv_inplace(|g| g * factor);
                input_clone.add_grad(grad.into_dyn());
            }),
        )
    }
}

fn softmax_minus_onehot(softmax: &Array2<f32>, labels: &[usize]) -> Array2<f32> {
    let mut grad = softmax.clone();
    for (mut row, &label) in grad.outer_iter_mut().zip(labels) {
        row[label] -= 1.0;
    }
    grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn uniform_logits_give_log_classes() {
        let logits = Tensor::parameter(Array2::<f32>::zeros((2, 4)).into_dyn());
        let loss = CrossEntropyLoss::apply(&logits, &[0, 3]);
        assert_abs_diff_eq!(loss.item().unwrap(), 4.0f32.ln(), epsilon = 1e-6);
    }

    #[test]
    fn gradient_is_softmax_minus_onehot_over_batch() {
        let logits = Tensor::parameter(arr2(&[[0.0, 0.0], [0.0, 0.0]]).into_dyn());
        CrossEntropyLoss::apply(&logits, &[0, 1]).backward();
        let g = logits.grad().unwrap();
        let expected = arr2(&[[-0.25, 0.25], [0.25, -0.25]]).into_dyn();
        for (a, b) in g.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn large_logits_stay_finite() {
        let logits = Tensor::parameter(arr2(&[[1000.0, -1000.0]]).into_dyn());
        let loss = CrossEntropyLoss::apply(&logits, &[1]);
        let v = loss.item().unwrap();
        assert!(v.is_finite());
        assert_abs_diff_eq!(v, 2000.0, epsilon = 1e-2);
    }
}
