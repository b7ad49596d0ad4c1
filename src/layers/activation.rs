// src/layers/activation.rs
use crate::autograd::{is_no_grad, Tensor};
use crate::module::Module;
use ndarray::Zip;

// --- ReLU ---
#[derive(Debug, Default, Clone, Copy)]
pub struct ReLU;

impl ReLU {
    pub fn new() -> Self {
        ReLU
    }
}

impl Module for ReLU {
    fn forward(&self, input: Tensor) -> Tensor {
        // Forward: 并行计算 x.max(0.0)
        let data = Zip::from(&*input.data_ref()).par_map_collect(|&x| x.max(0.0));

        if is_no_grad() || !input.requires_grad() {
            return Tensor::from_data_no_grad(data);
        }

        let input_clone = input.clone();
        Tensor::from_op(
            data,
            vec![input],
            Box::new(move |grad| {
                let mut grad_input = grad.clone();
                {
                    let input_d = input_clone.data_ref();
                    // Backward: 原地修改梯度
                    Zip::from(&mut grad_input)
                        .and(&*input_d)
                        .par_for_each(|g, &x| {
                            if x <= 0.0 {
                                *g = 0.0;
                            }
                        });
                }
                input_clone.add_grad(grad_input);
            }),
        )
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}
