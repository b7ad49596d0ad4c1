// src/optim.rs
use crate::autograd::Tensor;
use ndarray::prelude::*;
use ndarray::Zip;

// Parameters that no longer require grad, or hold no gradient, are skipped.
pub trait Optimizer {
    fn step(&mut self);

    fn zero_grad(&self) {
        for param in self.params() {
            param.zero_grad();
        }
    }

    fn params(&self) -> &[Tensor];

    fn learning_rate(&self) -> f32;
}

fn trainable_grad(param: &Tensor) -> Option<ArrayD<f32>> {
    let inner = param.0.borrow();
    if !inner.requires_grad {
        return None;
    }
    // 先把 grad clone 出来，避免与 data.view_mut() 的可变借用冲突
    inner.grad.clone()
}

pub struct SGD {
    params: Vec<Tensor>,
    lr: f32,
    momentum: f32,
    velocities: Vec<Option<ArrayD<f32>>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32) -> Self {
        let len = params.len();
        SGD {
            params,
            lr,
            momentum: 0.0, // 默认无动量
            velocities: vec![None; len],
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for SGD {
    fn params(&self) -> &[Tensor] {
        &self.params
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn step(&mut self) {
        let lr = self.lr;
        let m = self.momentum;

        for (param, velocity) in self.params.iter().zip(self.velocities.iter_mut()) {
            let grad = match trainable_grad(param) {
                Some(g) => g,
                None => continue,
            };
            let mut data = param.data_mut();

            if m == 0.0 {
                // w -= lr * grad
                Zip::from(data.view_mut())
                    .and(grad.view())
                    .for_each(|w, g| *w -= lr * *g);
            } else {
                // v = m * v + grad (PyTorch 默认行为); w -= lr * v
                let v_buf = velocity.get_or_insert_with(|| ArrayD::zeros(data.shape()));
                Zip::from(v_buf.view_mut())
                    .and(grad.view())
                    .for_each(|v, g| *v = m * (*v) + *g);
                Zip::from(data.view_mut())
                    .and(v_buf.view())
                    .for_each(|w, vv| *w -= lr * *vv);
            }
        }
    }
}

pub struct Adam {
    params: Vec<Tensor>,
    lr: f32,
    betas: (f32, f32),
    eps: f32,

    // 状态
    step_count: usize,
    exp_avg: Vec<Option<ArrayD<f32>>>,    // m (一阶矩)
    exp_avg_sq: Vec<Option<ArrayD<f32>>>, // v (二阶矩)
}

impl Adam {
    pub fn new(params: Vec<Tensor>, lr: f32) -> Self {
        let len = params.len();
        Adam {
            params,
            lr,
            betas: (0.9, 0.999),
            eps: 1e-8,
            step_count: 0,
            exp_avg: vec![None; len],
            exp_avg_sq: vec![None; len],
        }
    }
}

impl Optimizer for Adam {
    fn params(&self) -> &[Tensor] {
        &self.params
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn step(&mut self) {
        self.step_count += 1;
        let (beta1, beta2) = self.betas;

        // 预计算 Bias Correction
        let bias_correction1 = 1.0 - beta1.powi(self.step_count as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step_count as i32);
        let lr = self.lr;
        let eps = self.eps;

        for ((param, m_slot), v_slot) in self
            .params
            .iter()
            .zip(self.exp_avg.iter_mut())
            .zip(self.exp_avg_sq.iter_mut())
        {
            let grad = match trainable_grad(param) {
                Some(g) => g,
                None => continue,
            };
            let mut data = param.data_mut();

            let m_buf = m_slot.get_or_insert_with(|| ArrayD::zeros(data.shape()));
            let v_buf = v_slot.get_or_insert_with(|| ArrayD::zeros(data.shape()));

            // m = beta1*m + (1-beta1)*g
            // v = beta2*v + (1-beta2)*g^2
            // w -= lr * (m/bc1) / (sqrt(v/bc2) + eps)
            Zip::from(data.view_mut())
                .and(m_buf.view_mut())
                .and(v_buf.view_mut())
                .and(grad.view())
                .for_each(|w, m, v, &g| {
                    *m = beta1 * (*m) + (1.0 - beta1) * g;
                    *v = beta2 * (*v) + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias_correction1;
                    let v_hat = *v / bias_correction2;
                    *w -= lr * (m_hat / (v_hat.sqrt() + eps));
                });
        }
    }
}
