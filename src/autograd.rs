// src/autograd.rs
use ndarray::prelude::*;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::rc::Rc;

// Tensors are `Rc` handles, so graph-recording state is per thread.
thread_local! {
    static NO_GRAD_DEPTH: Cell<usize> = const { Cell::new(0) };
    static INFERENCE_MODE: Cell<bool> = const { Cell::new(false) };
}

pub struct NoGradGuard {
    _priv: (),
}

impl NoGradGuard {
    pub fn enter() -> Self {
        NO_GRAD_DEPTH.with(|d| d.set(d.get() + 1));
        Self { _priv: () }
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        NO_GRAD_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// 开/关 全局推理模式（eval_mode/train_mode 可调用它）
pub fn set_inference_mode(on: bool) {
    INFERENCE_MODE.with(|m| m.set(on));
}

#[inline]
pub fn is_inference_mode() -> bool {
    INFERENCE_MODE.with(Cell::get)
}

#[inline]
pub fn is_no_grad() -> bool {
    NO_GRAD_DEPTH.with(Cell::get) > 0 || is_inference_mode()
}

/// 便利封装：no_grad(|| { ... })
pub fn no_grad<R>(f: impl FnOnce() -> R) -> R {
    let _g = NoGradGuard::enter();
    f()
}

pub type BackwardOp = Box<dyn Fn(&ArrayD<f32>)>;

pub struct TensorData {
    pub data: ArrayD<f32>,
    pub grad: Option<ArrayD<f32>>,
    pub parents: Vec<Tensor>,
    pub backward_op: Option<BackwardOp>,
    pub requires_grad: bool,
}

/// Identity of a tensor allocation. Clones of the same handle share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

#[derive(Clone)]
pub struct Tensor(pub(crate) Rc<RefCell<TensorData>>);

impl Tensor {
    pub(crate) fn from_op(data: ArrayD<f32>, parents: Vec<Tensor>, backward_op: BackwardOp) -> Tensor {
        Tensor(Rc::new(RefCell::new(TensorData {
            data,
            grad: None,
            parents,
            backward_op: Some(backward_op),
            requires_grad: true,
        })))
    }

    /// 创建叶子张量（显式指定 requires_grad）
    fn from_data_with_grad_flag(data: ArrayD<f32>, requires_grad: bool) -> Tensor {
        Tensor(Rc::new(RefCell::new(TensorData {
            data,
            grad: None,
            parents: vec![],
            backward_op: None,
            requires_grad,
        })))
    }

    /// 推理/常量：不需要梯度
    pub fn from_data_no_grad(data: ArrayD<f32>) -> Tensor {
        Tensor::from_data_with_grad_flag(data, false)
    }

    /// 训练参数：需要梯度（叶子）
    pub fn parameter(data: ArrayD<f32>) -> Tensor {
        Tensor::from_data_with_grad_flag(data, true)
    }

    pub fn id(&self) -> TensorId {
        TensorId(Rc::as_ptr(&self.0) as *const () as usize)
    }

    /// 获取数据的只读引用（零拷贝）
    pub fn data_ref(&self) -> Ref<'_, ArrayD<f32>> {
        let borrow = self.0.borrow();
        Ref::map(borrow, |t| &t.data)
    }

    /// 获取数据的可变引用
    pub fn data_mut(&self) -> RefMut<'_, ArrayD<f32>> {
        let borrow = self.0.borrow_mut();
        RefMut::map(borrow, |t| &mut t.data)
    }

    pub fn data(&self) -> ArrayD<f32> {
        self.0.borrow().data.clone()
    }

    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.0.borrow().grad.clone()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().data.shape().to_vec()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn item(&self) -> Option<f32> {
        let inner = self.0.borrow();
        if inner.data.len() == 1 {
            inner.data.first().copied()
        } else {
            None
        }
    }

    pub fn sum(&self) -> Tensor {
        crate::ops::arithmetic::sum(self)
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        crate::ops::arithmetic::scale(self, factor)
    }

    #[inline]
    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    // a leaf that no longer requires grad drops its gradient and ignores later ones
    pub fn set_requires_grad(&self, requires_grad: bool) {
        let mut inner = self.0.borrow_mut();
        inner.requires_grad = requires_grad;
        if !requires_grad {
            inner.grad = None;
        }
    }

    pub fn zero_grad(&self) {
        self.0.borrow_mut().grad = None;
    }

    pub fn add_grad(&self, grad: ArrayD<f32>) {
        let mut inner = self.0.borrow_mut();
        if !inner.requires_grad {
            return;
        }

        if inner.data.shape() != grad.shape() {
            panic!(
                "CRITICAL: Gradient shape mismatch!\nParameter Shape: {:?}\nGradient Shape: {:?}\nHint: Check ops/arithmetic.rs reduce_gradient logic.",
                inner.data.shape(),
                grad.shape()
            );
        }

        if let Some(existing) = inner.grad.as_mut() {
            *existing += &grad;
        } else {
            inner.grad = Some(grad);
        }
    }

    pub fn backward(&self) {
        let mut topo = Vec::new();
        let mut visited = HashSet::new();

        fn build_topo(node: &Tensor, topo: &mut Vec<Tensor>, visited: &mut HashSet<TensorId>) {
            if !visited.insert(node.id()) {
                return;
            }
            for parent in &node.0.borrow().parents {
                build_topo(parent, topo, visited);
            }
            topo.push(node.clone());
        }

        build_topo(self, &mut topo, &mut visited);

        let seed = ArrayD::ones(self.data_ref().shape());
        self.add_grad(seed);

        for node in topo.iter().rev() {
            let inner = node.0.borrow();
            if let (Some(grad), Some(op)) = (&inner.grad, &inner.backward_op) {
                op(grad);
            }
        }
    }

    pub fn get_raw_data(&self) -> (Vec<usize>, Vec<f32>) {
        let inner = self.0.borrow();
        (
            inner.data.shape().to_vec(),
            inner.data.iter().cloned().collect(),
        )
    }

    pub fn set_raw_data(&self, shape: Vec<usize>, raw_data: Vec<f32>) -> Result<(), ndarray::ShapeError> {
        let new_data = Array::from_shape_vec(shape, raw_data)?.into_dyn();
        self.0.borrow_mut().data = new_data;
        Ok(())
    }

}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Tensor")
            .field("shape", &inner.data.shape())
            .field("requires_grad", &inner.requires_grad)
            .field("has_grad", &inner.grad.is_some())
            .finish()
    }
}
