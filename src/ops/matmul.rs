// src/ops/matmul.rs
use crate::autograd::{is_no_grad, Tensor};
use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, ArrayD, ArrayView2, Ix2};

fn as_2d(data: &ArrayD<f32>, rows: usize, cols: usize) -> Array2<f32> {
    // 尝试 View，失败则 Copy (处理非连续内存)
    match data.view().into_shape_with_order((rows, cols)) {
        Ok(v) => v.to_owned(),
        Err(_) => data
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((rows, cols))
            .expect("Reshape to 2D failed: element count mismatch"),
    }
}

fn view_2d(data: &ArrayD<f32>) -> ArrayView2<'_, f32> {
    data.view()
        .into_dimensionality::<Ix2>()
        .unwrap_or_else(|_| panic!("expected a 2D operand, got {:?}", data.shape()))
}

// A[..., K] @ B^T, where B is [N(out), K(in)]
// output: [..., N]
pub fn matmul(a: &Tensor, b: &Tensor) -> Tensor {
    let build_graph = !is_no_grad() && (a.requires_grad() || b.requires_grad());

    let a_shape = a.shape();
    let b_shape = b.shape();

    if b_shape.len() != 2 {
        panic!("MatMul RHS must be 2D, got {:?}", b_shape);
    }

    let k_dim_a = a_shape[a_shape.len() - 1];
    let n_dim = b_shape[0];
    let k_dim_b = b_shape[1];

    if k_dim_a != k_dim_b {
        panic!(
            "MatMul shape mismatch: a {:?} (K={}) vs b {:?} (K={})",
            a_shape, k_dim_a, b_shape, k_dim_b
        );
    }

    let m_dim = a.len() / k_dim_a;

    let res_2d = {
        let ad = a.data_ref();
        let bd = b.data_ref();
        let a_2d = as_2d(&ad, m_dim, k_dim_a);
        let b_2d = view_2d(&bd); // [N,K]
        let mut res = Array2::<f32>::zeros((m_dim, n_dim));
        general_mat_mul(1.0, &a_2d, &b_2d.t(), 0.0, &mut res);
        res
    };

    // 恢复输出形状: [..., N]
    let mut out_shape = a_shape.clone();
    let last_idx = out_shape.len() - 1;
    out_shape[last_idx] = n_dim;

    let result = res_2d
        .into_shape_with_order(out_shape)
        .expect("MatMul output reshape failed")
        .into_dyn();

    if !build_graph {
        return Tensor::from_data_no_grad(result);
    }

    let a_clone = a.clone();
    let b_clone = b.clone();

    Tensor::from_op(
        result,
        vec![a.clone(), b.clone()],
        Box::new(move |grad| {
            // grad: [..., N] -> [M,N]
            let grad_2d = as_2d(grad, m_dim, n_dim);

            // Backward 必须 clone 数据以避免 RefCell 借用冲突
            let (a_2d, b_2d) = {
                let ad = a_clone.data_ref();
                let bd = b_clone.data_ref();
                (as_2d(&ad, m_dim, k_dim_a), view_2d(&bd).to_owned())
            };

            // dA = dY @ B  -> [M,K]
            let mut da_2d = Array2::<f32>::zeros((m_dim, k_dim_a));
            general_mat_mul(1.0, &grad_2d, &b_2d, 0.0, &mut da_2d);
            let da = da_2d
                .into_shape_with_order(a_shape.clone())
                .expect("MatMul input grad reshape failed")
                .into_dyn();
            a_clone.add_grad(da);

            // dB = dY^T @ A -> [N,K]
            let mut db_2d = Array2::<f32>::zeros((n_dim, k_dim_a));
            general_mat_mul(1.0, &grad_2d.t(), &a_2d, 0.0, &mut db_2d);
            b_clone.add_grad(db_2d.into_dyn());
        }),
    )
}

/// Plain matrix product `lhs[M, K] @ rhs[K, N] -> [M, N]`.
///
/// Backward: `dlhs = dY @ rhs^T`, `drhs = lhs^T @ dY`.
pub fn mm(lhs: &Tensor, rhs: &Tensor) -> Tensor {
    let build_graph = !is_no_grad() && (lhs.requires_grad() || rhs.requires_grad());

    let output = {
        let l = lhs.data_ref();
        let r = rhs.data_ref();
        let l2 = view_2d(&l);
        let r2 = view_2d(&r);
        let (m, k) = l2.dim();
        let (k2, n) = r2.dim();
        assert_eq!(k, k2, "mm inner dim mismatch: {:?} @ {:?}", l.shape(), r.shape());

        let mut out = Array2::<f32>::zeros((m, n));
        general_mat_mul(1.0, &l2, &r2, 0.0, &mut out);
        out.into_dyn()
    };

    if !build_graph {
        return Tensor::from_data_no_grad(output);
    }

    let lhs_clone = lhs.clone();
    let rhs_clone = rhs.clone();

    Tensor::from_op(
        output,
        vec![lhs.clone(), rhs.clone()],
        Box::new(move |grad| {
            let (l_data, r_data) = {
                let l = lhs_clone.data_ref();
                let r = rhs_clone.data_ref();
                (view_2d(&l).to_owned(), view_2d(&r).to_owned())
            };
            let g = view_2d(grad);

            let mut d_lhs = Array2::<f32>::zeros(l_data.dim());
            general_mat_mul(1.0, &g, &r_data.t(), 0.0, &mut d_lhs);
            lhs_clone.add_grad(d_lhs.into_dyn());

            let mut d_rhs = Array2::<f32>::zeros(r_data.dim());
            general_mat_mul(1.0, &l_data.t(), &g, 0.0, &mut d_rhs);
            rhs_clone.add_grad(d_rhs.into_dyn());
        }),
    )
}
