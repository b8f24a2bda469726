// Higher-order differentiation on the tape: nested gradients, Hessian-vector
// products through matmul, and the thread-local tape scope.

use metagrad_core::tape::{is_tape_active, with_tape, Tape};
use metagrad_core::{Backend, Tensor};

fn assert_close(actual: &[f32], expected: &[f32], tol: f32, msg: &str) {
    assert_eq!(actual.len(), expected.len(), "{msg}: length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < tol, "{msg}[{i}]: actual={a} expected={e}");
    }
}

#[test]
fn test_third_derivative_of_quartic() {
    // f = x⁴: f' = 4x³, f'' = 12x², f''' = 24x
    let mut tape = Tape::new(Backend::HigherOrder);
    let x = tape.register_param(&Tensor::new(vec![1.5], vec![1]).unwrap());
    let x2 = tape.square(x).unwrap();
    let x4 = tape.square(x2).unwrap();
    let f = tape.sum(x4).unwrap();

    let d1 = tape.grad(f, &[x], true).unwrap()[0];
    assert_close(tape.buf_data(d1), &[4.0 * 1.5f32.powi(3)], 1e-4, "f'");
    let s1 = tape.sum(d1).unwrap();
    let d2 = tape.grad(s1, &[x], true).unwrap()[0];
    assert_close(tape.buf_data(d2), &[12.0 * 1.5f32.powi(2)], 1e-4, "f''");
    let s2 = tape.sum(d2).unwrap();
    let d3 = tape.grad_values(s2, &[x]).unwrap();
    assert_close(&d3[0].data, &[24.0 * 1.5], 1e-4, "f'''");
}

#[test]
fn test_hessian_vector_product_through_matmul() {
    // f(W) = (W x)², H = 2 x xᵀ, so H v = 2 x (xᵀ v)
    let mut tape = Tape::new(Backend::HigherOrder);
    let w = tape.register_param(&Tensor::new(vec![0.3, -0.7], vec![1, 2]).unwrap());
    let x = tape.constant(&Tensor::new(vec![1.0, 2.0], vec![2, 1]).unwrap());
    let v = tape.constant(&Tensor::new(vec![1.0, 1.0], vec![1, 2]).unwrap());

    let y = tape.matmul(w, x).unwrap();
    let y2 = tape.square(y).unwrap();
    let f = tape.sum(y2).unwrap();

    let g = tape.grad(f, &[w], true).unwrap()[0];
    assert_eq!(tape.buf_shape(g), &[1, 2]);
    // ∇f = 2 (W x) xᵀ, W x = 0.3 − 1.4 = −1.1
    assert_close(tape.buf_data(g), &[-2.2, -4.4], 1e-5, "grad");

    let gv = tape.mul(g, v).unwrap();
    let gv = tape.sum(gv).unwrap();
    let hv = tape.grad_values(gv, &[w]).unwrap();
    assert_close(&hv[0].data, &[6.0, 12.0], 1e-5, "Hv");
}

#[test]
fn test_hessian_through_matmul_transpose_b() {
    // f(a) = (a bᵀ)², a, b ∈ R^{1×3}: ∂²f/∂a² = 2 bᵀ b, row sums against v = 1
    let mut tape = Tape::new(Backend::HigherOrder);
    let a = tape.register_param(&Tensor::new(vec![0.1, 0.2, 0.3], vec![1, 3]).unwrap());
    let b = tape.constant(&Tensor::new(vec![1.0, -1.0, 2.0], vec![1, 3]).unwrap());
    let ones = tape.constant(&Tensor::full(&[1, 3], 1.0));

    let y = tape.matmul_transpose_b(a, b).unwrap();
    let y2 = tape.square(y).unwrap();
    let f = tape.sum(y2).unwrap();
    let g = tape.grad(f, &[a], true).unwrap()[0];
    let gv = tape.mul(g, ones).unwrap();
    let gv = tape.sum(gv).unwrap();
    let hv = tape.grad_values(gv, &[a]).unwrap();
    // (2 bᵀ b) 1 = 2 b (b · 1) = 2 b · 2
    assert_close(&hv[0].data, &[4.0, -4.0, 8.0], 1e-5, "Hv");
}

#[test]
fn test_gradient_through_gradient_step() {
    // One inner step v1 = v − lr·∇(v²) = (1 − 2lr) v; outer (v1)² has
    // derivative 2 (1 − 2lr)² v.
    let lr = 0.1;
    let mut tape = Tape::new(Backend::HigherOrder);
    let v = tape.register_param(&Tensor::new(vec![2.0], vec![1]).unwrap());
    let inner = tape.square(v).unwrap();
    let inner = tape.sum(inner).unwrap();
    let g = tape.grad(inner, &[v], true).unwrap()[0];
    let step = tape.scale(g, lr).unwrap();
    let v1 = tape.sub(v, step).unwrap();
    let outer = tape.square(v1).unwrap();
    let outer = tape.sum(outer).unwrap();
    let d = tape.grad_values(outer, &[v]).unwrap();
    let expected = 2.0 * (1.0 - 2.0 * lr) * (1.0 - 2.0 * lr) * 2.0;
    assert_close(&d[0].data, &[expected], 1e-5, "meta-gradient");

    // Detaching the inner gradient drops the curvature term.
    let g_det = tape.detach(g);
    let step = tape.scale(g_det, lr).unwrap();
    let v1 = tape.sub(v, step).unwrap();
    let outer = tape.square(v1).unwrap();
    let outer = tape.sum(outer).unwrap();
    let d = tape.grad_values(outer, &[v]).unwrap();
    assert_close(&d[0].data, &[2.0 * (1.0 - 2.0 * lr) * 2.0], 1e-5, "first-order");
}

#[test]
fn test_pad_slice_second_order() {
    let mut tape = Tape::new(Backend::HigherOrder);
    let a = tape.register_param(&Tensor::new(vec![1.0, 2.0], vec![2]).unwrap());
    let padded = tape.pad(a, 1, &[4]).unwrap();
    assert_eq!(tape.buf_data(padded), &[0.0, 1.0, 2.0, 0.0]);
    let cube = tape.square(padded).unwrap();
    let cube = tape.mul(cube, padded).unwrap();
    let f = tape.sum(cube).unwrap();
    // f = Σ a³ → ∇f = 3a², ∇(Σ ∇f) = 6a
    let g = tape.grad(f, &[a], true).unwrap()[0];
    assert_close(tape.buf_data(g), &[3.0, 12.0], 1e-5, "grad");
    let s = tape.sum(g).unwrap();
    let h = tape.grad_values(s, &[a]).unwrap();
    assert_close(&h[0].data, &[6.0, 12.0], 1e-5, "diag hessian");
}

#[test]
fn test_with_tape_scope_is_released() {
    assert!(!is_tape_active());
    let (bufs, ops) = with_tape(Backend::FirstOrder, |tape| {
        assert!(is_tape_active());
        let a = tape.register_param(&Tensor::full(&[3], 2.0));
        let s = tape.sum(a).unwrap();
        tape.grad_values(s, &[a]).unwrap();
        (tape.num_bufs(), tape.num_ops())
    });
    assert!(bufs >= 3 && ops == 1, "bufs={bufs} ops={ops}");
    assert!(!is_tape_active());
}

#[test]
fn test_with_tape_flag_cleared_on_panic() {
    let result = std::panic::catch_unwind(|| {
        with_tape(Backend::HigherOrder, |_| panic!("boom"))
    });
    assert!(result.is_err());
    assert!(!is_tape_active());
}
