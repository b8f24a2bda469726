/// Host-side tensors and flat-slice math kernels.
///
/// Row-major throughout. Axis 0 of every variable and batch tensor is the
/// task axis, so most helpers here speak in terms of "rows".

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};

/// Flat f32 tensor with shape metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

/// Wire form of a tensor, validated through `Tensor::new` on load.
#[derive(Deserialize)]
struct RawTensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = MetaError;

    fn try_from(raw: RawTensor) -> Result<Self> {
        Tensor::new(raw.data, raw.shape)
    }
}

impl Tensor {
    /// Build a tensor, checking `data.len()` against the shape.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let n: usize = shape.iter().product();
        if n != data.len() {
            return Err(MetaError::shape("Tensor::new", &[n], &[data.len()]));
        }
        Ok(Tensor { data, shape })
    }

    /// Re-check `data.len()` against the shape; fields are public.
    pub fn validate(&self) -> Result<()> {
        let n: usize = self.shape.iter().product();
        if n != self.data.len() {
            return Err(MetaError::shape("Tensor::validate", &[n], &[self.data.len()]));
        }
        Ok(())
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Tensor::full(shape, 0.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![value; n],
            shape: shape.to_vec(),
        }
    }

    /// `[start, start + 1, ..)` up to but excluding `stop`, as a 1-D tensor.
    pub fn arange(start: f32, stop: f32) -> Self {
        let mut data = Vec::new();
        let mut v = start;
        while v < stop {
            data.push(v);
            v += 1.0;
        }
        let n = data.len();
        Tensor { data, shape: vec![n] }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    // ── Task-axis helpers ────────────────────────────────────────────

    /// Size of axis 0. Rank-0 tensors have no task axis.
    pub fn num_rows(&self) -> Option<usize> {
        self.shape.first().copied()
    }

    /// Shape of one row (everything after axis 0).
    pub fn row_shape(&self) -> &[usize] {
        if self.shape.is_empty() { &[] } else { &self.shape[1..] }
    }

    fn row_len(&self) -> usize {
        self.row_shape().iter().product()
    }

    /// `n` copies of `self` stacked along a new task axis.
    pub fn repeat_rows(&self, n: usize) -> Tensor {
        let mut data = Vec::with_capacity(self.numel() * n);
        for _ in 0..n {
            data.extend_from_slice(&self.data);
        }
        let mut shape = Vec::with_capacity(self.shape.len() + 1);
        shape.push(n);
        shape.extend_from_slice(&self.shape);
        Tensor { data, shape }
    }

    /// Uniform mean over the task axis.
    pub fn mean_rows(&self) -> Result<Tensor> {
        let rows = match self.num_rows() {
            Some(r) if r > 0 => r,
            _ => return Err(MetaError::shape("Tensor::mean_rows", &[1], &self.shape)),
        };
        let len = self.row_len();
        let mut out = vec![0.0f32; len];
        for r in 0..rows {
            for (o, v) in out.iter_mut().zip(&self.data[r * len..(r + 1) * len]) {
                *o += v;
            }
        }
        let inv = 1.0 / rows as f32;
        for o in out.iter_mut() {
            *o *= inv;
        }
        Ok(Tensor { data: out, shape: self.row_shape().to_vec() })
    }

    /// Replace every row with the task mean, keeping the shape.
    pub fn mean_rows_broadcast(&self) -> Result<Tensor> {
        let rows = self.num_rows().unwrap_or(0);
        Ok(self.mean_rows()?.repeat_rows(rows))
    }

    // ── Element-wise ─────────────────────────────────────────────────

    pub fn scaled(&self, s: f32) -> Tensor {
        let mut out = vec![0.0f32; self.numel()];
        scale_f32(&self.data, s, &mut out);
        Tensor { data: out, shape: self.shape.clone() }
    }

    /// Combine two equally-shaped tensors element by element.
    pub fn zip_map(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(MetaError::shape("Tensor::zip_map", &self.shape, &other.shape));
        }
        let data = self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect();
        Ok(Tensor { data, shape: self.shape.clone() })
    }

    /// numpy-style `allclose`: |a - b| <= atol + rtol * |b| everywhere.
    pub fn allclose(&self, other: &Tensor, rtol: f32, atol: f32) -> bool {
        self.shape == other.shape
            && self.data.iter().zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs())
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Transpose A[M,K] → out[K,M].
pub fn transpose_f32(a: &[f32], out: &mut [f32], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), k * m);

    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// Element-wise add: out[i] = a[i] + b[i].
pub fn add_f32(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] = a[i] + b[i];
    }
}

/// Element-wise product: out[i] = a[i] * b[i].
pub fn mul_f32(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] = a[i] * b[i];
    }
}

/// Scale: out[i] = a[i] * scalar.
pub fn scale_f32(a: &[f32], scalar: f32, out: &mut [f32]) {
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] = a[i] * scalar;
    }
}

/// Sigmoid: 1 / (1 + exp(-x)). Clamped to avoid overflow.
#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    if x >= 15.0 { return 1.0; }
    if x <= -15.0 { return 0.0; }
    1.0 / (1.0 + (-x).exp())
}

// ── Deterministic RNG ────────────────────────────────────────────────

/// xorshift64: reproducible initialisation for tests and benches.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}
