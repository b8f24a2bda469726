// Wengert tape: reverse-mode AD via operation recording.
//
// Records operations during the forward pass into a linear tape, then
// replays them in reverse to compute gradients via the chain rule.
//
// Two reverse sweeps share the op list:
//   - numeric: VJPs computed on flat buffers, result is plain data.
//   - graph:   every VJP is itself recorded as tape ops, so the returned
//              gradient buffers can be differentiated again (MAML).
//
// Buffers are immutable once allocated. Parameters are snapshotted at
// registration, so later mutation of the host tensor never leaks in.

use std::cell::Cell;

use crate::dispatch::Backend;
use crate::error::{MetaError, Result};
use crate::tensor::{self, Tensor};

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers. Immutable after creation.
pub type BufId = usize;

/// A flat tensor buffer in the tape arena.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    /// Flat storage (row-major).
    pub data: Vec<f32>,
    /// Shape metadata, e.g., [num_tasks, d].
    pub shape: Vec<usize>,
}

impl TapeBuf {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation on the tape.
#[derive(Debug, Clone)]
pub enum TapeOp {
    // ── Linear algebra ──────────────────────────────────────────
    /// out = A @ B where A: [m, k], B: [k, n], out: [m, n]
    Matmul { a: BufId, b: BufId, out: BufId, m: usize, k: usize, n: usize },
    /// out = A @ B^T where A: [m, k], B: [n, k], out: [m, n]
    MatmulTransposeB { a: BufId, b: BufId, out: BufId, m: usize, k: usize, n: usize },
    /// out = A^T where A: [rows, cols], out: [cols, rows]
    Transpose { input: BufId, out: BufId, rows: usize, cols: usize },

    // ── Element-wise ────────────────────────────────────────────
    /// out = A + B
    Add { a: BufId, b: BufId, out: BufId },
    /// out = A - B
    Sub { a: BufId, b: BufId, out: BufId },
    /// out = A * B  (element-wise)
    Mul { a: BufId, b: BufId, out: BufId },
    /// out = scalar * A
    Scale { input: BufId, scalar: f32, out: BufId },
    /// out = -A
    Negate { input: BufId, out: BufId },
    /// out = sigmoid(x); backward reads the output
    Sigmoid { input: BufId, out: BufId },

    // ── Reductions / structure ──────────────────────────────────
    /// out = sum(A), shape []
    Sum { input: BufId, out: BufId },
    /// out = fill(shape, input[0]); input has one element
    Broadcast { input: BufId, out: BufId },
    /// Same data, new shape.
    Reshape { input: BufId, out: BufId },
    /// out = input[offset..offset+len]
    Slice { input: BufId, out: BufId, offset: usize, len: usize, input_len: usize },
    /// out = zeros(out_len) with input written at [offset..offset+len]
    Pad { input: BufId, out: BufId, offset: usize, len: usize, out_len: usize },
}

// ── The Tape ─────────────────────────────────────────────────────────

/// Wengert tape for reverse-mode AD.
///
/// Created via `with_tape()`, dropped when the enclosing meta step returns.
pub struct Tape {
    /// Operations in forward order. Replayed in reverse during backward.
    ops: Vec<TapeOp>,
    /// Arena of tensor buffers. Indexed by BufId.
    bufs: Vec<TapeBuf>,
    /// Which reverse sweeps this tape may run.
    backend: Backend,
}

impl Tape {
    pub fn new(backend: Backend) -> Self {
        Tape {
            ops: Vec::new(),
            bufs: Vec::new(),
            backend,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    // ── Buffer management ────────────────────────────────────────

    /// Allocate a new buffer in the arena. Returns its BufId.
    pub fn alloc(&mut self, data: Vec<f32>, shape: Vec<usize>) -> BufId {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        let id = self.bufs.len();
        self.bufs.push(TapeBuf::new(data, shape));
        id
    }

    /// Register a meta-parameter leaf. CLONES the data.
    pub fn register_param(&mut self, t: &Tensor) -> BufId {
        self.alloc(t.data.clone(), t.shape.clone())
    }

    /// Register batch data or another fixed input. Clones the data.
    /// Gradients can be taken with respect to any leaf.
    pub fn constant(&mut self, t: &Tensor) -> BufId {
        self.alloc(t.data.clone(), t.shape.clone())
    }

    /// Copy of `id` with no history: gradients stop here.
    pub fn detach(&mut self, id: BufId) -> BufId {
        let buf = &self.bufs[id];
        let (data, shape) = (buf.data.clone(), buf.shape.clone());
        self.alloc(data, shape)
    }

    /// Get the data for a buffer.
    pub fn buf_data(&self, id: BufId) -> &[f32] {
        &self.bufs[id].data
    }

    /// Get the shape for a buffer.
    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.bufs[id].shape
    }

    /// Get the number of elements in a buffer.
    pub fn buf_numel(&self, id: BufId) -> usize {
        self.bufs[id].numel()
    }

    /// Number of buffers in the arena.
    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    /// Number of ops recorded.
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Host copy of a buffer.
    pub fn to_tensor(&self, id: BufId) -> Tensor {
        let buf = &self.bufs[id];
        Tensor { data: buf.data.clone(), shape: buf.shape.clone() }
    }

    /// Value of a one-element buffer.
    pub fn value(&self, id: BufId) -> Result<f32> {
        match self.bufs[id].data.as_slice() {
            [v] => Ok(*v),
            _ => Err(MetaError::NotScalar(self.bufs[id].shape.clone())),
        }
    }

    // ── Recording ────────────────────────────────────────────────

    /// Allocate the output buffer and record the op that produced it.
    fn record_with_output(&mut self, data: Vec<f32>, shape: Vec<usize>,
                          op_fn: impl FnOnce(BufId) -> TapeOp) -> BufId {
        let out_id = self.alloc(data, shape);
        self.ops.push(op_fn(out_id));
        out_id
    }

    fn same_shape(&self, op: &'static str, a: BufId, b: BufId) -> Result<()> {
        if self.bufs[a].shape != self.bufs[b].shape {
            return Err(MetaError::shape(op, &self.bufs[a].shape, &self.bufs[b].shape));
        }
        Ok(())
    }

    fn matrix_dims(&self, op: &'static str, id: BufId) -> Result<(usize, usize)> {
        match self.bufs[id].shape.as_slice() {
            &[r, c] => Ok((r, c)),
            other => Err(MetaError::shape(op, &[0, 0], other)),
        }
    }

    pub fn add(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        self.same_shape("add", a, b)?;
        let mut out = vec![0.0f32; self.bufs[a].numel()];
        tensor::add_f32(&self.bufs[a].data, &self.bufs[b].data, &mut out);
        let shape = self.bufs[a].shape.clone();
        Ok(self.record_with_output(out, shape, |out| TapeOp::Add { a, b, out }))
    }

    pub fn sub(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        self.same_shape("sub", a, b)?;
        let out: Vec<f32> = self.bufs[a].data.iter().zip(&self.bufs[b].data)
            .map(|(x, y)| x - y).collect();
        let shape = self.bufs[a].shape.clone();
        Ok(self.record_with_output(out, shape, |out| TapeOp::Sub { a, b, out }))
    }

    pub fn mul(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        self.same_shape("mul", a, b)?;
        let mut out = vec![0.0f32; self.bufs[a].numel()];
        tensor::mul_f32(&self.bufs[a].data, &self.bufs[b].data, &mut out);
        let shape = self.bufs[a].shape.clone();
        Ok(self.record_with_output(out, shape, |out| TapeOp::Mul { a, b, out }))
    }

    pub fn square(&mut self, a: BufId) -> Result<BufId> {
        self.mul(a, a)
    }

    pub fn scale(&mut self, input: BufId, scalar: f32) -> Result<BufId> {
        let mut out = vec![0.0f32; self.bufs[input].numel()];
        tensor::scale_f32(&self.bufs[input].data, scalar, &mut out);
        let shape = self.bufs[input].shape.clone();
        Ok(self.record_with_output(out, shape, |out| TapeOp::Scale { input, scalar, out }))
    }

    pub fn neg(&mut self, input: BufId) -> Result<BufId> {
        let out: Vec<f32> = self.bufs[input].data.iter().map(|x| -x).collect();
        let shape = self.bufs[input].shape.clone();
        Ok(self.record_with_output(out, shape, |out| TapeOp::Negate { input, out }))
    }

    pub fn sigmoid(&mut self, input: BufId) -> Result<BufId> {
        let out: Vec<f32> = self.bufs[input].data.iter().map(|&x| tensor::sigmoid_f32(x)).collect();
        let shape = self.bufs[input].shape.clone();
        Ok(self.record_with_output(out, shape, |out| TapeOp::Sigmoid { input, out }))
    }

    /// Sum of all elements, shape [].
    pub fn sum(&mut self, input: BufId) -> Result<BufId> {
        let s: f32 = self.bufs[input].data.iter().sum();
        Ok(self.record_with_output(vec![s], Vec::new(), |out| TapeOp::Sum { input, out }))
    }

    /// Mean of all elements, shape [].
    pub fn mean(&mut self, input: BufId) -> Result<BufId> {
        let n = self.bufs[input].numel().max(1);
        let s = self.sum(input)?;
        self.scale(s, 1.0 / n as f32)
    }

    /// Fill `shape` with the single value held by `input`.
    pub fn broadcast(&mut self, input: BufId, shape: &[usize]) -> Result<BufId> {
        let v = match self.bufs[input].data.as_slice() {
            [v] => *v,
            _ => return Err(MetaError::shape("broadcast", &[1], &self.bufs[input].shape)),
        };
        let n: usize = shape.iter().product();
        Ok(self.record_with_output(vec![v; n], shape.to_vec(), |out| TapeOp::Broadcast { input, out }))
    }

    pub fn reshape(&mut self, input: BufId, shape: &[usize]) -> Result<BufId> {
        let n: usize = shape.iter().product();
        if n != self.bufs[input].numel() {
            return Err(MetaError::shape("reshape", shape, &self.bufs[input].shape));
        }
        let data = self.bufs[input].data.clone();
        Ok(self.record_with_output(data, shape.to_vec(), |out| TapeOp::Reshape { input, out }))
    }

    /// Flat slice `[offset, offset + numel(shape))` viewed as `shape`.
    pub fn slice(&mut self, input: BufId, offset: usize, shape: &[usize]) -> Result<BufId> {
        let len: usize = shape.iter().product();
        let input_len = self.bufs[input].numel();
        if offset + len > input_len {
            return Err(MetaError::shape("slice", &[offset + len], &self.bufs[input].shape));
        }
        let data = self.bufs[input].data[offset..offset + len].to_vec();
        Ok(self.record_with_output(data, shape.to_vec(),
            |out| TapeOp::Slice { input, out, offset, len, input_len }))
    }

    /// Zeros of `shape` with `input` written at flat `offset`.
    pub fn pad(&mut self, input: BufId, offset: usize, shape: &[usize]) -> Result<BufId> {
        let out_len: usize = shape.iter().product();
        let len = self.bufs[input].numel();
        if offset + len > out_len {
            return Err(MetaError::shape("pad", shape, &[offset + len]));
        }
        let mut data = vec![0.0f32; out_len];
        data[offset..offset + len].copy_from_slice(&self.bufs[input].data);
        Ok(self.record_with_output(data, shape.to_vec(),
            |out| TapeOp::Pad { input, out, offset, len, out_len }))
    }

    /// Row `i` along axis 0, with the task axis removed.
    pub fn row(&mut self, input: BufId, i: usize) -> Result<BufId> {
        let shape = self.bufs[input].shape.clone();
        let rows = match shape.first() {
            Some(&r) if i < r => r,
            _ => return Err(MetaError::shape("row", &[i + 1], &shape)),
        };
        let row_shape = shape[1..].to_vec();
        let len = self.bufs[input].numel() / rows;
        self.slice(input, i * len, &row_shape)
    }

    /// out = A @ B for 2-D buffers.
    pub fn matmul(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        let (m, k) = self.matrix_dims("matmul", a)?;
        let (k2, n) = self.matrix_dims("matmul", b)?;
        if k != k2 {
            return Err(MetaError::shape("matmul", &[k, n], &[k2, n]));
        }
        let mut out = vec![0.0f32; m * n];
        tensor::matmul_f32(&self.bufs[a].data, &self.bufs[b].data, &mut out, m, k, n);
        Ok(self.record_with_output(out, vec![m, n],
            |out| TapeOp::Matmul { a, b, out, m, k, n }))
    }

    /// out = A @ B^T for 2-D buffers.
    pub fn matmul_transpose_b(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        let (m, k) = self.matrix_dims("matmul_transpose_b", a)?;
        let (n, k2) = self.matrix_dims("matmul_transpose_b", b)?;
        if k != k2 {
            return Err(MetaError::shape("matmul_transpose_b", &[n, k], &[n, k2]));
        }
        let mut b_t = vec![0.0f32; k * n];
        tensor::transpose_f32(&self.bufs[b].data, &mut b_t, n, k);
        let mut out = vec![0.0f32; m * n];
        tensor::matmul_f32(&self.bufs[a].data, &b_t, &mut out, m, k, n);
        Ok(self.record_with_output(out, vec![m, n],
            |out| TapeOp::MatmulTransposeB { a, b, out, m, k, n }))
    }

    pub fn transpose(&mut self, input: BufId) -> Result<BufId> {
        let (rows, cols) = self.matrix_dims("transpose", input)?;
        let mut out = vec![0.0f32; rows * cols];
        tensor::transpose_f32(&self.bufs[input].data, &mut out, rows, cols);
        Ok(self.record_with_output(out, vec![cols, rows],
            |out| TapeOp::Transpose { input, out, rows, cols }))
    }

    // ── Gradients ────────────────────────────────────────────────

    /// Gradients of the scalar `output` with respect to each of `wrt`.
    ///
    /// With `create_graph` the VJPs are recorded as tape ops and the returned
    /// buffers carry history (differentiable again). Without it the returned
    /// buffers are fresh leaves. Inputs that `output` does not depend on get
    /// zeros.
    pub fn grad(&mut self, output: BufId, wrt: &[BufId], create_graph: bool) -> Result<Vec<BufId>> {
        if create_graph {
            self.backend.require_nested_gradients()?;
        } else {
            self.backend.require_gradients()?;
        }
        if self.bufs[output].numel() != 1 {
            return Err(MetaError::NotScalar(self.bufs[output].shape.clone()));
        }

        if create_graph {
            let grads = self.backward_graph(output)?;
            Ok(wrt.iter().map(|&id| match grads[id] {
                Some(g) => g,
                None => {
                    let shape = self.bufs[id].shape.clone();
                    self.alloc(vec![0.0; self.bufs[id].numel()], shape)
                }
            }).collect())
        } else {
            let grads = self.backward_numeric(output);
            Ok(wrt.iter().map(|&id| {
                let shape = self.bufs[id].shape.clone();
                let data = grads[id].clone().unwrap_or_else(|| vec![0.0; self.bufs[id].numel()]);
                self.alloc(data, shape)
            }).collect())
        }
    }

    /// Numeric gradients as host tensors.
    pub fn grad_values(&mut self, output: BufId, wrt: &[BufId]) -> Result<Vec<Tensor>> {
        let ids = self.grad(output, wrt, false)?;
        Ok(ids.into_iter().map(|id| self.to_tensor(id)).collect())
    }

    // ── Numeric backward ─────────────────────────────────────────

    fn backward_numeric(&self, loss: BufId) -> Vec<Option<Vec<f32>>> {
        let mut grads: Vec<Option<Vec<f32>>> = vec![None; self.bufs.len()];
        grads[loss] = Some(vec![1.0]);
        for op in self.ops.iter().rev() {
            self.backward_op_numeric(op, &mut grads);
        }
        grads
    }

    /// Compute VJP for a single operation on flat data.
    fn backward_op_numeric(&self, op: &TapeOp, grads: &mut [Option<Vec<f32>>]) {
        match op {
            // ── Matmul: out = A @ B ──────────────────────────────
            TapeOp::Matmul { a, b, out, m, k, n } => {
                let (m, k, n) = (*m, *k, *n);
                if let Some(d_out) = grads[*out].clone() {
                    // d_A = d_out @ B^T
                    let mut d_a = vec![0.0f32; m * k];
                    let mut b_t = vec![0.0f32; n * k];
                    tensor::transpose_f32(&self.bufs[*b].data, &mut b_t, k, n);
                    tensor::matmul_f32(&d_out, &b_t, &mut d_a, m, n, k);
                    accumulate(grads, *a, d_a);

                    // d_B = A^T @ d_out
                    let mut d_b = vec![0.0f32; k * n];
                    let mut a_t = vec![0.0f32; k * m];
                    tensor::transpose_f32(&self.bufs[*a].data, &mut a_t, m, k);
                    tensor::matmul_f32(&a_t, &d_out, &mut d_b, k, m, n);
                    accumulate(grads, *b, d_b);
                }
            }

            // ── MatmulTransposeB: out = A @ B^T ─────────────────
            TapeOp::MatmulTransposeB { a, b, out, m, k, n } => {
                let (m, k, n) = (*m, *k, *n);
                if let Some(d_out) = grads[*out].clone() {
                    // d_A = d_out @ B  (d_out: m×n, B: n×k → d_A: m×k)
                    let mut d_a = vec![0.0f32; m * k];
                    tensor::matmul_f32(&d_out, &self.bufs[*b].data, &mut d_a, m, n, k);
                    accumulate(grads, *a, d_a);

                    // d_B = d_out^T @ A  (d_out^T: n×m, A: m×k → d_B: n×k)
                    let mut d_out_t = vec![0.0f32; n * m];
                    tensor::transpose_f32(&d_out, &mut d_out_t, m, n);
                    let mut d_b = vec![0.0f32; n * k];
                    tensor::matmul_f32(&d_out_t, &self.bufs[*a].data, &mut d_b, n, m, k);
                    accumulate(grads, *b, d_b);
                }
            }

            // ── Transpose: out = A^T ─────────────────────────────
            TapeOp::Transpose { input, out, rows, cols } => {
                if let Some(d_out) = grads[*out].clone() {
                    let mut d_input = vec![0.0f32; *rows * *cols];
                    tensor::transpose_f32(&d_out, &mut d_input, *cols, *rows);
                    accumulate(grads, *input, d_input);
                }
            }

            TapeOp::Add { a, b, out } => {
                if let Some(d_out) = grads[*out].clone() {
                    accumulate(grads, *a, d_out.clone());
                    accumulate(grads, *b, d_out);
                }
            }

            TapeOp::Sub { a, b, out } => {
                if let Some(d_out) = grads[*out].clone() {
                    let neg: Vec<f32> = d_out.iter().map(|x| -x).collect();
                    accumulate(grads, *a, d_out);
                    accumulate(grads, *b, neg);
                }
            }

            TapeOp::Mul { a, b, out } => {
                if let Some(d_out) = grads[*out].clone() {
                    // d_A = d_out * B, d_B = d_out * A
                    let d_a: Vec<f32> = d_out.iter().zip(&self.bufs[*b].data).map(|(d, b)| d * b).collect();
                    let d_b: Vec<f32> = d_out.iter().zip(&self.bufs[*a].data).map(|(d, a)| d * a).collect();
                    accumulate(grads, *a, d_a);
                    accumulate(grads, *b, d_b);
                }
            }

            TapeOp::Scale { input, scalar, out } => {
                if let Some(d_out) = grads[*out].clone() {
                    let d_input: Vec<f32> = d_out.iter().map(|d| *scalar * d).collect();
                    accumulate(grads, *input, d_input);
                }
            }

            TapeOp::Negate { input, out } => {
                if let Some(d_out) = grads[*out].clone() {
                    let d_input: Vec<f32> = d_out.iter().map(|d| -d).collect();
                    accumulate(grads, *input, d_input);
                }
            }

            TapeOp::Sigmoid { input, out } => {
                if let Some(d_out) = grads[*out].clone() {
                    // d_x = d_out * out * (1 - out)
                    let d_input: Vec<f32> = d_out.iter().zip(&self.bufs[*out].data)
                        .map(|(d, o)| d * o * (1.0 - o)).collect();
                    accumulate(grads, *input, d_input);
                }
            }

            TapeOp::Sum { input, out } => {
                if let Some(d_out) = grads[*out].clone() {
                    accumulate(grads, *input, vec![d_out[0]; self.bufs[*input].numel()]);
                }
            }

            TapeOp::Broadcast { input, out } => {
                if let Some(d_out) = grads[*out].clone() {
                    accumulate(grads, *input, vec![d_out.iter().sum()]);
                }
            }

            TapeOp::Reshape { input, out } => {
                if let Some(d_out) = grads[*out].clone() {
                    accumulate(grads, *input, d_out);
                }
            }

            TapeOp::Slice { input, out, offset, len, input_len } => {
                if let Some(d_out) = grads[*out].clone() {
                    let mut d_input = vec![0.0f32; *input_len];
                    d_input[*offset..*offset + *len].copy_from_slice(&d_out);
                    accumulate(grads, *input, d_input);
                }
            }

            TapeOp::Pad { input, out, offset, len, .. } => {
                if let Some(d_out) = grads[*out].clone() {
                    accumulate(grads, *input, d_out[*offset..*offset + *len].to_vec());
                }
            }
        }
    }

    // ── Graph backward ───────────────────────────────────────────

    /// Reverse sweep that records every VJP on the tape. Only ops that existed
    /// when the sweep started are replayed.
    fn backward_graph(&mut self, loss: BufId) -> Result<Vec<Option<BufId>>> {
        let mut grads: Vec<Option<BufId>> = vec![None; self.bufs.len()];
        let seed = self.alloc(vec![1.0], self.bufs[loss].shape.clone());
        grads[loss] = Some(seed);
        for op_idx in (0..self.ops.len()).rev() {
            let op = self.ops[op_idx].clone();
            self.backward_op_graph(&op, &mut grads)?;
        }
        Ok(grads)
    }

    fn accumulate_graph(&mut self, grads: &mut [Option<BufId>], id: BufId, g: BufId) -> Result<()> {
        grads[id] = Some(match grads[id] {
            Some(existing) => self.add(existing, g)?,
            None => g,
        });
        Ok(())
    }

    /// Compute VJP for a single operation as recorded tape ops.
    fn backward_op_graph(&mut self, op: &TapeOp, grads: &mut [Option<BufId>]) -> Result<()> {
        match *op {
            TapeOp::Matmul { a, b, out, .. } => {
                if let Some(g) = grads[out] {
                    let d_a = self.matmul_transpose_b(g, b)?;
                    let a_t = self.transpose(a)?;
                    let d_b = self.matmul(a_t, g)?;
                    self.accumulate_graph(grads, a, d_a)?;
                    self.accumulate_graph(grads, b, d_b)?;
                }
            }

            TapeOp::MatmulTransposeB { a, b, out, .. } => {
                if let Some(g) = grads[out] {
                    let d_a = self.matmul(g, b)?;
                    let g_t = self.transpose(g)?;
                    let d_b = self.matmul(g_t, a)?;
                    self.accumulate_graph(grads, a, d_a)?;
                    self.accumulate_graph(grads, b, d_b)?;
                }
            }

            TapeOp::Transpose { input, out, .. } => {
                if let Some(g) = grads[out] {
                    let d_input = self.transpose(g)?;
                    self.accumulate_graph(grads, input, d_input)?;
                }
            }

            TapeOp::Add { a, b, out } => {
                if let Some(g) = grads[out] {
                    self.accumulate_graph(grads, a, g)?;
                    self.accumulate_graph(grads, b, g)?;
                }
            }

            TapeOp::Sub { a, b, out } => {
                if let Some(g) = grads[out] {
                    let neg = self.neg(g)?;
                    self.accumulate_graph(grads, a, g)?;
                    self.accumulate_graph(grads, b, neg)?;
                }
            }

            TapeOp::Mul { a, b, out } => {
                if let Some(g) = grads[out] {
                    let d_a = self.mul(g, b)?;
                    let d_b = self.mul(g, a)?;
                    self.accumulate_graph(grads, a, d_a)?;
                    self.accumulate_graph(grads, b, d_b)?;
                }
            }

            TapeOp::Scale { input, scalar, out } => {
                if let Some(g) = grads[out] {
                    let d_input = self.scale(g, scalar)?;
                    self.accumulate_graph(grads, input, d_input)?;
                }
            }

            TapeOp::Negate { input, out } => {
                if let Some(g) = grads[out] {
                    let d_input = self.neg(g)?;
                    self.accumulate_graph(grads, input, d_input)?;
                }
            }

            TapeOp::Sigmoid { input, out } => {
                if let Some(g) = grads[out] {
                    // σ' = σ - σ²; `out` is itself a node, so this stays differentiable.
                    let sq = self.mul(out, out)?;
                    let slope = self.sub(out, sq)?;
                    let d_input = self.mul(g, slope)?;
                    self.accumulate_graph(grads, input, d_input)?;
                }
            }

            TapeOp::Sum { input, out } => {
                if let Some(g) = grads[out] {
                    let shape = self.bufs[input].shape.clone();
                    let d_input = self.broadcast(g, &shape)?;
                    self.accumulate_graph(grads, input, d_input)?;
                }
            }

            TapeOp::Broadcast { input, out } => {
                if let Some(g) = grads[out] {
                    let total = self.sum(g)?;
                    let shape = self.bufs[input].shape.clone();
                    let d_input = if shape.is_empty() { total } else { self.reshape(total, &shape)? };
                    self.accumulate_graph(grads, input, d_input)?;
                }
            }

            TapeOp::Reshape { input, out } => {
                if let Some(g) = grads[out] {
                    let shape = self.bufs[input].shape.clone();
                    let d_input = self.reshape(g, &shape)?;
                    self.accumulate_graph(grads, input, d_input)?;
                }
            }

            TapeOp::Slice { input, out, offset, .. } => {
                if let Some(g) = grads[out] {
                    let shape = self.bufs[input].shape.clone();
                    let d_input = self.pad(g, offset, &shape)?;
                    self.accumulate_graph(grads, input, d_input)?;
                }
            }

            TapeOp::Pad { input, out, offset, .. } => {
                if let Some(g) = grads[out] {
                    let shape = self.bufs[input].shape.clone();
                    let d_input = self.slice(g, offset, &shape)?;
                    self.accumulate_graph(grads, input, d_input)?;
                }
            }
        }
        Ok(())
    }
}

/// Accumulate a numeric gradient into a buffer's slot.
fn accumulate(grads: &mut [Option<Vec<f32>>], id: BufId, grad: Vec<f32>) {
    match &mut grads[id] {
        Some(existing) => {
            debug_assert_eq!(existing.len(), grad.len());
            for (e, g) in existing.iter_mut().zip(grad.iter()) {
                *e += g;
            }
        }
        None => {
            grads[id] = Some(grad);
        }
    }
}

// ── Thread-local tape access ─────────────────────────────────────────

thread_local! {
    static TAPE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Drop guard that pops the active-tape depth when scope exits, including
/// on panic. Ensures `is_tape_active()` is never left stale.
struct TapeGuard;

impl Drop for TapeGuard {
    fn drop(&mut self) {
        TAPE_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Execute a closure with a fresh tape on `backend`. Every intermediate the
/// closure records is released when it returns.
pub fn with_tape<F, R>(backend: Backend, f: F) -> R
where
    F: FnOnce(&mut Tape) -> R,
{
    TAPE_DEPTH.with(|d| d.set(d.get() + 1));
    let _guard = TapeGuard;
    let mut tape = Tape::new(backend);
    f(&mut tape)
}

/// True only while inside a `with_tape()` closure on this thread.
pub fn is_tape_active() -> bool {
    TAPE_DEPTH.with(|d| d.get() > 0)
}

// ── Tests ────────────────────────────────────────────────────────────
