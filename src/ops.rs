use crate::tensor::Tensor;
use ndarray::{ArrayD, Axis, Ix4, IxDyn, Slice};

// Helper: reduce `grad` to `target_shape` by summing over broadcasted axes.
fn reduce_grad_to_shape(grad: &ArrayD<f32>, target_shape: &[usize]) -> ArrayD<f32> {
    if grad.shape() == target_shape {
        return grad.clone();
    }

    let mut res = grad.clone();
    let grad_ndim = res.ndim();
    let target_ndim = target_shape.len();
    let dim_diff = grad_ndim as isize - target_ndim as isize;
    // Sum over axes that were broadcast, walking from the back so indices stay valid.
    for axis in (0..grad_ndim).rev() {
        let axis_idx = axis as isize;
        let target_dim = if axis_idx - dim_diff >= 0 {
            target_shape[(axis_idx - dim_diff) as usize]
        } else {
            1
        };
        if res.shape()[axis] != target_dim {
            res = res.sum_axis(Axis(axis));
        }
    }

    if res.shape() != target_shape {
        res = res
            .to_shape(IxDyn(target_shape))
            .expect("Final reshape to target shape failed")
            .into_owned();
    }
    res
}

fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

fn softmax_along(x: &ArrayD<f32>, axis: usize) -> ArrayD<f32> {
    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for v in lane.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in lane.iter_mut() {
            *v /= sum;
        }
    }
    out
}

/// A trait for operations that can be performed on tensors.
///
/// Operations assume their inputs were validated by the `Tensor` method that built
/// them; shape violations inside `forward`/`backward` are bugs and panic.
pub trait Operation: Send + Sync {
    /// Performs the forward pass of the operation.
    ///
    /// # Arguments
    ///
    /// * `inputs` - The input tensors.
    /// * `output` - Receives the output array (shape included).
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>);

    /// Performs the backward pass of the operation, returning one gradient per input
    /// shaped like that input.
    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>>;

    /// Short name used in trace logs.
    fn name(&self) -> &'static str;
}

/// Reshape operation: changes tensor shape but keeps elements order
pub struct Reshape {
    pub shape: Vec<usize>,
}

impl Reshape {
    pub fn new(shape: Vec<usize>) -> Self {
        Reshape { shape }
    }
}

impl Operation for Reshape {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].data();
        *output = a
            .to_shape(IxDyn(&self.shape))
            .expect("Reshape forward: invalid shape")
            .into_owned();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let in_shape = inputs[0].shape();
        let g = output_grad
            .to_shape(IxDyn(&in_shape))
            .expect("Reshape backward: invalid shape");
        vec![g.into_owned()]
    }

    fn name(&self) -> &'static str {
        "reshape"
    }
}

/// Axis permutation; `axes[i]` is the source axis placed at position `i`.
pub struct Permute {
    pub axes: Vec<usize>,
}

impl Permute {
    pub fn new(axes: Vec<usize>) -> Self {
        Permute { axes }
    }
}

impl Operation for Permute {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].data();
        *output = a
            .view()
            .permuted_axes(self.axes.clone())
            .as_standard_layout()
            .into_owned();
    }

    fn backward(&self, _inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let inv = inverse_permutation(&self.axes);
        vec![output_grad
            .view()
            .permuted_axes(inv)
            .as_standard_layout()
            .into_owned()]
    }

    fn name(&self) -> &'static str {
        "permute"
    }
}

/// Sum operation: sums all elements to a scalar
pub struct Sum;

impl Operation for Sum {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let s = inputs[0].lock().data.sum();
        *output = ArrayD::from_elem(IxDyn(&[]), s);
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].shape();
        let val = *output_grad
            .iter()
            .next()
            .expect("Expected scalar output_grad");
        vec![ArrayD::from_elem(IxDyn(&a_shape), val)]
    }

    fn name(&self) -> &'static str {
        "sum"
    }
}

/// Mean operation: computes mean over all elements to a scalar
pub struct Mean;

impl Operation for Mean {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let lock = inputs[0].lock();
        let mean = lock.data.sum() / (lock.data.len() as f32);
        *output = ArrayD::from_elem(IxDyn(&[]), mean);
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].shape();
        let count: usize = a_shape.iter().product();
        let val = *output_grad
            .iter()
            .next()
            .expect("Expected scalar output_grad");
        vec![ArrayD::from_elem(IxDyn(&a_shape), val / count as f32)]
    }

    fn name(&self) -> &'static str {
        "mean"
    }
}

/// The addition operation.
pub struct Add;

impl Operation for Add {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].data();
        let b = inputs[1].data();
        *output = &a + &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let grad_a = reduce_grad_to_shape(output_grad, &inputs[0].shape());
        let grad_b = reduce_grad_to_shape(output_grad, &inputs[1].shape());
        vec![grad_a, grad_b]
    }

    fn name(&self) -> &'static str {
        "add"
    }
}

/// The multiplication operation.
pub struct Mul;

impl Operation for Mul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].data();
        let b = inputs[1].data();
        *output = &a * &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0].data();
        let b = inputs[1].data();
        let grad_a = &b * output_grad;
        let grad_b = &a * output_grad;
        vec![
            reduce_grad_to_shape(&grad_a, a.shape()),
            reduce_grad_to_shape(&grad_b, b.shape()),
        ]
    }

    fn name(&self) -> &'static str {
        "mul"
    }
}

/// The ReLU activation function.
pub struct ReLU;

impl Operation for ReLU {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = inputs[0].lock().data.mapv(|x| x.max(0.0));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0].data();
        vec![output_grad * &a.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 })]
    }

    fn name(&self) -> &'static str {
        "relu"
    }
}

/// The sigmoid activation function.
pub struct Sigmoid;

impl Operation for Sigmoid {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = inputs[0].lock().data.mapv(|x| 1.0 / (1.0 + (-x).exp()));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let s = inputs[0].data().mapv(|x| 1.0 / (1.0 + (-x).exp()));
        vec![output_grad * &s.mapv(|y| y * (1.0 - y))]
    }

    fn name(&self) -> &'static str {
        "sigmoid"
    }
}

/// The tanh activation function.
pub struct Tanh;

impl Operation for Tanh {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = inputs[0].lock().data.mapv(|x| x.tanh());
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let t = inputs[0].data().mapv(|x| x.tanh());
        vec![output_grad * &t.mapv(|y| 1.0 - y * y)]
    }

    fn name(&self) -> &'static str {
        "tanh"
    }
}

const GELU_C: f32 = 0.797_884_6; // sqrt(2 / pi)
const GELU_K: f32 = 0.044_715;

/// GELU, tanh approximation.
pub struct Gelu;

impl Operation for Gelu {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = inputs[0]
            .lock()
            .data
            .mapv(|x| 0.5 * x * (1.0 + (GELU_C * (x + GELU_K * x * x * x)).tanh()));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let d = inputs[0].data().mapv(|x| {
            let t = (GELU_C * (x + GELU_K * x * x * x)).tanh();
            0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * GELU_C * (1.0 + 3.0 * GELU_K * x * x)
        });
        vec![output_grad * &d]
    }

    fn name(&self) -> &'static str {
        "gelu"
    }
}

/// Softmax operation (numerically stable), forward and backward on axis
pub struct Softmax {
    pub axis: usize,
}

impl Softmax {
    pub fn new(axis: usize) -> Self {
        Softmax { axis }
    }

    fn axis_for(&self, ndim: usize) -> usize {
        self.axis.min(ndim.saturating_sub(1))
    }
}

impl Operation for Softmax {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let x = inputs[0].data();
        *output = softmax_along(&x, self.axis_for(x.ndim()));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let x = inputs[0].data();
        let axis = Axis(self.axis_for(x.ndim()));
        let y = softmax_along(&x, axis.index());
        // grad = y * (grad_out - sum(grad_out * y))
        let mut grad_in = output_grad.clone();
        for (mut g_lane, y_lane) in grad_in.lanes_mut(axis).into_iter().zip(y.lanes(axis)) {
            let s: f32 = g_lane.iter().zip(y_lane.iter()).map(|(g, y)| g * y).sum();
            for (gi, &yy) in g_lane.iter_mut().zip(y_lane.iter()) {
                *gi = yy * (*gi - s);
            }
        }
        vec![grad_in]
    }

    fn name(&self) -> &'static str {
        "softmax"
    }
}

/// The stack operation.
pub struct Stack(pub usize);

impl Operation for Stack {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let arrays: Vec<ArrayD<f32>> = inputs.iter().map(|t| t.data()).collect();
        *output = ndarray::stack(
            Axis(self.0),
            &arrays.iter().map(|x| x.view()).collect::<Vec<_>>(),
        )
        .expect("Stack forward: inputs must share a shape");
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        (0..inputs.len())
            .map(|i| output_grad.index_axis(Axis(self.0), i).to_owned())
            .collect()
    }

    fn name(&self) -> &'static str {
        "stack"
    }
}

/// Contiguous slice along one axis of an N-d tensor.
pub struct SliceAxis {
    pub axis: usize,
    pub start: usize,
    pub len: usize,
}

impl SliceAxis {
    pub fn new(axis: usize, start: usize, len: usize) -> Self {
        SliceAxis { axis, start, len }
    }

    fn range(&self) -> Slice {
        Slice::from(self.start..self.start + self.len)
    }
}

impl Operation for SliceAxis {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].data();
        *output = a.slice_axis(Axis(self.axis), self.range()).to_owned();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let mut grad = ArrayD::<f32>::zeros(IxDyn(&inputs[0].shape()));
        grad.slice_axis_mut(Axis(self.axis), self.range())
            .assign(output_grad);
        vec![grad]
    }

    fn name(&self) -> &'static str {
        "slice_axis"
    }
}

/// Matrix product over the last two axes, batched over all leading axes.
pub struct BatchMatMul;

impl BatchMatMul {
    fn as_batches(a: &ArrayD<f32>) -> ndarray::Array3<f32> {
        let shape = a.shape();
        let nd = shape.len();
        let batch: usize = shape[..nd - 2].iter().product();
        a.to_shape((batch, shape[nd - 2], shape[nd - 1]))
            .expect("BatchMatMul: batch reshape failed")
            .into_owned()
    }

    fn product<F>(batches: usize, rows: usize, cols: usize, f: F) -> ndarray::Array3<f32>
    where
        F: Fn(usize) -> ndarray::Array2<f32>,
    {
        let mut out = ndarray::Array3::<f32>::zeros((batches, rows, cols));
        for (i, mut slot) in out.outer_iter_mut().enumerate() {
            slot.assign(&f(i));
        }
        out
    }
}

impl Operation for BatchMatMul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].data();
        let b = inputs[1].data();
        let mut out_shape = a.shape().to_vec();
        let nd = out_shape.len();
        out_shape[nd - 1] = b.shape()[nd - 1];

        let a3 = Self::as_batches(&a);
        let b3 = Self::as_batches(&b);
        let (batches, m, _) = a3.dim();
        let n = b3.dim().2;
        let out = Self::product(batches, m, n, |i| {
            a3.index_axis(Axis(0), i).dot(&b3.index_axis(Axis(0), i))
        });
        *output = out
            .into_dyn()
            .to_shape(IxDyn(&out_shape))
            .expect("BatchMatMul forward: output reshape failed")
            .into_owned();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0].data();
        let b = inputs[1].data();
        let a3 = Self::as_batches(&a);
        let b3 = Self::as_batches(&b);
        let g3 = Self::as_batches(output_grad);
        let (batches, m, k) = a3.dim();
        let n = b3.dim().2;

        // dA = dC . B^T, dB = A^T . dC
        let grad_a = Self::product(batches, m, k, |i| {
            g3.index_axis(Axis(0), i).dot(&b3.index_axis(Axis(0), i).t())
        });
        let grad_b = Self::product(batches, k, n, |i| {
            a3.index_axis(Axis(0), i).t().dot(&g3.index_axis(Axis(0), i))
        });
        vec![
            grad_a
                .into_dyn()
                .to_shape(IxDyn(a.shape()))
                .expect("BatchMatMul backward: reshape failed")
                .into_owned(),
            grad_b
                .into_dyn()
                .to_shape(IxDyn(b.shape()))
                .expect("BatchMatMul backward: reshape failed")
                .into_owned(),
        ]
    }

    fn name(&self) -> &'static str {
        "batch_matmul"
    }
}

/// Grouped 2-D convolution (NCHW), stride 1, zero padding.
///
/// Inputs: `[input (N, C_in, H, W), weight (C_out, C_in / groups, KH, KW)]`. Output channel
/// `oc` reads only input group `oc / (C_out / groups)`.
pub struct GroupedConv2D {
    pub groups: usize,
    /// Leading (top, left) padding.
    pub padding: (usize, usize),
    /// Output (height, width).
    pub out_size: (usize, usize),
}

impl GroupedConv2D {
    pub fn new(groups: usize, padding: (usize, usize), out_size: (usize, usize)) -> Self {
        GroupedConv2D {
            groups,
            padding,
            out_size,
        }
    }

    /// Calls `f(out_index, input_index, weight_index)` for every in-bounds tap.
    fn for_each_tap<F>(
        &self,
        input_dim: (usize, usize, usize, usize),
        weight_dim: (usize, usize, usize, usize),
        mut f: F,
    ) where
        F: FnMut([usize; 4], [usize; 4], [usize; 4]),
    {
        let (n, _, hin, win) = input_dim;
        let (cout, cin_g, kh, kw) = weight_dim;
        let cout_g = cout / self.groups;
        let (pad_h, pad_w) = (self.padding.0 as isize, self.padding.1 as isize);
        let (hout, wout) = self.out_size;

        for b in 0..n {
            for oc in 0..cout {
                let group = oc / cout_g;
                for oh in 0..hout {
                    for ow in 0..wout {
                        for icl in 0..cin_g {
                            let ic = group * cin_g + icl;
                            for ki in 0..kh {
                                let ih = oh as isize + ki as isize - pad_h;
                                if ih < 0 || ih >= hin as isize {
                                    continue;
                                }
                                for kj in 0..kw {
                                    let iw = ow as isize + kj as isize - pad_w;
                                    if iw < 0 || iw >= win as isize {
                                        continue;
                                    }
                                    f(
                                        [b, oc, oh, ow],
                                        [b, ic, ih as usize, iw as usize],
                                        [oc, icl, ki, kj],
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Operation for GroupedConv2D {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let input = inputs[0].data();
        let weight = inputs[1].data();
        let x = input
            .view()
            .into_dimensionality::<Ix4>()
            .expect("GroupedConv2D: input must be 4-D");
        let w = weight
            .view()
            .into_dimensionality::<Ix4>()
            .expect("GroupedConv2D: weight must be 4-D");
        let n = x.dim().0;
        let cout = w.dim().0;
        let (hout, wout) = self.out_size;

        let mut out = ndarray::Array4::<f32>::zeros((n, cout, hout, wout));
        self.for_each_tap(x.dim(), w.dim(), |o, i, k| {
            out[o] += x[i] * w[k];
        });
        *output = out.into_dyn();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let input = inputs[0].data();
        let weight = inputs[1].data();
        let x = input
            .view()
            .into_dimensionality::<Ix4>()
            .expect("GroupedConv2D: input must be 4-D");
        let w = weight
            .view()
            .into_dimensionality::<Ix4>()
            .expect("GroupedConv2D: weight must be 4-D");
        let g = output_grad
            .view()
            .into_dimensionality::<Ix4>()
            .expect("GroupedConv2D: output grad must be 4-D");

        let mut grad_in = ndarray::Array4::<f32>::zeros(x.dim());
        let mut grad_w = ndarray::Array4::<f32>::zeros(w.dim());
        self.for_each_tap(x.dim(), w.dim(), |o, i, k| {
            let gv = g[o];
            grad_in[i] += gv * w[k];
            grad_w[k] += gv * x[i];
        });
        vec![grad_in.into_dyn(), grad_w.into_dyn()]
    }

    fn name(&self) -> &'static str {
        "grouped_conv2d"
    }
}
