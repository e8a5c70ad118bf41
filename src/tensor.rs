use crate::error::{Result, RvtError};
use crate::ops::{
    Add, BatchMatMul, Gelu, GroupedConv2D, Mean, Mul, Operation, Permute, ReLU, Reshape, Sigmoid,
    SliceAxis, Softmax, Stack, Sum, Tanh,
};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// `TensorData` contains the actual data of a tensor, along with metadata for automatic differentiation.
pub struct TensorData {
    /// The tensor's data, stored as a dynamically-dimensioned array.
    pub data: ArrayD<f32>,
    /// The gradient of the tensor, if it has one.
    pub grad: Option<ArrayD<f32>>,
    /// The operation that created this tensor, if any.
    pub creator: Option<Arc<dyn Operation>>,
    /// The input tensors that were used to create this tensor.
    pub inputs: Vec<Tensor>,
    /// Whether this tensor requires a gradient.
    pub requires_grad: bool,
}

/// A multi-dimensional array (tensor) that supports automatic differentiation.
///
/// Tensors are cheap to clone: clones share the same storage, so a parameter handed to
/// several modules is one parameter. Tensors produced by operations on inputs with
/// `requires_grad = true` record their creator and take part in `backward()`.
#[derive(Clone)]
pub struct Tensor(Arc<Mutex<TensorData>>);

impl Tensor {
    /// Creates a new leaf tensor.
    ///
    /// # Arguments
    ///
    /// * `data` - The tensor's data.
    /// * `requires_grad` - Whether this tensor should have a gradient.
    pub fn new(data: ArrayD<f32>, requires_grad: bool) -> Self {
        Tensor(Arc::new(Mutex::new(TensorData {
            data,
            grad: None,
            creator: None,
            inputs: vec![],
            requires_grad,
        })))
    }

    /// Creates a zero-filled leaf tensor.
    pub fn zeros(shape: &[usize], requires_grad: bool) -> Self {
        Tensor::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
    }

    /// Creates a leaf tensor from row-major values.
    pub fn from_vec(shape: &[usize], values: Vec<f32>, requires_grad: bool) -> Result<Self> {
        let len = values.len();
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|_| RvtError::shape("tensor construction", shape, &[len]))?;
        Ok(Tensor::new(data, requires_grad))
    }

    /// Applies an operation to a set of input tensors.
    ///
    /// This is the primary way that computation graphs are constructed. The operation
    /// writes the full output array, including its shape.
    pub fn apply(op: Arc<dyn Operation>, inputs: &[Tensor]) -> Tensor {
        let requires_grad = inputs.iter().any(|t| t.requires_grad());
        let mut data = ArrayD::zeros(IxDyn(&[0]));
        op.forward(inputs, &mut data);
        log::trace!("{} -> {:?}", op.name(), data.shape());

        let (creator, inputs) = if requires_grad {
            (Some(op), inputs.to_vec())
        } else {
            (None, vec![])
        };
        Tensor(Arc::new(Mutex::new(TensorData {
            data,
            grad: None,
            creator,
            inputs,
            requires_grad,
        })))
    }

    /// Adds two tensors (broadcasting).
    pub fn add(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Add), &[self.clone(), other.clone()])
    }

    /// Multiplies two tensors element-wise (broadcasting).
    pub fn mul(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Mul), &[self.clone(), other.clone()])
    }

    /// Applies the ReLU activation function.
    pub fn relu(&self) -> Tensor {
        Tensor::apply(Arc::new(ReLU), &[self.clone()])
    }

    /// Applies the sigmoid activation function.
    pub fn sigmoid(&self) -> Tensor {
        Tensor::apply(Arc::new(Sigmoid), &[self.clone()])
    }

    /// Applies the tanh activation function.
    pub fn tanh(&self) -> Tensor {
        Tensor::apply(Arc::new(Tanh), &[self.clone()])
    }

    /// GELU activation (tanh approximation).
    pub fn gelu(&self) -> Tensor {
        Tensor::apply(Arc::new(Gelu), &[self.clone()])
    }

    /// Computes the sum of the tensor's elements.
    pub fn sum(&self) -> Tensor {
        Tensor::apply(Arc::new(Sum), &[self.clone()])
    }

    /// Computes the mean of the tensor's elements.
    pub fn mean(&self) -> Tensor {
        Tensor::apply(Arc::new(Mean), &[self.clone()])
    }

    /// Numerically stable softmax along `axis`.
    pub fn softmax(&self, axis: usize) -> Tensor {
        Tensor::apply(Arc::new(Softmax::new(axis)), &[self.clone()])
    }

    /// Reshapes the tensor, keeping row-major element order.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let current = self.shape();
        let from: usize = current.iter().product();
        let to: usize = shape.iter().product();
        if from != to {
            return Err(RvtError::shape("reshape", shape, &current));
        }
        Ok(Tensor::apply(
            Arc::new(Reshape::new(shape.to_vec())),
            &[self.clone()],
        ))
    }

    /// Reorders axes; `axes[i]` names the source axis placed at position `i`.
    pub fn permute(&self, axes: &[usize]) -> Result<Tensor> {
        let ndim = self.ndim();
        let mut seen = vec![false; ndim];
        for &axis in axes {
            if axis >= ndim || seen[axis] {
                return Err(RvtError::invalid(format!(
                    "permute: {:?} is not a permutation of {} axes",
                    axes, ndim
                )));
            }
            seen[axis] = true;
        }
        if axes.len() != ndim {
            return Err(RvtError::invalid(format!(
                "permute: {:?} is not a permutation of {} axes",
                axes, ndim
            )));
        }
        Ok(Tensor::apply(
            Arc::new(Permute::new(axes.to_vec())),
            &[self.clone()],
        ))
    }

    /// Takes `len` consecutive entries along `axis`, starting at `start`.
    pub fn slice_axis(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        let shape = self.shape();
        if axis >= shape.len() || start + len > shape[axis] || len == 0 {
            return Err(RvtError::invalid(format!(
                "slice_axis: range {}..{} on axis {} out of bounds for shape {:?}",
                start,
                start + len,
                axis,
                shape
            )));
        }
        Ok(Tensor::apply(
            Arc::new(SliceAxis::new(axis, start, len)),
            &[self.clone()],
        ))
    }

    /// Batched matrix product over the last two axes; leading axes must agree.
    pub fn batch_matmul(&self, other: &Tensor) -> Result<Tensor> {
        let a = self.shape();
        let b = other.shape();
        let nd = a.len();
        if nd < 2 || b.len() != nd || a[..nd - 2] != b[..nd - 2] || a[nd - 1] != b[nd - 2] {
            return Err(RvtError::shape("batch_matmul", &a, &b));
        }
        Ok(Tensor::apply(
            Arc::new(BatchMatMul),
            &[self.clone(), other.clone()],
        ))
    }

    /// Grouped 2-D convolution with stride 1 and zero padding.
    ///
    /// `weight` is laid out as `[C_out, C_in / groups, KH, KW]`. `padding` is the leading
    /// (top, left) padding and `out_size` the requested output extent; any trailing
    /// padding needed to reach it is implicit zeros.
    pub fn conv2d_grouped(
        &self,
        weight: &Tensor,
        groups: usize,
        padding: (usize, usize),
        out_size: (usize, usize),
    ) -> Result<Tensor> {
        let x = self.shape();
        let w = weight.shape();
        if x.len() != 4 || w.len() != 4 {
            return Err(RvtError::shape("conv2d_grouped", &w, &x));
        }
        if groups == 0 || x[1] % groups != 0 || w[0] % groups != 0 || w[1] * groups != x[1] {
            return Err(RvtError::config(format!(
                "conv2d_grouped: input channels {} and weight {:?} incompatible with {} groups",
                x[1], w, groups
            )));
        }
        Ok(Tensor::apply(
            Arc::new(GroupedConv2D::new(groups, padding, out_size)),
            &[self.clone(), weight.clone()],
        ))
    }

    /// Stacks equally-shaped tensors along a new axis.
    pub fn stack(tensors: &[Tensor], axis: usize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| RvtError::invalid("stack: no tensors given"))?
            .shape();
        if axis > first.len() {
            return Err(RvtError::invalid(format!(
                "stack: axis {} out of range for rank {}",
                axis,
                first.len()
            )));
        }
        for t in &tensors[1..] {
            let shape = t.shape();
            if shape != first {
                return Err(RvtError::shape("stack", &first, &shape));
            }
        }
        Ok(Tensor::apply(Arc::new(Stack(axis)), tensors))
    }

    /// Locks the tensor's data for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, TensorData> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a copy of the tensor's values.
    pub fn data(&self) -> ArrayD<f32> {
        self.lock().data.clone()
    }

    /// Returns the tensor's shape.
    pub fn shape(&self) -> Vec<usize> {
        self.lock().data.shape().to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.lock().data.ndim()
    }

    /// Returns a copy of the accumulated gradient, if any.
    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.lock().grad.clone()
    }

    /// Sets the gradient of this tensor to zero.
    pub fn zero_grad(&self) {
        let mut lock = self.lock();
        lock.grad = None;
    }

    /// Detaches the tensor from the computation graph.
    pub fn detach(&self) -> Tensor {
        let lock = self.lock();
        Tensor::new(lock.data.clone(), false)
    }

    /// Returns whether this tensor requires gradients.
    pub fn requires_grad(&self) -> bool {
        self.lock().requires_grad
    }

    /// Whether `self` and `other` share storage.
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Performs backpropagation starting from this tensor.
    ///
    /// Nodes are visited in reverse topological order so that a tensor consumed by several
    /// operations has its gradient fully accumulated before it is propagated further.
    pub fn backward(&self) {
        {
            let mut self_lock = self.lock();
            if self_lock.grad.is_none() {
                self_lock.grad = Some(ArrayD::ones(self_lock.data.raw_dim()));
            }
        }

        for node in self.topo_order().iter().rev() {
            let (creator, inputs, output_grad) = {
                let lock = node.lock();
                let (Some(creator), Some(grad)) = (lock.creator.clone(), lock.grad.clone()) else {
                    continue;
                };
                (creator, lock.inputs.clone(), grad)
            };
            let input_grads = creator.backward(&inputs, &output_grad);
            for (input, grad) in inputs.iter().zip(input_grads) {
                let mut input_lock = input.lock();
                if !input_lock.requires_grad {
                    continue;
                }
                match &mut input_lock.grad {
                    Some(acc) => *acc += &grad,
                    None => input_lock.grad = Some(grad),
                }
            }
        }
    }

    /// Builds a topological sort of the computation graph rooted at this tensor.
    fn topo_order(&self) -> Vec<Tensor> {
        let mut visited: HashSet<*const Mutex<TensorData>> = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if !visited.insert(Arc::as_ptr(&node.0)) {
                continue;
            }
            let inputs = node.lock().inputs.clone();
            stack.push((node, true));
            for input in inputs {
                if !visited.contains(&Arc::as_ptr(&input.0)) {
                    stack.push((input, false));
                }
            }
        }
        order
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lock = self.lock();
        f.debug_struct("Tensor")
            .field("shape", &lock.data.shape())
            .field("requires_grad", &lock.requires_grad)
            .finish()
    }
}

// Tensors compare by identity, not by value.
impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.same_storage(other)
    }
}

impl Eq for Tensor {}
