use crate::error::{Result, RvtError};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;

/// Checks that `p` is a usable drop probability.
pub fn check_probability(p: f32) -> Result<()> {
    if (0.0..1.0).contains(&p) {
        Ok(())
    } else {
        Err(RvtError::invalid(format!(
            "dropout probability must lie in [0, 1), got {}",
            p
        )))
    }
}

/// Inverted dropout whose keep-mask is drawn once and broadcast over `shared_axes`.
///
/// Every axis not listed gets an independent draw per index; listed axes see the same mask
/// value at every position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructuralDropout {
    shared_axes: Vec<usize>,
}

impl StructuralDropout {
    pub fn new(shared_axes: &[usize]) -> Self {
        let mut shared_axes = shared_axes.to_vec();
        shared_axes.sort_unstable();
        shared_axes.dedup();
        StructuralDropout { shared_axes }
    }

    pub fn shared_axes(&self) -> &[usize] {
        &self.shared_axes
    }

    /// Applies the mask. With `p == 0` or outside training the input is returned unchanged
    /// and `rng` is not touched.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        p: f32,
        training: bool,
        rng: &mut R,
    ) -> Result<Tensor> {
        check_probability(p)?;
        if p == 0.0 || !training {
            return Ok(x.clone());
        }

        let shape = x.shape();
        if let Some(&axis) = self.shared_axes.iter().find(|&&a| a >= shape.len()) {
            return Err(RvtError::invalid(format!(
                "shared axis {} out of range for shape {:?}",
                axis, shape
            )));
        }
        let mask_shape: Vec<usize> = shape
            .iter()
            .enumerate()
            .map(|(axis, &n)| if self.shared_axes.contains(&axis) { 1 } else { n })
            .collect();

        let keep = 1.0 - p;
        let scale = 1.0 / keep;
        let mask = ArrayD::from_shape_fn(IxDyn(&mask_shape), |_| {
            if rng.random::<f32>() < keep {
                scale
            } else {
                0.0
            }
        });
        Ok(x.mul(&Tensor::new(mask, false)))
    }
}
