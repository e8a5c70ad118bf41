use crate::error::Result;
use crate::nn::activation::Activation;
use crate::nn::module::{join_name, Module};
use crate::nn::projection::{GroupedProjection, SourceSpec};
use crate::tensor::Tensor;
use rand::Rng;

/// One gate: a projection of `[a, xh]` followed by a fixed nonlinearity.
#[derive(Clone)]
pub struct Gate {
    name: &'static str,
    projection: GroupedProjection,
    activation: Activation,
}

impl Gate {
    fn new(
        name: &'static str,
        channels: usize,
        groups: usize,
        kernel_size: usize,
        activation: Activation,
    ) -> Result<Self> {
        let mut projection = GroupedProjection::new(channels, groups)?
            .with_gain(true)
            .with_bias(true);
        projection.add(SourceSpec::new(channels).groups(groups))?;
        projection.add(
            SourceSpec::new(channels * 2)
                .groups(groups)
                .kernel_size(kernel_size),
        )?;
        Ok(Gate {
            name,
            projection,
            activation,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn open(&self, a: &Tensor, xh: &Tensor) -> Result<Tensor> {
        let z = self.projection.forward(&[a.clone(), xh.clone()])?;
        Ok(self.activation.apply(&z))
    }
}

/// Convolutional LSTM update driven by the attention aggregate.
#[derive(Clone)]
pub struct GatedStateUpdate {
    input: Gate,
    forget: Gate,
    candidate: Gate,
    output: Gate,
}

impl GatedStateUpdate {
    pub fn new(channels: usize, groups: usize, kernel_size: usize) -> Result<Self> {
        Ok(GatedStateUpdate {
            input: Gate::new("proj_i", channels, groups, kernel_size, Activation::Sigmoid)?,
            forget: Gate::new("proj_f", channels, groups, kernel_size, Activation::Sigmoid)?,
            candidate: Gate::new("proj_g", channels, groups, kernel_size, Activation::Tanh)?,
            output: Gate::new("proj_o", channels, groups, kernel_size, Activation::Sigmoid)?,
        })
    }

    pub fn gates(&self) -> [&Gate; 4] {
        [&self.input, &self.forget, &self.candidate, &self.output]
    }

    pub fn finalize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        self.input.projection.finalize(rng)?;
        self.forget.projection.finalize(rng)?;
        self.candidate.projection.finalize(rng)?;
        self.output.projection.finalize(rng)
    }

    /// Returns `(hidden', cell')` given the aggregate, joint context and previous cell.
    pub fn forward(&self, a: &Tensor, xh: &Tensor, cell: &Tensor) -> Result<(Tensor, Tensor)> {
        let i = self.input.open(a, xh)?;
        let f = self.forget.open(a, xh)?;
        let g = self.candidate.open(a, xh)?;
        let o = self.output.open(a, xh)?;

        let cell = f.mul(cell).add(&i.mul(&g));
        let hidden = o.mul(&cell.tanh());
        Ok((hidden, cell))
    }
}

impl Module for GatedStateUpdate {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.gates()
            .into_iter()
            .flat_map(|gate| {
                gate.projection
                    .named_parameters(&join_name(prefix, gate.name))
            })
            .collect()
    }
}
