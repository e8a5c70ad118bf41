//! Recurrent grouped-attention core.
//!
//! Each step combines the stored hidden state with the new inputs, attends within channel
//! groups over the joint context and advances a convolutional LSTM state. The state lives
//! in the module instance and is replaced wholesale on every step until [`Recurrent::reset`].

use crate::config::RvtConfig;
use crate::error::{Result, RvtError};
use crate::nn::attention::GroupedAttention;
use crate::nn::dropout::{check_probability, StructuralDropout};
use crate::nn::gates::GatedStateUpdate;
use crate::nn::module::{join_name, Module};
use crate::nn::projection::{GroupedProjection, SourceSpec};
use crate::tensor::Tensor;
use rand::{Rng, RngCore};

/// Hidden and cell feature maps carried between steps.
#[derive(Clone, Debug)]
pub struct RecurrentState {
    hidden: Tensor,
    cell: Tensor,
}

impl RecurrentState {
    pub fn zeros(n: usize, channels: usize, h: usize, w: usize) -> Self {
        RecurrentState {
            hidden: Tensor::zeros(&[n, channels, h, w], false),
            cell: Tensor::zeros(&[n, channels, h, w], false),
        }
    }

    pub fn hidden(&self) -> &Tensor {
        &self.hidden
    }

    pub fn cell(&self) -> &Tensor {
        &self.cell
    }

    /// Batch size and spatial extent `(N, H, W)`.
    pub fn dims(&self) -> (usize, usize, usize) {
        let s = self.hidden.shape();
        (s[0], s[2], s[3])
    }

    /// Same values with the autograd history cut.
    pub fn detached(&self) -> Self {
        RecurrentState {
            hidden: self.hidden.detach(),
            cell: self.cell.detach(),
        }
    }
}

/// A module with temporal state advanced one step per `forward` call.
pub trait Recurrent: Module {
    fn out_channels(&self) -> usize;

    /// Spatial downsampling factor between inputs and outputs.
    fn scale(&self) -> usize;

    /// Registers an upstream input with `channels` channels.
    fn add_input(&mut self, channels: usize) -> Result<()>;

    /// Advances the state by one step and returns the new hidden feature map.
    ///
    /// `inputs` must follow `add_input` registration order. `dropout` must lie in `[0, 1)`.
    fn forward(
        &mut self,
        inputs: &[Tensor],
        dropout: f32,
        rng: &mut dyn RngCore,
    ) -> Result<Tensor>;

    /// Discards the recurrent state; parameters are untouched.
    fn reset(&mut self);
}

/// Recurrent vision transformer cell.
///
/// Not `Clone`: a copy would alias both the parameters and the stored state. Use
/// [`RvT::share_parameters`] for a second instance over the same weights.
pub struct RvT {
    config: RvtConfig,
    proj_x: GroupedProjection,
    drop: StructuralDropout,
    attention: GroupedAttention,
    update: GatedStateUpdate,
    state: Option<RecurrentState>,
    training: bool,
    finalized: bool,
}

impl RvT {
    pub fn new(config: RvtConfig) -> Result<Self> {
        config.validate()?;
        let RvtConfig {
            channels,
            kernel_size,
            groups,
        } = config;

        let mut proj_x = GroupedProjection::new(channels, groups)?;
        if groups > 1 {
            proj_x.add_intergroup()?;
        }
        Ok(RvT {
            config,
            proj_x,
            // xh is (N, G, 2, C/G, H, W): one draw per (N, G, C/G)
            drop: StructuralDropout::new(&[2, 4, 5]),
            attention: GroupedAttention::new(channels, groups, kernel_size)?,
            update: GatedStateUpdate::new(channels, groups, kernel_size)?,
            state: None,
            training: true,
            finalized: false,
        })
    }

    pub fn config(&self) -> &RvtConfig {
        &self.config
    }

    /// Allocates every parameter in registration order and closes input registration.
    pub fn finalize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        if self.finalized {
            return Err(RvtError::config("module already finalized"));
        }
        if self.input_channels().is_empty() {
            return Err(RvtError::config(
                "no inputs registered; call add_input before finalize",
            ));
        }
        self.proj_x.finalize(rng)?;
        self.attention.finalize(rng)?;
        self.update.finalize(rng)?;
        self.finalized = true;
        log::debug!(
            "RvT finalized: channels={} kernel_size={} groups={} inputs={:?}",
            self.config.channels,
            self.config.kernel_size,
            self.config.groups,
            self.input_channels()
        );
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Channel counts of the registered external inputs.
    pub fn input_channels(&self) -> Vec<usize> {
        self.proj_x
            .sources()
            .into_iter()
            .filter(|s| !s.is_intergroup())
            .map(|s| s.in_channels)
            .collect()
    }

    /// Evaluation mode (`false`) turns dropout into the identity.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn state(&self) -> Option<&RecurrentState> {
        self.state.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    /// Cuts the autograd history of the stored state, keeping its values.
    pub fn detach_state(&mut self) {
        self.state = self.state.as_ref().map(RecurrentState::detached);
    }

    /// A new instance reading and writing the same parameter storage, with its own state.
    ///
    /// Parameter tensors are `Arc` handles, so updates through either instance are seen by
    /// both. The recurrent state starts Unset.
    pub fn share_parameters(&self) -> RvT {
        RvT {
            config: self.config,
            proj_x: self.proj_x.clone(),
            drop: self.drop.clone(),
            attention: self.attention.clone(),
            update: self.update.clone(),
            state: None,
            training: self.training,
            finalized: self.finalized,
        }
    }

    /// Returns `(N, H, W)` shared by all inputs.
    fn validate_inputs(&self, inputs: &[Tensor]) -> Result<(usize, usize, usize)> {
        let expected = self.input_channels();
        if inputs.len() != expected.len() {
            return Err(RvtError::config(format!(
                "expected {} inputs, got {}",
                expected.len(),
                inputs.len()
            )));
        }

        let mut dims = None;
        for (i, (input, &channels)) in inputs.iter().zip(&expected).enumerate() {
            let shape = input.shape();
            if shape.len() != 4 {
                return Err(RvtError::invalid(format!(
                    "input {} must be (N, C, H, W), got {:?}",
                    i, shape
                )));
            }
            if shape[1] != channels {
                return Err(RvtError::config(format!(
                    "input {} has {} channels, registered with {}",
                    i, shape[1], channels
                )));
            }
            let this = (shape[0], shape[2], shape[3]);
            match dims {
                None => dims = Some(this),
                Some((n, h, w)) if (n, h, w) != this => {
                    return Err(RvtError::shape(
                        format!("input {}", i),
                        &[n, channels, h, w],
                        &shape,
                    ));
                }
                Some(_) => {}
            }
        }
        dims.ok_or_else(|| RvtError::config("forward called without inputs"))
    }

    /// One step from `state`; returns `(hidden', cell')`.
    fn step(
        &self,
        state: &RecurrentState,
        inputs: &[Tensor],
        dropout: f32,
        rng: &mut dyn RngCore,
        (n, h, w): (usize, usize, usize),
    ) -> Result<(Tensor, Tensor)> {
        let (c, g) = (self.config.channels, self.config.groups);
        let cg = self.config.group_channels();

        let x = if g > 1 {
            let mut sources = Vec::with_capacity(inputs.len() + 1);
            sources.push(state.hidden.clone());
            sources.extend_from_slice(inputs);
            self.proj_x.forward(&sources)?
        } else {
            self.proj_x.forward(inputs)?
        };

        let grouped = [
            x.reshape(&[n, g, cg, h, w])?,
            state.hidden.reshape(&[n, g, cg, h, w])?,
        ];
        let xh = Tensor::stack(&grouped, 2)?;
        let xh = self
            .drop
            .forward(&xh, dropout, self.training, rng)?
            .reshape(&[n, 2 * c, h, w])?;

        let a = self.attention.forward(&xh)?;
        self.update.forward(&a, &xh, &state.cell)
    }
}

impl Recurrent for RvT {
    fn out_channels(&self) -> usize {
        self.config.channels
    }

    fn scale(&self) -> usize {
        1
    }

    fn add_input(&mut self, channels: usize) -> Result<()> {
        if self.finalized {
            return Err(RvtError::config(
                "add_input called after the module was finalized",
            ));
        }
        self.proj_x.add(SourceSpec::new(channels))
    }

    fn forward(
        &mut self,
        inputs: &[Tensor],
        dropout: f32,
        rng: &mut dyn RngCore,
    ) -> Result<Tensor> {
        if !self.finalized {
            return Err(RvtError::config("forward called before finalize"));
        }
        check_probability(dropout)?;
        let (n, h, w) = self.validate_inputs(inputs)?;
        let c = self.config.channels;

        // The stored state is only replaced once the step succeeds.
        let state = match &self.state {
            Some(state) if state.dims() != (n, h, w) => {
                let (sn, sh, sw) = state.dims();
                return Err(RvtError::shape(
                    "input vs recurrent state",
                    &[sn, c, sh, sw],
                    &[n, c, h, w],
                ));
            }
            Some(state) => state.clone(),
            None => {
                log::debug!("initialising recurrent state ({}, {}, {}, {})", n, c, h, w);
                RecurrentState::zeros(n, c, h, w)
            }
        };

        let (hidden, cell) = self.step(&state, inputs, dropout, rng, (n, h, w))?;
        self.state = Some(RecurrentState {
            hidden: hidden.clone(),
            cell,
        });
        Ok(hidden)
    }

    fn reset(&mut self) {
        if self.state.take().is_some() {
            log::debug!("recurrent state reset");
        }
    }
}

impl Module for RvT {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut params = self.proj_x.named_parameters(&join_name(prefix, "proj_x"));
        params.extend(self.attention.named_parameters(prefix));
        params.extend(self.update.named_parameters(prefix));
        params
    }
}
