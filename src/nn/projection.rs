//! Grouped projections: several independently registered feature maps mapped onto one
//! grouped output feature map.
//!
//! Every registered source owns its own kernel. Contributions are summed, then an optional
//! per-channel gain and bias are applied. Sources are registered first and parameters are
//! allocated once by [`GroupedProjection::finalize`]; after that the source list is closed.

use crate::error::{Result, RvtError};
use crate::nn::module::{join_name, Module};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use std::cell::Cell;

/// Spatial padding policy of a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Padding {
    /// Output height and width equal the input's.
    #[default]
    Preserve,
    /// No padding: output extent shrinks by `kernel_size - 1`.
    Shrink,
}

/// Declaration of one input source of a [`GroupedProjection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceSpec {
    pub in_channels: usize,
    pub in_groups: usize,
    pub kernel_size: usize,
    pub padding: Padding,
    intergroup: bool,
}

impl SourceSpec {
    /// Dense pointwise source with preserve padding.
    pub fn new(in_channels: usize) -> Self {
        SourceSpec {
            in_channels,
            in_groups: 1,
            kernel_size: 1,
            padding: Padding::Preserve,
            intergroup: false,
        }
    }

    pub fn groups(mut self, in_groups: usize) -> Self {
        self.in_groups = in_groups;
        self
    }

    pub fn kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Whether this is the cross-group source added by [`GroupedProjection::add_intergroup`].
    pub fn is_intergroup(&self) -> bool {
        self.intergroup
    }
}

#[derive(Clone)]
struct Source {
    spec: SourceSpec,
    weight: Option<Tensor>,
    /// Fixed 0/1 multiplier applied to the weight before every use.
    mask: Option<Tensor>,
    crop_logged: Cell<bool>,
}

impl Source {
    fn new(spec: SourceSpec) -> Self {
        Source {
            spec,
            weight: None,
            mask: None,
            crop_logged: Cell::new(false),
        }
    }

    fn conv_groups(&self) -> usize {
        self.spec.in_groups
    }

    fn weight_shape(&self, out_channels: usize) -> [usize; 4] {
        let k = self.spec.kernel_size;
        [out_channels, self.spec.in_channels / self.conv_groups(), k, k]
    }

    fn fan_in(&self) -> usize {
        let k = self.spec.kernel_size;
        self.spec.in_channels / self.conv_groups() * k * k
    }

    fn project(&self, x: &Tensor) -> Result<Tensor> {
        let weight = self
            .weight
            .as_ref()
            .ok_or_else(|| RvtError::config("projection source used before finalize"))?;
        let mut weight = match &self.mask {
            Some(mask) => weight.mul(mask),
            None => weight.clone(),
        };

        let shape = x.shape();
        let (h, w) = (shape[2], shape[3]);
        let k = self.spec.kernel_size;
        let (padding, out_size) = match self.spec.padding {
            Padding::Preserve => {
                let pad = (k - 1) / 2;
                ((pad, pad), (h, w))
            }
            Padding::Shrink => {
                let (kh, kw) = (k.min(h), k.min(w));
                if kh < k {
                    weight = weight.slice_axis(2, (k - kh) / 2, kh)?;
                }
                if kw < k {
                    weight = weight.slice_axis(3, (k - kw) / 2, kw)?;
                }
                if (kh < k || kw < k) && !self.crop_logged.replace(true) {
                    log::warn!(
                        "kernel {}x{} exceeds input {}x{}; cropping to {}x{}",
                        k,
                        k,
                        h,
                        w,
                        kh,
                        kw
                    );
                }
                ((0, 0), (h - kh + 1, w - kw + 1))
            }
        };
        x.conv2d_grouped(&weight, self.conv_groups(), padding, out_size)
    }
}

/// Learnable map from registered sources to `out_channels` channels in `out_groups` groups.
#[derive(Clone)]
pub struct GroupedProjection {
    out_channels: usize,
    out_groups: usize,
    use_gain: bool,
    use_bias: bool,
    sources: Vec<Source>,
    gain: Option<Tensor>,
    bias: Option<Tensor>,
    finalized: bool,
}

impl GroupedProjection {
    pub fn new(out_channels: usize, out_groups: usize) -> Result<Self> {
        if out_channels == 0 || out_groups == 0 || out_channels % out_groups != 0 {
            return Err(RvtError::config(format!(
                "{} output channels cannot be split into {} groups",
                out_channels, out_groups
            )));
        }
        Ok(GroupedProjection {
            out_channels,
            out_groups,
            use_gain: false,
            use_bias: false,
            sources: Vec::new(),
            gain: None,
            bias: None,
            finalized: false,
        })
    }

    pub fn with_gain(mut self, gain: bool) -> Self {
        self.use_gain = gain;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.use_bias = bias;
        self
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn out_groups(&self) -> usize {
        self.out_groups
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Registered sources, in registration order.
    pub fn sources(&self) -> Vec<SourceSpec> {
        self.sources.iter().map(|s| s.spec).collect()
    }

    /// Registers another input source.
    pub fn add(&mut self, spec: SourceSpec) -> Result<()> {
        if self.finalized {
            return Err(RvtError::config(
                "cannot register a projection source after finalize",
            ));
        }
        if spec.in_channels == 0 || spec.kernel_size == 0 || spec.in_groups == 0 {
            return Err(RvtError::config(format!(
                "invalid source {:?}: channels, groups and kernel size must be positive",
                spec
            )));
        }
        if spec.in_channels % spec.in_groups != 0 || self.out_channels % spec.in_groups != 0 {
            return Err(RvtError::config(format!(
                "source with {} channels in {} groups does not fit {} output channels",
                spec.in_channels, spec.in_groups, self.out_channels
            )));
        }
        self.sources.push(Source::new(spec));
        Ok(())
    }

    /// Registers a pointwise source of `out_channels` channels whose kernel never maps a
    /// group onto itself.
    pub fn add_intergroup(&mut self) -> Result<()> {
        if self.out_groups < 2 {
            return Err(RvtError::config(
                "intergroup source requires at least two output groups",
            ));
        }
        let mut spec = SourceSpec::new(self.out_channels);
        spec.intergroup = true;
        self.add(spec)
    }

    /// Allocates kernels, gain and bias and closes registration.
    pub fn finalize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        if self.finalized {
            return Err(RvtError::config("projection already finalized"));
        }
        if self.sources.is_empty() {
            return Err(RvtError::config("projection has no sources"));
        }

        let fan_in: usize = self.sources.iter().map(Source::fan_in).sum();
        let bound = 1.0 / (fan_in as f32).sqrt();
        let out_channels = self.out_channels;
        let group_channels = self.out_channels / self.out_groups;

        for source in &mut self.sources {
            let shape = source.weight_shape(out_channels);
            let mut values =
                ArrayD::from_shape_fn(IxDyn(&shape), |_| rng.random_range(-bound..=bound));
            if source.spec.intergroup {
                let mask = ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
                    if idx[0] / group_channels == idx[1] / group_channels {
                        0.0
                    } else {
                        1.0
                    }
                });
                values *= &mask;
                source.mask = Some(Tensor::new(mask, false));
            }
            source.weight = Some(Tensor::new(values, true));
        }
        if self.use_gain {
            self.gain = Some(Tensor::new(ArrayD::ones(IxDyn(&[out_channels])), true));
        }
        if self.use_bias {
            self.bias = Some(Tensor::zeros(&[out_channels], true));
        }
        self.finalized = true;
        log::debug!(
            "projection finalized: {} sources -> {} channels / {} groups, fan_in {}",
            self.sources.len(),
            self.out_channels,
            self.out_groups,
            fan_in
        );
        Ok(())
    }

    /// Projects `inputs`, one per registered source and in registration order.
    pub fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        if !self.finalized {
            return Err(RvtError::config("projection used before finalize"));
        }
        if inputs.len() != self.sources.len() {
            return Err(RvtError::config(format!(
                "expected {} inputs, got {}",
                self.sources.len(),
                inputs.len()
            )));
        }

        let mut reference: Option<Vec<usize>> = None;
        for (i, (input, source)) in inputs.iter().zip(&self.sources).enumerate() {
            let shape = input.shape();
            if shape.len() != 4 {
                return Err(RvtError::invalid(format!(
                    "input {} must be (N, C, H, W), got {:?}",
                    i, shape
                )));
            }
            if shape[1] != source.spec.in_channels {
                return Err(RvtError::config(format!(
                    "input {} has {} channels, source was registered with {}",
                    i, shape[1], source.spec.in_channels
                )));
            }
            match &reference {
                Some(first) => {
                    if (first[0], first[2], first[3]) != (shape[0], shape[2], shape[3]) {
                        return Err(RvtError::shape(
                            format!("projection input {}", i),
                            &[first[0], shape[1], first[2], first[3]],
                            &shape,
                        ));
                    }
                }
                None => reference = Some(shape),
            }
        }

        let mut out: Option<Tensor> = None;
        for (input, source) in inputs.iter().zip(&self.sources) {
            let y = source.project(input)?;
            out = Some(match out {
                None => y,
                Some(acc) => {
                    let (a, b) = (acc.shape(), y.shape());
                    if a != b {
                        return Err(RvtError::shape("projection contributions", &a, &b));
                    }
                    acc.add(&y)
                }
            });
        }
        let mut out = out.ok_or_else(|| RvtError::config("projection has no sources"))?;

        let channel_shape = [1, self.out_channels, 1, 1];
        if let Some(gain) = &self.gain {
            out = out.mul(&gain.reshape(&channel_shape)?);
        }
        if let Some(bias) = &self.bias {
            out = out.add(&bias.reshape(&channel_shape)?);
        }
        Ok(out)
    }
}

impl Module for GroupedProjection {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut params = Vec::new();
        for (i, source) in self.sources.iter().enumerate() {
            if let Some(w) = &source.weight {
                params.push((join_name(prefix, &format!("sources.{}.weight", i)), w.clone()));
            }
        }
        if let Some(g) = &self.gain {
            params.push((join_name(prefix, "gain"), g.clone()));
        }
        if let Some(b) = &self.bias {
            params.push((join_name(prefix, "bias"), b.clone()));
        }
        params
    }
}
