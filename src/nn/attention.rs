use crate::error::{Result, RvtError};
use crate::nn::module::{join_name, Module};
use crate::nn::projection::{GroupedProjection, Padding, SourceSpec};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;

/// Per-group spatial self-attention over a joint context.
///
/// Queries are taken at every location of the frame; keys and values come from a
/// shrink-padded projection, so their token count drops to `(H - k + 1) * (W - k + 1)`
/// (one token when the kernel covers the frame). Scores are scaled by a learned
/// per-group temperature rather than a fixed `1 / sqrt(d)`.
#[derive(Clone)]
pub struct GroupedAttention {
    channels: usize,
    groups: usize,
    tau: Tensor,
    proj_q: GroupedProjection,
    proj_k: GroupedProjection,
    proj_v: GroupedProjection,
}

impl GroupedAttention {
    /// Attention producing `channels` output channels from a context of `2 * channels`.
    pub fn new(channels: usize, groups: usize, kernel_size: usize) -> Result<Self> {
        let context = SourceSpec::new(channels * 2)
            .groups(groups)
            .kernel_size(kernel_size);

        let mut proj_q = GroupedProjection::new(channels, groups)?;
        proj_q.add(context.padding(Padding::Preserve))?;
        let mut proj_k = GroupedProjection::new(channels, groups)?;
        proj_k.add(context.padding(Padding::Shrink))?;
        let mut proj_v = GroupedProjection::new(channels, groups)?;
        proj_v.add(context.padding(Padding::Shrink))?;

        let group_channels = channels / groups;
        let tau = Tensor::new(
            ArrayD::from_elem(IxDyn(&[groups]), (group_channels as f32).powf(-0.5)),
            true,
        );
        Ok(GroupedAttention {
            channels,
            groups,
            tau,
            proj_q,
            proj_k,
            proj_v,
        })
    }

    pub fn finalize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        self.proj_q.finalize(rng)?;
        self.proj_k.finalize(rng)?;
        self.proj_v.finalize(rng)
    }

    /// Per-group temperature, shape `[groups]`.
    pub fn tau(&self) -> &Tensor {
        &self.tau
    }

    /// Attends over `xh` of shape `(N, 2C, H, W)` and returns the aggregate `(N, C, H, W)`.
    pub fn forward(&self, xh: &Tensor) -> Result<Tensor> {
        let shape = xh.shape();
        if shape.len() != 4 || shape[1] != self.channels * 2 {
            return Err(RvtError::shape(
                "attention context",
                &[shape.first().copied().unwrap_or(0), self.channels * 2, 0, 0],
                &shape,
            ));
        }
        let (n, h, w) = (shape[0], shape[2], shape[3]);
        let (g, cg) = (self.groups, self.channels / self.groups);

        let q = self.proj_q.forward(std::slice::from_ref(xh))?;
        let k = self.proj_k.forward(std::slice::from_ref(xh))?;
        let v = self.proj_v.forward(std::slice::from_ref(xh))?;
        let tokens = |t: &Tensor| -> Result<Tensor> {
            let s = t.shape();
            t.reshape(&[n, g, cg, s[2] * s[3]])
        };
        let (q, k, v) = (tokens(&q)?, tokens(&k)?, tokens(&v)?);

        // (N, G, Q, Cg) x (N, G, Cg, D) -> (N, G, Q, D)
        let scores = q.permute(&[0, 1, 3, 2])?.batch_matmul(&k)?;
        let scores = scores.mul(&self.tau.reshape(&[1, g, 1, 1])?);
        let weights = scores.softmax(3);

        // (N, G, Cg, D) x (N, G, D, Q) -> (N, G, Cg, Q)
        let a = v.batch_matmul(&weights.permute(&[0, 1, 3, 2])?)?;
        a.reshape(&[n, self.channels, h, w])
    }
}

impl Module for GroupedAttention {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut params = vec![(join_name(prefix, "tau"), self.tau.clone())];
        params.extend(self.proj_q.named_parameters(&join_name(prefix, "proj_q")));
        params.extend(self.proj_k.named_parameters(&join_name(prefix, "proj_k")));
        params.extend(self.proj_v.named_parameters(&join_name(prefix, "proj_v")));
        params
    }
}
