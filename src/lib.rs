//! Recurrent grouped-attention core for sequential vision models.
//!
//! [`RvT`] keeps a hidden/cell feature-map state per instance and advances it once per
//! frame: the new inputs and the previous hidden state are projected into channel groups,
//! attend to each other within each group, and drive a convolutional LSTM update. The
//! computation runs on a small reverse-mode autograd engine over `ndarray`, so every
//! parameter exposed through [`Module::parameters`] receives gradients from `backward()`.
//!
//! ```no_run
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use rvt_core::{Recurrent, RvT, RvtConfig, Tensor};
//!
//! # fn main() -> rvt_core::Result<()> {
//! let mut rng = StdRng::seed_from_u64(0);
//! let mut core = RvT::new(RvtConfig::new(8, 3, 2))?;
//! core.add_input(3)?;
//! core.finalize(&mut rng)?;
//! for _ in 0..4 {
//!     let frame = Tensor::zeros(&[1, 3, 16, 16], false);
//!     let hidden = core.forward(&[frame], 0.1, &mut rng)?;
//!     assert_eq!(hidden.shape(), vec![1, 8, 16, 16]);
//! }
//! core.reset();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod nn;
pub mod ops;
pub mod tensor;

pub use config::RvtConfig;
pub use error::{Result, RvtError};
pub use nn::{Activation, Module, Recurrent, RecurrentState, RvT};
pub use tensor::Tensor;
