//! Learnable components of the recurrent core.

pub mod activation;
pub use activation::Activation;
pub mod module;
pub use module::Module;
pub mod projection;
pub use projection::{GroupedProjection, Padding, SourceSpec};
pub mod dropout;
pub use dropout::StructuralDropout;
pub mod attention;
pub use attention::GroupedAttention;
pub mod gates;
pub use gates::{Gate, GatedStateUpdate};
pub mod recurrent;
pub use recurrent::{Recurrent, RecurrentState, RvT};
