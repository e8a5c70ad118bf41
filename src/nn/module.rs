use crate::error::{Result, RvtError};
use crate::tensor::Tensor;
use std::collections::HashMap;

/// Parameter surface shared by every learnable component.
///
/// Modules own their parameters; an external optimizer reads them through
/// `parameters()` and mutates their storage in place between sequences.
pub trait Module {
    /// Returns `(name, tensor)` pairs with stable dotted names under `prefix`.
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)>;

    /// Returns the parameters of the module.
    fn parameters(&self) -> Vec<Tensor> {
        self.named_parameters("")
            .into_iter()
            .map(|(_, p)| p)
            .collect()
    }

    /// Copies matching entries of `state` into the module's parameter storage.
    ///
    /// Entries without a matching name are ignored. Returns the number of parameters
    /// that were overwritten.
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>, prefix: &str) -> Result<usize> {
        let mut loaded = 0;
        for (name, param) in self.named_parameters(prefix) {
            let Some(src) = state.get(&name) else {
                continue;
            };
            // Copy out first: `src` may be `param` itself.
            let values = src.data();
            let mut param_lock = param.lock();
            if param_lock.data.shape() != values.shape() {
                return Err(RvtError::shape(
                    format!("state dict entry '{}'", name),
                    param_lock.data.shape(),
                    values.shape(),
                ));
            }
            param_lock.data = values;
            loaded += 1;
        }
        log::debug!("loaded {} parameters under prefix '{}'", loaded, prefix);
        Ok(loaded)
    }

    /// Clears accumulated gradients on every parameter.
    fn zero_grad(&self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }
}

/// Joins a parameter name onto a (possibly empty) prefix.
pub(crate) fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
