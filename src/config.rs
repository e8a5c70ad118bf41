use crate::error::{Result, RvtError};
use serde::{Deserialize, Serialize};

fn default_groups() -> usize {
    1
}

/// Construction parameters of a recurrent core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RvtConfig {
    /// Recurrent (output) channels.
    pub channels: usize,
    /// Spatial kernel size of the attention and gate projections.
    pub kernel_size: usize,
    /// Channel groups; must divide `channels`.
    #[serde(default = "default_groups")]
    pub groups: usize,
}

impl RvtConfig {
    pub fn new(channels: usize, kernel_size: usize, groups: usize) -> Self {
        RvtConfig {
            channels,
            kernel_size,
            groups,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.kernel_size == 0 || self.groups == 0 {
            return Err(RvtError::config(format!(
                "channels, kernel_size and groups must be positive: {:?}",
                self
            )));
        }
        if self.channels % self.groups != 0 {
            return Err(RvtError::config(format!(
                "{} groups do not evenly divide {} channels",
                self.groups, self.channels
            )));
        }
        Ok(())
    }

    pub fn group_channels(&self) -> usize {
        self.channels / self.groups
    }

    /// Parses and validates a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RvtConfig = serde_json::from_str(json)
            .map_err(|e| RvtError::config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| RvtError::config(format!("failed to serialize config: {}", e)))
    }
}
