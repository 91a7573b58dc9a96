use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{context::GraphicsBackend, error::ConfigError, mesh::VertexNormalUV};

/// Tuning for the mesh pools. Every field has a default, so a config file
/// only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Bytes reserved for the vertex pool up front. 0 defers the first buffer
    /// to the first allocation.
    pub initial_vertex_capacity: u32,
    pub initial_index_capacity: u32,
    /// Smallest step a pool grows by.
    pub min_growth: u32,
    /// Every request is rounded up to this many bytes. Power of two.
    pub alignment: u32,
    /// Pools never grow past this many bytes.
    pub max_capacity: u32,
    pub vertex_stride: u32,
    pub index_stride: u32,
    pub backend: GraphicsBackend,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            initial_vertex_capacity: 0,
            initial_index_capacity: 0,
            min_growth: 64 * 1024,
            alignment: wgpu::COPY_BUFFER_ALIGNMENT as u32,
            max_capacity: u32::MAX,
            vertex_stride: std::mem::size_of::<VertexNormalUV>() as u32,
            index_stride: std::mem::size_of::<u32>() as u32,
            backend: GraphicsBackend::Primary,
        }
    }
}

impl AllocatorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// Describes the first problem found, if any.
    pub fn validate(&self) -> Result<(), String> {
        if !self.alignment.is_power_of_two() {
            return Err(format!("alignment {} is not a power of two", self.alignment));
        }
        if self.min_growth == 0 {
            return Err("min_growth must be non-zero".into());
        }
        if self.initial_vertex_capacity > self.max_capacity
            || self.initial_index_capacity > self.max_capacity
        {
            return Err(format!(
                "initial capacity exceeds max_capacity {}",
                self.max_capacity
            ));
        }
        Ok(())
    }

    /// Rounds `size` up to the configured alignment, `None` on overflow.
    pub fn align(&self, size: u32) -> Option<u32> {
        let mask = self.alignment - 1;
        size.checked_add(mask).map(|s| s & !mask)
    }
}
