//! JSON operator configuration
//!
//! ```json
//! { "spacing": [0.5, 0.5, 1.0], "zero_boundary": true, "device": "threaded", "threads": 4 }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::{ComputeCapabilities, ComputeUnit};
use crate::error::{Result, StnError};
use crate::scale::validate_spacing;
use crate::BoundaryPolicy;

/// Requested compute unit family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRequest {
    /// Whatever the capabilities prefer.
    #[default]
    Auto,
    Serial,
    Threaded,
}

impl std::str::FromStr for DeviceRequest {
    type Err = StnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(DeviceRequest::Auto),
            "serial" => Ok(DeviceRequest::Serial),
            "threaded" => Ok(DeviceRequest::Threaded),
            other => Err(StnError::config(format!(
                "unknown device '{other}', expected auto, serial or threaded"
            ))),
        }
    }
}

/// Construction parameters of a [`SpatialTransformer`](crate::SpatialTransformer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformerConfig {
    pub spacing: Vec<f64>,
    #[serde(default)]
    pub zero_boundary: bool,
    #[serde(default)]
    pub device: DeviceRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
}

impl TransformerConfig {
    pub fn new(spacing: Vec<f64>, zero_boundary: bool) -> Self {
        Self {
            spacing,
            zero_boundary,
            device: DeviceRequest::Auto,
            threads: None,
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StnError::config(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| StnError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StnError::config(format!("cannot serialize configuration: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        validate_spacing(&self.spacing)?;
        if self.threads == Some(0) {
            return Err(StnError::config("threads must be at least 1"));
        }
        if self.device == DeviceRequest::Serial && self.threads.is_some_and(|t| t > 1) {
            return Err(StnError::config("a thread count requires the threaded device"));
        }
        Ok(())
    }

    pub fn boundary(&self) -> BoundaryPolicy {
        BoundaryPolicy::from_zero_boundary(self.zero_boundary)
    }

    /// Concrete compute unit for this request on a machine with `caps`.
    ///
    /// `auto` never fails: it falls back to serial and caps the thread
    /// count. An explicit `threaded` request is returned as asked, so that
    /// backend selection reports it if `caps` cannot honour it.
    pub fn resolve_unit(&self, caps: &ComputeCapabilities) -> ComputeUnit {
        match self.device {
            DeviceRequest::Serial => ComputeUnit::Serial,
            DeviceRequest::Threaded => ComputeUnit::Threaded {
                threads: self.threads.unwrap_or(caps.max_threads),
            },
            DeviceRequest::Auto => match (caps.preferred_unit(), self.threads) {
                (ComputeUnit::Threaded { threads }, Some(requested)) => {
                    let threads = requested.min(threads);
                    if threads > 1 {
                        ComputeUnit::Threaded { threads }
                    } else {
                        ComputeUnit::Serial
                    }
                }
                (unit, _) => unit,
            },
        }
    }
}
