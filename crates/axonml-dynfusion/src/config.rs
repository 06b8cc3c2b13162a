//! Build Configuration
//!
//! Device description and fusion settings passed to [`crate::build`].
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// GPU Target
// =============================================================================

/// GPU architecture the kernels are generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuTarget {
    /// Midgard family (T6xx, T7xx, T8xx).
    Midgard,
    /// Bifrost G71.
    G71,
    /// Bifrost G72.
    G72,
    /// Bifrost G76.
    #[default]
    G76,
    /// Valhall G77.
    G77,
    /// Valhall G78.
    G78,
    /// Valhall G710.
    G710,
}

impl GpuTarget {
    /// Smallest kernel side considered "large" by the convolution heuristic.
    pub fn direct_conv_kernel_threshold(self) -> usize {
        match self {
            Self::G76 | Self::G77 | Self::G78 => 7,
            _ => 5,
        }
    }

    /// Returns whether the target prefers direct convolution only for
    /// channel-reducing layers.
    pub fn is_legacy(self) -> bool {
        matches!(self, Self::Midgard | Self::G71 | Self::G72)
    }

    /// Lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Midgard => "midgard",
            Self::G71 => "g71",
            Self::G72 => "g72",
            Self::G76 => "g76",
            Self::G77 => "g77",
            Self::G78 => "g78",
            Self::G710 => "g710",
        }
    }
}

impl fmt::Display for GpuTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GpuTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "midgard" => Ok(Self::Midgard),
            "g71" => Ok(Self::G71),
            "g72" => Ok(Self::G72),
            "g76" => Ok(Self::G76),
            "g77" => Ok(Self::G77),
            "g78" => Ok(Self::G78),
            "g710" => Ok(Self::G710),
            other => Err(format!("unknown GPU target '{other}'")),
        }
    }
}

/// Device descriptor. Only the target is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuInfo {
    /// Architecture.
    pub target: GpuTarget,
}

impl GpuInfo {
    /// Creates a descriptor for `target`.
    pub fn new(target: GpuTarget) -> Self {
        Self { target }
    }
}

// =============================================================================
// Fusion Configuration
// =============================================================================

/// Configuration for the fusion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Run the fusion pass at all.
    pub enabled: bool,
    /// Upper bound on kernels per fused group.
    pub max_kernels_per_group: Option<usize>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_kernels_per_group: None,
        }
    }
}

impl FusionConfig {
    /// Creates the default configuration: fusion on, no group limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration that keeps one kernel per group.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_kernels_per_group: None,
        }
    }

    /// Builder: limit the size of fused groups.
    pub fn max_kernels_per_group(mut self, max: usize) -> Self {
        self.max_kernels_per_group = Some(max);
        self
    }
}

// =============================================================================
// Workload Context
// =============================================================================

/// Everything [`crate::build`] needs besides the operator graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadContext {
    /// Device descriptor.
    pub gpu_info: GpuInfo,
    /// Fusion settings.
    #[serde(default)]
    pub fusion: FusionConfig,
}

impl WorkloadContext {
    /// Creates a context for `target` with default fusion.
    pub fn new(target: GpuTarget) -> Self {
        Self {
            gpu_info: GpuInfo::new(target),
            fusion: FusionConfig::default(),
        }
    }

    /// Builder: replace the fusion settings.
    pub fn fusion(mut self, fusion: FusionConfig) -> Self {
        self.fusion = fusion;
        self
    }

    /// The target architecture.
    pub fn target(&self) -> GpuTarget {
        self.gpu_info.target
    }
}

// =============================================================================
// Tests
// =============================================================================
