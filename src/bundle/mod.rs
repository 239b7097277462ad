//! Bundle deployment: download, verify, stage, atomically activate.

pub mod descriptor;
pub mod extract;
pub mod fetch;
pub mod manager;

pub use descriptor::{BundleDescriptor, BundleId};
pub use manager::{BundleManager, DeployReport};

use std::fmt;

/// Deployment steps, in order. Each step gates the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStep {
    Validate,
    StopServices,
    Fetch,
    Verify,
    Extract,
    Activate,
    Hook,
    Restart,
}

impl DeployStep {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::StopServices => "stop_services",
            Self::Fetch => "fetch",
            Self::Verify => "verify",
            Self::Extract => "extract",
            Self::Activate => "activate",
            Self::Hook => "hook",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed deployment, split by whether the active pointer already moved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeployError {
    /// Nothing changed on disk that matters: the previous bundle is intact.
    #[error("bundle.apply {bundle_id} failed at {step}: {detail}; active bundle unchanged")]
    BeforeActivation {
        bundle_id: String,
        step: DeployStep,
        detail: String,
    },

    /// The pointer was swapped; the named later step failed. Not rolled back.
    #[error("bundle.apply {bundle_id} partial: active={bundle_id} but {step} failed: {detail}")]
    AfterActivation {
        bundle_id: String,
        step: DeployStep,
        detail: String,
    },
}

impl DeployError {
    #[must_use]
    pub fn step(&self) -> DeployStep {
        match self {
            Self::BeforeActivation { step, .. } | Self::AfterActivation { step, .. } => *step,
        }
    }

    #[must_use]
    pub fn activated(&self) -> bool {
        matches!(self, Self::AfterActivation { .. })
    }
}
