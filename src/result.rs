//! The single stream of [`BuildResult`] events the scheduler emits,
//! consumed by whatever driver (CLI, UI, test harness) is running the
//! build.

use crate::label::BuildLabel;

/// One event in the result stream. Every phase transition the scheduler
/// makes is reflected here; drivers never poll target state directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResult {
    PackageParsed { package: String },
    TargetActive { label: BuildLabel },
    TargetBuilding { label: BuildLabel },
    TargetBuilt { label: BuildLabel, outputs: Vec<String> },
    TargetCached { label: BuildLabel, outputs: Vec<String> },
    TargetTested { label: BuildLabel, passed: bool },
    TargetBuildFailed { label: BuildLabel, message: String },
    TargetDependencyFailed { label: BuildLabel, failed_dependency: BuildLabel },
}

impl BuildResult {
    pub fn label(&self) -> Option<&BuildLabel> {
        match self {
            BuildResult::PackageParsed { .. } => None,
            BuildResult::TargetActive { label }
            | BuildResult::TargetBuilding { label }
            | BuildResult::TargetBuilt { label, .. }
            | BuildResult::TargetCached { label, .. }
            | BuildResult::TargetTested { label, .. }
            | BuildResult::TargetBuildFailed { label, .. }
            | BuildResult::TargetDependencyFailed { label, .. } => Some(label),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            BuildResult::TargetBuildFailed { .. } | BuildResult::TargetDependencyFailed { .. }
        )
    }
}
