//! The engine's public error surface.
//!
//! Internal helpers propagate with `anyhow::Result` and `.context(...)`;
//! values only become an [`EngineError`] at the boundary where they are
//! about to be surfaced to a caller or turned into a [`crate::result::BuildResult`].

use thiserror::Error;

use crate::label::BuildLabel;

/// One arm per error kind named in the error-handling design.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid label {text:?}: {reason}")]
    InvalidLabel { text: String, reason: String },

    #[error("unknown target {label}")]
    UnknownTarget { label: BuildLabel },

    #[error("failed to parse package for {label}: {source}")]
    ParseFailed {
        label: BuildLabel,
        #[source]
        source: anyhow::Error,
    },

    #[error("{label} did not build because a dependency failed")]
    DependencyFailed { label: BuildLabel },

    #[error("action for {label} failed: {source}")]
    ActionFailed {
        label: BuildLabel,
        #[source]
        source: anyhow::Error,
    },

    #[error("dependency cycle detected, starting at {head}: {}", render_cycle(path))]
    CycleDetected {
        head: BuildLabel,
        path: Vec<BuildLabel>,
    },

    #[error("cache unavailable for {label}: {source}")]
    CacheUnavailable {
        label: BuildLabel,
        #[source]
        source: anyhow::Error,
    },

    #[error("target {label} already exists in the graph")]
    DuplicateTarget { label: BuildLabel },

    #[error("duplicate output {path:?} declared by {first} and {second}")]
    DuplicateOutput {
        path: String,
        first: BuildLabel,
        second: BuildLabel,
    },

    #[error("{label} is not visible to {from}")]
    VisibilityDenied { label: BuildLabel, from: BuildLabel },
}

fn render_cycle(path: &[BuildLabel]) -> String {
    path.iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, EngineError>;
