//! The parser collaborator's callback surface. The build-file
//! interpreter itself (a separate embedded DSL evaluator) lives outside
//! this crate; only the contract it's invoked through is specified
//! here, and only the bitflags that travel with a parse request are
//! owned by this module.

use async_trait::async_trait;
use bitflags::bitflags;
use camino::Utf8Path;

use crate::label::BuildLabel;
use crate::target::BuildTarget;

bitflags! {
    /// Flags that travel with a parse task and propagate through any
    /// transitive parse requests it triggers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParseMode: u8 {
        /// An ordinary parse triggered by reaching a new package.
        const NORMAL = 0b0001;
        /// Parsing was triggered by a `subinclude()` call; the engine
        /// must wait for the included target to be built before parsing
        /// can continue.
        const FOR_SUBINCLUDE = 0b0010;
        /// Parsing was triggered by a preload declaration; same
        /// build-before-parse requirement as subinclude.
        const FOR_PRELOAD = 0b0100;
        /// Propagates a force-build requirement to everything this
        /// parse discovers, even targets that would otherwise remain
        /// semiactive.
        const FORCE_BUILD = 0b1000;
    }
}

impl ParseMode {
    /// Subinclude and preload parses must block on their dependency's
    /// build completing before the parser can resume.
    pub fn must_wait_for_build(self) -> bool {
        self.intersects(ParseMode::FOR_SUBINCLUDE | ParseMode::FOR_PRELOAD)
    }
}

/// The callback surface the embedded build-file interpreter is invoked
/// through. Implementations call back into the scheduler (`queue_target`,
/// `add_target`, `wait_for_built_target`) as they encounter dependencies
/// and subincludes while evaluating a build file.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse_file(
        &self,
        package: &str,
        for_label: &BuildLabel,
        dependent: &BuildLabel,
        mode: ParseMode,
        filename: &Utf8Path,
    ) -> anyhow::Result<()>;

    async fn parse_reader(
        &self,
        package: &str,
        contents: &[u8],
        for_label: &BuildLabel,
        dependent: &BuildLabel,
        mode: ParseMode,
    ) -> anyhow::Result<()>;

    async fn run_pre_build_function(&self, target: &BuildTarget) -> anyhow::Result<()>;

    async fn run_post_build_function(&self, target: &BuildTarget, output: &str) -> anyhow::Result<()>;

    async fn register_preload(&self, label: &BuildLabel) -> anyhow::Result<()>;
}
