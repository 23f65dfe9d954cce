//! The optional remote-execution collaborator. The RPC protocol itself
//! is out of scope; this is the surface the scheduler calls through
//! when a remote executor is configured.

use async_trait::async_trait;
use camino::Utf8Path;

use crate::target::BuildTarget;

/// A lightweight handle to a subrepo's files as seen by the remote
/// executor, e.g. a virtual filesystem rooted at `root`. Left opaque:
/// callers only need to pass it back through, never inspect it.
pub struct RemoteFs {
    pub root: camino::Utf8PathBuf,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn build(&self, target: &BuildTarget) -> anyhow::Result<()>;

    async fn test(&self, target: &BuildTarget, run: u32) -> anyhow::Result<bool>;

    async fn run(&self, target: &BuildTarget) -> anyhow::Result<()>;

    async fn download(&self, target: &BuildTarget) -> anyhow::Result<()>;

    async fn download_inputs(&self, target: &BuildTarget, dir: &Utf8Path, is_test: bool) -> anyhow::Result<()>;

    async fn print_hashes(&self, target: &BuildTarget, is_test: bool) -> anyhow::Result<()>;

    /// Bytes transferred per second over this client's connection, for
    /// progress reporting; not build-affecting.
    fn data_rate(&self) -> f64;

    async fn disconnect(&self) -> anyhow::Result<()>;

    fn subrepo_fs(&self, target: &BuildTarget, root: &Utf8Path) -> anyhow::Result<RemoteFs>;
}
