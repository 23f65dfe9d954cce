//! The concurrent build graph: a map of label to target, plus the
//! per-package grouping that build files populate.
//!
//! All awaitable lookups are built on the single [`crate::sharded_map::ShardedMap`]
//! primitive rather than a bespoke channel per map.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::EngineError;
use crate::label::BuildLabel;
use crate::sharded_map::ShardedMap;
use crate::target::BuildTarget;

/// The set of targets declared by one build file, keyed by package path
/// (subrepo-qualified so different subrepos never collide).
#[derive(Debug, Default)]
pub struct Package {
    pub subrepo: String,
    pub path: String,
    targets: parking_lot::RwLock<BTreeSet<BuildLabel>>,
    declared_outputs: parking_lot::RwLock<std::collections::BTreeMap<String, BuildLabel>>,
    subincludes: parking_lot::RwLock<Vec<BuildLabel>>,
}

impl Package {
    pub fn new(subrepo: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            subrepo: subrepo.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> String {
        format!("@{}//{}", self.subrepo, self.path)
    }

    pub fn add_target(&self, label: BuildLabel) {
        self.targets.write().insert(label);
    }

    pub fn targets(&self) -> Vec<BuildLabel> {
        self.targets.read().iter().cloned().collect()
    }

    pub fn add_subinclude(&self, label: BuildLabel) {
        self.subincludes.write().push(label);
    }

    pub fn subincludes(&self) -> Vec<BuildLabel> {
        self.subincludes.read().clone()
    }

    /// Registers `path` as an output of `owner`. Returns an error
    /// (without mutating anything) if another target in this package
    /// already claims it, unless one of the two targets is a filegroup
    /// (which legitimately re-exports another target's outputs).
    pub fn declare_output(
        &self,
        path: impl Into<String>,
        owner: &BuildLabel,
        owner_is_filegroup: bool,
    ) -> Result<(), EngineError> {
        let path = path.into();
        let mut outputs = self.declared_outputs.write();
        match outputs.get(&path) {
            Some(existing) if existing != owner && !owner_is_filegroup => {
                Err(EngineError::DuplicateOutput {
                    path,
                    first: existing.clone(),
                    second: owner.clone(),
                })
            }
            _ => {
                outputs.insert(path, owner.clone());
                Ok(())
            }
        }
    }
}

/// A concurrent mapping `BuildLabel -> BuildTarget`, plus a mapping of
/// package key to `Package`. Keys are unique within each map.
pub struct BuildGraph {
    targets: ShardedMap<BuildLabel, Arc<BuildTarget>>,
    packages: ShardedMap<String, Arc<Package>>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self {
            targets: ShardedMap::new(),
            packages: ShardedMap::new(),
        }
    }

    /// Inserts a target. Fails if one with the same label already
    /// exists (property 3: `add_target` is add-once).
    pub fn add_target(&self, target: Arc<BuildTarget>) -> Result<(), EngineError> {
        let label = target.label.clone();
        if self.targets.contains_key(&label) {
            return Err(EngineError::DuplicateTarget { label });
        }
        debug!(%label, "target added to graph");
        let previous = self.targets.publish(label.clone(), target);
        if previous.is_some() {
            // Lost a race against a concurrent add_target for the same
            // label; surface it the same way as the upfront check.
            return Err(EngineError::DuplicateTarget { label });
        }
        Ok(())
    }

    /// Never blocks; `None` if not yet present.
    pub fn target(&self, label: &BuildLabel) -> Option<Arc<BuildTarget>> {
        self.targets.get(label)
    }

    pub fn target_or_die(&self, label: &BuildLabel) -> Arc<BuildTarget> {
        self.target(label)
            .unwrap_or_else(|| panic!("target {label} must already be present in the graph"))
    }

    /// Blocks until a target with this label is inserted.
    pub async fn wait_for_target(&self, label: &BuildLabel) -> Arc<BuildTarget> {
        self.targets.wait(label).await
    }

    pub fn add_package(&self, package: Arc<Package>) -> Result<(), EngineError> {
        let key = package.key();
        if self.packages.contains_key(&key) {
            let label = BuildLabel::Concrete {
                subrepo: package.subrepo.clone(),
                package: package.path.clone(),
                name: crate::label::TargetName::All,
                annotation: None,
            };
            return Err(EngineError::DuplicateTarget { label });
        }
        self.packages.publish(key, package);
        Ok(())
    }

    pub fn package(&self, key: &str) -> Option<Arc<Package>> {
        self.packages.get(&key.to_string())
    }

    pub async fn wait_for_package(&self, key: &str) -> Arc<Package> {
        self.packages.wait(&key.to_string()).await
    }

    /// Marks a package key as "someone has promised to parse this" so
    /// concurrent waiters block instead of each independently deciding
    /// to enqueue a duplicate parse task. See DESIGN.md for why this is
    /// distinct from the scheduler's own `package_parse_waiters` map.
    pub fn mark_package_pending(&self, key: impl Into<String>) {
        self.packages.mark_pending(key.into());
    }

    /// Snapshot of every target currently present. No consistency
    /// guarantee across concurrent mutation.
    pub fn all_targets(&self) -> Vec<Arc<BuildTarget>> {
        self.targets
            .present_keys()
            .into_iter()
            .filter_map(|label| self.targets.get(&label))
            .collect()
    }

    pub fn package_map(&self) -> Vec<Arc<Package>> {
        self.packages
            .present_keys()
            .into_iter()
            .filter_map(|key| self.packages.get(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BuildGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::parse;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn target(text: &str) -> Arc<BuildTarget> {
        BuildTarget::new(parse(text, "").unwrap(), BTreeSet::new())
    }

    #[test]
    fn add_target_rejects_duplicates() {
        let graph = BuildGraph::new();
        graph.add_target(target("//a:x")).unwrap();
        let err = graph.add_target(target("//a:x")).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTarget { .. }));
    }

    #[test]
    fn target_lookup_without_insert_misses() {
        let graph = BuildGraph::new();
        assert!(graph.target(&parse("//a:x", "").unwrap()).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_for_target_completes_on_insert() {
        let graph = Arc::new(BuildGraph::new());
        let label = parse("//a:x", "").unwrap();
        let waiting = Arc::clone(&graph);
        let waiting_label = label.clone();
        let waiter = tokio::spawn(async move { waiting.wait_for_target(&waiting_label).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        graph.add_target(target("//a:x")).unwrap();
        let found = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.label, label);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn many_concurrent_waiters_see_same_target() {
        let graph = Arc::new(BuildGraph::new());
        let label = parse("//a:x", "").unwrap();
        let mut waiters = Vec::new();
        for _ in 0..16 {
            let graph = Arc::clone(&graph);
            let label = label.clone();
            waiters.push(tokio::spawn(async move { graph.wait_for_target(&label).await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        graph.add_target(target("//a:x")).unwrap();
        for w in waiters {
            assert_eq!(w.await.unwrap().label, label);
        }
    }

    #[test]
    fn package_rejects_conflicting_outputs() {
        let pkg = Package::new("", "a");
        let owner_a = parse("//a:x", "").unwrap();
        let owner_b = parse("//a:y", "").unwrap();
        pkg.declare_output("out.txt", &owner_a, false).unwrap();
        let err = pkg.declare_output("out.txt", &owner_b, false).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateOutput { .. }));
    }

    #[test]
    fn filegroup_may_reuse_an_output() {
        let pkg = Package::new("", "a");
        let owner_a = parse("//a:x", "").unwrap();
        let owner_b = parse("//a:group", "").unwrap();
        pkg.declare_output("out.txt", &owner_a, false).unwrap();
        pkg.declare_output("out.txt", &owner_b, true).unwrap();
    }
}
