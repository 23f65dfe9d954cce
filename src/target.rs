//! Per-target data: state machine, dependency edges, outputs, and the
//! provide/require substitution that lets one target stand in for
//! another when a requirer asks for a particular tag.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::label::BuildLabel;

/// The monotonic per-target state machine. Declared in the order a
/// target naturally advances through it; `as_u8`/`from_u8` give the CAS
/// layer a stable numeric encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TargetState {
    Inactive,
    Semiactive,
    Active,
    Pending,
    Building,
    Built,
    Tested,
    DependencyFailed,
    Failed,
}

impl TargetState {
    fn as_u8(self) -> u8 {
        match self {
            TargetState::Inactive => 0,
            TargetState::Semiactive => 1,
            TargetState::Active => 2,
            TargetState::Pending => 3,
            TargetState::Building => 4,
            TargetState::Built => 5,
            TargetState::Tested => 6,
            TargetState::DependencyFailed => 7,
            TargetState::Failed => 8,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => TargetState::Inactive,
            1 => TargetState::Semiactive,
            2 => TargetState::Active,
            3 => TargetState::Pending,
            4 => TargetState::Building,
            5 => TargetState::Built,
            6 => TargetState::Tested,
            7 => TargetState::DependencyFailed,
            _ => TargetState::Failed,
        }
    }

    /// True once this state is a terminal, no-further-action state for
    /// the build phase (tests may still follow `Built`).
    pub fn is_built_or_worse(self) -> bool {
        self >= TargetState::Built
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TargetState::DependencyFailed | TargetState::Failed)
    }
}

/// A declared `provides` entry: the tag a requirer must ask for, and the
/// label to substitute when it does.
pub type ProvideMap = BTreeMap<String, BuildLabel>;

/// All per-target mutable bookkeeping gathered under one lock, since it
/// is only ever touched before the target reaches `Built` (filegroups
/// aside, which may append outputs after, per §4.3).
#[derive(Debug, Default)]
struct Mutable {
    resolved_dependencies: BTreeSet<BuildLabel>,
    data_dependencies: BTreeSet<BuildLabel>,
    outputs: BTreeSet<String>,
    labels: BTreeSet<String>,
}

/// A single node in the build graph.
pub struct BuildTarget {
    pub label: BuildLabel,
    pub declared_dependencies: BTreeSet<BuildLabel>,
    pub sources: Vec<String>,
    pub test_only: bool,
    pub is_filegroup: bool,
    pub visibility: Vec<BuildLabel>,
    pub requires: BTreeSet<String>,
    pub provides: ProvideMap,

    state: AtomicU8,
    mutable: RwLock<Mutable>,
    build_done: Notify,
}

impl std::fmt::Debug for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildTarget")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("declared_dependencies", &self.declared_dependencies)
            .field("sources", &self.sources)
            .field("test_only", &self.test_only)
            .field("is_filegroup", &self.is_filegroup)
            .finish_non_exhaustive()
    }
}

/// Everything a parser collaborator knows about a target at the moment
/// it declares it; the rest of [`BuildTarget`]'s fields are populated
/// afterwards via its methods.
#[derive(Debug, Default)]
pub struct TargetSpec {
    pub declared_dependencies: BTreeSet<BuildLabel>,
    pub sources: Vec<String>,
    pub test_only: bool,
    pub is_filegroup: bool,
    pub visibility: Vec<BuildLabel>,
    pub requires: BTreeSet<String>,
    pub provides: ProvideMap,
}

impl BuildTarget {
    pub fn new(label: BuildLabel, declared_dependencies: BTreeSet<BuildLabel>) -> Arc<Self> {
        Self::from_spec(
            label,
            TargetSpec {
                declared_dependencies,
                ..TargetSpec::default()
            },
        )
    }

    pub fn from_spec(label: BuildLabel, spec: TargetSpec) -> Arc<Self> {
        Arc::new(Self {
            label,
            declared_dependencies: spec.declared_dependencies,
            sources: spec.sources,
            test_only: spec.test_only,
            is_filegroup: spec.is_filegroup,
            visibility: spec.visibility,
            requires: spec.requires,
            provides: spec.provides,
            state: AtomicU8::new(TargetState::Inactive.as_u8()),
            mutable: RwLock::new(Mutable::default()),
            build_done: Notify::new(),
        })
    }

    pub fn state(&self) -> TargetState {
        TargetState::from_u8(self.state.load(AtomicOrdering::Acquire))
    }

    /// Compare-and-set the state. Returns `true` on success. Callers
    /// should treat a CAS failure as "someone else already advanced it"
    /// rather than retry blindly, since the machine is monotonic.
    pub fn sync_update_state(&self, expected: TargetState, new: TargetState) -> bool {
        let won = self
            .state
            .compare_exchange(
                expected.as_u8(),
                new.as_u8(),
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
            .is_ok();
        if won && new.is_built_or_worse() {
            self.build_done.notify_waiters();
        }
        won
    }

    /// Forces the state forward regardless of the current value,
    /// for terminal transitions (`Failed`, `DependencyFailed`) that
    /// must win over whatever the target is currently doing.
    pub fn force_state(&self, new: TargetState) {
        self.state.store(new.as_u8(), AtomicOrdering::Release);
        if new.is_built_or_worse() {
            self.build_done.notify_waiters();
        }
    }

    pub async fn wait_for_build(&self) -> TargetState {
        loop {
            let current = self.state();
            if current.is_built_or_worse() {
                return current;
            }
            self.build_done.notified().await;
        }
    }

    pub fn add_dependency(&self, label: BuildLabel) {
        self.mutable.write().resolved_dependencies.insert(label);
    }

    pub fn add_maybe_exported_dependency(&self, label: BuildLabel, is_data: bool) {
        let mut m = self.mutable.write();
        if is_data {
            m.data_dependencies.insert(label.clone());
        }
        m.resolved_dependencies.insert(label);
    }

    pub fn resolve_dependency(&self, declared: &BuildLabel, resolved: BuildLabel) {
        debug_assert!(self.declared_dependencies.contains(declared) || declared == &resolved);
        self.mutable.write().resolved_dependencies.insert(resolved);
    }

    pub fn dependencies(&self) -> Vec<BuildLabel> {
        self.mutable
            .read()
            .resolved_dependencies
            .iter()
            .cloned()
            .collect()
    }

    pub fn declared_dependencies(&self) -> Vec<BuildLabel> {
        self.declared_dependencies.iter().cloned().collect()
    }

    pub fn add_output(&self, path: impl Into<String>) {
        self.mutable.write().outputs.insert(path.into());
    }

    /// Sorted, deduplicated outputs, per the ordering invariant in §4.3.
    pub fn outputs(&self) -> Vec<String> {
        self.mutable.read().outputs.iter().cloned().collect()
    }

    pub fn add_label(&self, tag: impl Into<String>) {
        self.mutable.write().labels.insert(tag.into());
    }

    pub fn has_label(&self, tag: &str) -> bool {
        self.mutable.read().labels.contains(tag)
    }

    /// Labels this target offers to `requirer`: entries of `provides`
    /// whose tag is in `requirer.requires`, except where `requirer`
    /// has also declared `self.label` as a data dependency (an
    /// explicit data dep suppresses the substitution, per scenario 6).
    pub fn provide_for(&self, requirer: &BuildTarget) -> Vec<BuildLabel> {
        if requirer.mutable.read().data_dependencies.contains(&self.label) {
            return vec![self.label.clone()];
        }
        let offered: Vec<BuildLabel> = self
            .provides
            .iter()
            .filter(|(tag, _)| requirer.requires.contains(*tag))
            .map(|(_, label)| label.clone())
            .collect();
        if offered.is_empty() {
            vec![self.label.clone()]
        } else {
            offered
        }
    }

    /// `other.visibility` must include `self.label`, or the two targets
    /// share a package, or `experimental` suppresses the check entirely.
    pub fn can_see(&self, other: &BuildTarget, experimental: bool) -> bool {
        if experimental {
            return true;
        }
        if self.label.package() == other.label.package() && self.label.subrepo() == other.label.subrepo() {
            return true;
        }
        other
            .visibility
            .iter()
            .any(|v| v.includes(&self.label.without_annotation()))
    }

    /// For a sub-target `_base#suffix`, the parent's label; otherwise
    /// `None`. Delegates to [`BuildLabel::parent`].
    pub fn parent_label(&self) -> Option<BuildLabel> {
        self.label.parent()
    }

    pub fn has_parent(&self) -> bool {
        self.label.has_parent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::parse;

    fn target(text: &str) -> Arc<BuildTarget> {
        BuildTarget::new(parse(text, "").unwrap(), BTreeSet::new())
    }

    #[test]
    fn state_starts_inactive() {
        let t = target("//a:x");
        assert_eq!(t.state(), TargetState::Inactive);
    }

    #[test]
    fn cas_succeeds_once() {
        let t = target("//a:x");
        assert!(t.sync_update_state(TargetState::Inactive, TargetState::Active));
        assert!(!t.sync_update_state(TargetState::Inactive, TargetState::Active));
        assert_eq!(t.state(), TargetState::Active);
    }

    #[test]
    fn outputs_are_sorted_and_deduplicated() {
        let t = target("//a:x");
        t.add_output("b.txt");
        t.add_output("a.txt");
        t.add_output("b.txt");
        assert_eq!(t.outputs(), vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_for_build_unblocks_on_built() {
        let t = target("//a:x");
        let t2 = Arc::clone(&t);
        let waiter = tokio::spawn(async move { t2.wait_for_build().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        t.force_state(TargetState::Built);
        assert_eq!(waiter.await.unwrap(), TargetState::Built);
    }

    #[test]
    fn provide_for_substitutes_by_tag() {
        let lib_py = parse("//a:lib_py", "").unwrap();
        let mut provides = ProvideMap::new();
        provides.insert("py".to_string(), lib_py.clone());
        let lib = BuildTarget::from_spec(
            parse("//a:lib", "").unwrap(),
            TargetSpec {
                provides,
                ..TargetSpec::default()
            },
        );

        let mut requires = BTreeSet::new();
        requires.insert("py".to_string());
        let bin = BuildTarget::from_spec(
            parse("//a:bin", "").unwrap(),
            TargetSpec {
                requires,
                ..TargetSpec::default()
            },
        );

        assert_eq!(lib.provide_for(&bin), vec![lib_py]);
    }

    #[test]
    fn data_dependency_suppresses_substitution() {
        let lib_py = parse("//a:lib_py", "").unwrap();
        let mut provides = ProvideMap::new();
        provides.insert("py".to_string(), lib_py);
        let lib = BuildTarget::from_spec(
            parse("//a:lib", "").unwrap(),
            TargetSpec {
                provides,
                ..TargetSpec::default()
            },
        );

        let mut requires = BTreeSet::new();
        requires.insert("py".to_string());
        let bin = BuildTarget::from_spec(
            parse("//a:bin", "").unwrap(),
            TargetSpec {
                requires,
                ..TargetSpec::default()
            },
        );
        bin.add_maybe_exported_dependency(lib.label.clone(), true);

        assert_eq!(lib.provide_for(&bin), vec![lib.label.clone()]);
    }

    #[test]
    fn visibility_allows_same_package() {
        let a = target("//pkg:a");
        let b = target("//pkg:b");
        assert!(a.can_see(&b, false));
    }

    #[test]
    fn visibility_denied_without_matching_entry() {
        let a = target("//pkg:a");
        let b = target("//other:b");
        assert!(!a.can_see(&b, false));
    }

    #[test]
    fn experimental_suppresses_visibility() {
        let a = target("//pkg:a");
        let b = target("//other:b");
        assert!(a.can_see(&b, true));
    }
}
