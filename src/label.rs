//! Build-label algebra: the canonical identifier for every target, plus
//! the pseudo-labels (`:all`, `...`) that denote sets of targets, and the
//! two reserved sentinel labels the scheduler uses internally.
//!
//! A label is a value type: hashable, totally ordered, and cheap to clone.
//! Parsing never panics; malformed text yields [`crate::error::EngineError::InvalidLabel`].

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Reserved suffixes that a package path may not end with (these are the
/// directories the engine itself writes build/test outputs into).
const RESERVED_PACKAGE_SUFFIXES: &[&str] = &["plz-out", "_build_output", "_test_output"];

/// Characters a package or target name may never contain.
const FORBIDDEN_NAME_CHARS: &[char] = &[':', '|', '@', '\0'];

/// A target's name component: a concrete identifier, or one of the two
/// pseudo-names that denote a set of targets.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetName {
    /// A single, concrete target.
    Name(String),
    /// `all`: every target declared directly in the package.
    All,
    /// `...`: every target in the package and all sub-packages, recursively.
    Recursive,
}

impl TargetName {
    fn as_text(&self) -> &str {
        match self {
            TargetName::Name(n) => n,
            TargetName::All => "all",
            TargetName::Recursive => "...",
        }
    }

    fn is_pseudo(&self) -> bool {
        !matches!(self, TargetName::Name(_))
    }
}

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_text())
    }
}

/// One of the two scheduler sentinels. These never appear in a build file
/// and are never produced by [`parse`]; they exist purely so the scheduler
/// can use a `BuildLabel` as a map key for "the thing read from stdin" and
/// "whichever target the user originally asked for", without resorting to
/// magic strings compared at runtime (see REDESIGN FLAGS in SPEC_FULL.md).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Sentinel {
    /// Placeholder for a target whose sources are piped in on stdin.
    Stdin,
    /// Placeholder "dependent" used when activating a target the user
    /// named directly on the command line, rather than as someone's
    /// dependency.
    OriginalTarget,
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sentinel::Stdin => write!(f, "//:_stdin_"),
            Sentinel::OriginalTarget => write!(f, "//:_original_"),
        }
    }
}

/// The canonical identifier for every target: `(subrepo, package, name)`,
/// plus the reserved sentinels and the whole-graph pseudo-label, each
/// represented as an explicit variant rather than a magic string.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
pub enum BuildLabel {
    /// `//...`: every target in every package, in every subrepo.
    WholeGraph,
    /// A scheduler-internal sentinel; see [`Sentinel`].
    Reserved(Sentinel),
    /// An ordinary, concrete-or-package-pseudo label.
    Concrete {
        subrepo: String,
        package: String,
        name: TargetName,
        /// The `|annotation` suffix of an annotated-output label, if any.
        annotation: Option<String>,
    },
}

impl BuildLabel {
    /// Construct a fully-qualified label directly, validating its parts.
    pub fn new(
        subrepo: impl Into<String>,
        package: impl Into<String>,
        name: TargetName,
    ) -> Result<Self, EngineError> {
        let subrepo = subrepo.into();
        let package = package.into();
        validate_package(&package).map_err(|reason| EngineError::InvalidLabel {
            text: format!("@{subrepo}//{package}:{name}"),
            reason,
        })?;
        if let TargetName::Name(n) = &name {
            validate_name(n).map_err(|reason| EngineError::InvalidLabel {
                text: format!("@{subrepo}//{package}:{name}"),
                reason,
            })?;
        }
        Ok(BuildLabel::Concrete {
            subrepo,
            package,
            name,
            annotation: None,
        })
    }

    pub fn subrepo(&self) -> &str {
        match self {
            BuildLabel::Concrete { subrepo, .. } => subrepo,
            _ => "",
        }
    }

    pub fn package(&self) -> &str {
        match self {
            BuildLabel::Concrete { package, .. } => package,
            _ => "",
        }
    }

    pub fn name(&self) -> Option<&TargetName> {
        match self {
            BuildLabel::Concrete { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn annotation(&self) -> Option<&str> {
        match self {
            BuildLabel::Concrete { annotation, .. } => annotation.as_deref(),
            _ => None,
        }
    }

    /// A copy of this label without its `|annotation` suffix, if any.
    pub fn without_annotation(&self) -> BuildLabel {
        match self {
            BuildLabel::Concrete {
                subrepo,
                package,
                name,
                ..
            } => BuildLabel::Concrete {
                subrepo: subrepo.clone(),
                package: package.clone(),
                name: name.clone(),
                annotation: None,
            },
            other => other.clone(),
        }
    }

    /// Is this label a pseudo-label (`:all` or `...`) rather than a single
    /// concrete target?
    pub fn is_pseudo(&self) -> bool {
        match self {
            BuildLabel::WholeGraph => true,
            BuildLabel::Reserved(_) => false,
            BuildLabel::Concrete { name, .. } => name.is_pseudo(),
        }
    }

    /// For a sub-target named `_base#suffix`, the label of its parent
    /// (`base`). Returns `None` for ordinary targets and pseudo-labels.
    pub fn parent(&self) -> Option<BuildLabel> {
        let BuildLabel::Concrete {
            subrepo,
            package,
            name: TargetName::Name(name),
            ..
        } = self
        else {
            return None;
        };
        let base = sub_target_base(name)?;
        Some(BuildLabel::Concrete {
            subrepo: subrepo.clone(),
            package: package.clone(),
            name: TargetName::Name(base.to_string()),
            annotation: None,
        })
    }

    pub fn has_parent(&self) -> bool {
        self.parent().is_some()
    }

    /// `self` includes `other` under the inclusion relation of §3: used
    /// for visibility checks and target-set expansion.
    pub fn includes(&self, other: &BuildLabel) -> bool {
        if matches!(self, BuildLabel::WholeGraph) {
            return true;
        }
        let (BuildLabel::Concrete {
            subrepo: a_sub,
            package: a_pkg,
            name: a_name,
            ..
        },
            BuildLabel::Concrete {
                subrepo: b_sub,
                package: b_pkg,
                ..
            }) = (self, other)
        else {
            return false;
        };
        if a_sub != b_sub {
            return false;
        }
        match a_name {
            TargetName::Name(_) => self.without_annotation() == other.without_annotation(),
            TargetName::All => a_pkg == b_pkg,
            TargetName::Recursive => a_pkg.is_empty() || is_package_or_ancestor(a_pkg, b_pkg),
        }
    }

    /// Canonical textual form, eliding `:name` when it equals the final
    /// path component of `package`.
    fn render(&self) -> String {
        match self {
            BuildLabel::WholeGraph => "//...".to_string(),
            BuildLabel::Reserved(s) => s.to_string(),
            BuildLabel::Concrete {
                subrepo,
                package,
                name,
                annotation,
            } => {
                let prefix = if subrepo.is_empty() {
                    String::new()
                } else {
                    format!("@{subrepo}")
                };
                let mut out = match name {
                    TargetName::Recursive if package.is_empty() => format!("{prefix}//..."),
                    TargetName::Recursive => format!("{prefix}//{package}/..."),
                    TargetName::All => format!("{prefix}//{package}:all"),
                    TargetName::Name(n) => {
                        let last_component = package.rsplit('/').next().unwrap_or("");
                        if n == last_component && !package.is_empty() {
                            format!("{prefix}//{package}")
                        } else {
                            format!("{prefix}//{package}:{n}")
                        }
                    }
                };
                if let Some(annotation) = annotation {
                    out.push('|');
                    out.push_str(annotation);
                }
                out
            }
        }
    }
}

impl fmt::Display for BuildLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Total order by `(subrepo, package, name)`; reserved sentinels and the
/// whole-graph label sort after every concrete label, in a stable but
/// otherwise unspecified relative order. Per §4.1, ordering a concrete
/// label against a sibling pseudo-label is well-defined (it is simply
/// lexicographic) but not meaningful for inclusion checks — callers must
/// use [`BuildLabel::includes`] for that.
impl Ord for BuildLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(l: &BuildLabel) -> u8 {
            match l {
                BuildLabel::Concrete { .. } => 0,
                BuildLabel::WholeGraph => 1,
                BuildLabel::Reserved(_) => 2,
            }
        }
        match rank(self).cmp(&rank(other)) {
            Ordering::Equal => {}
            other => return other,
        }
        match (self, other) {
            (
                BuildLabel::Concrete {
                    subrepo: s1,
                    package: p1,
                    name: n1,
                    annotation: a1,
                },
                BuildLabel::Concrete {
                    subrepo: s2,
                    package: p2,
                    name: n2,
                    annotation: a2,
                },
            ) => (s1, p1, n1.as_text(), a1).cmp(&(s2, p2, n2.as_text(), a2)),
            (BuildLabel::Reserved(a), BuildLabel::Reserved(b)) => a.cmp(b),
            (BuildLabel::WholeGraph, BuildLabel::WholeGraph) => Ordering::Equal,
            _ => Ordering::Equal,
        }
    }
}

impl PartialOrd for BuildLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for BuildLabel {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl std::hash::Hash for BuildLabel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            BuildLabel::WholeGraph => 1u8.hash(state),
            BuildLabel::Reserved(s) => {
                2u8.hash(state);
                s.hash(state);
            }
            BuildLabel::Concrete {
                subrepo,
                package,
                name,
                annotation,
            } => {
                0u8.hash(state);
                subrepo.hash(state);
                package.hash(state);
                name.hash(state);
                annotation.hash(state);
            }
        }
    }
}

/// Parse label text in the context of `current_package` (used to resolve
/// the `:name` relative form). Never panics.
pub fn parse(text: &str, current_package: &str) -> Result<BuildLabel, EngineError> {
    let invalid = |reason: &str| EngineError::InvalidLabel {
        text: text.to_string(),
        reason: reason.to_string(),
    };

    if text.is_empty() {
        return Err(invalid("label text is empty"));
    }

    let (text, annotation) = match text.split_once('|') {
        Some((base, annotation)) => {
            if annotation.is_empty() {
                return Err(invalid("empty annotation after '|'"));
            }
            (base, Some(annotation.to_string()))
        }
        None => (text, None),
    };

    let (subrepo, rest) = if let Some(stripped) = text.strip_prefix('@') {
        let end = stripped
            .find("//")
            .ok_or_else(|| invalid("'@subrepo' must be followed by '//'"))?;
        (&stripped[..end], &stripped[end..])
    } else {
        ("", text)
    };
    if subrepo.is_empty() && text.starts_with('@') {
        return Err(invalid("subrepo name must not be empty"));
    }

    let label = if let Some(after_slashes) = rest.strip_prefix("//") {
        parse_absolute(after_slashes, subrepo, &invalid)?
    } else if let Some(name) = rest.strip_prefix(':') {
        if !subrepo.is_empty() {
            return Err(invalid("relative ':name' form cannot carry a subrepo"));
        }
        validate_name(name).map_err(|r| invalid(&r))?;
        BuildLabel::Concrete {
            subrepo: subrepo.to_string(),
            package: current_package.to_string(),
            name: TargetName::Name(name.to_string()),
            annotation: None,
        }
    } else {
        // Bare relative forms: `pkg:name`, `pkg/...`, `pkg`. These are
        // absolute package paths, written without the leading `//` for
        // convenience at the shell.
        parse_absolute(rest, subrepo, &invalid)?
    };

    Ok(match (label, annotation) {
        (
            BuildLabel::Concrete {
                subrepo,
                package,
                name,
                ..
            },
            annotation,
        ) => BuildLabel::Concrete {
            subrepo,
            package,
            name,
            annotation,
        },
        (other, None) => other,
        (other, Some(_)) => {
            return Err(invalid(&format!(
                "label {other} cannot carry an annotation"
            )))
        }
    })
}

fn parse_absolute(
    rest: &str,
    subrepo: &str,
    invalid: &dyn Fn(&str) -> EngineError,
) -> Result<BuildLabel, EngineError> {
    if rest.is_empty() {
        return Err(invalid("missing package after '//'"));
    }
    if rest == "..." {
        return Ok(if subrepo.is_empty() {
            BuildLabel::WholeGraph
        } else {
            BuildLabel::Concrete {
                subrepo: subrepo.to_string(),
                package: String::new(),
                name: TargetName::Recursive,
                annotation: None,
            }
        });
    }

    let (package, name) = if let Some((pkg, name)) = rest.split_once(':') {
        let name = match name {
            "all" => TargetName::All,
            "..." => TargetName::Recursive,
            _ => TargetName::Name(name.to_string()),
        };
        (pkg, name)
    } else if let Some(pkg) = rest.strip_suffix("/...") {
        (pkg, TargetName::Recursive)
    } else {
        // Implicit name: the final path component of the package.
        let last = rest.rsplit('/').next().unwrap_or(rest);
        (rest, TargetName::Name(last.to_string()))
    };

    validate_package(package).map_err(|r| invalid(&r))?;
    if let TargetName::Name(n) = &name {
        if n.is_empty() {
            return Err(invalid("target name must not be empty"));
        }
        validate_name(n).map_err(|r| invalid(&r))?;
    }

    Ok(BuildLabel::Concrete {
        subrepo: subrepo.to_string(),
        package: package.to_string(),
        name,
        annotation: None,
    })
}

fn validate_package(package: &str) -> Result<(), String> {
    if package.starts_with('/') || package.ends_with('/') {
        return Err("package path must not start or end with '/'".to_string());
    }
    if package.contains("//") {
        return Err("package path must not contain '//'".to_string());
    }
    for suffix in RESERVED_PACKAGE_SUFFIXES {
        if package == *suffix || package.ends_with(&format!("/{suffix}")) {
            return Err(format!("package path must not end with reserved directory {suffix:?}"));
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
        return Err(format!("name must not contain '{c}'"));
    }
    Ok(())
}

/// `"_foo#bar"` -> `Some("foo")`; anything else -> `None`.
fn sub_target_base(name: &str) -> Option<&str> {
    let rest = name.strip_prefix('_')?;
    let (base, _suffix) = rest.split_once('#')?;
    if base.is_empty() {
        None
    } else {
        Some(base)
    }
}

fn is_package_or_ancestor(ancestor: &str, package: &str) -> bool {
    if ancestor == package {
        return true;
    }
    package
        .strip_prefix(ancestor)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("//foo/bar:baz", "", "", "foo/bar", "baz")]
    #[case("//foo/bar", "", "", "foo/bar", "bar")]
    #[case(":baz", "foo/bar", "", "foo/bar", "baz")]
    #[case("foo/bar:baz", "", "", "foo/bar", "baz")]
    #[case("@sub//foo:baz", "", "sub", "foo", "baz")]
    fn parses_concrete_forms(
        #[case] text: &str,
        #[case] current_package: &str,
        #[case] subrepo: &str,
        #[case] package: &str,
        #[case] name: &str,
    ) {
        let label = parse(text, current_package).unwrap();
        assert_eq!(label.subrepo(), subrepo);
        assert_eq!(label.package(), package);
        assert_eq!(label.name(), Some(&TargetName::Name(name.to_string())));
    }

    #[test]
    fn parses_whole_graph() {
        assert_eq!(parse("//...", "").unwrap(), BuildLabel::WholeGraph);
    }

    #[test]
    fn parses_recursive_and_all() {
        let recursive = parse("//foo/...", "").unwrap();
        assert_eq!(recursive.name(), Some(&TargetName::Recursive));
        let all = parse("//foo:all", "").unwrap();
        assert_eq!(all.name(), Some(&TargetName::All));
    }

    #[test]
    fn parses_annotation() {
        let label = parse("//foo:bar|annotation", "").unwrap();
        assert_eq!(label.annotation(), Some("annotation"));
        assert_eq!(label.without_annotation().annotation(), None);
    }

    #[rstest]
    #[case("")]
    #[case("//foo:")]
    #[case("//foo/bar/plz-out:baz")]
    #[case("//foo:bar:baz")]
    #[case("@//foo:bar")]
    fn rejects_invalid(#[case] text: &str) {
        assert!(parse(text, "").is_err());
    }

    #[test]
    fn round_trips_through_display() {
        for text in [
            "//foo/bar:baz",
            "//foo/bar",
            "//foo/...",
            "//...",
            "@sub//foo:bar",
            "//foo:bar|out.txt",
        ] {
            let label = parse(text, "").unwrap();
            let rendered = label.to_string();
            let reparsed = parse(&rendered, "").unwrap();
            assert_eq!(label, reparsed, "round trip failed for {text}");
        }
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = parse("//a:a", "").unwrap();
        let b = parse("//a:b", "").unwrap();
        let c = parse("//b:a", "").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn inclusion_recursive() {
        let recursive = parse("//foo/...", "").unwrap();
        assert!(recursive.includes(&parse("//foo:x", "").unwrap()));
        assert!(recursive.includes(&parse("//foo/bar:x", "").unwrap()));
        assert!(!recursive.includes(&parse("//other:x", "").unwrap()));
    }

    #[test]
    fn inclusion_all() {
        let all = parse("//foo:all", "").unwrap();
        assert!(all.includes(&parse("//foo:x", "").unwrap()));
        assert!(!all.includes(&parse("//foo/bar:x", "").unwrap()));
    }

    #[test]
    fn inclusion_whole_graph() {
        assert!(BuildLabel::WholeGraph.includes(&parse("//anything/at/all:x", "").unwrap()));
    }

    #[test]
    fn parent_of_sub_target() {
        let sub = parse("//foo:_bar#test", "").unwrap();
        assert!(sub.has_parent());
        assert_eq!(sub.parent().unwrap(), parse("//foo:bar", "").unwrap());

        let plain = parse("//foo:bar", "").unwrap();
        assert!(!plain.has_parent());
    }

    #[test]
    fn sentinel_labels_are_distinct_and_stable() {
        assert_ne!(BuildLabel::Reserved(Sentinel::Stdin), BuildLabel::WholeGraph);
        assert_ne!(
            BuildLabel::Reserved(Sentinel::Stdin),
            BuildLabel::Reserved(Sentinel::OriginalTarget)
        );
    }
}
