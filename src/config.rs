//! The typed configuration contract the engine consumes. Parsing actual
//! ini-style config files is explicitly out of scope here; this module
//! only defines the resulting struct and its hash.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use redact::Secret;

/// Build-affecting configuration. Immutable once constructed; per-arch
/// overlays (§9, "per-arch state forking") are separate value copies
/// produced by [`Configuration::with_arch`], never in-place mutation.
///
/// Not `Serialize`/`Deserialize`: the wrapped [`Secret`] values are
/// deliberately opaque to generic serialization so nothing downstream
/// can accidentally round-trip a secret env value back into plaintext.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Target architecture/subrepo overlay this configuration applies
    /// to; empty for the host configuration.
    pub arch: String,
    /// Freeform per-rule-language flag (e.g. optimisation level).
    pub build_language_flag: String,
    /// A value that changes per invocation purely to let callers force
    /// a fresh cache namespace; not derived from any other field.
    pub nonce: String,
    pub rejected_licences: Vec<String>,
    /// Sorted so the hash is independent of how the environment was
    /// enumerated. Never contains `SECRET*` entries: those are filtered
    /// before the map is populated, not merely before hashing.
    pub build_env: BTreeMap<String, Secret<String>>,
    pub worker_count: usize,
    /// How many times each test target's test action runs in parallel
    /// (§4.5 step 3: `num_active` credits a test target `1+num_test_runs`).
    pub test_runs: u32,
    pub keep_going: bool,
    pub experimental: bool,
    pub quiescence_interval: std::time::Duration,
    pub out_dir: Utf8PathBuf,
}

impl Configuration {
    /// Filters out any environment entry whose name starts with
    /// `SECRET`, wrapping the rest in [`Secret`] so a stray `{:?}` of
    /// this struct never leaks a value into a log line.
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.build_env = env
            .into_iter()
            .filter(|(k, _)| !k.starts_with("SECRET"))
            .map(|(k, v)| (k, Secret::new(v)))
            .collect();
        self
    }

    pub fn with_arch(&self, arch: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            ..self.clone()
        }
    }

    /// A digest over every build-affecting field. Action/cache keys are
    /// seeded with this so a configuration change invalidates
    /// previously cached results without the cache needing to know why.
    pub fn hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.arch.as_bytes());
        hasher.update(self.build_language_flag.as_bytes());
        hasher.update(self.nonce.as_bytes());
        for licence in &self.rejected_licences {
            hasher.update(licence.as_bytes());
        }
        for (key, value) in &self.build_env {
            hasher.update(key.as_bytes());
            hasher.update(value.expose_secret().as_bytes());
        }
        hasher.finalize()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            arch: String::new(),
            build_language_flag: String::new(),
            nonce: String::new(),
            rejected_licences: Vec::new(),
            build_env: BTreeMap::new(),
            worker_count: num_cpus_hint() + 2,
            test_runs: 1,
            keep_going: false,
            experimental: false,
            quiescence_interval: std::time::Duration::from_secs(5),
            out_dir: Utf8PathBuf::from("plz-out"),
        }
    }
}

fn num_cpus_hint() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_configuration_hashes_identically() {
        let a = Configuration::default().with_env([("FOO".to_string(), "bar".to_string())]);
        let b = Configuration::default().with_env([("FOO".to_string(), "bar".to_string())]);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn different_env_changes_hash() {
        let a = Configuration::default().with_env([("FOO".to_string(), "bar".to_string())]);
        let b = Configuration::default().with_env([("FOO".to_string(), "baz".to_string())]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn secret_prefixed_env_is_filtered_out() {
        let config = Configuration::default().with_env([
            ("SECRET_TOKEN".to_string(), "shh".to_string()),
            ("VISIBLE".to_string(), "ok".to_string()),
        ]);
        assert!(!config.build_env.contains_key("SECRET_TOKEN"));
        assert!(config.build_env.contains_key("VISIBLE"));
    }

    #[test]
    fn debug_output_never_shows_secret_values() {
        let config = Configuration::default().with_env([("TOKEN".to_string(), "super-secret".to_string())]);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn with_arch_preserves_other_fields() {
        let base = Configuration::default().with_env([("FOO".to_string(), "bar".to_string())]);
        let overlay = base.with_arch("arm64");
        assert_eq!(overlay.arch, "arm64");
        assert_eq!(overlay.build_env, base.build_env);
    }
}
