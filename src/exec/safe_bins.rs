//! Safe-bin execution trust policy.
//!
//! A safe bin may run without interactive approval when it is listed in the
//! resolved policy, lives in a trusted directory, and its arguments pass its
//! profile. Interpreters additionally need an explicit profile.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::interpreter::{is_interpreter_like, normalize_bin_name};
use super::trusted_dirs::{TrustedBinDirSet, TrustedDirCache};
use crate::config::{SafeBinConfigLayer, SafeBinProfileConfig};

/// Safe bins used when no configuration layer lists any.
pub const DEFAULT_SAFE_BINS: &[&str] = &["jq", "cut", "uniq", "head", "tail", "tr", "wc"];

/// Built-in profiles: `(name, denied flags, max positional, flags taking a value)`.
const BUILTIN_PROFILES: &[(&str, &[&str], Option<usize>, &[&str])] = &[
    (
        "jq",
        &["-f", "--from-file", "--rawfile", "--slurpfile", "-L", "--library-path"],
        Some(1),
        &["--indent"],
    ),
    (
        "cut",
        &[],
        Some(0),
        &["-b", "-c", "-d", "-f", "--bytes", "--characters", "--delimiter", "--fields"],
    ),
    ("uniq", &[], Some(0), &["-f", "-s", "-w", "--skip-fields", "--skip-chars", "--check-chars"]),
    ("head", &[], Some(0), &["-n", "-c", "--lines", "--bytes"]),
    ("tail", &["-f", "-F", "--follow", "--retry"], Some(0), &["-n", "-c", "--lines", "--bytes"]),
    ("tr", &[], Some(2), &[]),
    ("wc", &["--files0-from"], Some(0), &[]),
];

/// Argument restrictions for one safe bin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafeBinProfile {
    /// Normalized binary name.
    pub binary_name: String,
    /// Flags that make an invocation unsafe.
    pub denied_flags: BTreeSet<String>,
    /// Maximum positional arguments, if limited.
    pub max_positional: Option<usize>,
    /// Flags whose value is the following argument (not counted as positional).
    pub value_flags: BTreeSet<String>,
}

/// Why an argument vector failed a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgvViolation {
    /// A denied flag was used.
    DeniedFlag { flag: String },
    /// Too many positional arguments.
    TooManyPositional { count: usize, max: usize },
}

impl std::fmt::Display for ArgvViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeniedFlag { flag } => write!(f, "flag {flag} is not allowed"),
            Self::TooManyPositional { count, max } => {
                write!(f, "{count} positional arguments exceed the limit of {max}")
            }
        }
    }
}

impl SafeBinProfile {
    /// Builds a profile from configuration, dropping blank flags.
    #[must_use]
    pub fn from_config(binary_name: &str, config: &SafeBinProfileConfig) -> Self {
        let denied_flags = config
            .denied_flags
            .iter()
            .flatten()
            .map(|flag| flag.trim())
            .filter(|flag| !flag.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            binary_name: binary_name.to_string(),
            denied_flags,
            max_positional: config.max_positional,
            value_flags: BTreeSet::new(),
        }
    }

    /// Returns `true` if the profile imposes no restriction.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.denied_flags.is_empty() && self.max_positional.is_none()
    }

    /// Checks arguments (program name excluded) against the profile.
    ///
    /// Long flags match with or without `=value`, and any abbreviation of a
    /// denied long flag is denied as well, since getopt accepts unambiguous
    /// prefixes. Short flags match exactly, bundled (`-xf`), or with an
    /// attached value (`-fFILE`). Everything after `--`, and a lone `-`,
    /// counts as positional.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn check_argv<S: AsRef<str>>(&self, args: &[S]) -> Result<(), ArgvViolation> {
        let mut positional = 0usize;
        let mut options_done = false;
        let mut skip_value = false;

        for arg in args.iter().map(AsRef::as_ref) {
            if skip_value {
                skip_value = false;
                continue;
            }
            if options_done || arg == "-" || !arg.starts_with('-') {
                positional += 1;
                continue;
            }
            if arg == "--" {
                options_done = true;
                continue;
            }

            if let Some(long) = arg.strip_prefix("--") {
                let (name, has_value) = match long.split_once('=') {
                    Some((name, _)) => (name, true),
                    None => (long, false),
                };
                let flag = format!("--{name}");
                self.deny_long_flag(&flag)?;
                skip_value = !has_value && self.takes_long_value(&flag);
                continue;
            }

            self.deny_flag(arg)?;
            let cluster = &arg[1..];
            for (index, ch) in cluster.char_indices() {
                let flag = format!("-{ch}");
                self.deny_flag(&flag)?;
                if self.value_flags.contains(&flag) {
                    // The rest of the cluster is the value; otherwise the next arg is.
                    skip_value = index + ch.len_utf8() == cluster.len();
                    break;
                }
            }
        }

        match self.max_positional {
            Some(max) if positional > max => Err(ArgvViolation::TooManyPositional {
                count: positional,
                max,
            }),
            _ => Ok(()),
        }
    }

    /// Denies `flag` when it is a denied long flag or a prefix of one.
    fn deny_long_flag(&self, flag: &str) -> Result<(), ArgvViolation> {
        self.deny_flag(flag)?;
        match self
            .denied_flags
            .iter()
            .find(|denied| denied.starts_with("--") && denied.starts_with(flag))
        {
            Some(denied) => Err(ArgvViolation::DeniedFlag {
                flag: denied.clone(),
            }),
            None => Ok(()),
        }
    }

    /// A long flag takes a value when it names, or uniquely abbreviates, a
    /// value flag.
    fn takes_long_value(&self, flag: &str) -> bool {
        self.value_flags.contains(flag)
            || self
                .value_flags
                .iter()
                .filter(|value_flag| value_flag.starts_with("--") && value_flag.starts_with(flag))
                .count()
                == 1
    }

    fn deny_flag(&self, flag: &str) -> Result<(), ArgvViolation> {
        if self.denied_flags.contains(flag) {
            return Err(ArgvViolation::DeniedFlag {
                flag: flag.to_string(),
            });
        }
        Ok(())
    }
}

/// Normalizes a configured binary name: trimmed and lower-cased.
fn normalize_key(name: &str) -> Option<String> {
    let key = name.trim().to_lowercase();
    (!key.is_empty()).then_some(key)
}

/// Merges global and per-agent profile fixtures.
///
/// Keys are trimmed and lower-cased, blank keys dropped. A local entry replaces
/// the global entry for the same binary entirely (no field-level merge).
#[must_use]
pub fn merge_profile_fixtures(
    global: Option<&BTreeMap<String, SafeBinProfileConfig>>,
    local: Option<&BTreeMap<String, SafeBinProfileConfig>>,
) -> BTreeMap<String, SafeBinProfileConfig> {
    let mut merged = BTreeMap::new();
    for layer in [global, local].into_iter().flatten() {
        for (name, profile) in layer {
            if let Some(key) = normalize_key(name) {
                merged.insert(key, profile.clone());
            }
        }
    }
    merged
}

fn builtin_profiles() -> BTreeMap<String, SafeBinProfile> {
    BUILTIN_PROFILES
        .iter()
        .map(|(name, denied, max, value_flags)| {
            let profile = SafeBinProfile {
                binary_name: (*name).to_string(),
                denied_flags: denied.iter().map(|f| (*f).to_string()).collect(),
                max_positional: *max,
                value_flags: value_flags.iter().map(|f| (*f).to_string()).collect(),
            };
            ((*name).to_string(), profile)
        })
        .collect()
}

/// Resolved safe-bin policy for one execution context.
#[derive(Debug, Clone)]
pub struct SafeBinPolicy {
    /// Normalized names of binaries allowed without approval.
    pub trusted_bins: BTreeSet<String>,
    /// Profiles keyed by normalized binary name.
    pub profiles: BTreeMap<String, SafeBinProfile>,
    /// Directories safe bins must live in.
    pub trusted_dirs: Arc<TrustedBinDirSet>,
    /// Trusted bins without a profile, sorted.
    pub unprofiled_bins: Vec<String>,
    /// Unprofiled trusted bins that are interpreter-like, sorted.
    pub unprofiled_interpreter_bins: Vec<String>,
}

impl SafeBinPolicy {
    /// Returns the profile for a binary name or path.
    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&SafeBinProfile> {
        self.profiles.get(&normalize_bin_name(name))
    }

    /// Returns `true` if the binary name or path is listed as a safe bin.
    #[must_use]
    pub fn is_listed(&self, name: &str) -> bool {
        self.trusted_bins.contains(&normalize_bin_name(name))
    }
}

/// Resolves the policy from the global and per-agent layers.
///
/// `safeBins` from the local layer replaces the global list; with neither set,
/// [`DEFAULT_SAFE_BINS`] apply. Built-in profiles are overridden by configured
/// ones. Trusted directories come from the baseline plus both layers' extra
/// directories, through `cache`.
#[instrument(skip_all)]
pub fn resolve_policy(
    global: Option<&SafeBinConfigLayer>,
    local: Option<&SafeBinConfigLayer>,
    cache: &TrustedDirCache,
) -> SafeBinPolicy {
    let listed: Vec<String> = match (
        local.and_then(|l| l.safe_bins.as_ref()),
        global.and_then(|g| g.safe_bins.as_ref()),
    ) {
        (Some(bins), _) | (None, Some(bins)) => bins.clone(),
        (None, None) => DEFAULT_SAFE_BINS.iter().map(|b| (*b).to_string()).collect(),
    };
    let trusted_bins: BTreeSet<String> = listed.iter().filter_map(|b| normalize_key(b)).collect();

    let mut profiles = builtin_profiles();
    let fixtures = merge_profile_fixtures(
        global.and_then(|g| g.safe_bin_profiles.as_ref()),
        local.and_then(|l| l.safe_bin_profiles.as_ref()),
    );
    for (name, fixture) in &fixtures {
        let mut profile = SafeBinProfile::from_config(name, fixture);
        // Value-taking flags are a property of the tool, not of the policy.
        if let Some(builtin) = profiles.get(name) {
            profile.value_flags = builtin.value_flags.clone();
        }
        profiles.insert(name.clone(), profile);
    }

    let extra_dirs: Vec<String> = [global, local]
        .into_iter()
        .flatten()
        .filter_map(|layer| layer.safe_bin_trusted_dirs.as_ref())
        .flatten()
        .cloned()
        .collect();
    let trusted_dirs = cache.get_trusted_safe_bin_dirs(&extra_dirs, false);

    let unprofiled_bins: Vec<String> = trusted_bins
        .iter()
        .filter(|bin| !profiles.contains_key(*bin))
        .cloned()
        .collect();
    let unprofiled_interpreter_bins: Vec<String> = unprofiled_bins
        .iter()
        .filter(|bin| is_interpreter_like(bin))
        .cloned()
        .collect();

    for bin in &unprofiled_interpreter_bins {
        warn!(
            bin = %bin,
            "Interpreter listed as safe bin without a profile; it will require approval"
        );
    }
    debug!(
        bins = trusted_bins.len(),
        profiles = profiles.len(),
        unprofiled = unprofiled_bins.len(),
        "Resolved safe-bin policy"
    );

    SafeBinPolicy {
        trusted_bins,
        profiles,
        trusted_dirs,
        unprofiled_bins,
        unprofiled_interpreter_bins,
    }
}

/// Empty profiles for every unprofiled, non-interpreter safe bin.
///
/// Interpreters are left out: an empty profile would trust them unconditionally.
#[must_use]
pub fn scaffold_missing_profiles(policy: &SafeBinPolicy) -> BTreeMap<String, SafeBinProfileConfig> {
    policy
        .unprofiled_bins
        .iter()
        .filter(|bin| !policy.unprofiled_interpreter_bins.contains(bin))
        .map(|bin| (bin.clone(), SafeBinProfileConfig::default()))
        .collect()
}

/// Outcome of [`evaluate_safe_bin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafeBinVerdict {
    /// May run without approval.
    Allowed,
    /// Not listed as a safe bin.
    NotListed,
    /// Listed, but an interpreter without a profile.
    UnprofiledInterpreter,
    /// Listed, but the path resolves to a binary with a different name.
    TargetMismatch { target: String },
    /// Listed, but not located in a trusted directory.
    UntrustedLocation,
    /// Listed, but the arguments fail its profile.
    ArgvRejected(ArgvViolation),
}

impl SafeBinVerdict {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

impl std::fmt::Display for SafeBinVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allowed => write!(f, "allowed as safe bin"),
            Self::NotListed => write!(f, "not a safe bin"),
            Self::UnprofiledInterpreter => write!(f, "interpreter without a safe-bin profile"),
            Self::TargetMismatch { target } => {
                write!(f, "executable resolves to a different binary ({target})")
            }
            Self::UntrustedLocation => {
                write!(f, "executable is outside the trusted bin directories")
            }
            Self::ArgvRejected(violation) => write!(f, "{violation}"),
        }
    }
}

/// Decides whether `executable` with `args` (program name excluded) may run
/// without approval.
///
/// The path is canonicalized once. Both the name the profile is chosen by and
/// the directory that must be trusted come from that one resolution, so a
/// symlink named after a safe bin cannot borrow its profile for another binary.
#[instrument(skip(policy, args), fields(executable = %executable.display(), args = args.len()))]
pub fn evaluate_safe_bin<S: AsRef<str>>(
    policy: &SafeBinPolicy,
    executable: &Path,
    args: &[S],
) -> SafeBinVerdict {
    let name = normalize_bin_name(&executable.to_string_lossy());
    let canonical = std::fs::canonicalize(executable).ok();
    let target = canonical
        .as_deref()
        .map(|path| normalize_bin_name(&path.to_string_lossy()));

    let verdict = if !policy.trusted_bins.contains(&name) {
        SafeBinVerdict::NotListed
    } else if policy.unprofiled_interpreter_bins.contains(&name) {
        SafeBinVerdict::UnprofiledInterpreter
    } else if let Some(target) = target.filter(|target| *target != name) {
        SafeBinVerdict::TargetMismatch { target }
    } else if !canonical
        .as_deref()
        .is_some_and(|path| policy.trusted_dirs.contains_executable(path))
    {
        SafeBinVerdict::UntrustedLocation
    } else {
        match policy.profiles.get(&name).map(|p| p.check_argv(args)) {
            Some(Err(violation)) => SafeBinVerdict::ArgvRejected(violation),
            Some(Ok(())) | None => SafeBinVerdict::Allowed,
        }
    };
    debug!(bin = %name, verdict = %verdict, "Evaluated safe bin");
    verdict
}
