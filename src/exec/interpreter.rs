//! Interpreter-like binary classification.
//!
//! Interpreters run arbitrary code handed to them as arguments or on stdin,
//! so an allowlist entry alone never makes them safe to run unattended.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Kind of interpreter a binary name was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterClass {
    /// POSIX and non-POSIX command shells.
    Shell,
    /// General-purpose scripting runtimes.
    Scripting,
    /// Multi-call or embedded shells (busybox, toybox).
    Embedded,
    /// Text-processing languages that can run arbitrary programs.
    TextProgram,
}

/// Pattern table, matched against the normalized binary name.
///
/// Patterns are anchored. Shells and language runtimes accept a trailing
/// version suffix such as `3`, `3.12`, `-5.1` or `20`.
const INTERPRETER_PATTERNS: &[(&str, InterpreterClass)] = &[
    (r"^(a|ba|da|z|k|mk|c|tc|fi|ya|po|xon|o)?sh[0-9.]*$", InterpreterClass::Shell),
    (r"^(nu|elvish|ion|rc)$", InterpreterClass::Shell),
    (r"^(pwsh|powershell)(-preview)?$", InterpreterClass::Shell),
    (r"^cmd$", InterpreterClass::Shell),
    (r"^(python|pypy)[0-9.]*(-?(dbg|config))?$", InterpreterClass::Scripting),
    (r"^(node|nodejs|deno|bun|qjs|d8)[0-9.]*$", InterpreterClass::Scripting),
    (r"^(ruby|irb|jruby|truffleruby)[0-9.]*$", InterpreterClass::Scripting),
    (
        r"^(perl|php|lua|luajit|tclsh|wish|rscript|julia|guile|racket|osascript)[-0-9.]*$",
        InterpreterClass::Scripting,
    ),
    (r"^(sbcl|clisp|ecl|ghci|runghc|ocaml|swift)[0-9.]*$", InterpreterClass::Scripting),
    (
        r"^(kotlin|groovy|scala|java|jshell|elixir|erl|escript)[0-9.]*$",
        InterpreterClass::Scripting,
    ),
    (r"^(busybox|toybox)$", InterpreterClass::Embedded),
    (r"^(g|m|n)?awk$", InterpreterClass::TextProgram),
];

static COMPILED_PATTERNS: LazyLock<Vec<(Regex, InterpreterClass)>> = LazyLock::new(|| {
    INTERPRETER_PATTERNS
        .iter()
        .filter_map(|(pattern, class)| Regex::new(pattern).ok().map(|re| (re, *class)))
        .collect()
});

/// Normalizes an executable name or path for classification and policy lookups.
///
/// Takes the basename, strips a trailing `.exe`, trims and lower-cases.
#[must_use]
pub fn normalize_bin_name(name: &str) -> String {
    let trimmed = name.trim();
    let base = Path::new(trimmed)
        .file_name()
        .map_or_else(|| trimmed.to_string(), |n| n.to_string_lossy().into_owned());
    let lowered = base.to_ascii_lowercase();
    if let Some(stripped) = lowered.strip_suffix(".exe") {
        return stripped.to_string();
    }
    lowered
}

/// Classifies a binary name, returning `None` for non-interpreters.
#[must_use]
pub fn classify_interpreter(name: &str) -> Option<InterpreterClass> {
    let normalized = normalize_bin_name(name);
    if normalized.is_empty() {
        return None;
    }
    COMPILED_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(&normalized))
        .map(|(_, class)| *class)
}

/// Returns `true` if the binary can execute arbitrary embedded code.
#[must_use]
pub fn is_interpreter_like(name: &str) -> bool {
    classify_interpreter(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        assert_eq!(COMPILED_PATTERNS.len(), INTERPRETER_PATTERNS.len());
    }

    #[test]
    fn test_versioned_interpreters() {
        let names = [
            "python3.12",
            "python3",
            "python",
            "ruby3.2",
            "node20",
            "nodejs",
            "perl5.36",
            "lua5.4",
        ];
        for name in names {
            assert!(is_interpreter_like(name), "{name} should be interpreter-like");
        }
    }

    #[test]
    fn test_shells_and_embedded() {
        for name in ["bash", "bash5", "sh", "zsh", "dash", "fish", "pwsh", "busybox", "toybox"] {
            assert!(is_interpreter_like(name), "{name} should be interpreter-like");
        }
        assert_eq!(classify_interpreter("busybox"), Some(InterpreterClass::Embedded));
        assert_eq!(classify_interpreter("bash"), Some(InterpreterClass::Shell));
        assert_eq!(classify_interpreter("gawk"), Some(InterpreterClass::TextProgram));
    }

    #[test]
    fn test_plain_tools_are_not_interpreters() {
        let names = [
            "jq", "myfilter", "cut", "sed", "grep", "head", "shasum", "bashful", "", "   ",
        ];
        for name in names {
            assert!(!is_interpreter_like(name), "{name:?} should not be interpreter-like");
        }
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_bin_name("/usr/bin/Python3.EXE"), "python3");
        assert_eq!(normalize_bin_name("  JQ "), "jq");
        assert!(is_interpreter_like("C:/tools/node.exe"));
        assert!(is_interpreter_like("/usr/local/bin/python3.12"));
    }
}
