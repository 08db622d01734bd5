//! Smart-diff test selection: turns the changed-file map and config flags
//! into the discovery runner's CLI arguments.

use testflow_core::{ChangeKind, Diff};

/// Inputs the selection policy depends on.
#[derive(Debug, Clone, Copy)]
pub struct SelectorInput<'a> {
    pub diff: &'a Diff,
    /// Whether a diff could be computed at all. An empty map with
    /// `diff_exists = true` is a genuinely empty diff (e.g. a PR whose net
    /// changes cancel out), not a missing one.
    pub diff_exists: bool,
    /// Whether the active config file path is itself a key in the diff.
    pub config_file_changed: bool,
    pub smart_run: bool,
}

/// Build the full discovery argument list.
///
/// Policy: a config change or `smart_run = false` forces full discovery
/// (no `--diff` arguments). A known-empty diff emits one bare `--diff`
/// sentinel. Otherwise one `--diff <path>` per non-removed entry, in
/// sorted order so invocations are deterministic.
pub fn discovery_args(input: SelectorInput<'_>, patterns: &[String], config_file: &str) -> Vec<String> {
    let mut args = vec!["--command".to_string(), "discover".to_string()];

    let discover_all = input.config_file_changed || !input.smart_run;
    if !discover_all {
        if input.diff.is_empty() && input.diff_exists {
            args.push("--diff".to_string());
        } else {
            let mut changed: Vec<&String> = input
                .diff
                .iter()
                .filter(|(_, kind)| **kind != ChangeKind::Removed)
                .map(|(path, _)| path)
                .collect();
            changed.sort();
            for path in changed {
                args.push("--diff".to_string());
                args.push(path.clone());
            }
        }
    }

    if !config_file.is_empty() {
        args.push("--config".to_string());
        args.push(config_file.to_string());
    }

    for pattern in patterns {
        args.push("--pattern".to_string());
        args.push(pattern.clone());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn diff(entries: &[(&str, ChangeKind)]) -> Diff {
        entries
            .iter()
            .map(|(path, kind)| (path.to_string(), *kind))
            .collect()
    }

    fn patterns() -> Vec<String> {
        vec!["**/*.test.ts".to_string()]
    }

    fn diff_args(args: &[String]) -> usize {
        args.iter().filter(|a| *a == "--diff").count()
    }

    #[test]
    fn test_config_change_forces_full_discovery() {
        let d = diff(&[("src/a.ts", ChangeKind::Modified)]);
        for smart_run in [true, false] {
            let args = discovery_args(
                SelectorInput {
                    diff: &d,
                    diff_exists: true,
                    config_file_changed: true,
                    smart_run,
                },
                &patterns(),
                "",
            );
            assert_eq!(diff_args(&args), 0, "smart_run = {smart_run}");
        }
    }

    #[test]
    fn test_smart_run_disabled_forces_full_discovery() {
        let d = diff(&[("src/a.ts", ChangeKind::Modified)]);
        let args = discovery_args(
            SelectorInput {
                diff: &d,
                diff_exists: true,
                config_file_changed: false,
                smart_run: false,
            },
            &patterns(),
            "",
        );
        assert_eq!(diff_args(&args), 0);
    }

    #[test]
    fn test_true_empty_diff_emits_bare_sentinel() {
        let d = HashMap::new();
        let args = discovery_args(
            SelectorInput {
                diff: &d,
                diff_exists: true,
                config_file_changed: false,
                smart_run: true,
            },
            &patterns(),
            "",
        );
        assert_eq!(diff_args(&args), 1);
        let diff_pos = args.iter().position(|a| a == "--diff").unwrap();
        // Bare sentinel: the next argument is a flag, not a path.
        assert!(args[diff_pos + 1].starts_with("--"));
    }

    #[test]
    fn test_missing_diff_discovers_all() {
        // diff computation failed: no sentinel, no paths.
        let d = HashMap::new();
        let args = discovery_args(
            SelectorInput {
                diff: &d,
                diff_exists: false,
                config_file_changed: false,
                smart_run: true,
            },
            &patterns(),
            "",
        );
        assert_eq!(diff_args(&args), 0);
    }

    #[test]
    fn test_removed_files_are_omitted() {
        let d = diff(&[("a.ts", ChangeKind::Modified), ("b.ts", ChangeKind::Removed)]);
        let args = discovery_args(
            SelectorInput {
                diff: &d,
                diff_exists: true,
                config_file_changed: false,
                smart_run: true,
            },
            &patterns(),
            "",
        );
        assert!(args.windows(2).any(|w| w[0] == "--diff" && w[1] == "a.ts"));
        assert!(!args.contains(&"b.ts".to_string()));
    }

    #[test]
    fn test_added_and_modified_both_selected() {
        let d = diff(&[("new.ts", ChangeKind::Added), ("old.ts", ChangeKind::Modified)]);
        let args = discovery_args(
            SelectorInput {
                diff: &d,
                diff_exists: true,
                config_file_changed: false,
                smart_run: true,
            },
            &patterns(),
            "",
        );
        assert_eq!(diff_args(&args), 2);
        assert!(args.contains(&"new.ts".to_string()));
        assert!(args.contains(&"old.ts".to_string()));
    }

    #[test]
    fn test_end_to_end_arg_shape() {
        let d = diff(&[("src/foo.ts", ChangeKind::Modified)]);
        let args = discovery_args(
            SelectorInput {
                diff: &d,
                diff_exists: true,
                config_file_changed: false,
                smart_run: true,
            },
            &patterns(),
            "",
        );
        assert_eq!(
            args,
            vec![
                "--command",
                "discover",
                "--diff",
                "src/foo.ts",
                "--pattern",
                "**/*.test.ts",
            ]
        );
    }

    #[test]
    fn test_module_config_file_forwarded() {
        let d = HashMap::new();
        let args = discovery_args(
            SelectorInput {
                diff: &d,
                diff_exists: false,
                config_file_changed: false,
                smart_run: false,
            },
            &patterns(),
            "jest.config.js",
        );
        assert!(args
            .windows(2)
            .any(|w| w[0] == "--config" && w[1] == "jest.config.js"));
    }

    #[test]
    fn test_every_pattern_emitted() {
        let d = HashMap::new();
        let many = vec!["a/**/*.ts".to_string(), "b/**/*.ts".to_string()];
        let args = discovery_args(
            SelectorInput {
                diff: &d,
                diff_exists: false,
                config_file_changed: false,
                smart_run: false,
            },
            &many,
            "",
        );
        assert_eq!(args.iter().filter(|a| *a == "--pattern").count(), 2);
    }
}
