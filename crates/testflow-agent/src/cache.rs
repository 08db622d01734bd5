//! Cache key policy.

/// Scope the configured cache key to its org and repo.
///
/// Pure and deterministic: identical inputs always produce identical keys,
/// so a re-upload under the same key is an overwrite.
pub fn cache_key(org_id: &str, repo_id: &str, configured_key: &str) -> String {
    format!("{org_id}/{repo_id}/{configured_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shape() {
        assert_eq!(
            cache_key("org-1", "repo-9", "node-modules-v2"),
            "org-1/repo-9/node-modules-v2"
        );
    }

    #[test]
    fn test_deterministic() {
        let a = cache_key("org", "repo", "key");
        let b = cache_key("org", "repo", "key");
        assert_eq!(a, b);
    }

    #[test]
    fn test_scoping_distinguishes_repos() {
        assert_ne!(
            cache_key("org", "repo-a", "key"),
            cache_key("org", "repo-b", "key")
        );
    }
}
