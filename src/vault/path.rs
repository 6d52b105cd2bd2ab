//! Canonical Vault path resolution
//!
//! Every remote address is `<mount>/<subresource-type>/<name>`. Resolution is
//! pure: the same inputs always yield the same path, and inputs that could
//! escape the mount (`..`, empty segments, stray separators) are rejected.

use std::fmt;

use crate::error::{Error, Result};

/// Canonical remote address of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VaultPath(String);

impl VaultPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VaultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VaultPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolve the remote path for an object
///
/// `base_path` may span several segments (`auth/kubernetes`); one leading and
/// one trailing `/` are normalized away. `subresource` is a single segment,
/// or empty to address `<base>/<name>` directly. `name` is a single segment.
pub fn resolve(base_path: &str, subresource: &str, name: &str) -> Result<VaultPath> {
    let base = normalize_base(base_path)?;

    if !subresource.is_empty() {
        validate_segment(subresource, "subresource")?;
    }
    validate_segment(name, "name")?;

    let path = if subresource.is_empty() {
        format!("{base}/{name}")
    } else {
        format!("{base}/{subresource}/{name}")
    };
    Ok(VaultPath(path))
}

fn normalize_base(base_path: &str) -> Result<&str> {
    let trimmed = base_path.strip_prefix('/').unwrap_or(base_path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);

    if trimmed.is_empty() {
        return Err(Error::InvalidPath("base path must not be empty".to_string()));
    }

    for segment in trimmed.split('/') {
        validate_segment(segment, "base path").map_err(|_| {
            Error::InvalidPath(format!(
                "base path '{base_path}' contains an invalid segment '{segment}'"
            ))
        })?;
    }
    Ok(trimmed)
}

fn validate_segment(segment: &str, what: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::InvalidPath(format!("{what} segment is empty")));
    }
    if segment == "." || segment == ".." {
        return Err(Error::InvalidPath(format!(
            "{what} segment '{segment}' is not allowed"
        )));
    }
    if let Some(c) = segment.chars().find(|c| !is_allowed(*c)) {
        return Err(Error::InvalidPath(format!(
            "{what} segment '{segment}' contains disallowed character {c:?}"
        )));
    }
    Ok(())
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '+' | ':' | '=')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_static_role() {
        let path = resolve("database", "static-roles", "alice").unwrap();
        assert_eq!(path.as_str(), "database/static-roles/alice");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let a = resolve("db", "roles", "reader").unwrap();
        let b = resolve("db", "roles", "reader").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_resolve_multi_segment_base() {
        let path = resolve("auth/kubernetes", "role", "app").unwrap();
        assert_eq!(path.as_str(), "auth/kubernetes/role/app");
    }

    #[test]
    fn test_resolve_normalizes_single_separators() {
        let path = resolve("/database/", "static-roles", "alice").unwrap();
        assert_eq!(path.as_str(), "database/static-roles/alice");
    }

    #[test]
    fn test_resolve_without_subresource() {
        let path = resolve("sys/mounts", "", "kv").unwrap();
        assert_eq!(path.as_str(), "sys/mounts/kv");
    }

    #[test]
    fn test_resolve_rejects_empty_base() {
        assert!(matches!(
            resolve("", "static-roles", "alice"),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            resolve("/", "static-roles", "alice"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        assert!(resolve("../sys", "roles", "a").is_err());
        assert!(resolve("db/../sys", "roles", "a").is_err());
        assert!(resolve("db", "..", "a").is_err());
        assert!(resolve("db", "roles", "..").is_err());
        assert!(resolve("db/./x", "roles", "a").is_err());
    }

    #[test]
    fn test_resolve_rejects_extra_separators() {
        assert!(resolve("//db", "roles", "a").is_err());
        assert!(resolve("db//", "roles", "a").is_err());
        assert!(resolve("db//x", "roles", "a").is_err());
        assert!(resolve("db", "roles/extra", "a").is_err());
        assert!(resolve("db", "roles", "a/b").is_err());
    }

    #[test]
    fn test_resolve_rejects_disallowed_characters() {
        assert!(resolve("db base", "roles", "a").is_err());
        assert!(resolve("db", "roles", "a?b").is_err());
        assert!(resolve("db\n", "roles", "a").is_err());
        assert!(resolve("db", "roles", "").is_err());
    }
}
