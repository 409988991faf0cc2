//! Resource loading and URI arithmetic.
//!
//! URIs are `/`-separated paths.  A leading `/` makes an include target
//! absolute (relative to the loader root); anything else is resolved against
//! the directory of the including template.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::LoadError;

/// Fetches template text by URI.
pub type ResourceLoader = Arc<dyn Fn(&str) -> Result<String, LoadError> + Send + Sync>;

/// Load from files under `root`.  URIs may not climb out of `root`.
pub fn file_loader(root: impl Into<PathBuf>) -> ResourceLoader {
    let root: PathBuf = root.into();
    Arc::new(move |uri: &str| {
        let rel = Path::new(uri.trim_start_matches('/'));
        if rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(LoadError::Forbidden);
        }
        let path = root.join(rel);
        debug!(path = %path.display(), "loading template file");
        std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoadError::NotFound,
            _ => LoadError::Io(e),
        })
    })
}

/// An in-memory loader; the returned map handle can be updated later.
pub fn memory_loader(
    entries: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
) -> (ResourceLoader, Arc<RwLock<HashMap<String, String>>>) {
    let map: HashMap<String, String> = entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    let map = Arc::new(RwLock::new(map));
    let handle = Arc::clone(&map);
    let loader: ResourceLoader = Arc::new(move |uri: &str| {
        map.read()
            .get(uri.trim_start_matches('/'))
            .cloned()
            .ok_or(LoadError::NotFound)
    });
    (loader, handle)
}

/// Resolve `target` against the URI of the template that references it.
pub fn resolve_relative(base: Option<&str>, target: &str) -> String {
    let joined = match (target.strip_prefix('/'), base) {
        (Some(abs), _) => abs.to_owned(),
        (None, Some(base)) => match base.rfind('/') {
            Some(i) => format!("{}/{target}", &base[..i]),
            None => target.to_owned(),
        },
        (None, None) => target.to_owned(),
    };
    let mut parts: Vec<&str> = Vec::new();
    for seg in joined.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Append `.ext` when the last path segment has no extension.
pub fn with_default_extension(uri: &str, ext: &str) -> String {
    let last = uri.rsplit('/').next().unwrap_or(uri);
    if ext.is_empty() || last.contains('.') {
        uri.to_owned()
    } else {
        format!("{uri}.{}", ext.trim_start_matches('.'))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_resolution() {
        assert_eq!(resolve_relative(Some("a/b/page.tpl"), "part.tpl"), "a/b/part.tpl");
        assert_eq!(resolve_relative(Some("a/b/page.tpl"), "../x.tpl"), "a/x.tpl");
        assert_eq!(resolve_relative(Some("a/b/page.tpl"), "/top.tpl"), "top.tpl");
        assert_eq!(resolve_relative(Some("page.tpl"), "./x"), "x");
        assert_eq!(resolve_relative(None, "x/y"), "x/y");
    }

    #[test]
    fn default_extension() {
        assert_eq!(with_default_extension("a/page", "tpl"), "a/page.tpl");
        assert_eq!(with_default_extension("a/page.html", "tpl"), "a/page.html");
        assert_eq!(with_default_extension("a.d/page", ".tpl"), "a.d/page.tpl");
        assert_eq!(with_default_extension("page", ""), "page");
    }

    #[test]
    fn memory_loader_is_updatable() {
        let (loader, handle) = memory_loader([("a.tpl", "A")]);
        assert_eq!(loader("a.tpl").unwrap(), "A");
        assert!(matches!(loader("b.tpl"), Err(LoadError::NotFound)));
        handle.write().insert("b.tpl".into(), "B".into());
        assert_eq!(loader("/b.tpl").unwrap(), "B");
    }

    #[test]
    fn file_loader_reads_and_confines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/x.tpl"), "hello").unwrap();
        let loader = file_loader(dir.path());
        assert_eq!(loader("sub/x.tpl").unwrap(), "hello");
        assert!(matches!(loader("missing.tpl"), Err(LoadError::NotFound)));
        assert!(matches!(loader("../etc/passwd"), Err(LoadError::Forbidden)));
    }
}
