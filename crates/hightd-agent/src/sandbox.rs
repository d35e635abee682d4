use std::path::{Component, Path, PathBuf};

/// Why a user-supplied path was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    /// The path would resolve outside the server's sandbox directory.
    Escape,
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathError::Escape => write!(f, "path escapes the server directory"),
        }
    }
}

impl std::error::Error for PathError {}

/// The per-server directory that bounds every file operation.
pub fn server_root(base: &Path, server_id: &str) -> PathBuf {
    base.join(server_id)
}

/// Resolve a user-supplied path to an absolute host path inside the
/// server's sandbox. Purely lexical: backslashes become slashes, leading
/// separators are stripped, `.` segments vanish and any `..` segment is
/// refused outright. Symlinks are never followed here.
pub fn resolve(base: &Path, server_id: &str, user_path: &str) -> Result<PathBuf, PathError> {
    resolve_in(&server_root(base, server_id), user_path)
}

/// Same confinement, against an already-known sandbox root.
pub fn resolve_in(root: &Path, user_path: &str) -> Result<PathBuf, PathError> {
    let root = root.to_path_buf();

    let normalized = user_path.replace('\\', "/");
    let trimmed = normalized.trim();
    if trimmed.is_empty() || trimmed == "/" || trimmed == "." {
        return Ok(root);
    }

    // Drive-letter prefixes ("C:/x") and rooted inputs are treated as
    // sandbox-relative once the prefix is gone.
    let mut rest = trimmed;
    if rest.len() >= 2 && rest.as_bytes()[1] == b':' && rest.as_bytes()[0].is_ascii_alphabetic() {
        rest = &rest[2..];
    }
    let rest = rest.trim_start_matches('/');

    let mut out = root.clone();
    for c in Path::new(rest).components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err(PathError::Escape),
            Component::Prefix(_) | Component::RootDir => return Err(PathError::Escape),
        }
    }

    if !out.starts_with(&root) {
        return Err(PathError::Escape);
    }
    Ok(out)
}

/// Map an absolute host path back to the `/`-rooted view a client sees.
pub fn virtualize(base: &Path, server_id: &str, abs: &Path) -> String {
    virtualize_in(&server_root(base, server_id), abs)
}

/// Same mapping, against an already-known sandbox root.
pub fn virtualize_in(root: &Path, abs: &Path) -> String {
    match abs.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
        Ok(rel) => format!("/{}", rel.to_string_lossy().replace('\\', "/")),
        Err(_) => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PathBuf {
        PathBuf::from("/srv/hightd")
    }

    #[test]
    fn empty_slash_and_dot_resolve_to_root() {
        for p in ["", "/", "."] {
            assert_eq!(resolve(&base(), "s1", p).unwrap(), base().join("s1"));
        }
    }

    #[test]
    fn relative_paths_land_inside_the_root() {
        assert_eq!(
            resolve(&base(), "s1", "world/region.dat").unwrap(),
            base().join("s1").join("world").join("region.dat")
        );
    }

    #[test]
    fn leading_separators_are_stripped() {
        assert_eq!(
            resolve(&base(), "s1", "//etc/config").unwrap(),
            base().join("s1").join("etc").join("config")
        );
    }

    #[test]
    fn backslashes_normalize_to_slashes() {
        assert_eq!(
            resolve(&base(), "s1", "plugins\\essentials\\config.yml").unwrap(),
            base()
                .join("s1")
                .join("plugins")
                .join("essentials")
                .join("config.yml")
        );
    }

    #[test]
    fn parent_segments_are_rejected() {
        assert_eq!(
            resolve(&base(), "s1", "../../../etc/passwd"),
            Err(PathError::Escape)
        );
        assert_eq!(resolve(&base(), "s1", "a/../b"), Err(PathError::Escape));
        assert_eq!(resolve(&base(), "s1", "a/.."), Err(PathError::Escape));
    }

    #[test]
    fn drive_letter_inputs_are_contained() {
        assert_eq!(
            resolve(&base(), "s1", "C:\\data\\save.dat").unwrap(),
            base().join("s1").join("data").join("save.dat")
        );
        assert_eq!(
            resolve(&base(), "s1", "C:/../../x"),
            Err(PathError::Escape)
        );
    }

    #[test]
    fn dot_segments_collapse() {
        assert_eq!(
            resolve(&base(), "s1", "./a/./b").unwrap(),
            base().join("s1").join("a").join("b")
        );
    }

    #[test]
    fn virtualize_inverts_resolve() {
        let abs = resolve(&base(), "s1", "a/b.txt").unwrap();
        assert_eq!(virtualize(&base(), "s1", &abs), "/a/b.txt");
        assert_eq!(virtualize(&base(), "s1", &base().join("s1")), "/");
    }

    #[test]
    fn resolved_paths_are_descendants_of_the_root() {
        let root = server_root(&base(), "s1");
        for p in ["x", "a/b/c", "/x/y", "C:/z", ".", ""] {
            let got = resolve(&base(), "s1", p).unwrap();
            assert!(got.starts_with(&root), "{p:?} -> {got:?}");
        }
    }
}
