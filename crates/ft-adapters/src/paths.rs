// SPDX-License-Identifier: MIT OR Apache-2.0
//! Path mapping between sandbox mounts, posix drive forms, and host paths.
//!
//! Agents running inside a container report paths under the mount point
//! (`/workspace/...`); agents on Windows may report `/c/Users/...` posix
//! drive forms or `\\?\`-prefixed extended paths. All of these are mapped
//! back to host paths before events are written.

use std::path::{Path, PathBuf};

/// Normalize a mount string: forward slashes, no trailing slash, leading `/`.
pub fn normalize_workspace_mount(workspace_mount: Option<&str>) -> Option<String> {
    let mount = workspace_mount?.trim().replace('\\', "/");
    let mount = mount.trim_end_matches('/');
    if mount.is_empty() {
        return None;
    }
    Some(if mount.starts_with('/') {
        mount.to_string()
    } else {
        format!("/{mount}")
    })
}

/// Strip the Windows extended-length prefix (`\\?\C:\...` → `C:\...`).
pub fn strip_windows_extended_prefix(path_str: &str) -> &str {
    path_str.strip_prefix(r"\\?\").unwrap_or(path_str)
}

/// Interpret `/c/Users/...` (posix drive form) as `C:/Users/...`.
pub fn maybe_windows_drive_posix_path(path_str: &str) -> Option<PathBuf> {
    let posixish = path_str.replace('\\', "/");
    let mut chars = posixish.chars();
    if chars.next() != Some('/') {
        return None;
    }
    let drive = chars.next()?;
    if !drive.is_ascii_alphabetic() {
        return None;
    }
    if chars.next() != Some('/') {
        return None;
    }
    let remainder: String = chars.collect();
    Some(PathBuf::from(format!(
        "{}:/{remainder}",
        drive.to_ascii_uppercase()
    )))
}

/// Map a path string the agent reported to a host path.
///
/// Posix drive forms win, then mount-relative rewrites, then the raw string
/// with any extended-length prefix stripped.
pub fn map_sandbox_path_str(
    path_str: &str,
    workspace_root: &Path,
    workspace_mount: Option<&str>,
) -> PathBuf {
    if let Some(win) = maybe_windows_drive_posix_path(path_str) {
        return win;
    }

    let Some(mount) = normalize_workspace_mount(workspace_mount) else {
        return PathBuf::from(strip_windows_extended_prefix(path_str));
    };

    let posixish = path_str.replace('\\', "/");
    if posixish == mount {
        return workspace_root.to_path_buf();
    }
    if let Some(rel) = posixish.strip_prefix(&format!("{mount}/")) {
        let mut out = workspace_root.to_path_buf();
        for part in rel.split('/').filter(|p| !p.is_empty()) {
            out.push(part);
        }
        return out;
    }

    PathBuf::from(strip_windows_extended_prefix(path_str))
}

/// Render a host path with forward slashes and a clean drive form
/// (`C://foo` → `C:/foo`).
pub fn render_path(path: &Path) -> String {
    let rendered = path.display().to_string().replace('\\', "/");
    let bytes = rendered.as_bytes();
    if bytes.len() > 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes[2] == b'/'
    {
        let rest = rendered[2..].trim_start_matches('/');
        return format!("{}:/{rest}", &rendered[..1]);
    }
    rendered
}

/// Render `path` relative to `root` when it is inside it, posix-style.
pub fn safe_relpath(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => render_path(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_normalization() {
        assert_eq!(
            normalize_workspace_mount(Some("/workspace/")),
            Some("/workspace".to_string())
        );
        assert_eq!(
            normalize_workspace_mount(Some("workspace")),
            Some("/workspace".to_string())
        );
        assert_eq!(normalize_workspace_mount(Some("  ")), None);
        assert_eq!(normalize_workspace_mount(None), None);
    }

    #[test]
    fn posix_drive_form_maps_to_windows_drive() {
        assert_eq!(
            maybe_windows_drive_posix_path("/c/Users/dev/proj"),
            Some(PathBuf::from("C:/Users/dev/proj"))
        );
        assert_eq!(maybe_windows_drive_posix_path("/workspace/src"), None);
        assert_eq!(maybe_windows_drive_posix_path("relative/path"), None);
    }

    #[test]
    fn mount_paths_rewrite_to_host_root() {
        let root = Path::new("/home/dev/work");
        assert_eq!(
            map_sandbox_path_str("/workspace", root, Some("/workspace")),
            PathBuf::from("/home/dev/work")
        );
        assert_eq!(
            map_sandbox_path_str("/workspace/src/lib.rs", root, Some("/workspace")),
            PathBuf::from("/home/dev/work/src/lib.rs")
        );
    }

    #[test]
    fn non_mount_paths_pass_through() {
        let root = Path::new("/home/dev/work");
        assert_eq!(
            map_sandbox_path_str("/etc/hosts", root, Some("/workspace")),
            PathBuf::from("/etc/hosts")
        );
    }

    #[test]
    fn extended_prefix_is_stripped() {
        let root = Path::new("/home/dev/work");
        assert_eq!(
            map_sandbox_path_str(r"\\?\C:\Users\dev", root, None),
            PathBuf::from(r"C:\Users\dev")
        );
    }

    #[test]
    fn drive_form_beats_mount_mapping() {
        let root = Path::new("/home/dev/work");
        assert_eq!(
            map_sandbox_path_str("/c/Users/dev/x.txt", root, Some("/workspace")),
            PathBuf::from("C:/Users/dev/x.txt")
        );
    }

    #[test]
    fn render_cleans_drive_doubles() {
        assert_eq!(render_path(Path::new("C://Users//dev")), "C:/Users//dev");
        assert_eq!(render_path(Path::new("/plain/posix")), "/plain/posix");
    }

    #[test]
    fn relpath_inside_and_outside_root() {
        let root = Path::new("/work");
        assert_eq!(safe_relpath(Path::new("/work/a/b.txt"), root), "a/b.txt");
        assert_eq!(safe_relpath(Path::new("/other/c.txt"), root), "/other/c.txt");
    }
}
