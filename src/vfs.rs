//! The VFS jail (§4.?, §6.3): translates NT-style guest paths to a real host directory,
//! rejecting any attempt to leave it.

use crate::error::{VfsError, VfsResult};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use widestring::U16Str;

/// Maps drive letters to host directories, as parsed from the CLI's `-X: <dir>` flags (§6.6).
#[derive(Clone, Debug, Default)]
pub struct DriveMap {
    drives: HashMap<char, PathBuf>,
}

impl DriveMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// `letter` is normalized to uppercase.
    pub fn insert(&mut self, letter: char, root: PathBuf) {
        self.drives.insert(letter.to_ascii_uppercase(), root);
    }

    pub fn get(&self, letter: char) -> Option<&Path> {
        self.drives.get(&letter.to_ascii_uppercase()).map(PathBuf::as_path)
    }
}

/// A single drive's jail: guest paths under this drive letter are confined to `root` on the
/// host.
pub struct VfsJail {
    root: PathBuf,
}

impl VfsJail {
    /// `root` must already exist and be a directory.
    pub fn new(root: impl Into<PathBuf>) -> VfsResult<Self> {
        let root = root.into();
        let canonical = fs::canonicalize(&root).map_err(VfsError::Io)?;
        if !canonical.is_dir() {
            return Err(VfsError::InvalidJailRoot(canonical.display().to_string()));
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Translates an NT path (already stripped of its drive letter, or with one present — both
    /// are accepted) into a host path confined to this jail.
    ///
    /// Per §6.3: drop a `\??\` prefix, drop a leading drive letter, convert `\` to `/`, resolve
    /// `.`/`..` without leaving the root, reject `\Device\` and UNC paths.
    pub fn translate(&self, nt_path: &str) -> VfsResult<PathBuf> {
        let mut rest = nt_path;

        if let Some(stripped) = rest.strip_prefix(r"\??\") {
            rest = stripped;
        }

        if rest.starts_with(r"\\") {
            return Err(VfsError::UnsupportedPathForm);
        }
        if starts_with_device_prefix(rest) {
            return Err(VfsError::UnsupportedPathForm);
        }

        let mut chars = rest.chars();
        let is_drive_letter = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
            && chars.next() == Some(':');
        if is_drive_letter {
            rest = &rest[2..];
        }

        let normalized = rest.replace('\\', "/");
        let mut components: Vec<&str> = Vec::new();
        for part in normalized.split('/') {
            match part {
                "" | "." => continue,
                ".." => {
                    if components.pop().is_none() {
                        return Err(VfsError::Escape);
                    }
                }
                other => components.push(other),
            }
        }

        let mut host_path = self.root.clone();
        host_path.extend(components);
        Ok(host_path)
    }

    /// Translates a guest `UNICODE_STRING`'s wide-character contents directly, for syscall
    /// handlers that read the buffer out of guest memory themselves.
    pub fn translate_wide(&self, wide: &U16Str) -> VfsResult<PathBuf> {
        let lossy = wide.to_string_lossy();
        self.translate(&lossy)
    }

    /// Confirms that `host_path` (or, for a not-yet-existing file, its parent) still resolves
    /// inside the jail root after symlink resolution. `translate` alone cannot catch an escape
    /// introduced by a symlink already present on the host filesystem.
    pub fn check_contains(&self, host_path: &Path) -> VfsResult<()> {
        let resolved = match fs::canonicalize(host_path) {
            Ok(p) => p,
            Err(_) => {
                let parent = host_path.parent().ok_or(VfsError::Escape)?;
                fs::canonicalize(parent).map_err(|_| VfsError::Escape)?
            }
        };

        if resolved.starts_with(&self.root) {
            Ok(())
        } else {
            warn!("vfs: path {} resolves outside jail root {}", resolved.display(), self.root.display());
            Err(VfsError::Escape)
        }
    }

    /// Translates and verifies a path in one call; the form most syscall handlers want.
    pub fn resolve(&self, nt_path: &str) -> VfsResult<PathBuf> {
        let host_path = self.translate(nt_path)?;
        self.check_contains(&host_path)?;
        debug!("vfs: '{}' -> {}", nt_path, host_path.display());
        Ok(host_path)
    }
}

fn starts_with_device_prefix(rest: &str) -> bool {
    let trimmed = rest.strip_prefix('\\').unwrap_or(rest);
    trimmed.len() >= 7 && trimmed[..6].eq_ignore_ascii_case("Device") && trimmed.as_bytes()[6] == b'\\'
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn jail() -> (tempfile::TempDir, VfsJail) {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("windows/system32")).unwrap();
        let jail = VfsJail::new(dir.path()).unwrap();
        (dir, jail)
    }

    #[test]
    fn strips_nt_prefix_and_drive_letter() {
        let (_dir, jail) = jail();
        let p = jail.translate(r"\??\C:\windows\system32\ntdll.dll").unwrap();
        assert_eq!(p, jail.root().join("windows/system32/ntdll.dll"));
    }

    #[test]
    fn rejects_escape_attempts() {
        let (_dir, jail) = jail();
        assert!(matches!(jail.translate(r"C:\..\..\etc\passwd"), Err(VfsError::Escape)));
    }

    #[test]
    fn rejects_device_paths() {
        let (_dir, jail) = jail();
        assert!(matches!(jail.translate(r"\Device\HarddiskVolume1\foo"), Err(VfsError::UnsupportedPathForm)));
    }

    #[test]
    fn rejects_unc_paths() {
        let (_dir, jail) = jail();
        assert!(matches!(jail.translate(r"\\server\share\foo"), Err(VfsError::UnsupportedPathForm)));
    }

    #[test]
    fn resolves_dot_dot_within_bounds() {
        let (_dir, jail) = jail();
        let p = jail.translate(r"C:\windows\system32\..\system32\ntdll.dll").unwrap();
        assert_eq!(p, jail.root().join("windows/system32/ntdll.dll"));
    }

    #[test]
    fn resolve_checks_existing_file_stays_inside_jail() {
        let (dir, jail) = jail();
        fs::write(dir.path().join("windows/system32/ntdll.dll"), b"MZ").unwrap();
        let resolved = jail.resolve(r"C:\windows\system32\ntdll.dll").unwrap();
        assert!(resolved.starts_with(jail.root()));
    }
}
