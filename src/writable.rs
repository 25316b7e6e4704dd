// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scoped write access to files and directories in an otherwise read-only
//! tree.

use std::{fs, fs::Permissions, os::unix::fs::PermissionsExt};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

/// Grants the owner write permission on a path for as long as the guard
/// lives. Dropping the guard puts the path's original mode back.
///
/// Failing to grant access is an error; failing to restore it is only logged,
/// since the restored mode has no bearing on whether the image boots.
#[derive(Debug)]
pub struct Writable {
    path: Utf8PathBuf,
    original: Permissions,
}

impl Writable {
    pub fn acquire(path: &Utf8Path) -> anyhow::Result<Self> {
        let original = fs::metadata(path)
            .with_context(|| format!("reading permissions of {path}"))?
            .permissions();

        let mode = original.mode();
        if mode & 0o200 == 0 {
            fs::set_permissions(path, Permissions::from_mode(mode | 0o200))
                .with_context(|| format!("making {path} writable"))?;
            debug!(%path, "unlocked (mode {:o})", mode & 0o7777);
        }

        Ok(Self { path: path.to_owned(), original })
    }

    /// Acquires write access to `path` and to the directory that contains
    /// it, for operations that replace the file with a new one. The returned
    /// guards restore the file before the directory.
    pub fn acquire_with_parent(
        path: &Utf8Path,
    ) -> anyhow::Result<(Writable, Writable)> {
        let parent = path
            .parent()
            .with_context(|| format!("{path} has no parent directory"))?;
        let dir = Writable::acquire(parent)?;
        let file = Writable::acquire(path)?;
        Ok((file, dir))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for Writable {
    fn drop(&mut self) {
        if let Err(e) = fs::set_permissions(&self.path, self.original.clone())
        {
            warn!(
                path = %self.path,
                "failed to restore original permissions: {e}"
            );
        }
    }
}

/// Removes write permission from every file and directory under `root`,
/// without following symbolic links.
pub fn make_tree_read_only(root: &Utf8Path) -> anyhow::Result<()> {
    // Directories are visited after their contents so that clearing a
    // directory's write bit never blocks changes inside it.
    for entry in walkdir::WalkDir::new(root).contents_first(true) {
        let entry = entry.with_context(|| format!("walking {root}"))?;
        if entry.path_is_symlink() {
            continue;
        }

        let meta = entry.metadata().with_context(|| {
            format!("reading metadata of {}", entry.path().display())
        })?;
        let mode = meta.permissions().mode();
        fs::set_permissions(entry.path(), Permissions::from_mode(mode & !0o222))
            .with_context(|| {
                format!("making {} read-only", entry.path().display())
            })?;
    }

    Ok(())
}

/// Removes a tree previously made read-only by `make_tree_read_only`.
pub fn remove_read_only_tree(root: &Utf8Path) -> anyhow::Result<()> {
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.with_context(|| format!("walking {root}"))?;
        if entry.file_type().is_dir() {
            let mode = entry
                .metadata()
                .with_context(|| {
                    format!("reading metadata of {}", entry.path().display())
                })?
                .permissions()
                .mode();
            fs::set_permissions(entry.path(), Permissions::from_mode(mode | 0o700))
                .with_context(|| {
                    format!("making {} writable", entry.path().display())
                })?;
        }
    }

    fs::remove_dir_all(root).with_context(|| format!("removing {root}"))
}

#[cfg(test)]
mod test {
    use super::*;

    fn mode_of(path: &Utf8Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn guard_restores_original_mode() {
        let (_dir, root) = scratch();
        let file = root.join("file");
        fs::write(&file, b"data").unwrap();
        fs::set_permissions(&file, Permissions::from_mode(0o444)).unwrap();

        {
            let guard = Writable::acquire(&file).unwrap();
            assert_eq!(guard.path(), file);
            assert_eq!(mode_of(&file), 0o644);
            fs::write(&file, b"changed").unwrap();
        }

        assert_eq!(mode_of(&file), 0o444);
        assert_eq!(fs::read(&file).unwrap(), b"changed");
    }

    #[test]
    fn guard_leaves_writable_paths_alone() {
        let (_dir, root) = scratch();
        let file = root.join("file");
        fs::write(&file, b"data").unwrap();
        fs::set_permissions(&file, Permissions::from_mode(0o640)).unwrap();

        drop(Writable::acquire(&file).unwrap());
        assert_eq!(mode_of(&file), 0o640);
    }

    #[test]
    fn guard_restores_mode_on_replaced_file() {
        let (_dir, root) = scratch();
        let sub = root.join("sub");
        fs::create_dir(&sub).unwrap();
        let file = sub.join("file");
        fs::write(&file, b"old").unwrap();
        fs::set_permissions(&file, Permissions::from_mode(0o444)).unwrap();
        fs::set_permissions(&sub, Permissions::from_mode(0o555)).unwrap();

        {
            let _guards = Writable::acquire_with_parent(&file).unwrap();
            let tmp = sub.join("file.tmp");
            fs::write(&tmp, b"new").unwrap();
            fs::rename(&tmp, &file).unwrap();
        }

        assert_eq!(mode_of(&file), 0o444);
        assert_eq!(mode_of(&sub), 0o555);
        assert_eq!(fs::read(&file).unwrap(), b"new");

        fs::set_permissions(&sub, Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn acquiring_a_missing_path_fails() {
        let (_dir, root) = scratch();
        assert!(Writable::acquire(&root.join("nope")).is_err());
    }

    #[test]
    fn read_only_tree_can_be_removed() {
        let (_dir, root) = scratch();
        let tree = root.join("tree");
        fs::create_dir_all(tree.join("a/b")).unwrap();
        fs::write(tree.join("a/b/c"), b"c").unwrap();
        fs::write(tree.join("top"), b"t").unwrap();

        make_tree_read_only(&tree).unwrap();
        assert_eq!(mode_of(&tree.join("a/b/c")) & 0o222, 0);
        assert_eq!(mode_of(&tree.join("a")) & 0o222, 0);
        assert!(fs::write(tree.join("a/new"), b"x").is_err() || is_root());

        remove_read_only_tree(&tree).unwrap();
        assert!(!tree.exists());
    }

    // Permission checks don't apply to the superuser.
    fn is_root() -> bool {
        std::process::Command::new("id")
            .arg("-u")
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
            .unwrap_or(false)
    }
}
