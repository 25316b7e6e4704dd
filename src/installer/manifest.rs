// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `md5sum.txt` manifest the installer checks the medium against.
//!
//! Entries use the same form the stock image does, the output of
//! `find . -follow -type f ! -name md5sum.txt | xargs md5sum`: one line per
//! file, `<md5>  ./<path>`.

use std::collections::BTreeMap;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use super::tree::WorkingTree;
use crate::{
    util::{md5_file, md5_hex},
    writable::Writable,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    /// `./`-prefixed relative path to MD5.
    entries: BTreeMap<String, String>,
}

impl Manifest {
    /// Hashes every regular file under `root`, following symbolic links,
    /// except the manifest itself.
    pub fn compute(root: &Utf8Path, manifest: &str) -> anyhow::Result<Self> {
        let mut entries = BTreeMap::new();
        let walker = walkdir::WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                // Installer images carry links such as `debian -> .`; find
                // skips the cycles they create, and so do we.
                Err(e) if e.loop_ancestor().is_some() => {
                    debug!("skipping filesystem loop: {e}");
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("walking {root}"))
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = Utf8PathBuf::try_from(entry.into_path())
                .context("non-UTF-8 path in working tree")?;
            let rel = path
                .strip_prefix(root)
                .with_context(|| format!("{path} is outside {root}"))?;
            if rel == manifest {
                continue;
            }

            entries.insert(format!("./{rel}"), md5_file(&path)?);
        }

        Ok(Self { entries })
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut entries = BTreeMap::new();
        for (n, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }

            let (digest, path) = line
                .split_once("  ")
                .with_context(|| format!("malformed manifest line {}", n + 1))?;
            entries.insert(path.to_owned(), digest.to_owned());
        }

        Ok(Self { entries })
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(path, digest)| format!("{digest}  {path}\n"))
            .collect()
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Recomputes the manifest for `tree` and writes it over the old one. Returns
/// the MD5 of the manifest file as written, which the repackaging step uses
/// to confirm it is packing the tree this manifest describes.
pub fn regenerate(tree: &WorkingTree) -> anyhow::Result<String> {
    let name = tree.layout().manifest;
    let manifest = Manifest::compute(tree.root(), name)?;
    if manifest.is_empty() {
        anyhow::bail!("{} has no files to list in {name}", tree.root());
    }
    let text = manifest.render();

    let path = tree.path(name);
    let _guard = Writable::acquire(&path)?;
    std::fs::write(&path, &text)
        .with_context(|| format!("writing {path}"))?;

    debug!(%path, entries = manifest.len(), "regenerated manifest");
    Ok(md5_hex(text.as_bytes()))
}

/// Compares the manifest in `tree` with the tree's current contents and
/// returns the paths whose entries are missing, stale, or extra.
pub fn stale_entries(tree: &WorkingTree) -> anyhow::Result<Vec<String>> {
    let name = tree.layout().manifest;
    let path = tree.path(name);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {path}"))?;
    let recorded = Manifest::parse(&text)?;
    let actual = Manifest::compute(tree.root(), name)?;

    let mut stale: Vec<String> = actual
        .entries
        .iter()
        .filter(|(p, d)| recorded.entries.get(*p) != Some(*d))
        .map(|(p, _)| p.clone())
        .collect();
    stale.extend(
        recorded
            .entries
            .keys()
            .filter(|p| !actual.entries.contains_key(*p))
            .cloned(),
    );

    if !stale.is_empty() {
        warn!(count = stale.len(), "manifest does not match tree");
    }

    Ok(stale)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        installer::{testutil::stub_tree, InstallerLayout},
        writable::{make_tree_read_only, remove_read_only_tree},
    };

    fn stub() -> (tempfile::TempDir, WorkingTree) {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let root = stub_tree(&base);
        (dir, WorkingTree::open(root, InstallerLayout::default()))
    }

    fn regular_files(root: &Utf8Path) -> Vec<String> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap();
                format!("./{}", rel.to_str().unwrap())
            })
            .filter(|p| p != "./md5sum.txt")
            .collect()
    }

    #[test]
    fn tree_with_only_a_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().join("tree")).unwrap();
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("md5sum.txt"), b"").unwrap();

        let tree = WorkingTree::open(root, InstallerLayout::default());
        let err = regenerate(&tree).unwrap_err().to_string();
        assert!(err.contains("no files"), "{err}");
    }

    #[test]
    fn covers_every_file_except_itself() {
        let (_dir, tree) = stub();
        let digest = regenerate(&tree).unwrap();

        let text = std::fs::read_to_string(tree.path("md5sum.txt")).unwrap();
        assert_eq!(digest, md5_hex(text.as_bytes()));
        let manifest = Manifest::parse(&text).unwrap();

        let mut expected = regular_files(tree.root());
        expected.sort();
        let listed: Vec<String> = manifest.entries().keys().cloned().collect();
        assert_eq!(listed, expected);
        assert!(!manifest.entries().contains_key("./md5sum.txt"));

        for (path, digest) in manifest.entries() {
            let on_disk = tree.root().join(path.trim_start_matches("./"));
            assert_eq!(&md5_file(&on_disk).unwrap(), digest, "{path}");
        }
        assert!(stale_entries(&tree).unwrap().is_empty());
    }

    #[test]
    fn lines_use_two_space_separator() {
        let (_dir, tree) = stub();
        regenerate(&tree).unwrap();
        let text = std::fs::read_to_string(tree.path("md5sum.txt")).unwrap();
        let readme = text
            .lines()
            .find(|l| l.ends_with("./README.txt"))
            .unwrap()
            .to_string();
        assert_eq!(
            readme,
            format!("{}  ./README.txt", md5_hex(b"Debian GNU/Linux\n"))
        );
    }

    #[test]
    fn follows_links_and_skips_loops() {
        let (_dir, tree) = stub();
        std::os::unix::fs::symlink(".", tree.path("debian")).unwrap();
        std::os::unix::fs::symlink("README.txt", tree.path("README")).unwrap();

        let manifest = Manifest::compute(tree.root(), "md5sum.txt").unwrap();
        assert_eq!(
            manifest.entries().get("./README"),
            manifest.entries().get("./README.txt")
        );
        assert!(manifest.entries().keys().all(|p| !p.starts_with("./debian/")));
    }

    #[test]
    fn detects_changes_made_after_regeneration() {
        let (_dir, tree) = stub();
        regenerate(&tree).unwrap();
        std::fs::write(tree.path("README.txt"), b"changed").unwrap();
        std::fs::write(tree.path("NEW.txt"), b"new").unwrap();

        let stale = stale_entries(&tree).unwrap();
        assert_eq!(stale, vec!["./NEW.txt".to_string(), "./README.txt".to_string()]);
    }

    #[test]
    fn rewrites_read_only_manifest_and_relocks_it() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, tree) = stub();
        make_tree_read_only(tree.root()).unwrap();
        regenerate(&tree).unwrap();

        let mode = std::fs::metadata(tree.path("md5sum.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o222, 0);
        remove_read_only_tree(tree.root()).unwrap();
    }
}
