// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The unpacked contents of an installer image.

use std::process::Command;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use super::InstallerLayout;
use crate::{
    ui::Ui,
    util::run_command_check_status,
    writable::{make_tree_read_only, remove_read_only_tree},
};

/// Where 7-Zip puts an image's El Torito boot records.
const EL_TORITO_DIR: &str = "[BOOT]";

/// A directory holding the unpacked contents of an installer image. Only one
/// run may work on a given tree at a time.
#[derive(Clone, Debug)]
pub struct WorkingTree {
    root: Utf8PathBuf,
    layout: InstallerLayout,
}

impl WorkingTree {
    /// Refers to an already-extracted tree.
    pub fn open(root: Utf8PathBuf, layout: InstallerLayout) -> Self {
        Self { root, layout }
    }

    /// Unpacks `image` into `root` with 7-Zip, then makes the whole tree
    /// read-only, as it would be on the original medium.
    ///
    /// `root` must not exist yet or must be empty.
    pub fn extract(
        image: &Utf8Path,
        root: Utf8PathBuf,
        layout: InstallerLayout,
        ui: &dyn Ui,
    ) -> anyhow::Result<Self> {
        ensure_fresh(&root)?;
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating {root}"))?;

        info!(%image, %root, "extracting installer image");
        run_command_check_status(
            Command::new("7z")
                .args(["x", "-y", &format!("-o{root}"), image.as_str()])
                .stdout(ui.stdout_target()),
            ui,
        )
        .with_context(|| format!("extracting {image}"))?;

        let tree = Self { root, layout };
        tree.remove_boot_records()?;
        tree.check_complete()?;
        make_tree_read_only(&tree.root)?;
        Ok(tree)
    }

    /// Fails unless every file the rest of the pipeline depends on is
    /// present.
    pub fn check_complete(&self) -> anyhow::Result<()> {
        let missing: Vec<&str> = self
            .layout
            .required_files()
            .into_iter()
            .filter(|rel| !self.root.join(rel).is_file())
            .collect();

        if !missing.is_empty() {
            anyhow::bail!(
                "extracted image at {} is incomplete; missing: {}",
                self.root,
                missing.join(", ")
            );
        }

        Ok(())
    }

    /// 7-Zip unpacks the El Torito boot images into a synthetic directory
    /// that is not part of the medium's file system. Leaving it would put it
    /// in the manifest and the repacked image.
    fn remove_boot_records(&self) -> anyhow::Result<()> {
        let dir = self.path(EL_TORITO_DIR);
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("removing {dir}"))?;
        }

        Ok(())
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn layout(&self) -> &InstallerLayout {
        &self.layout
    }

    /// Resolves a path relative to the root of the image.
    pub fn path(&self, rel: &str) -> Utf8PathBuf {
        self.root.join(rel)
    }

    /// Deletes the tree, including its read-only parts.
    pub fn remove(self) -> anyhow::Result<()> {
        remove_read_only_tree(&self.root)
    }
}

/// Deletes whatever an earlier run left at `root`, including read-only
/// directories. Returns whether anything was there.
pub fn remove_leftover(root: &Utf8Path) -> anyhow::Result<bool> {
    if !root.exists() {
        return Ok(false);
    }

    warn!(%root, "removing working tree left by an earlier run");
    remove_read_only_tree(root)?;
    Ok(true)
}

fn ensure_fresh(root: &Utf8Path) -> anyhow::Result<()> {
    if !root.exists() {
        return Ok(());
    }

    let mut entries = std::fs::read_dir(root)
        .with_context(|| format!("reading {root}"))?;
    if entries.next().is_some() {
        anyhow::bail!(
            "working tree {root} already has contents, probably left by an \
            earlier run; its directories are read-only, so pass --clean to \
            remove it or choose another work directory"
        );
    }

    Ok(())
}
