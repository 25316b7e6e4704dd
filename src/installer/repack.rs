// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packs a working tree back into a bootable ISO image.

use std::process::Command;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use super::{manifest, tree::WorkingTree, InstallerLayout};
use crate::{
    ui::Ui,
    util::{md5_file, run_command_check_status},
    writable::Writable,
};

/// ISO 9660 limits volume identifiers to 32 characters.
const MAX_LABEL_LEN: usize = 32;

/// El Torito settings for the output image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootParameters {
    /// Boot image, relative to the root of the tree. Patched in place when
    /// `boot_info_table` is set.
    pub boot_image: String,
    pub boot_catalog: String,
    /// Number of 512-byte sectors the BIOS loads from the boot image.
    pub load_size: u32,
    pub boot_info_table: bool,
    pub volume_label: String,
}

impl BootParameters {
    /// No-emulation ISOLINUX boot, the way Debian's own images are built.
    pub fn isolinux(layout: &InstallerLayout, volume_label: &str) -> Self {
        Self {
            boot_image: layout.boot_image.to_string(),
            boot_catalog: layout.boot_catalog.to_string(),
            load_size: 4,
            boot_info_table: true,
            volume_label: volume_label.to_string(),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.volume_label.is_empty()
            || self.volume_label.len() > MAX_LABEL_LEN
        {
            anyhow::bail!(
                "volume label '{}' must be 1 to {MAX_LABEL_LEN} characters",
                self.volume_label
            );
        }

        Ok(())
    }
}

/// The `genisoimage` arguments that pack `root` into `output`.
pub fn genisoimage_args(
    root: &Utf8Path,
    output: &Utf8Path,
    params: &BootParameters,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-r",
        "-J",
        "-l",
        "-V",
        params.volume_label.as_str(),
        "-b",
        params.boot_image.as_str(),
        "-c",
        params.boot_catalog.as_str(),
        "-no-emul-boot",
        "-boot-load-size",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push(params.load_size.to_string());
    if params.boot_info_table {
        args.push("-boot-info-table".to_string());
    }
    args.extend(["-o".to_string(), output.to_string(), root.to_string()]);
    args
}

/// Fails unless the manifest in `tree` is the one the manifest step wrote,
/// identified by `recorded_digest`, and still describes the tree.
pub fn ensure_manifest_current(
    tree: &WorkingTree,
    recorded_digest: &str,
) -> anyhow::Result<()> {
    let path = tree.path(tree.layout().manifest);
    let on_disk = md5_file(&path)?;
    if on_disk != recorded_digest {
        anyhow::bail!(
            "{path} changed after it was regenerated (digest {on_disk}, \
            expected {recorded_digest})"
        );
    }

    let stale = manifest::stale_entries(tree)?;
    if !stale.is_empty() {
        anyhow::bail!(
            "{path} is out of date for {} file(s), first: {}",
            stale.len(),
            stale[0]
        );
    }

    Ok(())
}

/// Packs `tree` into a bootable ISO at `output`.
///
/// Any existing file at `output` is removed first. The image is written to
/// `<output>.partial` and moved into place only once packing succeeds.
pub fn build_image(
    tree: &WorkingTree,
    output: &Utf8Path,
    params: &BootParameters,
    ui: &dyn Ui,
) -> anyhow::Result<()> {
    pack_with("genisoimage", tree, output, params, ui)
}

fn pack_with(
    program: &str,
    tree: &WorkingTree,
    output: &Utf8Path,
    params: &BootParameters,
    ui: &dyn Ui,
) -> anyhow::Result<()> {
    params.validate()?;
    remove_if_present(output)?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {parent}"))?;
    }

    let partial = Utf8PathBuf::from(format!("{output}.partial"));
    remove_if_present(&partial)?;

    let result = {
        let _boot_image = Writable::acquire(&tree.path(&params.boot_image))?;
        info!(root = %tree.root(), %output, "packing installer image");
        run_command_check_status(
            Command::new(program)
                .args(genisoimage_args(tree.root(), &partial, params))
                .stdout(ui.stdout_target()),
            ui,
        )
    };

    if let Err(e) = result {
        let _ = std::fs::remove_file(&partial);
        return Err(e).with_context(|| format!("packing {}", tree.root()));
    }

    std::fs::rename(&partial, output)
        .with_context(|| format!("moving {partial} to {output}"))
}

fn remove_if_present(path: &Utf8Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {path}")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        installer::testutil::stub_tree,
        ui::LogUi,
        writable::{make_tree_read_only, remove_read_only_tree},
    };

    fn stub() -> (tempfile::TempDir, Utf8PathBuf, WorkingTree) {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let root = stub_tree(&base);
        (dir, base, WorkingTree::open(root, InstallerLayout::default()))
    }

    #[test]
    fn arguments_request_no_emulation_boot() {
        let params = BootParameters::isolinux(&InstallerLayout::default(), "DEBVM");
        let args = genisoimage_args(
            Utf8Path::new("/work/tree"),
            Utf8Path::new("/out/debvm.iso.partial"),
            &params,
        );
        assert_eq!(
            args.join(" "),
            "-r -J -l -V DEBVM -b isolinux/isolinux.bin -c isolinux/boot.cat \
            -no-emul-boot -boot-load-size 4 -boot-info-table \
            -o /out/debvm.iso.partial /work/tree"
        );
    }

    #[test]
    fn rejects_overlong_volume_label() {
        let params = BootParameters::isolinux(
            &InstallerLayout::default(),
            "THIS LABEL IS FAR TOO LONG FOR ISO 9660",
        );
        assert!(params.validate().is_err());
    }

    #[test]
    fn stale_manifest_blocks_packing() {
        let (_dir, _base, tree) = stub();
        let digest = manifest::regenerate(&tree).unwrap();
        ensure_manifest_current(&tree, &digest).unwrap();

        std::fs::write(tree.path("README.txt"), b"edited later").unwrap();
        let err = ensure_manifest_current(&tree, &digest).unwrap_err();
        assert!(err.to_string().contains("./README.txt"), "{err}");

        let err = ensure_manifest_current(&tree, "not-a-digest").unwrap_err();
        assert!(err.to_string().contains("changed after"), "{err}");
    }

    #[test]
    fn failed_packing_leaves_no_image() {
        let (_dir, base, tree) = stub();
        make_tree_read_only(tree.root()).unwrap();
        let output = base.join("out/debvm.iso");
        std::fs::create_dir_all(output.parent().unwrap()).unwrap();
        std::fs::write(&output, b"image from an earlier run").unwrap();

        let params = BootParameters::isolinux(tree.layout(), "DEBVM");
        let err = pack_with("false", &tree, &output, &params, &LogUi::new("pack"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("packing"), "{err:#}");
        assert!(!output.exists());
        assert!(!base.join("out/debvm.iso.partial").exists());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(tree.path("isolinux/isolinux.bin"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o222, 0);
        remove_read_only_tree(tree.root()).unwrap();
    }

    #[test]
    fn successful_packing_moves_image_into_place() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, base, tree) = stub();
        let fake = base.join("fake-genisoimage");
        std::fs::write(
            &fake,
            "#!/bin/sh\nwhile [ \"$1\" != -o ]; do shift; done\necho iso > \"$2\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755))
            .unwrap();

        let output = base.join("out/debvm.iso");
        let params = BootParameters::isolinux(tree.layout(), "DEBVM");
        pack_with(fake.as_str(), &tree, &output, &params, &LogUi::new("pack"))
            .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"iso\n");
        assert!(!base.join("out/debvm.iso.partial").exists());
    }
}
