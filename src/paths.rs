// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Every file and directory a run reads or writes, resolved once up front.

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};

/// Absolute paths for one run. Intermediate files go under the work
/// directory; anything meant to outlive the run goes under the output
/// directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunPaths {
    pub work_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    /// The unpacked installer image.
    pub tree: Utf8PathBuf,
    /// Where the rendered answer file is staged.
    pub seed_dir: Utf8PathBuf,
    /// Per-node cloud-init documents, one subdirectory per node.
    pub node_config_dir: Utf8PathBuf,
    pub installer_image: Utf8PathBuf,
    pub summary: Utf8PathBuf,
    pub vm_base_folder: Utf8PathBuf,
}

impl RunPaths {
    /// Resolves the run's paths. Relative directories are taken relative to
    /// the current directory.
    pub fn resolve(
        work_dir: &Utf8Path,
        output_dir: &Utf8Path,
        installer_image_name: &str,
        vm_base_folder: Option<&Utf8Path>,
    ) -> anyhow::Result<Self> {
        let work_dir = absolute(work_dir)?;
        let output_dir = absolute(output_dir)?;
        let vm_base_folder = match vm_base_folder {
            Some(dir) => absolute(dir)?,
            None => output_dir.join("vms"),
        };

        Ok(Self {
            tree: work_dir.join("tree"),
            seed_dir: work_dir.join("seed"),
            node_config_dir: work_dir.join("cidata"),
            installer_image: output_dir.join(installer_image_name),
            summary: output_dir.join("summary.log"),
            vm_base_folder,
            work_dir,
            output_dir,
        })
    }

    /// Where a downloaded file named `file_name` is kept.
    pub fn download(&self, file_name: &str) -> Utf8PathBuf {
        self.work_dir.join(file_name)
    }

    /// Staging directory for one node's cloud-init documents.
    pub fn node_documents(&self, node: &str) -> Utf8PathBuf {
        self.node_config_dir.join(node)
    }
}

fn absolute(path: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_owned());
    }

    let cwd = std::env::current_dir().context("getting current directory")?;
    let cwd = Utf8PathBuf::try_from(cwd)
        .context("current directory is not valid UTF-8")?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn everything_is_absolute() {
        let paths = RunPaths::resolve(
            Utf8Path::new("work"),
            Utf8Path::new("/srv/out"),
            "debvm-installer.iso",
            None,
        )
        .unwrap();

        assert!(paths.work_dir.is_absolute());
        assert!(paths.tree.starts_with(&paths.work_dir));
        assert_eq!(paths.installer_image, "/srv/out/debvm-installer.iso");
        assert_eq!(paths.summary, "/srv/out/summary.log");
        assert_eq!(paths.vm_base_folder, "/srv/out/vms");
        assert_eq!(
            paths.node_documents("debvm-storage"),
            paths.work_dir.join("cidata/debvm-storage")
        );
    }

    #[test]
    fn explicit_vm_folder() {
        let paths = RunPaths::resolve(
            Utf8Path::new("/w"),
            Utf8Path::new("/o"),
            "x.iso",
            Some(Utf8Path::new("/var/lib/vbox")),
        )
        .unwrap();
        assert_eq!(paths.vm_base_folder, "/var/lib/vbox");
        assert_eq!(paths.download("SHA256SUMS"), "/w/SHA256SUMS");
    }
}
