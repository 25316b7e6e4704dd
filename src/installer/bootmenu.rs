// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot menus that start automated installation without waiting for input.
//!
//! The stock menus are replaced wholesale rather than edited: each boot
//! loader gets exactly one entry, selected by default with no timeout.

use anyhow::Context as _;
use camino::Utf8PathBuf;
use tracing::debug;

use super::{tree::WorkingTree, InstallerLayout};
use crate::writable::Writable;

const CHECKSUM_ARG: &str = "preseed/file/checksum=";
const HEADER: &str =
    "# Generated by debvm. Boots straight into automated installation.";
const ENTRY_TITLE: &str = "Automated install";

/// Arguments passed to the installer kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelArgs {
    /// Where the installer loads the answer file from.
    pub preseed_location: String,
    /// MD5 of the answer file; the installer refuses a file that doesn't
    /// match.
    pub preseed_checksum: String,
    pub locale: String,
    pub keymap: String,
    /// Options placed after the `---` separator, which the installer copies
    /// into the installed system's boot loader configuration.
    pub installed_system: Vec<String>,
}

impl KernelArgs {
    pub fn new(preseed_location: String, preseed_checksum: String) -> Self {
        Self {
            preseed_location,
            preseed_checksum,
            locale: "en_US.UTF-8".to_string(),
            keymap: "us".to_string(),
            installed_system: vec!["quiet".to_string()],
        }
    }

    pub fn render(&self) -> String {
        let mut args = vec![
            "auto=true".to_string(),
            "priority=critical".to_string(),
            format!("preseed/file={}", self.preseed_location),
            format!("{CHECKSUM_ARG}{}", self.preseed_checksum),
            format!("debian-installer/locale={}", self.locale),
            format!("keyboard-configuration/xkb-keymap={}", self.keymap),
            "vga=788".to_string(),
            "---".to_string(),
        ];
        args.extend(self.installed_system.iter().cloned());
        args.join(" ")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootLoader {
    /// ISOLINUX, used by legacy BIOS boots.
    Isolinux,
    /// The GRUB menu on the image.
    Grub,
    /// The GRUB configuration the EFI boot path loads first.
    GrubEfi,
}

impl BootLoader {
    pub const ALL: [BootLoader; 3] =
        [BootLoader::Isolinux, BootLoader::Grub, BootLoader::GrubEfi];

    pub fn config_path<'a>(&self, layout: &'a InstallerLayout) -> &'a str {
        match self {
            BootLoader::Isolinux => layout.isolinux_cfg,
            BootLoader::Grub => layout.grub_cfg,
            BootLoader::GrubEfi => layout.grub_efi_cfg,
        }
    }

    /// The complete configuration file for this boot loader.
    pub fn render(&self, layout: &InstallerLayout, args: &KernelArgs) -> String {
        let kernel = format!("/{}", layout.kernel);
        let initrd = format!("/{}", layout.initrd);
        let args = args.render();
        let lines = match self {
            BootLoader::Isolinux => vec![
                HEADER.to_string(),
                "default unattended".to_string(),
                "prompt 0".to_string(),
                "timeout 0".to_string(),
                "label unattended".to_string(),
                format!("\tmenu label ^{ENTRY_TITLE}"),
                format!("\tkernel {kernel}"),
                format!("\tappend initrd={initrd} {args}"),
            ],
            BootLoader::Grub | BootLoader::GrubEfi => {
                let mut lines = vec![HEADER.to_string()];
                if *self == BootLoader::GrubEfi {
                    lines.extend(
                        ["part_gpt", "part_msdos", "iso9660", "gzio", "all_video"]
                            .iter()
                            .map(|m| format!("insmod {m}")),
                    );
                }
                lines.extend([
                    "set default=0".to_string(),
                    "set timeout=0".to_string(),
                    "set timeout_style=hidden".to_string(),
                    format!("menuentry '{ENTRY_TITLE}' {{"),
                    "\tset background_color=black".to_string(),
                    format!("\tlinux {kernel} {args}"),
                    format!("\tinitrd {initrd}"),
                    "}".to_string(),
                ]);
                lines
            }
        };

        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

/// Replaces the configuration of each of `loaders` in `tree`. Each file is
/// made writable only while it is being replaced. Returns the paths written.
pub fn rewrite(
    tree: &WorkingTree,
    loaders: &[BootLoader],
    args: &KernelArgs,
) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let mut written = Vec::new();
    for loader in loaders {
        let path = tree.path(loader.config_path(tree.layout()));
        let text = loader.render(tree.layout(), args);

        let _guard = Writable::acquire(&path)?;
        std::fs::write(&path, text)
            .with_context(|| format!("rewriting {path}"))?;
        debug!(%path, ?loader, "rewrote boot configuration");
        written.push(path);
    }

    Ok(written)
}

/// The answer file checksum a boot configuration passes to the installer.
pub fn embedded_checksum(config: &str) -> Option<&str> {
    config
        .split_whitespace()
        .find_map(|word| word.strip_prefix(CHECKSUM_ARG))
}

/// Checks that every boot loader configuration in `tree` passes `expected`
/// as the answer file checksum.
pub fn check_checksums(tree: &WorkingTree, expected: &str) -> anyhow::Result<()> {
    for loader in BootLoader::ALL {
        let path = tree.path(loader.config_path(tree.layout()));
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {path}"))?;
        match embedded_checksum(&text) {
            Some(found) if found == expected => {}
            Some(found) => anyhow::bail!(
                "{path} passes answer file checksum {found}, expected {expected}"
            ),
            None => anyhow::bail!("{path} passes no answer file checksum"),
        }
    }

    Ok(())
}
