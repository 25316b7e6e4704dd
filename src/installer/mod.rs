// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turning a stock debian-installer image into one that installs without
//! asking any questions.
//!
//! The image is unpacked into a working tree, the answer file is placed where
//! the installer will find it (normally inside the initrd), every boot menu is
//! replaced with a single entry that boots straight into automated
//! installation, `md5sum.txt` is regenerated to cover the changed files, and
//! the tree is packed back into a bootable ISO.
//!
//! The order matters. The checksum written into the boot menus must be the
//! checksum of the answer file the installer will actually load, and the
//! manifest must be regenerated after every other change or the installer's
//! integrity check fails.

use clap::ValueEnum;

pub mod bootmenu;
pub mod initrd;
pub mod manifest;
pub mod repack;
pub mod tree;

/// Where the installer finds the answer file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AnswerFileDelivery {
    /// Appended to the installer's initrd, so it is available before any
    /// device is mounted.
    Initrd,
    /// Copied to the root of the installation medium and loaded from the
    /// mounted CD-ROM.
    Cdrom,
}

impl AnswerFileDelivery {
    /// The location passed to the installer in `preseed/file`.
    pub fn preseed_location(&self, file_name: &str) -> String {
        match self {
            AnswerFileDelivery::Initrd => format!("/{file_name}"),
            AnswerFileDelivery::Cdrom => format!("/cdrom/{file_name}"),
        }
    }
}

impl std::fmt::Display for AnswerFileDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerFileDelivery::Initrd => write!(f, "embedded in initrd"),
            AnswerFileDelivery::Cdrom => write!(f, "on installation medium"),
        }
    }
}

/// Where things live inside an unpacked installer image. Paths are relative
/// to the root of the image.
#[derive(Clone, Debug)]
pub struct InstallerLayout {
    /// Directory holding the installer kernel and initrd.
    pub installer_dir: &'static str,
    pub kernel: &'static str,
    pub initrd: &'static str,
    /// ISOLINUX menu used for legacy BIOS boots.
    pub isolinux_cfg: &'static str,
    /// GRUB menu shared by both boot paths.
    pub grub_cfg: &'static str,
    /// GRUB configuration loaded first by the EFI boot path.
    pub grub_efi_cfg: &'static str,
    /// El Torito boot image.
    pub boot_image: &'static str,
    pub boot_catalog: &'static str,
    pub manifest: &'static str,
}

impl InstallerLayout {
    /// The layout of Debian amd64 netinst and DVD images.
    pub const fn debian_amd64() -> Self {
        Self {
            installer_dir: "install.amd",
            kernel: "install.amd/vmlinuz",
            initrd: "install.amd/initrd.gz",
            isolinux_cfg: "isolinux/isolinux.cfg",
            grub_cfg: "boot/grub/grub.cfg",
            grub_efi_cfg: "boot/grub/x86_64-efi/grub.cfg",
            boot_image: "isolinux/isolinux.bin",
            boot_catalog: "isolinux/boot.cat",
            manifest: "md5sum.txt",
        }
    }

    /// Files that must be present after extraction for the rest of the
    /// pipeline to make sense.
    pub fn required_files(&self) -> [&'static str; 7] {
        [
            self.kernel,
            self.initrd,
            self.isolinux_cfg,
            self.grub_cfg,
            self.grub_efi_cfg,
            self.boot_image,
            self.manifest,
        ]
    }
}

impl Default for InstallerLayout {
    fn default() -> Self {
        Self::debian_amd64()
    }
}
