// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Renders the debian-installer preseed file that answers every installer
//! prompt.
//!
//! The preseed format has no way to reference a secret stored elsewhere, so
//! the account password ends up in the rendered document in plain text. The
//! caller supplies it from a file or the environment, and the document is
//! written with owner-only permissions.

use std::{
    fs::OpenOptions,
    io::Write as _,
    os::unix::fs::OpenOptionsExt,
};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use itertools::Itertools;

use crate::util::md5_hex;

/// The name the installer looks for, both inside the initrd and on the
/// installation medium.
pub const ANSWER_FILE_NAME: &str = "preseed.cfg";

/// One of partman-auto's stock partitioning recipes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PartitionRecipe {
    /// All files in one partition.
    Atomic,
    /// Separate /home partition.
    Home,
    /// Separate /home, /var, and /tmp partitions.
    Multi,
}

impl PartitionRecipe {
    fn as_str(&self) -> &'static str {
        match self {
            PartitionRecipe::Atomic => "atomic",
            PartitionRecipe::Home => "home",
            PartitionRecipe::Multi => "multi",
        }
    }
}

#[derive(Clone)]
pub struct PreseedParams {
    pub locale: String,
    pub keymap: String,
    pub timezone: String,
    pub disk: String,
    pub partitioning: PartitionRecipe,
    pub mirror_host: String,
    pub full_name: String,
    pub username: String,
    pub password: String,
    /// Root logins are disabled unless this is set.
    pub root_password: Option<String>,
    pub packages: Vec<String>,
    pub reboot_on_finish: bool,
}

impl std::fmt::Debug for PreseedParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreseedParams")
            .field("locale", &self.locale)
            .field("keymap", &self.keymap)
            .field("timezone", &self.timezone)
            .field("disk", &self.disk)
            .field("partitioning", &self.partitioning)
            .field("mirror_host", &self.mirror_host)
            .field("full_name", &self.full_name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field(
                "root_password",
                &self.root_password.as_ref().map(|_| "<redacted>"),
            )
            .field("packages", &self.packages)
            .field("reboot_on_finish", &self.reboot_on_finish)
            .finish()
    }
}

/// A rendered answer file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnswerDocument {
    bytes: Vec<u8>,
}

impl AnswerDocument {
    pub fn render(params: &PreseedParams) -> Self {
        Self { bytes: render(params).into_bytes() }
    }

    /// Reads back a document written by `write_to`.
    pub fn read(path: &Utf8Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading answer file {path}"))?;
        Ok(Self { bytes })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The checksum the installer verifies via `preseed/file/checksum`.
    pub fn md5(&self) -> String {
        md5_hex(&self.bytes)
    }

    /// Writes the document to `dir/preseed.cfg`, readable only by its owner,
    /// and returns the path written.
    pub fn write_to(&self, dir: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {dir}"))?;

        let path = dir.join(ANSWER_FILE_NAME);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .with_context(|| format!("creating {path}"))?;
        file.write_all(&self.bytes)
            .with_context(|| format!("writing {path}"))?;

        Ok(path)
    }
}

fn render(p: &PreseedParams) -> String {
    let mut s = String::new();
    let mut line = |l: String| {
        s.push_str(&l);
        s.push('\n');
    };

    line("### Localization".into());
    line(format!("d-i debian-installer/locale string {}", p.locale));
    line(format!("d-i keyboard-configuration/xkb-keymap select {}", p.keymap));

    line("### Network".into());
    line("d-i netcfg/choose_interface select auto".into());
    line("d-i netcfg/get_hostname string unassigned-hostname".into());
    line("d-i netcfg/get_domain string unassigned-domain".into());
    line("d-i netcfg/wireless_wep string".into());

    line("### Mirror".into());
    line("d-i mirror/country string manual".into());
    line(format!("d-i mirror/http/hostname string {}", p.mirror_host));
    line("d-i mirror/http/directory string /debian".into());
    line("d-i mirror/http/proxy string".into());

    line("### Accounts".into());
    match &p.root_password {
        Some(root) => {
            line(format!("d-i passwd/root-password password {root}"));
            line(format!("d-i passwd/root-password-again password {root}"));
        }
        None => line("d-i passwd/root-login boolean false".into()),
    }
    line(format!("d-i passwd/user-fullname string {}", p.full_name));
    line(format!("d-i passwd/username string {}", p.username));
    line(format!("d-i passwd/user-password password {}", p.password));
    line(format!("d-i passwd/user-password-again password {}", p.password));

    line("### Clock".into());
    line("d-i clock-setup/utc boolean true".into());
    line(format!("d-i time/zone string {}", p.timezone));
    line("d-i clock-setup/ntp boolean true".into());

    line("### Partitioning".into());
    line(format!("d-i partman-auto/disk string {}", p.disk));
    line("d-i partman-auto/method string regular".into());
    line("d-i partman-lvm/device_remove_lvm boolean true".into());
    line("d-i partman-md/device_remove_md boolean true".into());
    line(format!(
        "d-i partman-auto/choose_recipe select {}",
        p.partitioning.as_str()
    ));
    line("d-i partman-partitioning/confirm_write_new_label boolean true".into());
    line("d-i partman/choose_partition select finish".into());
    line("d-i partman/confirm boolean true".into());
    line("d-i partman/confirm_nooverwrite boolean true".into());

    line("### Packages".into());
    line("d-i apt-setup/cdrom/set-first boolean false".into());
    line("tasksel tasksel/first multiselect standard, ssh-server".into());
    if !p.packages.is_empty() {
        line(format!("d-i pkgsel/include string {}", p.packages.iter().join(" ")));
    }
    line("d-i pkgsel/upgrade select none".into());
    line("popularity-contest popularity-contest/participate boolean false".into());

    line("### Boot loader".into());
    line("d-i grub-installer/only_debian boolean true".into());
    line("d-i grub-installer/with_other_os boolean true".into());
    line(format!("d-i grub-installer/bootdev string {}", p.disk));

    line("### Finish".into());
    line("d-i finish-install/reboot_in_progress note".into());
    if !p.reboot_on_finish {
        line("d-i debian-installer/exit/poweroff boolean true".into());
    }

    s
}

/// A one-line description of the parameters, safe to print.
pub fn describe(p: &PreseedParams) -> String {
    format!(
        "{} ({}), tz {}, {} on {}, user '{}'",
        p.locale,
        p.keymap,
        p.timezone,
        p.partitioning.as_str(),
        p.disk,
        p.username
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn params() -> PreseedParams {
        PreseedParams {
            locale: "en_US.UTF-8".to_string(),
            keymap: "us".to_string(),
            timezone: "Etc/UTC".to_string(),
            disk: "/dev/sda".to_string(),
            partitioning: PartitionRecipe::Atomic,
            mirror_host: "deb.debian.org".to_string(),
            full_name: "Cluster Admin".to_string(),
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            root_password: None,
            packages: vec!["openssh-server".to_string(), "cloud-init".to_string()],
            reboot_on_finish: true,
        }
    }

    #[test]
    fn render_includes_parameters() {
        let doc = AnswerDocument::render(&params());
        let text = std::str::from_utf8(doc.bytes()).unwrap();
        assert!(text.contains("d-i debian-installer/locale string en_US.UTF-8\n"));
        assert!(text.contains("d-i keyboard-configuration/xkb-keymap select us\n"));
        assert!(text.contains("d-i time/zone string Etc/UTC\n"));
        assert!(text.contains("d-i partman-auto/disk string /dev/sda\n"));
        assert!(text.contains("d-i partman-auto/choose_recipe select atomic\n"));
        assert!(text.contains("d-i passwd/username string admin\n"));
        assert!(text.contains("d-i passwd/user-password password hunter2\n"));
        assert!(text.contains("d-i passwd/user-password-again password hunter2\n"));
        assert!(text.contains("d-i pkgsel/include string openssh-server cloud-init\n"));
        assert!(!text.contains("exit/poweroff"));
        assert!(text.contains("d-i passwd/root-login boolean false\n"));
    }

    #[test]
    fn root_password_enables_root_login() {
        let mut p = params();
        p.root_password = Some("toor".to_string());
        let doc = AnswerDocument::render(&p);
        let text = std::str::from_utf8(doc.bytes()).unwrap();
        assert!(text.contains("d-i passwd/root-password password toor\n"));
        assert!(text.contains("d-i passwd/root-password-again password toor\n"));
        assert!(!text.contains("root-login boolean false"));
        assert!(!format!("{p:?}").contains("toor"));
    }

    #[test]
    fn render_is_deterministic() {
        assert_eq!(
            AnswerDocument::render(&params()),
            AnswerDocument::render(&params())
        );
    }

    #[test]
    fn power_off_instead_of_reboot() {
        let mut p = params();
        p.reboot_on_finish = false;
        p.packages.clear();
        let doc = AnswerDocument::render(&p);
        let text = std::str::from_utf8(doc.bytes()).unwrap();
        assert!(text.contains("d-i debian-installer/exit/poweroff boolean true\n"));
        assert!(!text.contains("pkgsel/include"));
    }

    #[test]
    fn debug_output_hides_password() {
        let rendered = format!("{:?}", params());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
        assert!(!describe(&params()).contains("hunter2"));
    }

    #[test]
    fn write_to_creates_private_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(dir.path().join("seed")).unwrap();
        let doc = AnswerDocument::render(&params());
        let path = doc.write_to(&dir).unwrap();

        assert_eq!(path.file_name(), Some(ANSWER_FILE_NAME));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let read_back = AnswerDocument::read(&path).unwrap();
        assert_eq!(read_back, doc);
        assert_eq!(read_back.md5(), md5_hex(doc.bytes()));
        assert!(AnswerDocument::read(&dir.join("absent.cfg")).is_err());
    }
}
