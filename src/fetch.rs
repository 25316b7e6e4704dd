// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fetching the base installer image and checking it against the published
//! checksum list.

use std::process::Command;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::{
    ui::Ui,
    util::{run_command_check_status, sha256_file},
};

/// An installer image whose contents match its published checksum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedArtifact {
    pub path: Utf8PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// Looks up `file_name` in a `sha256sum`-style checksum list and returns its
/// lowercase hex digest.
pub fn expected_checksum(
    checksum_list: &str,
    file_name: &str,
) -> anyhow::Result<String> {
    for line in checksum_list.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((digest, name)) = line.split_once(char::is_whitespace) else {
            continue;
        };

        // Binary-mode entries carry a leading '*'.
        let name = name.trim_start();
        let name = name.strip_prefix('*').unwrap_or(name);
        let name = name.strip_prefix("./").unwrap_or(name);
        if name == file_name {
            return Ok(digest.to_ascii_lowercase());
        }
    }

    anyhow::bail!("'{file_name}' is not listed in the published checksum list")
}

/// Checks that the file at `path` has the SHA-256 digest `expected`.
pub fn verify_artifact(
    path: &Utf8Path,
    expected: &str,
) -> anyhow::Result<VerifiedArtifact> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("reading metadata of {path}"))?
        .len();
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        anyhow::bail!(
            "checksum mismatch for {path}: expected {expected}, got {actual}"
        );
    }

    Ok(VerifiedArtifact { path: path.to_owned(), sha256: actual, size })
}

/// Verifies `image` against the entry for its file name in the checksum list
/// stored at `checksum_list`.
pub fn verify_against_list(
    image: &Utf8Path,
    checksum_list: &Utf8Path,
) -> anyhow::Result<VerifiedArtifact> {
    let list = std::fs::read_to_string(checksum_list)
        .with_context(|| format!("reading checksum list {checksum_list}"))?;
    let file_name = image
        .file_name()
        .with_context(|| format!("{image} has no file name"))?;
    let expected = expected_checksum(&list, file_name)?;
    verify_artifact(image, &expected)
}

/// Downloads `url` to `dest` with curl. The download goes to a temporary
/// sibling first so that an interrupted transfer never leaves a file at
/// `dest`.
pub fn download(url: &str, dest: &Utf8Path, ui: &dyn Ui) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {parent}"))?;
    }

    let partial = Utf8PathBuf::from(format!("{dest}.partial"));
    info!(%url, %dest, "downloading");
    let result = run_command_check_status(
        Command::new("curl").args(["-fsSL", "-o", partial.as_str(), url]),
        ui,
    );

    if let Err(e) = result {
        let _ = std::fs::remove_file(&partial);
        return Err(e).with_context(|| format!("downloading {url}"));
    }

    std::fs::rename(&partial, dest)
        .with_context(|| format!("moving {partial} to {dest}"))
}

/// Joins a base URL and a file name.
pub fn join_url(base: &str, file_name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file_name)
}

#[cfg(test)]
mod test {
    use super::*;

    const LIST: &str = "\
# published checksums
9b0b6e4d1b4fb23e0e5b5e3d8b3f1c1a3c8b1f0f8e1d2c3b4a5968778695a4b3  debian-12.7.0-amd64-DVD-1.iso
ABCDEF0123456789abcdef0123456789abcdef0123456789abcdef0123456789 *debian-12.7.0-amd64-netinst.iso
";

    #[test]
    fn finds_entries_in_checksum_list() {
        assert_eq!(
            expected_checksum(LIST, "debian-12.7.0-amd64-netinst.iso").unwrap(),
            "abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789"
        );
        assert!(expected_checksum(LIST, "debian-12.7.0-amd64-DVD-1.iso")
            .unwrap()
            .starts_with("9b0b6e4d"));
        assert!(expected_checksum(LIST, "other.iso").is_err());
    }

    #[test]
    fn matching_image_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let image =
            Utf8PathBuf::try_from(dir.path().join("base.iso")).unwrap();
        std::fs::write(&image, b"abc").unwrap();
        let list = Utf8PathBuf::try_from(dir.path().join("SHA256SUMS")).unwrap();
        std::fs::write(
            &list,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  base.iso\n",
        )
        .unwrap();

        let verified = verify_against_list(&image, &list).unwrap();
        assert_eq!(verified.size, 3);
        assert_eq!(verified.path, image);
    }

    #[test]
    fn mismatched_image_reports_both_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let image =
            Utf8PathBuf::try_from(dir.path().join("base.iso")).unwrap();
        std::fs::write(&image, b"tampered").unwrap();

        let expected =
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        let err = verify_artifact(&image, expected).unwrap_err().to_string();
        assert!(err.contains(expected));
        assert!(err.contains(&sha256_file(&image).unwrap()));
    }

    #[test]
    fn url_join_tolerates_trailing_slash() {
        assert_eq!(join_url("https://x/y/", "SHA256SUMS"), "https://x/y/SHA256SUMS");
        assert_eq!(join_url("https://x/y", "a.iso"), "https://x/y/a.iso");
    }
}
