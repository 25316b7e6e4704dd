// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utility functions shared by multiple scripts.

use std::{
    fs::File,
    io::{BufReader, Read},
    process::{Command, Output},
};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use md5::{Digest, Md5};
use sha2::Sha256;

use crate::{runner::ScriptStep, ui::Ui};

/// Runs a `Command` and returns its output. Returns `Err` if the command's exit
/// status indicates that it failed.
pub fn run_command_check_status(
    cmd: &mut Command,
    ui: &dyn Ui,
) -> anyhow::Result<Output> {
    ui.set_substep(&format!("executing: {:?}", cmd));
    let output = cmd.output().with_context(|| {
        format!("launching '{}'", cmd.get_program().to_string_lossy())
    })?;

    if !output.status.success() {
        anyhow::bail!(
            "'{}' returned non-success exit code {:?}: {}",
            cmd.get_program().to_string_lossy(),
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(output)
}

/// Runs the supplied `cmd` and searches its `stdout` for the first line
/// containing `row_contains`, then splits it by whitespace and returns the
/// `column`th zero-indexed word from that line.
///
/// Note that all searches are case-sensitive.
pub fn grep_command_for_row_and_column(
    cmd: &mut Command,
    row_contains: &str,
    column: usize,
    ui: &dyn Ui,
) -> anyhow::Result<String> {
    let output = run_command_check_status(cmd, ui)?.stdout;
    let output = String::from_utf8_lossy(&output);
    grep_row_and_column(&output, row_contains, column).with_context(|| {
        format!("searching output of {}", cmd.get_program().to_string_lossy())
    })
}

fn grep_row_and_column(
    output: &str,
    row_contains: &str,
    column: usize,
) -> anyhow::Result<String> {
    for line in output.lines() {
        if !line.contains(row_contains) {
            continue;
        }

        return Ok(line
            .split_whitespace()
            .nth(column)
            .ok_or(anyhow::anyhow!(
                "matching line '{line}' does not have column index {column}"
            ))?
            .to_owned());
    }

    anyhow::bail!("'{row_contains}' not found (output: {:?})", output);
}

/// Returns one message for each executable that one of `steps` needs and that
/// can't be found in the current `PATH`.
pub fn check_executable_prerequisites(steps: &[ScriptStep]) -> Vec<String> {
    steps
        .iter()
        .flat_map(|step| step.prereq_commands().iter().copied())
        .unique()
        .filter(|command| which::which(command).is_err())
        .map(|command| format!("executable '{command}' not found in PATH"))
        .collect()
}

/// Returns one message for each of `files` that does not exist.
pub fn check_file_prerequisites(files: &[Utf8PathBuf]) -> Vec<String> {
    files
        .iter()
        .filter(|file| !file.exists())
        .map(|file| format!("file '{file}' not found"))
        .collect()
}

/// Hex-encoded MD5 digest of `bytes`.
pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Hex-encoded MD5 digest of the file at `path`.
pub fn md5_file(path: &Utf8Path) -> anyhow::Result<String> {
    digest_file::<Md5>(path)
}

/// Hex-encoded SHA-256 digest of the file at `path`.
pub fn sha256_file(path: &Utf8Path) -> anyhow::Result<String> {
    digest_file::<Sha256>(path)
}

fn digest_file<D: Digest>(path: &Utf8Path) -> anyhow::Result<String> {
    let file =
        File::open(path).with_context(|| format!("opening {path} to hash"))?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading {path} to hash"))?;
        if n == 0 {
            break;
        }

        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_of_known_input() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn file_digests_match_in_memory_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("f")).unwrap();
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(md5_file(&path).unwrap(), md5_hex(b"abc"));
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn grep_finds_column() {
        let output = "0%...\nInterface 'vboxnet3' was successfully created\n";
        assert_eq!(
            grep_row_and_column(output, "successfully created", 1).unwrap(),
            "'vboxnet3'"
        );
        assert!(grep_row_and_column(output, "missing", 0).is_err());
        assert!(grep_row_and_column(output, "successfully", 9).is_err());
    }

    #[test]
    fn missing_executables_are_reported_once() {
        let steps = vec![
            ScriptStep::with_prereqs(
                "a",
                |_, _| Ok(()),
                &["definitely-not-a-real-tool-xyz"],
            ),
            ScriptStep::with_prereqs(
                "b",
                |_, _| Ok(()),
                &["definitely-not-a-real-tool-xyz"],
            ),
        ];

        assert_eq!(check_executable_prerequisites(&steps).len(), 1);
    }
}
