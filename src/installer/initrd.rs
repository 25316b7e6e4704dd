// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading and extending the installer's gzip-compressed newc cpio initrd.
//!
//! New members are appended by cutting the archive at its `TRAILER!!!` entry,
//! writing the new member, and writing a fresh trailer. Everything before the
//! old trailer is left byte-for-byte as it was.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Cursor, Read, Write},
    ops::Range,
};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use cpio::newc::{Builder as NewcBuilder, ModeFileType};
use flate2::{read::MultiGzDecoder, write::GzEncoder, Compression};
use tracing::debug;

/// Size of a newc header before the member name.
const NEWC_HEADER_LEN: usize = 110;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// One entry in the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub ino: u32,
    pub mode: u32,
    data: Range<usize>,
}

impl Member {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// An uncompressed newc archive held in memory.
#[derive(Debug)]
pub struct Initrd {
    data: Vec<u8>,
    members: Vec<Member>,
    trailer_offset: usize,
}

impl Initrd {
    /// Indexes the members of an uncompressed archive. Several archives
    /// concatenated back to back (optionally separated by zero padding) are
    /// treated as one; new members go after the last trailer.
    pub fn parse(data: Vec<u8>) -> anyhow::Result<Self> {
        let mut members = Vec::new();
        let mut trailer_offset = None;
        let mut pos = 0;

        while pos < data.len() {
            if data[pos] == 0 {
                pos += 1;
                continue;
            }

            let mut cursor = Cursor::new(data.as_slice());
            cursor.set_position(pos as u64);
            let reader = cpio::NewcReader::new(cursor).with_context(|| {
                format!("reading cpio header at offset {pos}")
            })?;

            let entry = reader.entry();
            let is_trailer = entry.is_trailer();
            let name = entry.name().to_owned();
            let ino = entry.ino();
            let mode = entry.mode();
            let size = entry.file_size() as usize;

            let data_start = pos + align4(NEWC_HEADER_LEN + name.len() + 1);
            let cursor = reader.finish().with_context(|| {
                format!("reading cpio member '{name}' at offset {pos}")
            })?;
            let next = cursor.position() as usize;

            if is_trailer {
                trailer_offset = Some(pos);
            } else {
                let data_end = data_start + size;
                anyhow::ensure!(
                    data_end <= next,
                    "cpio member '{name}' at offset {pos} overruns its entry"
                );
                members.push(Member { name, ino, mode, data: data_start..data_end });
                trailer_offset = None;
            }

            pos = next;
        }

        let trailer_offset = trailer_offset
            .context("cpio archive does not end with a TRAILER!!! entry")?;
        debug!(members = members.len(), bytes = data.len(), "parsed initrd");
        Ok(Self { data, members, trailer_offset })
    }

    /// Reads and decompresses a gzip-compressed archive.
    pub fn read_compressed(path: &Utf8Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening {path}"))?;
        let mut data = Vec::new();
        MultiGzDecoder::new(BufReader::new(file))
            .read_to_end(&mut data)
            .with_context(|| format!("decompressing {path}"))?;
        Self::parse(data).with_context(|| format!("parsing {path}"))
    }

    /// Reads an uncompressed archive.
    pub fn read(path: &Utf8Path) -> anyhow::Result<Self> {
        let data =
            std::fs::read(path).with_context(|| format!("reading {path}"))?;
        Self::parse(data).with_context(|| format!("parsing {path}"))
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn member_data(&self, name: &str) -> Option<&[u8]> {
        self.member(name).map(|m| &self.data[m.data.clone()])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Appends a regular file named `name` with the supplied contents.
    pub fn append_file(&mut self, name: &str, content: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(
            !name.is_empty()
                && !name.starts_with('/')
                && !name.split('/').any(|c| c == ".."),
            "'{name}' is not a valid relative cpio member name"
        );
        anyhow::ensure!(
            self.member(name).is_none(),
            "initrd already contains a member named '{name}'"
        );

        let size: u32 = content
            .len()
            .try_into()
            .with_context(|| format!("'{name}' is too large for a cpio member"))?;
        let ino = self.members.iter().map(|m| m.ino).max().unwrap_or(0) + 1;

        self.data.truncate(self.trailer_offset);
        let header_offset = self.data.len();
        let mut writer = NewcBuilder::new(name)
            .ino(ino)
            .mode(0o644)
            .nlink(1)
            .set_mode_file_type(ModeFileType::Regular)
            .write(&mut self.data, size);
        writer.write_all(content)?;
        writer.finish()?;

        let data_start = header_offset + align4(NEWC_HEADER_LEN + name.len() + 1);
        self.members.push(Member {
            name: name.to_owned(),
            ino,
            mode: 0o100644,
            data: data_start..data_start + content.len(),
        });

        self.trailer_offset = self.data.len();
        let data = std::mem::take(&mut self.data);
        self.data = cpio::newc::trailer(data)?;
        Ok(())
    }

    /// Compresses the archive with gzip and writes it to `path`, replacing
    /// any existing file only once the new one is complete. A replaced file's
    /// permissions carry over to the new one.
    pub fn write_compressed(&self, path: &Utf8Path) -> anyhow::Result<()> {
        let tmp = Utf8PathBuf::from(format!("{path}.tmp"));
        let permissions = match std::fs::metadata(path) {
            Ok(meta) => Some(meta.permissions()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("reading mode of {path}"))
            }
        };

        let result = (|| -> anyhow::Result<()> {
            let file = File::create(&tmp)
                .with_context(|| format!("creating {tmp}"))?;
            let mut encoder =
                GzEncoder::new(BufWriter::new(file), Compression::best());
            encoder.write_all(&self.data)?;
            encoder.finish()?.flush()?;
            if let Some(permissions) = permissions {
                std::fs::set_permissions(&tmp, permissions)
                    .with_context(|| format!("setting mode of {tmp}"))?;
            }
            std::fs::rename(&tmp, path)
                .with_context(|| format!("moving {tmp} to {path}"))
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }

        result.with_context(|| format!("compressing initrd into {path}"))
    }

    pub fn write(&self, path: &Utf8Path) -> anyhow::Result<()> {
        std::fs::write(path, &self.data)
            .with_context(|| format!("writing {path}"))
    }
}

/// Where `decompress_in_place` leaves the uncompressed archive for the
/// compressed archive at `gz`.
pub fn uncompressed_path(gz: &Utf8Path) -> Utf8PathBuf {
    match gz.as_str().strip_suffix(".gz") {
        Some(stem) => Utf8PathBuf::from(stem),
        None => Utf8PathBuf::from(format!("{gz}.cpio")),
    }
}

/// Writes the uncompressed contents of `gz` next to it and returns where
/// they went. `gz` stays until `compress_in_place` replaces it. The
/// containing directory must be writable.
pub fn decompress_in_place(gz: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    let initrd = Initrd::read_compressed(gz)?;
    let raw = uncompressed_path(gz);
    initrd.write(&raw)?;
    Ok(raw)
}

/// Appends the file at `answer_file` to the uncompressed archive at `raw`.
/// The member is stored under the file's bare name no matter where the file
/// was staged, since that is where the installer looks for it. Returns the
/// member name.
pub fn append_answer_file(
    raw: &Utf8Path,
    answer_file: &Utf8Path,
) -> anyhow::Result<String> {
    let name = answer_file
        .file_name()
        .with_context(|| format!("{answer_file} has no file name"))?;
    let content = std::fs::read(answer_file)
        .with_context(|| format!("reading {answer_file}"))?;

    let mut initrd = Initrd::read(raw)?;
    initrd.append_file(name, &content)?;
    initrd.write(raw)?;
    Ok(name.to_owned())
}

/// Compresses the uncompressed archive at `raw` over `gz`, keeping the mode
/// `gz` had, and removes `raw`. The containing directory must be writable.
pub fn compress_in_place(raw: &Utf8Path, gz: &Utf8Path) -> anyhow::Result<()> {
    let initrd = Initrd::read(raw)?;
    initrd.write_compressed(gz)?;
    std::fs::remove_file(raw).with_context(|| format!("removing {raw}"))
}

/// The MD5 of member `name` of the compressed archive at `gz`, as the
/// installer will see it after boot.
pub fn member_checksum(gz: &Utf8Path, name: &str) -> anyhow::Result<String> {
    let initrd = Initrd::read_compressed(gz)?;
    let data = initrd
        .member_data(name)
        .with_context(|| format!("{gz} has no member named {name}"))?;
    Ok(crate::util::md5_hex(data))
}
