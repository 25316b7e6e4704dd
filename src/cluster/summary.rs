// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The run summary: one line per provisioned node, appended to a log file
//! that accumulates across runs.

use std::{fs::OpenOptions, io::Write as _};

use anyhow::Context as _;
use camino::Utf8Path;
use chrono::{DateTime, Local, SecondsFormat};

use super::NodeSpec;

pub fn summary_line(node: &NodeSpec, at: &DateTime<Local>) -> String {
    format!(
        "{} {} memory={}MiB cpus={} disk={}MiB address={}",
        at.to_rfc3339_opts(SecondsFormat::Secs, false),
        node.name,
        node.resources.memory_mib,
        node.resources.cpus,
        node.resources.disk_mib,
        node.address,
    )
}

/// Appends a line for each of `nodes` to the summary at `path`.
pub fn append_summary(path: &Utf8Path, nodes: &[NodeSpec]) -> anyhow::Result<()> {
    let now = Local::now();
    let text: String = nodes
        .iter()
        .map(|node| summary_line(node, &now) + "\n")
        .collect();

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {path}"))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("writing {path}"))
}
