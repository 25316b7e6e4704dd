// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-node cloud-init configuration, delivered on a NoCloud seed volume.

use std::process::Command;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::{
    cluster::{ClusterNetwork, NodeRole, NodeSpec},
    ui::Ui,
    util::run_command_check_status,
};

/// cloud-init only looks for a NoCloud seed on volumes with this label.
pub const VOLUME_LABEL: &str = "cidata";

/// Interface names VirtualBox's default NICs get in a Debian guest.
const NAT_INTERFACE: &str = "enp0s3";
const CLUSTER_INTERFACE: &str = "enp0s8";

/// Directory the storage node exports to the rest of the cluster.
const EXPORT_DIR: &str = "/srv/export";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDocuments {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

impl NodeDocuments {
    pub const FILE_NAMES: [&'static str; 3] =
        ["user-data", "meta-data", "network-config"];

    pub fn render(node: &NodeSpec, network: &ClusterNetwork) -> Self {
        Self {
            user_data: user_data(node, network),
            meta_data: format!(
                "instance-id: {0}\nlocal-hostname: {0}\n",
                node.name
            ),
            network_config: network_config(node, network),
        }
    }

    /// Writes the documents into `dir` under the names cloud-init expects.
    pub fn write_to(&self, dir: &Utf8Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {dir}"))?;

        let contents =
            [&self.user_data, &self.meta_data, &self.network_config];
        for (name, text) in Self::FILE_NAMES.iter().zip(contents) {
            let path = dir.join(name);
            std::fs::write(&path, text)
                .with_context(|| format!("writing {path}"))?;
        }

        Ok(())
    }
}

fn user_data(node: &NodeSpec, network: &ClusterNetwork) -> String {
    let mut doc = format!(
        "#cloud-config\nhostname: {0}\nfqdn: {0}.cluster.internal\n\
        manage_etc_hosts: true\npackage_update: true\n",
        node.name
    );

    if !node.packages.is_empty() {
        doc.push_str("packages:\n");
        for package in &node.packages {
            doc.push_str(&format!("  - {package}\n"));
        }
    }

    if node.role == NodeRole::Storage {
        doc.push_str(&format!(
            "write_files:\n  - path: /etc/exports\n    content: |\n      \
            {EXPORT_DIR} {}(rw,sync,no_subtree_check)\n\
            runcmd:\n  - [mkdir, -p, {EXPORT_DIR}]\n  - [exportfs, -ra]\n",
            network.cidr
        ));
    }

    doc
}

fn network_config(node: &NodeSpec, network: &ClusterNetwork) -> String {
    format!(
        r#"version: 2
ethernets:
  {NAT_INTERFACE}:
    dhcp4: true
  {CLUSTER_INTERFACE}:
    dhcp4: false
    addresses:
      - {address}
    routes:
      - to: default
        via: {gateway}
        metric: 200
"#,
        address = node.address,
        gateway = network.gateway,
    )
}

/// Writes the documents for `node` into `staging` and packs them into a
/// `cidata` volume at `output`.
pub fn build_volume(
    docs: &NodeDocuments,
    staging: &Utf8Path,
    output: &Utf8Path,
    ui: &dyn Ui,
) -> anyhow::Result<Utf8PathBuf> {
    docs.write_to(staging)?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {parent}"))?;
    }

    run_command_check_status(
        Command::new("genisoimage")
            .current_dir(staging)
            .args(["-output", output.as_str(), "-volid", VOLUME_LABEL])
            .args(["-joliet", "-rock"])
            .args(NodeDocuments::FILE_NAMES)
            .stdout(ui.stdout_target()),
        ui,
    )
    .with_context(|| format!("building configuration volume {output}"))?;

    debug!(%output, "built configuration volume");
    Ok(output.to_owned())
}
