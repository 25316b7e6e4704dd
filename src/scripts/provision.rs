// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write;

use anyhow::Result;
use camino::Utf8PathBuf;
use colored::Colorize;
use tracing::info;

use crate::{
    app::ClusterOptions,
    cluster::{
        self,
        hypervisor::{Hypervisor, VBoxManage},
        provision::{config_volume_path, provision_nodes, ProvisionMedia},
        summary, ClusterNetwork, NodeSpec,
    },
    nodeconfig::{self, NodeDocuments},
    paths::RunPaths,
    runner::{Context, ScriptStep},
    ui::Ui,
};

/// The roster and network the cluster is provisioned with.
pub struct ProvisionPlan {
    network: ClusterNetwork,
    roster: Vec<NodeSpec>,
}

impl ProvisionPlan {
    pub fn new(options: &ClusterOptions) -> Result<Self> {
        let network = options.network()?;
        let roster =
            cluster::roster(&options.name_prefix, &options.resources(), &network)?;
        Ok(Self { network, roster })
    }

    pub fn print_configuration(
        &self,
        w: &mut dyn Write,
        paths: &RunPaths,
    ) -> std::io::Result<()> {
        writeln!(w, "Provisioning a {}-node cluster:\n", self.roster.len())?;
        writeln!(
            w,
            "  {}: {} (host at {})",
            "Network".bold(),
            self.network.cidr,
            self.network.gateway
        )?;
        writeln!(w, "  {}: {}", "VM folder".bold(), paths.vm_base_folder)?;
        writeln!(w, "  {}: {}", "Boot image".bold(), paths.installer_image)?;
        writeln!(w)?;
        for node in &self.roster {
            writeln!(
                w,
                "  {:<20} {:>6} MiB  {} vCPU  {:>6} MiB disk  {}",
                node.name.bold(),
                node.resources.memory_mib,
                node.resources.cpus,
                node.resources.disk_mib,
                node.address
            )?;
        }

        Ok(())
    }

    pub fn steps(&self) -> Vec<ScriptStep> {
        let (roster, network) = (self.roster.clone(), self.network);
        let build_volumes = ScriptStep::with_prereqs(
            "build node configuration volumes",
            move |ctx, ui| build_config_volumes(ctx, ui, &roster, &network),
            &["genisoimage"],
        );

        let network = self.network;
        let create_network = ScriptStep::with_prereqs(
            "create host-only network",
            move |ctx, ui| {
                let name = VBoxManage::new(ui).create_host_network(&network)?;
                info!(interface = %name, "created host-only network");
                ctx.set_var("host_network", name);
                Ok(())
            },
            &[VBoxManage::COMMAND],
        );

        let roster = self.roster.clone();
        let provision = ScriptStep::with_prereqs(
            "provision nodes",
            move |ctx, ui| {
                let base_folder = ctx.require_path("vm_base_folder")?;
                let installer_image = ctx.require_path("installer_image")?;
                let output_dir = ctx.require_path("output_dir")?;
                let media = ProvisionMedia {
                    base_folder: &base_folder,
                    installer_image: &installer_image,
                    config_volume_dir: &output_dir,
                };
                provision_nodes(
                    &VBoxManage::new(ui),
                    &roster,
                    ctx.require_var("host_network")?,
                    &media,
                )
            },
            &[VBoxManage::COMMAND],
        );

        let roster = self.roster.clone();
        let write_summary = ScriptStep::new("write run summary", move |ctx, _ui| {
            let path = ctx.require_path("summary")?;
            summary::append_summary(&path, &roster)?;
            info!(%path, nodes = roster.len(), "wrote run summary");
            Ok(())
        });

        vec![build_volumes, create_network, provision, write_summary]
    }

    /// Files that must exist before provisioning starts. When the installer
    /// image is built by the same run, it doesn't exist yet.
    pub fn file_prerequisites(
        &self,
        paths: &RunPaths,
        builds_image: bool,
    ) -> Vec<Utf8PathBuf> {
        if builds_image {
            Vec::new()
        } else {
            vec![paths.installer_image.clone()]
        }
    }
}

fn build_config_volumes(
    ctx: &mut Context,
    ui: &dyn Ui,
    roster: &[NodeSpec],
    network: &ClusterNetwork,
) -> Result<()> {
    let staging = ctx.require_path("node_config_dir")?;
    let output_dir = ctx.require_path("output_dir")?;
    for node in roster {
        ui.set_substep(&format!("configuration volume for {}", node.name));
        let docs = NodeDocuments::render(node, network);
        nodeconfig::build_volume(
            &docs,
            &staging.join(&node.name),
            &config_volume_path(&output_dir, node),
            ui,
        )?;
    }

    Ok(())
}
