// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor operations provisioning needs, and their VirtualBox
//! implementation.

use std::process::Command;

use anyhow::Context as _;
use camino::Utf8Path;
use tracing::info;

use super::{ClusterNetwork, ResourceAllocation};
use crate::{
    ui::Ui,
    util::{grep_command_for_row_and_column, run_command_check_status},
};

/// The kind of device a medium is attached as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    HardDisk,
    Optical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootDevice {
    Optical,
    Disk,
    None,
}

/// A medium attached to a port of a VM's storage controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attachment<'a> {
    pub controller: &'a str,
    pub port: u32,
    pub device: DeviceType,
    pub medium: &'a Utf8Path,
}

/// Operations on virtual machines and host networks. Each call either
/// completes or fails; nothing is rolled back.
pub trait Hypervisor {
    /// Creates an isolated host network with the host at `network.gateway`
    /// and returns its name.
    fn create_host_network(
        &self,
        network: &ClusterNetwork,
    ) -> anyhow::Result<String>;

    fn create_vm(
        &self,
        name: &str,
        os_type: &str,
        base_folder: &Utf8Path,
    ) -> anyhow::Result<()>;

    /// Sets memory and vCPUs, and connects the first NIC to NAT and the
    /// second to `host_network`.
    fn configure_vm(
        &self,
        name: &str,
        resources: &ResourceAllocation,
        host_network: &str,
    ) -> anyhow::Result<()>;

    fn add_storage_controller(
        &self,
        vm: &str,
        controller: &str,
        ports: u32,
    ) -> anyhow::Result<()>;

    fn create_disk(&self, path: &Utf8Path, size_mib: u32) -> anyhow::Result<()>;

    fn attach_medium(
        &self,
        vm: &str,
        attachment: &Attachment<'_>,
    ) -> anyhow::Result<()>;

    fn set_boot_order(
        &self,
        vm: &str,
        order: &[BootDevice; 4],
    ) -> anyhow::Result<()>;
}

/// Drives VirtualBox through `VBoxManage`.
pub struct VBoxManage<'a> {
    ui: &'a dyn Ui,
}

impl<'a> VBoxManage<'a> {
    pub const COMMAND: &'static str = "VBoxManage";

    pub fn new(ui: &'a dyn Ui) -> Self {
        Self { ui }
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<()> {
        run_command_check_status(
            Command::new(Self::COMMAND)
                .args(args)
                .stdout(self.ui.stdout_target()),
            self.ui,
        )?;
        Ok(())
    }
}

impl Hypervisor for VBoxManage<'_> {
    fn create_host_network(
        &self,
        network: &ClusterNetwork,
    ) -> anyhow::Result<String> {
        // Prints "Interface 'vboxnet0' was successfully created".
        let quoted = grep_command_for_row_and_column(
            Command::new(Self::COMMAND).args(["hostonlyif", "create"]),
            "was successfully created",
            1,
            self.ui,
        )
        .context("creating host-only interface")?;
        let name = quoted.trim_matches('\'').to_string();

        info!(interface = %name, cidr = %network.cidr, "configuring host-only network");
        self.run(&[
            "hostonlyif",
            "ipconfig",
            &name,
            "--ip",
            &network.gateway.to_string(),
            "--netmask",
            &network.netmask().to_string(),
        ])
        .with_context(|| format!("configuring {name}"))?;

        Ok(name)
    }

    fn create_vm(
        &self,
        name: &str,
        os_type: &str,
        base_folder: &Utf8Path,
    ) -> anyhow::Result<()> {
        self.run(&[
            "createvm",
            "--name",
            name,
            "--ostype",
            os_type,
            "--basefolder",
            base_folder.as_str(),
            "--register",
        ])
        .with_context(|| format!("creating VM {name}"))
    }

    fn configure_vm(
        &self,
        name: &str,
        resources: &ResourceAllocation,
        host_network: &str,
    ) -> anyhow::Result<()> {
        self.run(&[
            "modifyvm",
            name,
            "--memory",
            &resources.memory_mib.to_string(),
            "--cpus",
            &resources.cpus.to_string(),
            "--nic1",
            "nat",
            "--nic2",
            "hostonly",
            "--hostonlyadapter2",
            host_network,
        ])
        .with_context(|| format!("configuring VM {name}"))
    }

    fn add_storage_controller(
        &self,
        vm: &str,
        controller: &str,
        ports: u32,
    ) -> anyhow::Result<()> {
        self.run(&[
            "storagectl",
            vm,
            "--name",
            controller,
            "--add",
            "sata",
            "--controller",
            "IntelAhci",
            "--portcount",
            &ports.to_string(),
        ])
        .with_context(|| format!("adding storage controller to {vm}"))
    }

    fn create_disk(&self, path: &Utf8Path, size_mib: u32) -> anyhow::Result<()> {
        self.run(&[
            "createmedium",
            "disk",
            "--filename",
            path.as_str(),
            "--size",
            &size_mib.to_string(),
            "--format",
            "VDI",
        ])
        .with_context(|| format!("creating disk {path}"))
    }

    fn attach_medium(
        &self,
        vm: &str,
        attachment: &Attachment<'_>,
    ) -> anyhow::Result<()> {
        let device = match attachment.device {
            DeviceType::HardDisk => "hdd",
            DeviceType::Optical => "dvddrive",
        };

        self.run(&[
            "storageattach",
            vm,
            "--storagectl",
            attachment.controller,
            "--port",
            &attachment.port.to_string(),
            "--device",
            "0",
            "--type",
            device,
            "--medium",
            attachment.medium.as_str(),
        ])
        .with_context(|| {
            format!("attaching {} to {vm}", attachment.medium)
        })
    }

    fn set_boot_order(
        &self,
        vm: &str,
        order: &[BootDevice; 4],
    ) -> anyhow::Result<()> {
        let names = order.map(|d| match d {
            BootDevice::Optical => "dvd",
            BootDevice::Disk => "disk",
            BootDevice::None => "none",
        });

        self.run(&[
            "modifyvm",
            vm,
            "--boot1",
            names[0],
            "--boot2",
            names[1],
            "--boot3",
            names[2],
            "--boot4",
            names[3],
        ])
        .with_context(|| format!("setting boot order of {vm}"))
    }
}
