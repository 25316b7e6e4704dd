// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating the cluster's virtual machines.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use super::{
    hypervisor::{Attachment, BootDevice, DeviceType, Hypervisor},
    NodeSpec,
};

const OS_TYPE: &str = "Debian_64";
const CONTROLLER: &str = "SATA";
const BOOT_ORDER: [BootDevice; 4] =
    [BootDevice::Optical, BootDevice::Disk, BootDevice::None, BootDevice::None];

/// The media shared by or generated for the nodes.
pub struct ProvisionMedia<'a> {
    /// Directory VMs and their disks are created under.
    pub base_folder: &'a Utf8Path,
    /// The unattended installer image every node boots from.
    pub installer_image: &'a Utf8Path,
    /// Directory holding `<node>-cidata.iso` for each node.
    pub config_volume_dir: &'a Utf8Path,
}

impl ProvisionMedia<'_> {
    pub fn disk_path(&self, node: &NodeSpec) -> Utf8PathBuf {
        self.base_folder
            .join(&node.name)
            .join(format!("{}.vdi", node.name))
    }

    pub fn config_volume(&self, node: &NodeSpec) -> Utf8PathBuf {
        config_volume_path(self.config_volume_dir, node)
    }
}

/// Where the configuration volume for `node` lives under `dir`.
pub fn config_volume_path(dir: &Utf8Path, node: &NodeSpec) -> Utf8PathBuf {
    dir.join(format!("{}-cidata.iso", node.name))
}

/// Creates, configures, and attaches media to the VM for `node`. The
/// primary disk, the installer image, and the configuration volume go on
/// ports 0, 1, and 2 of one SATA controller, in that order.
pub fn provision_node(
    hv: &dyn Hypervisor,
    node: &NodeSpec,
    host_network: &str,
    media: &ProvisionMedia<'_>,
) -> anyhow::Result<()> {
    info!(
        node = %node.name,
        resources = %node.resources,
        address = %node.address,
        "provisioning node"
    );

    hv.create_vm(&node.name, OS_TYPE, media.base_folder)?;
    hv.configure_vm(&node.name, &node.resources, host_network)?;
    hv.add_storage_controller(&node.name, CONTROLLER, 3)?;

    let disk = media.disk_path(node);
    hv.create_disk(&disk, node.resources.disk_mib)?;

    let config_volume = media.config_volume(node);
    let attachments = [
        (DeviceType::HardDisk, disk.as_path()),
        (DeviceType::Optical, media.installer_image),
        (DeviceType::Optical, config_volume.as_path()),
    ];
    for (port, (device, medium)) in attachments.into_iter().enumerate() {
        hv.attach_medium(
            &node.name,
            &Attachment {
                controller: CONTROLLER,
                port: port as u32,
                device,
                medium,
            },
        )?;
    }

    hv.set_boot_order(&node.name, &BOOT_ORDER)
}

/// Provisions every node in roster order, stopping at the first failure.
/// VMs created before a failure are left in place.
pub fn provision_nodes(
    hv: &dyn Hypervisor,
    roster: &[NodeSpec],
    host_network: &str,
    media: &ProvisionMedia<'_>,
) -> anyhow::Result<()> {
    for node in roster {
        provision_node(hv, node, host_network, media).map_err(|e| {
            e.context(format!("provisioning node {}", node.name))
        })?;
    }

    Ok(())
}
