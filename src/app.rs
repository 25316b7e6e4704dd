// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::Ipv4Addr;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use ipnetwork::Ipv4Network;

use crate::{
    cluster::{ClusterNetwork, ResourceAllocation, RoleResources},
    installer::AnswerFileDelivery,
    paths::RunPaths,
    preseed::{PartitionRecipe, PreseedParams},
};

/// Packages every node gets from the installer, whatever its role.
const BASE_PACKAGES: [&str; 4] =
    ["openssh-server", "cloud-init", "sudo", "curl"];

#[derive(Parser)]
#[command(version, about)]
pub struct App {
    /// The directory in which to store downloads, the unpacked installer
    /// image, and other intermediate files.
    #[arg(long, global = true, default_value = "work")]
    pub work_dir: Utf8PathBuf,

    /// The directory to write the installer image, node configuration
    /// volumes, and run summary to.
    #[arg(long, global = true, default_value = "output")]
    pub output_dir: Utf8PathBuf,

    /// The file name of the unattended installer image within the output
    /// directory.
    #[arg(long, global = true, default_value = "debvm-installer.iso")]
    pub installer_image_name: String,

    /// Forces the tool to run in an interactive or non-interactive mode. If not
    /// set, the tool infers whether to run interactively from whether it is
    /// running in an interactive terminal.
    #[arg(long, global = true, default_value = Option::None)]
    pub interactive: Option<bool>,

    /// Logs debug messages. `RUST_LOG` takes precedence when set.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Builds an installer image that installs Debian without asking any
    /// questions.
    BuildImage {
        #[command(flatten)]
        image: ImageOptions,
    },

    /// Creates the cluster's VMs, booting each from a previously built
    /// installer image.
    Provision {
        #[command(flatten)]
        cluster: ClusterOptions,
    },

    /// Builds the installer image, then provisions the cluster with it.
    Run {
        #[command(flatten)]
        image: ImageOptions,

        #[command(flatten)]
        cluster: ClusterOptions,
    },
}

#[derive(Args, Clone, Debug)]
pub struct ImageOptions {
    /// The URL of the directory the base installer image and its checksum
    /// list are published in.
    #[arg(
        long,
        default_value = "https://cdimage.debian.org/debian-cd/current/amd64/iso-cd"
    )]
    pub image_url: String,

    /// The file name of the base installer image.
    #[arg(long, default_value = "debian-12.7.0-amd64-netinst.iso")]
    pub image_name: String,

    /// The file name of the published SHA-256 checksum list.
    #[arg(long, default_value = "SHA256SUMS")]
    pub checksum_list: String,

    /// Never download anything. The base image and checksum list must
    /// already be in the work directory.
    #[arg(long, default_value_t = false)]
    pub offline: bool,

    /// How the installer finds the answer file.
    #[arg(long, value_enum, default_value_t = AnswerFileDelivery::Initrd)]
    pub delivery: AnswerFileDelivery,

    /// The volume label of the installer image.
    #[arg(long, default_value = "DEBVM_INSTALL")]
    pub volume_label: String,

    /// Keeps the unpacked installer image after a successful build.
    #[arg(long, default_value_t = false)]
    pub keep_work_dir: bool,

    /// Removes an unpacked installer image left in the work directory by an
    /// earlier run before extracting the base image again.
    #[arg(long, default_value_t = false)]
    pub clean: bool,

    #[arg(long, default_value = "en_US.UTF-8")]
    pub locale: String,

    #[arg(long, default_value = "us")]
    pub keymap: String,

    #[arg(long, default_value = "Etc/UTC")]
    pub timezone: String,

    /// The guest disk to install to.
    #[arg(long, default_value = "/dev/sda")]
    pub disk: String,

    #[arg(long, value_enum, default_value_t = PartitionRecipe::Atomic)]
    pub partitioning: PartitionRecipe,

    /// The Debian mirror the installer fetches packages from.
    #[arg(long, default_value = "deb.debian.org")]
    pub mirror_host: String,

    /// The name of the administrative account created on every node.
    #[arg(long, default_value = "debvm")]
    pub username: String,

    #[arg(long, default_value = "debvm administrator")]
    pub full_name: String,

    /// The administrative account's password.
    #[arg(
        long,
        env = "DEBVM_PASSWORD",
        hide_env_values = true,
        conflicts_with = "password_file"
    )]
    pub password: Option<String>,

    /// A file holding the administrative account's password.
    #[arg(long)]
    pub password_file: Option<Utf8PathBuf>,

    /// A file holding a root password. Root logins are disabled if this is
    /// not set.
    #[arg(long)]
    pub root_password_file: Option<Utf8PathBuf>,

    /// Additional packages to install on every node, separated by commas.
    #[arg(long, value_delimiter = ',')]
    pub extra_packages: Vec<String>,

    /// Reboots into the installed system when installation finishes instead
    /// of powering off. VMs boot from the installer image first, so a reboot
    /// starts another installation unless the image is detached.
    #[arg(long, default_value_t = false)]
    pub reboot: bool,
}

impl ImageOptions {
    pub fn image_download_url(&self) -> String {
        crate::fetch::join_url(&self.image_url, &self.image_name)
    }

    pub fn checksum_list_url(&self) -> String {
        crate::fetch::join_url(&self.image_url, &self.checksum_list)
    }

    /// Assembles the answer file parameters, reading passwords from wherever
    /// they were supplied.
    pub fn preseed_params(&self) -> anyhow::Result<PreseedParams> {
        let password = match (&self.password, &self.password_file) {
            (Some(password), _) => password.clone(),
            (None, Some(file)) => read_secret(file)?,
            (None, None) => anyhow::bail!(
                "no account password: pass --password-file or set \
                DEBVM_PASSWORD"
            ),
        };
        anyhow::ensure!(!password.is_empty(), "account password is empty");

        let root_password = self
            .root_password_file
            .as_ref()
            .map(|file| read_secret(file))
            .transpose()?;

        let packages = BASE_PACKAGES
            .iter()
            .map(|p| p.to_string())
            .chain(self.extra_packages.iter().cloned())
            .collect();

        Ok(PreseedParams {
            locale: self.locale.clone(),
            keymap: self.keymap.clone(),
            timezone: self.timezone.clone(),
            disk: self.disk.clone(),
            partitioning: self.partitioning,
            mirror_host: self.mirror_host.clone(),
            full_name: self.full_name.clone(),
            username: self.username.clone(),
            password,
            root_password,
            packages,
            reboot_on_finish: self.reboot,
        })
    }
}

/// Reads a secret from the first line of `file`.
fn read_secret(file: &camino::Utf8Path) -> anyhow::Result<String> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading password from {file}"))?;
    Ok(text.lines().next().unwrap_or_default().to_string())
}

#[derive(Args, Clone, Debug)]
pub struct ClusterOptions {
    /// The host-only network the nodes share.
    #[arg(long, default_value = "192.168.56.0/24")]
    pub cidr: Ipv4Network,

    /// The host's address on the cluster network.
    #[arg(long, default_value = "192.168.56.1")]
    pub gateway: Ipv4Addr,

    /// The host number of the first node's address. Each following node gets
    /// the next address.
    #[arg(long, default_value_t = 10)]
    pub address_offset: u32,

    /// Prefix for VM names and hostnames.
    #[arg(long, default_value = "debvm")]
    pub name_prefix: String,

    /// The directory VirtualBox creates VMs and their disks in. Defaults to
    /// `vms` in the output directory.
    #[arg(long)]
    pub vm_base_folder: Option<Utf8PathBuf>,

    /// Resources for the controller, as MEMORY_MIB:CPUS:DISK_MIB.
    #[arg(long, default_value_t = ResourceAllocation::CONTROLLER)]
    pub controller: ResourceAllocation,

    /// Resources for each worker, as MEMORY_MIB:CPUS:DISK_MIB.
    #[arg(long, default_value_t = ResourceAllocation::WORKER)]
    pub worker: ResourceAllocation,

    /// Resources for the storage node, as MEMORY_MIB:CPUS:DISK_MIB.
    #[arg(long, default_value_t = ResourceAllocation::STORAGE)]
    pub storage: ResourceAllocation,
}

impl ClusterOptions {
    pub fn network(&self) -> anyhow::Result<ClusterNetwork> {
        ClusterNetwork::new(self.cidr, self.gateway, self.address_offset)
    }

    pub fn resources(&self) -> RoleResources {
        RoleResources {
            controller: self.controller,
            worker: self.worker,
            storage: self.storage,
        }
    }
}

impl App {
    pub fn paths(&self) -> anyhow::Result<RunPaths> {
        let vm_base_folder = match &self.command {
            Command::Provision { cluster } | Command::Run { cluster, .. } => {
                cluster.vm_base_folder.as_deref()
            }
            Command::BuildImage { .. } => None,
        };

        RunPaths::resolve(
            &self.work_dir,
            &self.output_dir,
            &self.installer_image_name,
            vm_base_folder,
        )
    }
}
