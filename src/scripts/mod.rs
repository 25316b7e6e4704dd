// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scripts each subcommand runs.

use std::collections::HashMap;

use crate::{
    app::{App, Command},
    paths::RunPaths,
    runner::{MissingPrerequisites, Script, ScriptStep},
    util::{check_executable_prerequisites, check_file_prerequisites},
};

use self::{build_image::BuildImagePlan, provision::ProvisionPlan};

pub mod build_image;
pub mod provision;

/// A run made of an optional image build followed by optional provisioning.
struct DebvmScript {
    paths: RunPaths,
    build: Option<BuildImagePlan>,
    provision: Option<ProvisionPlan>,
    steps: Vec<ScriptStep>,
}

impl DebvmScript {
    fn new(
        paths: RunPaths,
        build: Option<BuildImagePlan>,
        provision: Option<ProvisionPlan>,
    ) -> Self {
        let steps = build
            .iter()
            .flat_map(|plan| plan.steps())
            .chain(provision.iter().flat_map(|plan| plan.steps()))
            .collect();

        Self { paths, build, provision, steps }
    }
}

impl Script for DebvmScript {
    fn steps(&self) -> &[ScriptStep] {
        self.steps.as_slice()
    }

    fn print_configuration(
        &self,
        mut w: Box<dyn std::io::Write>,
    ) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "  {}: {}", "Work directory".bold(), self.paths.work_dir)?;
        writeln!(
            w,
            "  {}: {}\n",
            "Output directory".bold(),
            self.paths.output_dir
        )?;

        if let Some(build) = &self.build {
            build.print_configuration(&mut w, &self.paths)?;
        }

        if let Some(provision) = &self.provision {
            if self.build.is_some() {
                writeln!(w)?;
            }
            provision.print_configuration(&mut w, &self.paths)?;
        }

        Ok(())
    }

    fn check_prerequisites(&self) -> MissingPrerequisites {
        let mut files = Vec::new();
        if let Some(build) = &self.build {
            files.extend(build.file_prerequisites(&self.paths));
        }
        if let Some(provision) = &self.provision {
            files.extend(
                provision.file_prerequisites(&self.paths, self.build.is_some()),
            );
        }

        let mut errors = check_executable_prerequisites(&self.steps);
        errors.extend(check_file_prerequisites(&files));
        MissingPrerequisites::from_messages(errors, Vec::new())
    }

    fn initial_context(&self) -> HashMap<String, String> {
        let paths = &self.paths;
        let mut ctx: HashMap<String, String> = [
            ("work_dir", &paths.work_dir),
            ("output_dir", &paths.output_dir),
            ("tree", &paths.tree),
            ("seed_dir", &paths.seed_dir),
            ("node_config_dir", &paths.node_config_dir),
            ("installer_image", &paths.installer_image),
            ("summary", &paths.summary),
            ("vm_base_folder", &paths.vm_base_folder),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        if let Some(build) = &self.build {
            ctx.extend(build.initial_context(paths));
        }

        ctx
    }
}

/// Builds the script for the subcommand `app` was invoked with.
pub fn get_script(app: &App) -> anyhow::Result<Box<dyn Script>> {
    let paths = app.paths()?;
    let (build, provision) = match &app.command {
        Command::BuildImage { image } => {
            (Some(BuildImagePlan::new(image.clone())?), None)
        }
        Command::Provision { cluster } => {
            (None, Some(ProvisionPlan::new(cluster)?))
        }
        Command::Run { image, cluster } => (
            Some(BuildImagePlan::new(image.clone())?),
            Some(ProvisionPlan::new(cluster)?),
        ),
    };

    Ok(Box::new(DebvmScript::new(paths, build, provision)))
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;

    fn script(args: &[&str]) -> Box<dyn Script> {
        let app = App::try_parse_from(
            ["debvm", "--work-dir", "/w", "--output-dir", "/o"]
                .into_iter()
                .chain(args.iter().copied()),
        )
        .unwrap();
        get_script(&app).unwrap()
    }

    fn labels(script: &dyn Script) -> Vec<&'static str> {
        script.steps().iter().map(|s| s.label()).collect()
    }

    #[test]
    fn run_builds_before_provisioning() {
        let script = script(&["run", "--password", "pw"]);
        let labels = labels(script.as_ref());
        let repack = labels
            .iter()
            .position(|l| *l == "repackage installer image")
            .unwrap();
        let volumes = labels
            .iter()
            .position(|l| *l == "build node configuration volumes")
            .unwrap();
        assert!(repack < volumes);
        assert_eq!(labels.last(), Some(&"write run summary"));
    }

    #[test]
    fn provision_alone_needs_an_existing_image() {
        let script = script(&["provision"]);
        assert_eq!(labels(script.as_ref()).len(), 4);
        let missing = script.check_prerequisites();
        assert!(missing
            .errors()
            .iter()
            .any(|e| e.contains("/o/debvm-installer.iso")));
    }

    #[test]
    fn context_carries_every_run_path() {
        let script = script(&["build-image", "--password", "pw"]);
        let ctx = script.initial_context();
        assert_eq!(ctx["tree"], "/w/tree");
        assert_eq!(ctx["installer_image"], "/o/debvm-installer.iso");
        assert_eq!(ctx["vm_base_folder"], "/o/vms");
        assert_eq!(ctx["volume_label"], "DEBVM_INSTALL");
    }

    #[test]
    fn missing_password_fails_before_running() {
        let app =
            App::try_parse_from(["debvm", "build-image"]).unwrap();
        // DEBVM_PASSWORD may be set in the environment running the tests.
        if std::env::var_os("DEBVM_PASSWORD").is_none() {
            assert!(get_script(&app).is_err());
        }
    }
}
