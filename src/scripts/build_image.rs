// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Steps that turn a stock Debian installer image into an unattended one.

use std::{collections::HashMap, io::Write};

use anyhow::{Context as _, Result};
use camino::Utf8PathBuf;
use colored::Colorize;
use tracing::{debug, info, warn};

use crate::{
    app::ImageOptions,
    fetch,
    installer::{
        bootmenu::{self, BootLoader, KernelArgs},
        initrd, manifest,
        repack::{self, BootParameters},
        tree::{self, WorkingTree},
        AnswerFileDelivery, InstallerLayout,
    },
    paths::RunPaths,
    preseed::{self, AnswerDocument, PreseedParams, ANSWER_FILE_NAME},
    runner::{Context, ScriptStep},
    ui::Ui,
    util::md5_file,
    writable::Writable,
};

/// Everything needed to build the installer image.
pub struct BuildImagePlan {
    options: ImageOptions,
    preseed: PreseedParams,
}

impl BuildImagePlan {
    pub fn new(options: ImageOptions) -> Result<Self> {
        let preseed = options.preseed_params()?;
        Ok(Self { options, preseed })
    }

    pub fn print_configuration(
        &self,
        w: &mut dyn Write,
        paths: &RunPaths,
    ) -> std::io::Result<()> {
        let opts = &self.options;
        writeln!(w, "Building an unattended installer image:\n")?;
        if opts.offline {
            writeln!(
                w,
                "  {}: {} (offline)",
                "Base image".bold(),
                paths.download(&opts.image_name)
            )?;
        } else {
            writeln!(
                w,
                "  {}: {}",
                "Base image".bold(),
                opts.image_download_url()
            )?;
        }
        writeln!(w, "  {}: {}", "Checksum list".bold(), opts.checksum_list)?;
        writeln!(
            w,
            "  {}: {}",
            "Answer file".bold(),
            preseed::describe(&self.preseed)
        )?;
        writeln!(w, "  {}: {}", "Answer file location".bold(), opts.delivery)?;
        writeln!(w, "  {}: {}", "Volume label".bold(), opts.volume_label)?;
        writeln!(w)?;
        writeln!(w, "  {}: {}", "Output image".bold(), paths.installer_image)?;
        if opts.keep_work_dir {
            writeln!(w, "  Will keep the unpacked image in {}", paths.tree)?;
        }

        Ok(())
    }

    /// Files that must exist before the build starts.
    pub fn file_prerequisites(&self, paths: &RunPaths) -> Vec<Utf8PathBuf> {
        let mut files = Vec::new();
        if self.options.offline {
            files.push(paths.download(&self.options.image_name));
            files.push(paths.download(&self.options.checksum_list));
        }
        if let Some(file) = &self.options.password_file {
            files.push(file.clone());
        }

        files
    }

    pub fn initial_context(&self, paths: &RunPaths) -> HashMap<String, String> {
        let opts = &self.options;
        [
            ("base_image", paths.download(&opts.image_name).to_string()),
            ("checksum_list", paths.download(&opts.checksum_list).to_string()),
            ("image_download_url", opts.image_download_url()),
            ("checksum_list_url", opts.checksum_list_url()),
            ("volume_label", opts.volume_label.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    pub fn steps(&self) -> Vec<ScriptStep> {
        let mut steps = Vec::new();
        if !self.options.offline {
            steps.push(ScriptStep::with_prereqs(
                "download base image",
                download_base_image,
                &["curl"],
            ));
        }

        steps.push(ScriptStep::new(
            "verify base image checksum",
            verify_base_image,
        ));
        steps.extend(answer_file_steps(&self.preseed));
        let clean = self.options.clean;
        steps.push(ScriptStep::with_prereqs(
            "extract base image",
            move |ctx, ui| extract_base_image(ctx, ui, clean),
            &["7z"],
        ));
        steps.extend(mutation_steps(
            self.options.delivery,
            &self.preseed.locale,
            &self.preseed.keymap,
        ));
        steps.push(ScriptStep::with_prereqs(
            "repackage installer image",
            repackage_installer_image,
            &["genisoimage"],
        ));
        if !self.options.keep_work_dir {
            steps.push(ScriptStep::new(
                "remove unpacked image",
                remove_working_tree,
            ));
        }

        steps
    }
}

fn working_tree(ctx: &Context) -> Result<WorkingTree> {
    Ok(WorkingTree::open(ctx.require_path("tree")?, InstallerLayout::default()))
}

fn download_base_image(ctx: &mut Context, ui: &dyn Ui) -> Result<()> {
    for (path_var, url_var) in [
        ("base_image", "image_download_url"),
        ("checksum_list", "checksum_list_url"),
    ] {
        let path = ctx.require_path(path_var)?;
        if path.exists() {
            ui.set_substep(&format!("using existing {path}"));
            continue;
        }

        fetch::download(ctx.require_var(url_var)?, &path, ui)?;
    }

    Ok(())
}

fn verify_base_image(ctx: &mut Context, ui: &dyn Ui) -> Result<()> {
    ui.set_substep("computing SHA-256");
    let artifact = fetch::verify_against_list(
        &ctx.require_path("base_image")?,
        &ctx.require_path("checksum_list")?,
    )?;

    info!(
        image = %artifact.path,
        sha256 = %artifact.sha256,
        size = artifact.size,
        "base image verified"
    );
    Ok(())
}

/// Renders the answer file and records its checksum.
fn answer_file_steps(params: &PreseedParams) -> Vec<ScriptStep> {
    let params = params.clone();
    vec![
        ScriptStep::new("render answer file", move |ctx, _ui| {
            let doc = AnswerDocument::render(&params);
            let path = doc.write_to(&ctx.require_path("seed_dir")?)?;
            debug!(%path, "wrote answer file");
            ctx.set_var("answer_file", path.to_string());
            Ok(())
        }),
        ScriptStep::new("compute answer file checksum", |ctx, _ui| {
            let path = ctx.require_path("answer_file")?;
            let sum = AnswerDocument::read(&path)?.md5();
            info!(md5 = %sum, "answer file checksum");
            ctx.set_var("answer_md5", sum);
            Ok(())
        }),
    ]
}

fn extract_base_image(
    ctx: &mut Context,
    ui: &dyn Ui,
    clean: bool,
) -> Result<()> {
    let root = ctx.require_path("tree")?;
    if clean {
        tree::remove_leftover(&root)?;
    }

    WorkingTree::extract(
        &ctx.require_path("base_image")?,
        root,
        InstallerLayout::default(),
        ui,
    )?;
    Ok(())
}

/// The steps that change the unpacked image, ending with the regenerated
/// manifest.
fn mutation_steps(
    delivery: AnswerFileDelivery,
    locale: &str,
    keymap: &str,
) -> Vec<ScriptStep> {
    let mut steps = match delivery {
        AnswerFileDelivery::Initrd => vec![
            ScriptStep::new("unlock installer directory", unlock_installer_dir),
            ScriptStep::new("decompress initrd", decompress_initrd),
            ScriptStep::new("append answer file to initrd", append_answer_file),
            ScriptStep::new("recompress initrd", recompress_initrd),
            ScriptStep::new("relock installer directory", relock_installer_dir),
            ScriptStep::new(
                "verify answer file checksum in initrd",
                verify_initrd_answer_file,
            ),
        ],
        AnswerFileDelivery::Cdrom => vec![
            ScriptStep::new(
                "copy answer file to installation medium",
                copy_answer_file_to_medium,
            ),
            ScriptStep::new(
                "verify answer file checksum on medium",
                verify_medium_answer_file,
            ),
        ],
    };

    let (locale, keymap) = (locale.to_string(), keymap.to_string());
    let kernel_args = move |ctx: &Context| -> Result<KernelArgs> {
        let mut args = KernelArgs::new(
            delivery.preseed_location(ANSWER_FILE_NAME),
            ctx.require_var("answer_md5")?.to_string(),
        );
        args.locale = locale.clone();
        args.keymap = keymap.clone();
        Ok(args)
    };
    let (bios_args, efi_args) = (kernel_args.clone(), kernel_args);

    steps.extend([
        ScriptStep::new("rewrite boot menus", move |ctx, _ui| {
            let tree = working_tree(ctx)?;
            bootmenu::rewrite(
                &tree,
                &[BootLoader::Isolinux, BootLoader::Grub],
                &bios_args(ctx)?,
            )?;
            Ok(())
        }),
        ScriptStep::new("rewrite EFI boot configuration", move |ctx, _ui| {
            let tree = working_tree(ctx)?;
            bootmenu::rewrite(&tree, &[BootLoader::GrubEfi], &efi_args(ctx)?)?;
            bootmenu::check_checksums(&tree, ctx.require_var("answer_md5")?)
        }),
        ScriptStep::new("regenerate md5sum.txt", regenerate_manifest),
    ]);

    steps
}

fn unlock_installer_dir(ctx: &mut Context, _ui: &dyn Ui) -> Result<()> {
    let tree = working_tree(ctx)?;
    let dir = tree.path(tree.layout().installer_dir);
    ctx.hold_writable(Writable::acquire(&dir)?);
    Ok(())
}

fn decompress_initrd(ctx: &mut Context, ui: &dyn Ui) -> Result<()> {
    let tree = working_tree(ctx)?;
    let gz = tree.path(tree.layout().initrd);
    ui.set_substep(&format!("decompressing {gz}"));
    let raw = initrd::decompress_in_place(&gz)?;
    ctx.set_var("initrd_raw", raw.to_string());
    Ok(())
}

fn append_answer_file(ctx: &mut Context, _ui: &dyn Ui) -> Result<()> {
    let raw = ctx.require_path("initrd_raw")?;
    let answer = ctx.require_path("answer_file")?;
    let member = initrd::append_answer_file(&raw, &answer)?;
    debug!(%member, "appended answer file to initrd");
    Ok(())
}

fn recompress_initrd(ctx: &mut Context, ui: &dyn Ui) -> Result<()> {
    let tree = working_tree(ctx)?;
    let gz = tree.path(tree.layout().initrd);
    ui.set_substep(&format!("compressing {gz}"));
    initrd::compress_in_place(&ctx.require_path("initrd_raw")?, &gz)
}

fn relock_installer_dir(ctx: &mut Context, _ui: &dyn Ui) -> Result<()> {
    let tree = working_tree(ctx)?;
    let dir = tree.path(tree.layout().installer_dir);
    if ctx.release_writable(&dir) == 0 {
        warn!(%dir, "installer directory was not unlocked by this run");
    }
    Ok(())
}

fn verify_initrd_answer_file(ctx: &mut Context, _ui: &dyn Ui) -> Result<()> {
    let tree = working_tree(ctx)?;
    let stored = initrd::member_checksum(
        &tree.path(tree.layout().initrd),
        ANSWER_FILE_NAME,
    )?;
    check_answer_checksum(ctx, &stored, "the rebuilt initrd")
}

fn copy_answer_file_to_medium(ctx: &mut Context, _ui: &dyn Ui) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let tree = working_tree(ctx)?;
    let dest = tree.path(ANSWER_FILE_NAME);
    let _root = Writable::acquire(tree.root())?;
    std::fs::copy(ctx.require_path("answer_file")?, &dest)
        .with_context(|| format!("copying answer file to {dest}"))?;
    std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o444))
        .with_context(|| format!("making {dest} read-only"))
}

fn verify_medium_answer_file(ctx: &mut Context, _ui: &dyn Ui) -> Result<()> {
    let tree = working_tree(ctx)?;
    let stored = md5_file(&tree.path(ANSWER_FILE_NAME))?;
    check_answer_checksum(ctx, &stored, "the installation medium")
}

fn check_answer_checksum(ctx: &Context, stored: &str, place: &str) -> Result<()> {
    let expected = ctx.require_var("answer_md5")?;
    if stored != expected {
        anyhow::bail!(
            "answer file in {place} has checksum {stored}, but the boot menus \
            will require {expected}"
        );
    }

    Ok(())
}

fn regenerate_manifest(ctx: &mut Context, _ui: &dyn Ui) -> Result<()> {
    let digest = manifest::regenerate(&working_tree(ctx)?)?;
    ctx.set_var("manifest_digest", digest);
    Ok(())
}

fn repackage_installer_image(ctx: &mut Context, ui: &dyn Ui) -> Result<()> {
    let tree = working_tree(ctx)?;
    let digest = ctx.get_var("manifest_digest").context(
        "md5sum.txt has not been regenerated for this tree; refusing to \
        package it",
    )?;
    repack::ensure_manifest_current(&tree, digest)?;

    let params =
        BootParameters::isolinux(tree.layout(), ctx.require_var("volume_label")?);
    repack::build_image(&tree, &ctx.require_path("installer_image")?, &params, ui)
}

fn remove_working_tree(ctx: &mut Context, _ui: &dyn Ui) -> Result<()> {
    working_tree(ctx)?.remove()
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::{
        installer::testutil::stub_tree,
        preseed::PartitionRecipe,
        runner::run_steps,
        util::md5_hex,
        writable::{make_tree_read_only, remove_read_only_tree},
    };

    fn params() -> PreseedParams {
        PreseedParams {
            locale: "en_GB.UTF-8".to_string(),
            keymap: "gb".to_string(),
            timezone: "Europe/London".to_string(),
            disk: "/dev/sda".to_string(),
            partitioning: PartitionRecipe::Home,
            mirror_host: "deb.debian.org".to_string(),
            full_name: "Test".to_string(),
            username: "test".to_string(),
            password: "pw".to_string(),
            root_password: None,
            packages: vec!["cloud-init".to_string()],
            reboot_on_finish: false,
        }
    }

    struct Scratch {
        _dir: tempfile::TempDir,
        base: Utf8PathBuf,
        tree: WorkingTree,
    }

    fn scratch() -> Scratch {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let root = stub_tree(&base);
        make_tree_read_only(&root).unwrap();
        Scratch {
            _dir: dir,
            tree: WorkingTree::open(root, InstallerLayout::default()),
            base,
        }
    }

    fn context(s: &Scratch) -> Context {
        Context::new(
            [
                ("tree", s.tree.root().to_string()),
                ("seed_dir", s.base.join("seed").to_string()),
                ("installer_image", s.base.join("out/test.iso").to_string()),
                ("volume_label", "TEST".to_string()),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        )
    }

    fn mode(path: &camino::Utf8Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    fn run_mutation(s: &Scratch, delivery: AnswerFileDelivery) -> Context {
        let mut steps = answer_file_steps(&params());
        steps.extend(mutation_steps(delivery, "en_GB.UTF-8", "gb"));
        let mut ctx = context(s);
        run_steps(&steps, &mut ctx).unwrap();
        ctx
    }

    #[test]
    fn initrd_delivery_end_to_end() {
        let s = scratch();
        let dir_mode = mode(&s.tree.path("install.amd"));
        let initrd_mode = mode(&s.tree.path("install.amd/initrd.gz"));
        assert_eq!(initrd_mode & 0o222, 0);
        let ctx = run_mutation(&s, AnswerFileDelivery::Initrd);

        let expected = md5_hex(AnswerDocument::render(&params()).bytes());
        assert_eq!(ctx.require_var("answer_md5").unwrap(), expected);

        let stored = initrd::member_checksum(
            &s.tree.path("install.amd/initrd.gz"),
            "preseed.cfg",
        )
        .unwrap();
        assert_eq!(stored, expected);
        bootmenu::check_checksums(&s.tree, &expected).unwrap();
        let isolinux =
            std::fs::read_to_string(s.tree.path("isolinux/isolinux.cfg"))
                .unwrap();
        assert!(isolinux.contains(" preseed/file=/preseed.cfg "));
        assert!(isolinux.contains(" debian-installer/locale=en_GB.UTF-8 "));

        assert!(manifest::stale_entries(&s.tree).unwrap().is_empty());
        let digest = ctx.require_var("manifest_digest").unwrap();
        repack::ensure_manifest_current(&s.tree, digest).unwrap();

        // Everything unlocked along the way is locked again.
        assert_eq!(ctx.held_writable().count(), 0);
        assert_eq!(mode(&s.tree.path("install.amd")), dir_mode);
        assert_eq!(mode(&s.tree.path("install.amd/initrd.gz")), initrd_mode);
        assert_eq!(mode(&s.tree.path("md5sum.txt")) & 0o222, 0);
        assert!(!s.tree.path("install.amd/initrd").exists());

        // Dropping the context changes nothing further.
        drop(ctx);
        assert_eq!(mode(&s.tree.path("install.amd")), dir_mode);
        assert_eq!(mode(&s.tree.path("install.amd/initrd.gz")), initrd_mode);
        remove_read_only_tree(s.tree.root()).unwrap();
    }

    #[test]
    fn cdrom_delivery_end_to_end() {
        let s = scratch();
        let ctx = run_mutation(&s, AnswerFileDelivery::Cdrom);
        let expected = ctx.require_var("answer_md5").unwrap().to_string();

        assert_eq!(md5_file(&s.tree.path("preseed.cfg")).unwrap(), expected);
        let grub =
            std::fs::read_to_string(s.tree.path("boot/grub/grub.cfg")).unwrap();
        assert!(grub.contains(" preseed/file=/cdrom/preseed.cfg "));
        bootmenu::check_checksums(&s.tree, &expected).unwrap();

        // The initrd is left alone.
        let initrd =
            initrd::Initrd::read_compressed(&s.tree.path("install.amd/initrd.gz"))
                .unwrap();
        assert!(initrd.member("preseed.cfg").is_none());

        let text = std::fs::read_to_string(s.tree.path("md5sum.txt")).unwrap();
        assert!(text.contains(&format!("{expected}  ./preseed.cfg\n")));
        assert_eq!(mode(s.tree.root()) & 0o222, 0);

        drop(ctx);
        remove_read_only_tree(s.tree.root()).unwrap();
    }

    #[test]
    fn failure_midway_relocks_installer_directory() {
        let s = scratch();
        let dir_mode = mode(&s.tree.path("install.amd"));

        let mut steps = answer_file_steps(&params());
        steps.extend(mutation_steps(AnswerFileDelivery::Initrd, "C", "us"));
        // Corrupt the initrd so decompression fails after the unlock.
        {
            let _guard =
                Writable::acquire(&s.tree.path("install.amd/initrd.gz")).unwrap();
            std::fs::write(s.tree.path("install.amd/initrd.gz"), b"junk")
                .unwrap();
        }

        {
            let mut ctx = context(&s);
            let err = run_steps(&steps, &mut ctx).unwrap_err();
            assert!(format!("{err:#}").contains("decompress initrd"));
            assert_eq!(ctx.held_writable().count(), 1);
        }

        assert_eq!(mode(&s.tree.path("install.amd")), dir_mode);
        remove_read_only_tree(s.tree.root()).unwrap();
    }

    #[test]
    fn manifest_is_regenerated_last_and_packing_follows_it() {
        let plan = BuildImagePlan {
            options: crate::app::test::image_options(&["--offline"]),
            preseed: params(),
        };
        let labels: Vec<&str> = plan.steps().iter().map(|s| s.label()).collect();

        let position = |label: &str| {
            labels.iter().position(|l| *l == label).unwrap_or_else(|| {
                panic!("no step '{label}' in {labels:?}")
            })
        };
        let manifest = position("regenerate md5sum.txt");
        let repack = position("repackage installer image");
        assert_eq!(repack, manifest + 1);
        for earlier in [
            "compute answer file checksum",
            "extract base image",
            "recompress initrd",
            "verify answer file checksum in initrd",
            "rewrite boot menus",
            "rewrite EFI boot configuration",
        ] {
            assert!(position(earlier) < manifest, "{earlier}");
        }
        assert!(position("append answer file to initrd") > position("compute answer file checksum"));
        assert!(!labels.contains(&"download base image"));
        assert_eq!(labels.last(), Some(&"remove unpacked image"));
    }

    #[test]
    fn mismatched_base_image_stops_before_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let paths = RunPaths::resolve(
            &base.join("work"),
            &base.join("out"),
            "debvm.iso",
            None,
        )
        .unwrap();

        let plan = BuildImagePlan {
            options: crate::app::test::image_options(&["--offline"]),
            preseed: params(),
        };
        let image = paths.download(&plan.options.image_name);
        std::fs::create_dir_all(&paths.work_dir).unwrap();
        std::fs::write(&image, b"not the published image").unwrap();
        std::fs::write(
            paths.download(&plan.options.checksum_list),
            format!("{}  {}\n", "0".repeat(64), plan.options.image_name),
        )
        .unwrap();

        let steps = plan.steps();
        let labels: Vec<&str> = steps.iter().map(|s| s.label()).collect();
        let position = |label: &str| {
            labels.iter().position(|l| *l == label).unwrap()
        };
        assert!(
            position("verify base image checksum")
                < position("extract base image")
        );

        let mut vars = plan.initial_context(&paths);
        vars.insert("tree".to_string(), paths.tree.to_string());
        vars.insert("seed_dir".to_string(), paths.seed_dir.to_string());
        let mut ctx = Context::new(vars);
        let err = format!("{:#}", run_steps(&steps, &mut ctx).unwrap_err());
        assert!(err.contains("step 'verify base image checksum' failed"), "{err}");
        assert!(err.contains("checksum mismatch"), "{err}");
        assert!(!paths.tree.exists());
        assert!(ctx.get_var("answer_file").is_none());
    }

    #[test]
    fn packing_refuses_without_regenerated_manifest() {
        let s = scratch();
        let mut ctx = context(&s);
        let err = repackage_installer_image(
            &mut ctx,
            &crate::ui::LogUi::new("repackage"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("md5sum.txt has not been regenerated"));
        assert!(!s.base.join("out/test.iso").exists());

        drop(ctx);
        remove_read_only_tree(s.tree.root()).unwrap();
    }
}
