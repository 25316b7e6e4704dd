// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structs, traits, and functions for defining and running a set of scripted
//! operations.

use std::{
    collections::HashMap,
    io::{Read, Write},
};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{error, info};

use crate::{
    ui::{LogUi, ProgressUi, Ui},
    writable::Writable,
};

const PROGRESS_TICK_INTERVAL: std::time::Duration =
    std::time::Duration::from_millis(100);

type StepFn = dyn Fn(&mut Context, &dyn Ui) -> anyhow::Result<()>;

/// A step in a scripted procedure.
pub struct ScriptStep {
    /// A descriptive label for this procedure step.
    label: &'static str,

    /// The function to execute to run this procedure step.
    func: Box<StepFn>,

    /// A list of commands that this step expects to launch via
    /// `[std::process::Command]`. The script runner uses these to check for
    /// missing dependencies before running the script.
    prereq_commands: Vec<&'static str>,
}

impl ScriptStep {
    pub fn new(
        label: &'static str,
        func: impl Fn(&mut Context, &dyn Ui) -> anyhow::Result<()> + 'static,
    ) -> Self {
        Self { label, func: Box::new(func), prereq_commands: Vec::new() }
    }

    pub fn with_prereqs(
        label: &'static str,
        func: impl Fn(&mut Context, &dyn Ui) -> anyhow::Result<()> + 'static,
        commands: &[&'static str],
    ) -> Self {
        Self { label, func: Box::new(func), prereq_commands: commands.to_vec() }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn prereq_commands(&self) -> &[&'static str] {
        self.prereq_commands.as_slice()
    }

    /// Runs this step against the supplied context.
    pub fn run(&self, ctx: &mut Context, ui: &dyn Ui) -> anyhow::Result<()> {
        (self.func)(ctx, ui)
    }
}

/// The set of prerequisites a script found to be missing before it ran.
/// Errors prevent the script from running; warnings are printed and the
/// script proceeds.
#[derive(Debug, Default)]
pub struct MissingPrerequisites {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl MissingPrerequisites {
    pub fn from_messages(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self { errors, warnings }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Implemented by objects that can be used as scripts.
pub trait Script {
    /// Yields a slice of steps that can be executed to run this script.
    fn steps(&self) -> &[ScriptStep];

    fn print_configuration(
        &self,
        w: Box<dyn std::io::Write>,
    ) -> std::io::Result<()>;

    fn check_prerequisites(&self) -> MissingPrerequisites;

    /// Yields a `HashMap` that contains key-value pairs that should be inserted
    /// into the script's `[Context]` prior to running it.
    fn initial_context(&self) -> HashMap<String, String>;
}

struct StepAndProgress<'a> {
    step: &'a ScriptStep,
    bar: ProgressBar,
}

fn print_prerequisites(missing: &MissingPrerequisites) {
    if !missing.warnings().is_empty() {
        println!("{}", "Some optional prerequisites were not found:".bold());
        for warning in missing.warnings() {
            println!("  {}", warning);
        }

        println!();
    }

    if !missing.errors().is_empty() {
        println!("{}", "Some prerequisites were not satisfied:".bold());
        for unsatisfied in missing.errors() {
            println!("  {}", unsatisfied);
        }

        println!();
    }
}

/// Runs a script, pretty-printing its various labels and the outcomes of each
/// step.
pub fn run_script(
    script: Box<dyn Script>,
    interactive: bool,
) -> anyhow::Result<()> {
    script.print_configuration(Box::new(std::io::stdout()))?;
    println!();

    let missing = script.check_prerequisites();
    print_prerequisites(&missing);
    if !missing.errors().is_empty() {
        anyhow::bail!("some script prerequisites weren't satisfied");
    }

    if interactive {
        println!("Press Enter to continue or CTRL-C to cancel.");
        std::io::stdout().flush()?;
        std::io::stdin().read(&mut [0u8])?;
    }

    let mut ctx = Context::new(script.initial_context());
    if interactive {
        run_steps_interactive(script.steps(), &mut ctx)
    } else {
        run_steps(script.steps(), &mut ctx)
    }
}

/// Runs each of the supplied steps in order, logging each step's outcome.
/// Stops at the first step that fails.
///
/// Any paths still held writable in the context when this returns, including
/// on failure, are restored when `ctx` is dropped by the caller.
pub fn run_steps(steps: &[ScriptStep], ctx: &mut Context) -> anyhow::Result<()> {
    let total = steps.len();
    for (index, step) in steps.iter().enumerate() {
        info!("[{}/{}] {}", index + 1, total, step.label);
        let ui = LogUi::new(step.label);
        if let Err(e) = step.run(ctx, &ui) {
            error!("step '{}' failed: {:#}", step.label, e);
            return Err(e.context(format!("step '{}' failed", step.label)));
        }
    }

    info!("all {} steps completed", total);
    Ok(())
}

fn run_steps_interactive(
    steps: &[ScriptStep],
    ctx: &mut Context,
) -> anyhow::Result<()> {
    let multi = MultiProgress::new();
    let steps_with_progress: Vec<StepAndProgress> = steps
        .iter()
        .map(|step| {
            let bar = multi.add(ProgressBar::new_spinner());
            bar.set_message(step.label);
            bar.set_style(pending_style());
            bar.tick();
            StepAndProgress { step, bar }
        })
        .collect();

    for step in steps_with_progress {
        step.bar.set_style(ProgressStyle::default_spinner());
        step.bar.enable_steady_tick(PROGRESS_TICK_INTERVAL);
        let ui = ProgressUi::new(step.step.label, &step.bar);
        match step.step.run(ctx, &ui) {
            Ok(()) => {
                step.bar.set_message(step.step.label);
                step.bar.set_style(finished_style("✓ {msg:.green}"));
                step.bar.finish();
            }
            Err(e) => {
                step.bar.set_style(finished_style("⚠ {msg:.bold.red}"));
                step.bar.finish();
                error!("step '{}' failed: {:#}", step.step.label, e);
                return Err(
                    e.context(format!("step '{}' failed", step.step.label))
                );
            }
        }
    }

    Ok(())
}

fn pending_style() -> ProgressStyle {
    ProgressStyle::with_template("  {msg:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn finished_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// A shared script execution context, provided to each step in a running
/// script. Each context contains a key-value store that individual steps can
/// use to pass values to future steps. The `[Script]` trait's `initial_context`
/// function allows each script to populate the store before the script
/// executes.
///
/// The context also holds any write permissions that one step grants and a
/// later step gives back, so that they are restored even if a step in between
/// fails.
pub struct Context {
    vars: HashMap<String, String>,
    writable: Vec<Writable>,
}

impl Context {
    pub fn new(vars: HashMap<String, String>) -> Self {
        Self { vars, writable: Vec::new() }
    }

    /// Gets the value of the supplied `var`, returning `None` if the value is
    /// not in the store.
    pub fn get_var(&self, var: &str) -> Option<&str> {
        self.vars.get(var).map(|v| v.as_str())
    }

    /// Gets the value of the supplied `var`, returning an error if an earlier
    /// step (or the script's initial context) never set it.
    pub fn require_var(&self, var: &str) -> anyhow::Result<&str> {
        self.get_var(var)
            .with_context(|| format!("context variable '{var}' is not set"))
    }

    /// Like `require_var`, but interprets the value as a path.
    pub fn require_path(&self, var: &str) -> anyhow::Result<Utf8PathBuf> {
        self.require_var(var).map(Utf8PathBuf::from)
    }

    /// Sets the value of the supplied `var` to `value`, returning the old value
    /// if one was present.
    pub fn set_var(&mut self, var: &str, value: String) -> Option<String> {
        self.vars.insert(var.to_owned(), value)
    }

    /// Keeps `guard` alive until `release_writable` is called for its path or
    /// the context is dropped.
    pub fn hold_writable(&mut self, guard: Writable) {
        self.writable.push(guard);
    }

    /// Drops every held write permission for `path`, restoring its original
    /// mode. Returns the number of guards released.
    pub fn release_writable(&mut self, path: &Utf8Path) -> usize {
        let before = self.writable.len();
        // Restore in reverse acquisition order.
        let mut released: Vec<Writable> = Vec::new();
        let mut kept = Vec::new();
        for guard in self.writable.drain(..) {
            if guard.path() == path {
                released.push(guard);
            } else {
                kept.push(guard);
            }
        }

        while let Some(guard) = released.pop() {
            drop(guard);
        }

        self.writable = kept;
        before - self.writable.len()
    }

    pub fn held_writable(&self) -> impl Iterator<Item = &Utf8Path> {
        self.writable.iter().map(|g| g.path())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        while let Some(guard) = self.writable.pop() {
            drop(guard);
        }
    }
}
