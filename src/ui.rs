// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interface script steps use to report their progress.

use std::process::Stdio;

use indicatif::ProgressBar;
use tracing::debug;

pub trait Ui {
    /// Describes what the current step is doing right now.
    fn set_substep(&self, substep: &str);

    /// The `Stdio` that child processes launched by a step should write their
    /// standard output to.
    fn stdout_target(&self) -> Stdio;
}

/// Reports progress by updating a spinner in an interactive terminal.
pub struct ProgressUi<'a> {
    label: &'static str,
    bar: &'a ProgressBar,
}

impl<'a> ProgressUi<'a> {
    pub fn new(label: &'static str, bar: &'a ProgressBar) -> Self {
        Self { label, bar }
    }
}

impl Ui for ProgressUi<'_> {
    fn set_substep(&self, substep: &str) {
        self.bar.set_message(format!("{}: {}", self.label, substep));
    }

    fn stdout_target(&self) -> Stdio {
        Stdio::piped()
    }
}

/// Reports progress as log messages. Used when running non-interactively and
/// in tests.
pub struct LogUi {
    label: &'static str,
}

impl LogUi {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl Ui for LogUi {
    fn set_substep(&self, substep: &str) {
        debug!(step = self.label, "{}", substep);
    }

    fn stdout_target(&self) -> Stdio {
        Stdio::inherit()
    }
}
