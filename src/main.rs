// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! debvm: builds an unattended Debian installer image and provisions a small
//! VirtualBox cluster that installs itself from it.

use app::App;
use clap::Parser;

#[cfg(not(target_os = "linux"))]
compile_error!("only Linux targets are supported");

pub mod app;
pub mod cluster;
pub mod fetch;
pub mod installer;
pub mod logging;
pub mod nodeconfig;
pub mod paths;
pub mod preseed;
pub mod runner;
pub mod scripts;
pub mod ui;
pub mod util;
pub mod writable;

fn main() -> anyhow::Result<()> {
    let app = App::parse();
    let interactive = match app.interactive {
        Some(val) => val,
        None => atty::is(atty::Stream::Stdout),
    };

    logging::init(app.verbose, interactive)?;
    let script = scripts::get_script(&app)?;
    runner::run_script(script, interactive)
}
