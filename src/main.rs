// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::{Bpaf, Parser};
use tracing::{debug, error};

mod body;
mod capture;
mod classifier;
mod cmds;
mod config;
mod encoder;
mod fps;
mod frame;
mod mjpeg;
mod motion;
mod notifier;
mod preroll;
mod recorder;
mod sink;
mod video_sink;
mod web;

// This is either in the environment when `cargo` is invoked or set from within `build.rs`.
const VERSION: &str = env!("VERSION");

/// Camwatch: a single-camera motion-triggered video recorder.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    /// Validate the config file and the external tools/model it references, without running.
    Check(#[bpaf(external(cmds::check::args))] cmds::check::Args),

    /// Create the artifact directory and event database, then exit.
    Init(#[bpaf(external(cmds::init::args))] cmds::init::Args),

    /// Run the recorder: capture, motion detection, triggered recording, and the web UI.
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Check(a) => cmds::check::run(a),
            Args::Init(a) => cmds::init::run(a),
            Args::Run(a) => cmds::run::run(a),
        }
    }
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log anything (with
    // timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment. See the troubleshooting guide."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    let args = match args().fallback_to_usage().run_inner(bpaf::Args::current_args()) {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("Parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
