// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use bpaf::Parser;
use std::path::PathBuf;

pub mod check;
pub mod init;
pub mod run;

const DEFAULT_CONFIG_PATH: &str = "/etc/camwatch/camwatch.toml";

/// Shared `--config` flag, parsed the same way across all three subcommands.
fn config_path() -> impl Parser<PathBuf> {
    bpaf::long("config")
        .help("Path to the camwatch.toml configuration file.")
        .argument::<PathBuf>("PATH")
        .fallback(DEFAULT_CONFIG_PATH.into())
        .debug_fallback()
}
