// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `camwatch check`: validates the config file and the external tools/model it references,
//! without starting capture or the web server.

use crate::config::Config;
use crate::encoder;
use base::{bail, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

#[derive(Bpaf, Debug)]
#[bpaf(options("check"))]
pub struct Args {
    #[bpaf(external(super::config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    info!(config = %args.config.display(), "config parses and validates");

    let ffmpeg = encoder::locate_ffmpeg()?;
    info!(path = %ffmpeg.display(), "found ffmpeg");

    if !config.model_path.is_file() {
        bail!(
            NotFound,
            msg("classifier model not found at {}", config.model_path.display())
        );
    }
    info!(path = %config.model_path.display(), "found classifier model");

    if !config.base_dir.is_dir() {
        bail!(
            NotFound,
            msg("artifact directory {} does not exist; run `camwatch init` first", config.base_dir.display())
        );
    }
    if !config.db_path.is_file() {
        bail!(
            NotFound,
            msg("event database {} does not exist; run `camwatch init` first", config.db_path.display())
        );
    }

    info!("all checks passed");
    Ok(0)
}
