// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `camwatch init`: creates the artifact directory and the event database, then exits.

use crate::config::Config;
use base::{err, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

#[derive(Bpaf, Debug)]
#[bpaf(options("init"))]
pub struct Args {
    #[bpaf(external(super::config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;

    std::fs::create_dir_all(&config.base_dir)
        .map_err(|e| err!(BindError, msg("creating artifact dir {}: {e}", config.base_dir.display())))?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| err!(BindError, msg("creating db dir {}: {e}", parent.display())))?;
    }

    // `store::open` creates the schema synchronously before spawning its owning task, so a
    // throwaway single-threaded runtime is enough to drive it to that point.
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(|e| err!(Internal, msg("building init runtime: {e}")))?;
    rt.block_on(async { store::open(&config.db_path, config.base_dir.clone()) })?;

    info!(
        base_dir = %config.base_dir.display(),
        db_path = %config.db_path.display(),
        "initialized",
    );
    Ok(0)
}
