// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2023 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception

//! Build script: plumbs a `VERSION` through from `git describe`, or the `VERSION` environment
//! variable when `git` isn't available (e.g. building from a release archive).

use std::process::Command;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Returns one-line `stdout` from a `git` command; `args` are simply space-separated (no escapes).
fn git_oneline_output(args: &str) -> Result<String, BoxError> {
    static HELP_TEXT: &str =
        "If you are building from a release archive or without the `git` CLI available, \n\
        try again with the `VERSION` environment variable set";

    // `output()` returns `Err` e.g. if `git` was not found.
    let mut output = Command::new("git")
        .args(args.split(' '))
        .output()
        .map_err(|e| format!("`git {args}` failed: {e}\n\n{HELP_TEXT}"))?;

    // `status` is non-success if `git` launched and then failed.
    if !output.status.success() {
        let status = output.status;
        let stderr = output.stderr.escape_ascii();
        return Err(format!("`git {args}` failed with {status}: {stderr}\n\n{HELP_TEXT}").into());
    }
    if output.stdout.pop() != Some(b'\n') {
        return Err(format!("`git {args}` stdout should end with newline").into());
    }
    if output.stdout.contains(&b'\n') {
        return Err(format!("`git {args}` stdout should be single line").into());
    }
    Ok(String::from_utf8(output.stdout)
        .map_err(|_| format!("`git {args}` stdout should be valid UTF-8"))?)
}

fn handle_version() -> Result<(), BoxError> {
    println!("cargo:rerun-if-env-changed=VERSION");
    if std::env::var("VERSION").is_ok() {
        return Ok(());
    }

    // Get version from `git describe`. Inspired by the `git-version` crate.
    // We don't use that directly because `cross`'s default docker image doesn't install `git`,
    // and thus we need the environment variable pass-through above.

    // Avoid reruns when the output doesn't meaningfully change. I don't think this is quite right:
    // it won't recognize toggling between `-dirty` and not. But it'll do.
    let dir = git_oneline_output("rev-parse --git-dir")?;
    println!("cargo:rerun-if-changed={dir}/logs/HEAD");
    println!("cargo:rerun-if-changed={dir}/index");

    // Plumb the version through.
    let version = git_oneline_output("describe --always --dirty")?;
    println!("cargo:rustc-env=VERSION={version}");

    Ok(())
}

fn main() -> Result<(), BoxError> {
    // Explicitly declare dependencies, so this doesn't re-run if other source files change.
    println!("cargo:rerun-if-changed=build.rs");
    handle_version()?;
    Ok(())
}
