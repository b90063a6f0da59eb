/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use std::fs;
use std::path::Path;

const SAMPLE_CONFIG: &str = "./resource/config.yaml";

fn main() {
    println!("cargo:rerun-if-changed={SAMPLE_CONFIG}");

    // `target/<profile>/build/<pkg>-<hash>/out` -> `target/<profile>/`
    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR is set by cargo");
    let Some(profile_dir) = Path::new(&out_dir).ancestors().nth(3) else {
        return;
    };

    // Ship the sample config next to the binary so `domain-store` runs from there.
    fs::copy(SAMPLE_CONFIG, profile_dir.join("config.yaml"))
        .expect("Failed to copy sample config.yaml");
}
