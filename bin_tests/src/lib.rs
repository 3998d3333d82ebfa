// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod artifacts;
pub mod test_runner;
pub mod test_types;
pub mod validation;

use std::{collections::HashMap, env, ops::DerefMut, path::PathBuf, process, sync::Mutex};

use once_cell::sync::OnceCell;

/// This crate implements an abstraction over compilation with cargo with the purpose
/// of testing full binaries, instead of just rust static libraries.
///
/// The main entrypoint is `fn build_artifacts` which takes a list of artifacts to build,
/// either executable crates or extra binaries, invokes cargo and return the path
/// of the built artifact.
///
/// Builds are cached between invocations so that multiple tests can use the same artifact
/// without doing expensive work twice.
///
/// It is assumed that functions in this crate are invoked in the context of a cargo #[test]
/// item, or a `cargo run` command to be able to locate artifacts built by cargo from the position
/// of the current binary.

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum ArtifactType {
    ExecutablePackage,
    #[default]
    Bin,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum BuildProfile {
    #[default]
    Debug,
    Release,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Default)]
pub struct ArtifactsBuild {
    pub name: String,
    pub artifact_type: ArtifactType,
    pub build_profile: BuildProfile,
}

fn inner_build_artifact(c: &ArtifactsBuild) -> anyhow::Result<PathBuf> {
    let mut build_cmd = process::Command::new(env!("CARGO"));
    build_cmd.arg("build");
    if let BuildProfile::Release = c.build_profile {
        build_cmd.arg("--release");
    }
    match c.artifact_type {
        ArtifactType::ExecutablePackage => build_cmd.arg("-p"),
        ArtifactType::Bin => build_cmd.args(["--workspace", "--bin"]),
    };
    build_cmd.arg(&c.name);

    let output = build_cmd.output()?;
    if !output.status.success() {
        anyhow::bail!(
            "Cargo build failed: status code {:?}\nstderr:\n {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// This static variable contains the path in which cargo puts it's build artifacts
    /// This relies on the assumption that the current binary is assumed to not have been moved from
    /// it's directory
    static ARTIFACT_DIR: OnceCell<PathBuf> = OnceCell::new();
    let artifact_dir = ARTIFACT_DIR.get_or_try_init(|| {
        let test_bin_location = PathBuf::from(
            env::args()
                .next()
                .ok_or_else(|| anyhow::anyhow!("missing argv[0]"))?,
        );
        let mut location_components = test_bin_location.components().rev().peekable();
        loop {
            let Some(c) = location_components.peek() else {
                break;
            };
            if c.as_os_str() == "target" {
                break;
            }
            location_components.next();
        }
        anyhow::Ok(location_components.rev().collect::<PathBuf>())
    })?;

    let mut artifact_path = artifact_dir.clone();
    artifact_path.push(match c.build_profile {
        BuildProfile::Debug => "debug",
        BuildProfile::Release => "release",
    });
    artifact_path.push(format!("{}{}", c.name, env::consts::EXE_SUFFIX));
    Ok(artifact_path)
}

/// Caches and returns the path of the artifacts built by cargo
/// This function should only be called from cargo tests
pub fn build_artifacts<'b>(
    crates: &[&'b ArtifactsBuild],
) -> anyhow::Result<HashMap<&'b ArtifactsBuild, PathBuf>> {
    static ARTIFACTS: OnceCell<Mutex<HashMap<ArtifactsBuild, PathBuf>>> = OnceCell::new();

    let mut res = HashMap::new();

    let artifacts = ARTIFACTS.get_or_init(|| Mutex::new(HashMap::new()));
    for &c in crates {
        let mut artifacts = artifacts
            .lock()
            .map_err(|_| anyhow::anyhow!("artifact cache poisoned"))?;
        let artifacts = artifacts.deref_mut();

        if let Some(p) = artifacts.get(c) {
            res.insert(c, p.clone());
        } else {
            let p = inner_build_artifact(c)?;
            res.insert(c, p.clone());
            artifacts.insert(c.clone(), p);
        }
    }

    Ok(res)
}

#[macro_export]
macro_rules! timeit {
    ($op_name:literal, $op:block) => {{
        let start = std::time::Instant::now();
        let res = $op;
        let delta = start.elapsed();
        println!(
            concat!($op_name, " took {} ms"),
            delta.as_secs_f64() * 1000.0
        );
        res
    }};
}
