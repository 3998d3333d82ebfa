// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared artifact definitions for bin_tests.

use crate::{ArtifactType, ArtifactsBuild, BuildProfile};

/// Creates an ArtifactsBuild for the crashguard_bin_test binary.
pub fn crashguard_bin_test(profile: BuildProfile) -> ArtifactsBuild {
    ArtifactsBuild {
        name: "crashguard_bin_test".to_owned(),
        build_profile: profile,
        artifact_type: ArtifactType::Bin,
    }
}

/// Creates an ArtifactsBuild for the demo binary shipped with the library crate.
pub fn crashguard_demo(profile: BuildProfile) -> ArtifactsBuild {
    ArtifactsBuild {
        name: "crashguard-demo".to_owned(),
        build_profile: profile,
        artifact_type: ArtifactType::Bin,
    }
}
