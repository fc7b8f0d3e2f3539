/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use anyhow::Result;

fn main() -> Result<()> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var(
            "PROTOC",
            protoc_bin_vendored::protoc_bin_path().expect("bundled protoc binary"),
        );
    }

    generate_grpc_code()?;

    Ok(())
}

fn generate_grpc_code() -> Result<()> {
    let tonic_builder = tonic_build::configure()
        // Generated services use unwrap. Suppress the workspace lint.
        .server_mod_attribute("jobs.v0", "#[allow(clippy::unwrap_used)]")
        .client_mod_attribute("jobs.v0", "#[allow(clippy::unwrap_used)]");

    tonic_builder.compile(&["jobs/v0/jobs.proto"], &["jobs/v0/"])?;

    Ok(())
}
