/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use tracing_subscriber::EnvFilter;

/// Initializes the tracing subscriber. `RUST_LOG` wins when set; otherwise
/// `--verbose` selects debug over info. Safe to call more than once (tests).
pub(crate) fn init(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
