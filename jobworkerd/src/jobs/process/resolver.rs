/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use super::error::{ProcessError, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::{env, fs};
use tracing::trace;

/// Directories searched after PATH, in order.
const FALLBACK_SEARCH_PATHS: &[&str] =
    &["/bin", "/usr/bin", "/usr/local/bin", "/sbin", "/usr/sbin"];

/// Resolves a command name to an absolute path: an absolute command is
/// stat'ed as-is, anything else is searched in PATH and then in the common
/// system directories. First existing entry wins; whether the file is
/// actually runnable surfaces later, at exec time.
pub fn resolve_command(command: &str) -> Result<PathBuf> {
    if command.is_empty() {
        return Err(ProcessError::CommandNotFound {
            command: command.to_string(),
        });
    }

    let path = Path::new(command);
    if path.is_absolute() {
        if fs::metadata(path).is_ok() {
            return Ok(path.to_path_buf());
        }
        return Err(ProcessError::CommandNotFound {
            command: command.to_string(),
        });
    }

    if let Some(search_path) = env::var_os("PATH") {
        for dir in env::split_paths(&search_path) {
            let candidate = dir.join(command);
            if is_executable_file(&candidate) {
                trace!(command, resolved = %candidate.display(), "resolved via PATH");
                return Ok(candidate);
            }
        }
    }

    for dir in FALLBACK_SEARCH_PATHS {
        let candidate = Path::new(dir).join(command);
        if fs::metadata(&candidate).is_ok() {
            trace!(command, resolved = %candidate.display(), "resolved via fallback path");
            return Ok(candidate);
        }
    }

    Err(ProcessError::CommandNotFound { command: command.to_string() })
}

/// The init stage must be an executable regular file; checked once at
/// startup so a misconfigured daemon fails fast instead of per job.
pub fn validate_init_binary(path: &Path) -> Result<()> {
    if path.is_absolute() && is_executable_file(path) {
        return Ok(());
    }

    Err(ProcessError::InitBinaryNotExecutable { path: path.to_path_buf() })
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| {
            meta.is_file() && meta.permissions().mode() & 0o111 != 0
        })
        .unwrap_or(false)
}
