/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Generated protobuf definitions for the jobworkerd API

#![allow(clippy::derive_partial_eq_without_eq)]

pub mod jobs {
    tonic::include_proto!("jobs.v0");
}
