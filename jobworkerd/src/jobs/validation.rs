/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Validated request types. Every RPC payload is converted into one of these
//! before it can cause any side effect; a validation failure therefore never
//! mutates state.

use super::cgroups::{CpuPercent, IoBps, MemoryMb};
use super::store::{JobId, JobLimits, JobSpec};
use super::JobDefaults;
use jobworker_proto::jobs as rpc;
use validation::{ValidatedField, ValidatedType, ValidationError};

pub const MAX_JOB_ARGS: usize = 100;
pub const MAX_JOB_ARG_LENGTH: usize = 1024;
pub const MAX_COMMAND_LENGTH: usize = 1024;

/// A command name: one executable, not a shell expression. Shell
/// metacharacters are rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand(String);

impl JobCommand {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl ValidatedField<String> for JobCommand {
    fn validate(
        input: Option<String>,
        field_name: &str,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let input =
            validation::required_not_empty(input, field_name, parent_name)?;

        validation::maximum_length(
            input.as_bytes(),
            MAX_COMMAND_LENGTH,
            validation::UNIT_BYTES,
            field_name,
            parent_name,
        )?;
        validation::no_nul_bytes(&input, field_name, parent_name)?;
        validation::disallow_characters(
            &input,
            validation::FORBIDDEN_COMMAND_CHARACTERS,
            field_name,
            parent_name,
        )?;

        Ok(Self(input))
    }
}

#[derive(Debug)]
pub struct ValidatedCreateJobRequest {
    pub command: JobCommand,
    pub args: Vec<String>,
    pub cpu_percent: CpuPercent,
    pub memory_mb: MemoryMb,
    pub io_bytes_per_sec: IoBps,
}

impl ValidatedType<rpc::CreateJobRequest> for ValidatedCreateJobRequest {
    fn validate(
        input: rpc::CreateJobRequest,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let rpc::CreateJobRequest { command, args, limits } = input;

        let command =
            JobCommand::validate(Some(command), "command", parent_name)?;
        let args = validate_args(args, "args", parent_name)?;

        let limits = limits.unwrap_or_default();
        let cpu_percent = CpuPercent::validate(
            Some(limits.max_cpu_percent),
            "limits.max_cpu_percent",
            parent_name,
        )?;
        let memory_mb = MemoryMb::validate(
            Some(limits.max_memory_mb),
            "limits.max_memory_mb",
            parent_name,
        )?;
        let io_bytes_per_sec = IoBps::validate(
            Some(limits.max_io_bytes_per_sec),
            "limits.max_io_bytes_per_sec",
            parent_name,
        )?;

        Ok(Self { command, args, cpu_percent, memory_mb, io_bytes_per_sec })
    }
}

impl ValidatedCreateJobRequest {
    /// Converts into a launchable spec, substituting the server defaults for
    /// limits the caller left at zero.
    pub fn into_spec(self, defaults: &JobDefaults) -> JobSpec {
        let cpu_percent = if self.cpu_percent.is_unlimited() {
            defaults.cpu_percent
        } else {
            self.cpu_percent
        };
        let memory_mb = if self.memory_mb.is_unlimited() {
            defaults.memory_mb
        } else {
            self.memory_mb
        };
        let io_bytes_per_sec = if self.io_bytes_per_sec.is_unlimited() {
            defaults.io_bytes_per_sec
        } else {
            self.io_bytes_per_sec
        };

        JobSpec {
            command: self.command.into_inner(),
            args: self.args,
            limits: JobLimits { cpu_percent, memory_mb, io_bytes_per_sec },
        }
    }
}

fn validate_args(
    args: Vec<String>,
    field_name: &str,
    parent_name: Option<&str>,
) -> Result<Vec<String>, ValidationError> {
    validation::maximum_value(
        args.len(),
        MAX_JOB_ARGS,
        validation::UNIT_ITEMS,
        field_name,
        parent_name,
    )?;

    for (i, arg) in args.iter().enumerate() {
        let element = format!("{field_name}[{i}]");
        validation::maximum_length(
            arg.as_bytes(),
            MAX_JOB_ARG_LENGTH,
            validation::UNIT_BYTES,
            &element,
            parent_name,
        )?;
        validation::no_nul_bytes(arg, &element, parent_name)?;
    }

    Ok(args)
}

#[derive(Debug)]
pub struct ValidatedGetJobRequest {
    pub job_id: JobId,
}

impl ValidatedType<rpc::GetJobRequest> for ValidatedGetJobRequest {
    fn validate(
        input: rpc::GetJobRequest,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let job_id = JobId::validate(Some(input.id), "id", parent_name)?;
        Ok(Self { job_id })
    }
}

#[derive(Debug)]
pub struct ValidatedStopJobRequest {
    pub job_id: JobId,
}

impl ValidatedType<rpc::StopJobRequest> for ValidatedStopJobRequest {
    fn validate(
        input: rpc::StopJobRequest,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let job_id = JobId::validate(Some(input.id), "id", parent_name)?;
        Ok(Self { job_id })
    }
}

#[derive(Debug)]
pub struct ValidatedStreamJobOutputRequest {
    pub job_id: JobId,
}

impl ValidatedType<rpc::StreamJobOutputRequest>
    for ValidatedStreamJobOutputRequest
{
    fn validate(
        input: rpc::StreamJobOutputRequest,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let job_id = JobId::validate(Some(input.id), "id", parent_name)?;
        Ok(Self { job_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        command: &str,
        args: Vec<String>,
        limits: Option<rpc::JobLimits>,
    ) -> rpc::CreateJobRequest {
        rpc::CreateJobRequest { command: command.into(), args, limits }
    }

    #[test]
    fn test_create_request_valid() {
        let validated = ValidatedCreateJobRequest::validate(
            request(
                "/bin/echo",
                vec!["hi".into()],
                Some(rpc::JobLimits {
                    max_cpu_percent: 50,
                    max_memory_mb: 64,
                    max_io_bytes_per_sec: 0,
                }),
            ),
            None,
        )
        .expect("valid request");

        assert_eq!(validated.command.as_str(), "/bin/echo");
        assert_eq!(validated.args, vec!["hi".to_string()]);
    }

    #[test]
    fn test_create_request_missing_limits_defaults_to_zero() {
        let validated =
            ValidatedCreateJobRequest::validate(request("ls", vec![], None), None)
                .expect("valid request");
        assert!(validated.cpu_percent.is_unlimited());
        assert!(validated.memory_mb.is_unlimited());
        assert!(validated.io_bytes_per_sec.is_unlimited());
    }

    #[test]
    fn test_command_with_shell_metacharacters_rejected() {
        for bad in ["rm; rm -rf /", "a|b", "x&y", "`id`", "$(id)", "f()"] {
            assert!(
                ValidatedCreateJobRequest::validate(
                    request(bad, vec![], None),
                    None
                )
                .is_err(),
                "expected command '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn test_empty_and_oversized_command_rejected() {
        assert!(ValidatedCreateJobRequest::validate(
            request("", vec![], None),
            None
        )
        .is_err());

        let oversized = "x".repeat(MAX_COMMAND_LENGTH + 1);
        assert!(ValidatedCreateJobRequest::validate(
            request(&oversized, vec![], None),
            None
        )
        .is_err());
    }

    #[test]
    fn test_args_boundary_exactly_100_accepted_101_rejected() {
        let args_100 = vec!["a".to_string(); MAX_JOB_ARGS];
        assert!(ValidatedCreateJobRequest::validate(
            request("ls", args_100, None),
            None
        )
        .is_ok());

        let args_101 = vec!["a".to_string(); MAX_JOB_ARGS + 1];
        assert!(ValidatedCreateJobRequest::validate(
            request("ls", args_101, None),
            None
        )
        .is_err());
    }

    #[test]
    fn test_arg_content_rules() {
        let oversized = vec!["x".repeat(MAX_JOB_ARG_LENGTH + 1)];
        assert!(ValidatedCreateJobRequest::validate(
            request("ls", oversized, None),
            None
        )
        .is_err());

        let with_nul = vec!["nul\0arg".to_string()];
        assert!(ValidatedCreateJobRequest::validate(
            request("ls", with_nul, None),
            None
        )
        .is_err());
    }

    #[test]
    fn test_memory_boundaries() {
        let with_memory = |mb: i32| {
            request(
                "ls",
                vec![],
                Some(rpc::JobLimits {
                    max_cpu_percent: 0,
                    max_memory_mb: mb,
                    max_io_bytes_per_sec: 0,
                }),
            )
        };

        assert!(
            ValidatedCreateJobRequest::validate(with_memory(1), None).is_ok()
        );
        assert!(ValidatedCreateJobRequest::validate(with_memory(-1), None)
            .is_err());
        assert!(ValidatedCreateJobRequest::validate(
            with_memory(1_048_577),
            None
        )
        .is_err());
    }

    #[test]
    fn test_into_spec_applies_defaults() {
        use validation::ValidatedField;

        let defaults = JobDefaults {
            cpu_percent: CpuPercent::validate(Some(10), "cpu", None)
                .expect("valid"),
            memory_mb: MemoryMb::validate(Some(1), "memory", None)
                .expect("valid"),
            io_bytes_per_sec: IoBps::validate(Some(0), "io", None)
                .expect("valid"),
        };

        let validated = ValidatedCreateJobRequest::validate(
            request(
                "ls",
                vec![],
                Some(rpc::JobLimits {
                    max_cpu_percent: 0,
                    max_memory_mb: 256,
                    max_io_bytes_per_sec: 0,
                }),
            ),
            None,
        )
        .expect("valid request");

        let spec = validated.into_spec(&defaults);
        assert_eq!(spec.limits.cpu_percent.into_inner(), 10);
        assert_eq!(spec.limits.memory_mb.into_inner(), 256);
        assert_eq!(spec.limits.io_bytes_per_sec.into_inner(), 0);
    }

    #[test]
    fn test_get_request_id_rules() {
        assert!(ValidatedGetJobRequest::validate(
            rpc::GetJobRequest { id: "ok-id_1".into() },
            None
        )
        .is_ok());
        assert!(ValidatedGetJobRequest::validate(
            rpc::GetJobRequest { id: "bad id".into() },
            None
        )
        .is_err());
        assert!(ValidatedGetJobRequest::validate(
            rpc::GetJobRequest { id: String::new() },
            None
        )
        .is_err());
    }
}
