use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while attaching or detaching a filter program.
///
/// Every variant is terminal for the current attach call; nothing is retried
/// internally. Kernel-side resources created before the failure are unwound
/// before the error is returned.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("malformed BPF object: {0}")]
    MalformedArtifact(String),

    #[error("kernel rejected BPF program '{program}': {detail}")]
    VerificationRejected { program: String, detail: String },

    #[error("program '{0}' not found in BPF object")]
    ProgramNotFound(String),

    #[error("config map '{0}' not found in BPF object")]
    RegionNotFound(String),

    #[error("process name is {len} bytes, the comm field holds at most {max}")]
    IdentifierTooLong { len: usize, max: usize },

    #[error("config map '{region}' cannot hold a {width}-byte value: {detail}")]
    RegionWidthMismatch {
        region: String,
        width: usize,
        detail: String,
    },

    #[error("config map '{region}' access failed: {detail}")]
    RegionAccessFailed { region: String, detail: String },

    #[error("network interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("cgroup path '{}' is not an accessible cgroup directory", .0.display())]
    CgroupPathInvalid(PathBuf),

    #[error("hook already has a program attached")]
    HookBusy,

    #[error("kernel refused the attach: {0}")]
    AttachRejected(String),

    #[error("failed to release hook resources: {0}")]
    DetachFailed(String),
}

pub type Result<T> = std::result::Result<T, AttachError>;
