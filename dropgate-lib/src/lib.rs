// BPF attachment is Linux-only. This crate does not compile for other targets.
#![cfg(target_os = "linux")]
// Unsafe is required in two narrow sites in bpf.rs:
//   - libc::setrlimit FFI call (RLIMIT_MEMLOCK)
//   - libc::if_nametoindex FFI call (interface name resolution)
// All other unsafe is denied.
#![deny(unsafe_code)]

//! Control plane for attaching precompiled packet-filter BPF programs to
//! kernel hooks (tc ingress, cgroup socket, XDP) and feeding them runtime
//! configuration through their config maps.

pub mod bpf;
pub mod config;
pub mod error;
pub mod hook;
pub mod kernel;
pub mod orchestrator;

pub use bpf::SysKernel;
pub use config::{ConfigValue, CONFIG_KEY};
pub use error::{AttachError, Result};
pub use hook::{HookDescriptor, QdiscOwnership, XdpMode};
pub use kernel::{Artifact, Kernel};
pub use orchestrator::{AttachRequest, AttachmentHandle, AttachmentOrchestrator};
