use std::fs::File;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{AttachError, Result};
use crate::kernel::Kernel;

/// XDP attachment mode, passed through to the kernel unchanged.
///
/// No driver-support probing happens in userspace; the kernel rejects
/// unsupported combinations at attach time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XdpMode {
    /// Generic (skb) mode, works on any driver.
    Generic,
    /// Native driver mode.
    Driver,
}

/// Caller-supplied description of where a program should be attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookDescriptor {
    /// tc classifier on the interface's clsact ingress hook.
    IngressQueueing { interface: String },
    /// Socket hook on a cgroup-v2 directory. The attach point within the
    /// cgroup (e.g. inet4 connect) is fixed by the compiled program itself.
    CgroupSocket { path: PathBuf },
    /// XDP hook on the interface.
    Xdp { interface: String, mode: XdpMode },
}

/// Hook kind without the target, used to pick the program type when loading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    IngressQueueing,
    CgroupSocket,
    Xdp,
}

impl HookDescriptor {
    pub fn kind(&self) -> HookKind {
        match self {
            HookDescriptor::IngressQueueing { .. } => HookKind::IngressQueueing,
            HookDescriptor::CgroupSocket { .. } => HookKind::CgroupSocket,
            HookDescriptor::Xdp { .. } => HookKind::Xdp,
        }
    }
}

impl std::fmt::Display for HookDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookDescriptor::IngressQueueing { interface } => {
                write!(f, "tc ingress on {interface}")
            }
            HookDescriptor::CgroupSocket { path } => {
                write!(f, "cgroup socket hook on {}", path.display())
            }
            HookDescriptor::Xdp { interface, mode } => {
                write!(f, "xdp ({mode:?}) on {interface}")
            }
        }
    }
}

/// Whether this session created the clsact qdisc or found it already there.
///
/// Teardown removes the qdisc only in the `Created` case; a pre-existing
/// discipline belongs to whoever installed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QdiscOwnership {
    Created,
    PreExisting,
}

/// A hook prepared for attachment: prerequisites exist, target resolved,
/// ownership of anything this call created recorded for teardown.
#[derive(Debug)]
pub enum ResolvedHook {
    IngressQueueing {
        interface: String,
        qdisc: QdiscOwnership,
    },
    CgroupSocket {
        path: PathBuf,
        /// Kept open so the descriptor outlives the attach call.
        cgroup: File,
    },
    Xdp {
        interface: String,
        mode: XdpMode,
    },
}

/// Validate a descriptor against the running system before any artifact
/// resource is created: the interface must exist, the cgroup path must be
/// an accessible directory.
pub fn validate<K: Kernel>(kernel: &K, descriptor: &HookDescriptor) -> Result<()> {
    match descriptor {
        HookDescriptor::IngressQueueing { interface } | HookDescriptor::Xdp { interface, .. } => {
            kernel.interface_index(interface).map(|_| ())
        }
        HookDescriptor::CgroupSocket { path } => match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(AttachError::CgroupPathInvalid(path.clone())),
        },
    }
}

/// Resolve a validated descriptor into a ready-to-attach hook, creating the
/// clsact qdisc for the ingress case if the interface does not have one yet.
pub fn resolve<K: Kernel>(kernel: &K, descriptor: &HookDescriptor) -> Result<ResolvedHook> {
    match descriptor {
        HookDescriptor::IngressQueueing { interface } => {
            let qdisc = kernel.ensure_clsact(interface)?;
            debug!(interface = %interface, ?qdisc, "clsact qdisc ready");
            Ok(ResolvedHook::IngressQueueing {
                interface: interface.clone(),
                qdisc,
            })
        }
        HookDescriptor::CgroupSocket { path } => {
            let meta = std::fs::metadata(path)
                .map_err(|_| AttachError::CgroupPathInvalid(path.clone()))?;
            if !meta.is_dir() {
                return Err(AttachError::CgroupPathInvalid(path.clone()));
            }
            let cgroup =
                File::open(path).map_err(|_| AttachError::CgroupPathInvalid(path.clone()))?;
            Ok(ResolvedHook::CgroupSocket {
                path: path.clone(),
                cgroup,
            })
        }
        HookDescriptor::Xdp { interface, mode } => {
            kernel.interface_index(interface)?;
            Ok(ResolvedHook::Xdp {
                interface: interface.clone(),
                mode: *mode,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_kind_matches_variant() {
        let tc = HookDescriptor::IngressQueueing {
            interface: "eth0".to_string(),
        };
        let cg = HookDescriptor::CgroupSocket {
            path: PathBuf::from("/sys/fs/cgroup/test"),
        };
        let xdp = HookDescriptor::Xdp {
            interface: "eth0".to_string(),
            mode: XdpMode::Generic,
        };
        assert_eq!(tc.kind(), HookKind::IngressQueueing);
        assert_eq!(cg.kind(), HookKind::CgroupSocket);
        assert_eq!(xdp.kind(), HookKind::Xdp);
    }
}
