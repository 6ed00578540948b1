use std::ffi::CString;
use std::io;
use std::sync::Once;

use aya::maps::Array;
use aya::programs::cgroup_sock_addr::CgroupSockAddrLinkId;
use aya::programs::tc::{self, SchedClassifier, SchedClassifierLinkId, TcAttachType};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{CgroupAttachMode, CgroupSockAddr, ProgramError, Xdp, XdpFlags};
use aya::Ebpf;
use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REQUEST,
};
use netlink_packet_route::tc::{TcAttribute, TcHandle, TcMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use tracing::{debug, warn};

use crate::config::{COMM_WIDTH, PORT_WIDTH};
use crate::error::{AttachError, Result};
use crate::hook::{HookKind, QdiscOwnership, ResolvedHook, XdpMode};
use crate::kernel::{Artifact, Kernel};

/// Production kernel boundary: aya for object loading, map writes and
/// attach/detach; a direct rtnetlink request for the one operation aya does
/// not expose (deleting a clsact qdisc this session created).
#[derive(Clone, Copy, Debug, Default)]
pub struct SysKernel;

static MEMLOCK_INIT: Once = Once::new();

/// Raise RLIMIT_MEMLOCK before the first BPF load. Kernels before 5.11
/// account map memory against the memlock limit, and the default is too
/// small for anything nontrivial.
fn raise_memlock_limit() {
    MEMLOCK_INIT.call_once(|| {
        let limit = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        #[allow(unsafe_code)]
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
        if ret != 0 {
            warn!("failed to raise RLIMIT_MEMLOCK; BPF map creation may fail on older kernels");
        }
    });
}

impl Kernel for SysKernel {
    type Artifact = BpfArtifact;

    fn load_artifact(&self, bytes: &[u8]) -> Result<BpfArtifact> {
        if bytes.is_empty() {
            return Err(AttachError::MalformedArtifact(
                "object file is empty".to_string(),
            ));
        }
        raise_memlock_limit();
        let ebpf = Ebpf::load(bytes).map_err(|e| AttachError::MalformedArtifact(e.to_string()))?;
        Ok(BpfArtifact { ebpf, link: None })
    }

    fn interface_index(&self, name: &str) -> Result<u32> {
        let cname =
            CString::new(name).map_err(|_| AttachError::InterfaceNotFound(name.to_string()))?;
        #[allow(unsafe_code)]
        let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if index == 0 {
            Err(AttachError::InterfaceNotFound(name.to_string()))
        } else {
            Ok(index)
        }
    }

    fn ensure_clsact(&self, interface: &str) -> Result<QdiscOwnership> {
        match tc::qdisc_add_clsact(interface) {
            Ok(()) => {
                debug!(interface, "created clsact qdisc");
                Ok(QdiscOwnership::Created)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(QdiscOwnership::PreExisting),
            Err(e) => Err(AttachError::AttachRejected(format!(
                "failed to add clsact qdisc on {interface}: {e}"
            ))),
        }
    }

    fn remove_clsact(&self, interface: &str) -> Result<()> {
        let index = self.interface_index(interface)?;
        del_clsact(index).map_err(|e| {
            AttachError::DetachFailed(format!("failed to remove clsact qdisc on {interface}: {e}"))
        })?;
        debug!(interface, "removed clsact qdisc");
        Ok(())
    }
}

/// clsact is keyed by the fixed handle ffff:0 under the TC_H_CLSACT parent.
const CLSACT_HANDLE: TcHandle = TcHandle {
    major: 0xffff,
    minor: 0,
};
const CLSACT_PARENT: TcHandle = TcHandle {
    major: 0xffff,
    minor: 0xfff1,
};

/// Issue RTM_DELQDISC for the clsact qdisc on the given interface.
fn del_clsact(if_index: u32) -> io::Result<()> {
    let mut tc_msg = TcMessage::default();
    tc_msg.header.index = if_index as i32;
    tc_msg.header.handle = CLSACT_HANDLE;
    tc_msg.header.parent = CLSACT_PARENT;
    tc_msg
        .attributes
        .push(TcAttribute::Kind("clsact".to_string()));

    let mut header = NetlinkHeader::default();
    header.flags = NLM_F_REQUEST | NLM_F_ACK;
    let mut request = NetlinkMessage::new(
        header,
        NetlinkPayload::from(RouteNetlinkMessage::DelQueueDiscipline(tc_msg)),
    );
    request.finalize();

    let mut buf = vec![0u8; request.buffer_len()];
    request.serialize(&mut buf);

    let socket = Socket::new(NETLINK_ROUTE)?;
    socket.connect(&SocketAddr::new(0, 0))?;
    socket.send(&buf, 0)?;

    let mut recv_buf = vec![0u8; 4096];
    let n = socket.recv(&mut &mut recv_buf[..], 0)?;
    let response = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[..n])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    match response.payload {
        NetlinkPayload::Error(err) => match err.code {
            None => Ok(()),
            Some(code) => {
                let errno = -code.get();
                // Already gone; nothing left to remove.
                if errno == libc::ENOENT {
                    Ok(())
                } else {
                    Err(io::Error::from_raw_os_error(errno))
                }
            }
        },
        _ => Ok(()),
    }
}

/// The live kernel-side attachment held by a [`BpfArtifact`].
enum LiveLink {
    Tc(SchedClassifierLinkId),
    Cgroup(CgroupSockAddrLinkId),
    Xdp(XdpLinkId),
}

/// One loaded BPF object. Dropping it releases every kernel resource the
/// object holds, including a still-live attachment.
pub struct BpfArtifact {
    ebpf: Ebpf,
    link: Option<(String, LiveLink)>,
}

impl Artifact for BpfArtifact {
    fn prepare_program(&mut self, name: &str, kind: HookKind) -> Result<()> {
        let program = self
            .ebpf
            .program_mut(name)
            .ok_or_else(|| AttachError::ProgramNotFound(name.to_string()))?;
        match kind {
            HookKind::IngressQueueing => {
                let program: &mut SchedClassifier =
                    program.try_into().map_err(|e| wrong_type(name, e))?;
                program.load().map_err(|e| rejected(name, e))
            }
            HookKind::CgroupSocket => {
                let program: &mut CgroupSockAddr =
                    program.try_into().map_err(|e| wrong_type(name, e))?;
                program.load().map_err(|e| rejected(name, e))
            }
            HookKind::Xdp => {
                let program: &mut Xdp = program.try_into().map_err(|e| wrong_type(name, e))?;
                program.load().map_err(|e| rejected(name, e))
            }
        }
    }

    fn resolve_region(&self, name: &str) -> Result<()> {
        self.ebpf
            .map(name)
            .ok_or_else(|| AttachError::RegionNotFound(name.to_string()))?;
        Ok(())
    }

    fn write_region(&mut self, name: &str, key: u32, value: &[u8]) -> Result<()> {
        let map = self
            .ebpf
            .map_mut(name)
            .ok_or_else(|| AttachError::RegionNotFound(name.to_string()))?;
        match value.len() {
            PORT_WIDTH => {
                let mut region = Array::<_, [u8; PORT_WIDTH]>::try_from(map)
                    .map_err(|e| width_mismatch(name, PORT_WIDTH, e))?;
                let mut bytes = [0u8; PORT_WIDTH];
                bytes.copy_from_slice(value);
                region.set(key, bytes, 0).map_err(|e| access_failed(name, e))
            }
            COMM_WIDTH => {
                let mut region = Array::<_, [u8; COMM_WIDTH]>::try_from(map)
                    .map_err(|e| width_mismatch(name, COMM_WIDTH, e))?;
                let mut bytes = [0u8; COMM_WIDTH];
                bytes.copy_from_slice(value);
                region.set(key, bytes, 0).map_err(|e| access_failed(name, e))
            }
            other => Err(AttachError::RegionWidthMismatch {
                region: name.to_string(),
                width: other,
                detail: "config values are 2 or 16 bytes wide".to_string(),
            }),
        }
    }

    fn read_region(&self, name: &str, key: u32, width: usize) -> Result<Vec<u8>> {
        let map = self
            .ebpf
            .map(name)
            .ok_or_else(|| AttachError::RegionNotFound(name.to_string()))?;
        match width {
            PORT_WIDTH => {
                let region = Array::<_, [u8; PORT_WIDTH]>::try_from(map)
                    .map_err(|e| width_mismatch(name, PORT_WIDTH, e))?;
                let value = region.get(&key, 0).map_err(|e| access_failed(name, e))?;
                Ok(value.to_vec())
            }
            COMM_WIDTH => {
                let region = Array::<_, [u8; COMM_WIDTH]>::try_from(map)
                    .map_err(|e| width_mismatch(name, COMM_WIDTH, e))?;
                let value = region.get(&key, 0).map_err(|e| access_failed(name, e))?;
                Ok(value.to_vec())
            }
            other => Err(AttachError::RegionWidthMismatch {
                region: name.to_string(),
                width: other,
                detail: "config values are 2 or 16 bytes wide".to_string(),
            }),
        }
    }

    fn attach(&mut self, name: &str, hook: &ResolvedHook) -> Result<()> {
        if self.link.is_some() {
            return Err(AttachError::AttachRejected(
                "artifact already has a live attachment".to_string(),
            ));
        }
        let program = self
            .ebpf
            .program_mut(name)
            .ok_or_else(|| AttachError::ProgramNotFound(name.to_string()))?;
        let link = match hook {
            ResolvedHook::IngressQueueing { interface, .. } => {
                let program: &mut SchedClassifier =
                    program.try_into().map_err(|e| wrong_type(name, e))?;
                LiveLink::Tc(
                    program
                        .attach(interface, TcAttachType::Ingress)
                        .map_err(classify_attach_error)?,
                )
            }
            ResolvedHook::CgroupSocket { cgroup, .. } => {
                let program: &mut CgroupSockAddr =
                    program.try_into().map_err(|e| wrong_type(name, e))?;
                LiveLink::Cgroup(
                    program
                        .attach(cgroup, CgroupAttachMode::Single)
                        .map_err(classify_attach_error)?,
                )
            }
            ResolvedHook::Xdp { interface, mode } => {
                let program: &mut Xdp = program.try_into().map_err(|e| wrong_type(name, e))?;
                LiveLink::Xdp(
                    program
                        .attach(interface, xdp_flags(*mode))
                        .map_err(classify_attach_error)?,
                )
            }
        };
        self.link = Some((name.to_string(), link));
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        let Some((name, link)) = self.link.take() else {
            return Ok(());
        };
        let program = self
            .ebpf
            .program_mut(&name)
            .ok_or_else(|| AttachError::ProgramNotFound(name.clone()))?;
        let result = match link {
            LiveLink::Tc(id) => {
                let program: &mut SchedClassifier =
                    program.try_into().map_err(|e| wrong_type(&name, e))?;
                program.detach(id)
            }
            LiveLink::Cgroup(id) => {
                let program: &mut CgroupSockAddr =
                    program.try_into().map_err(|e| wrong_type(&name, e))?;
                program.detach(id)
            }
            LiveLink::Xdp(id) => {
                let program: &mut Xdp = program.try_into().map_err(|e| wrong_type(&name, e))?;
                program.detach(id)
            }
        };
        result.map_err(|e| AttachError::DetachFailed(e.to_string()))
    }
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Generic => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
    }
}

fn wrong_type(name: &str, err: ProgramError) -> AttachError {
    AttachError::MalformedArtifact(format!(
        "program '{name}' has the wrong type for the requested hook: {err}"
    ))
}

fn rejected(name: &str, err: ProgramError) -> AttachError {
    AttachError::VerificationRejected {
        program: name.to_string(),
        detail: err.to_string(),
    }
}

fn width_mismatch(name: &str, width: usize, err: aya::maps::MapError) -> AttachError {
    AttachError::RegionWidthMismatch {
        region: name.to_string(),
        width,
        detail: err.to_string(),
    }
}

fn access_failed(name: &str, err: aya::maps::MapError) -> AttachError {
    AttachError::RegionAccessFailed {
        region: name.to_string(),
        detail: err.to_string(),
    }
}

/// Attach refusals that mean "someone is already there" surface as
/// [`AttachError::HookBusy`]; everything else keeps the kernel's reason.
fn classify_attach_error(err: ProgramError) -> AttachError {
    if let ProgramError::SyscallError(sys) = &err {
        if let Some(errno) = sys.io_error.raw_os_error() {
            if errno == libc::EEXIST || errno == libc::EBUSY {
                return AttachError::HookBusy;
            }
        }
    }
    AttachError::AttachRejected(err.to_string())
}
