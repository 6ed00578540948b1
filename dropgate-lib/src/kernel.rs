use crate::error::Result;
use crate::hook::{HookKind, QdiscOwnership, ResolvedHook};

/// Kernel-side operations the orchestrator depends on.
///
/// [`crate::bpf::SysKernel`] is the production implementation over aya and
/// rtnetlink. Tests substitute an in-memory fake so attach/unwind behavior
/// can be asserted without privileges or a compiled BPF object.
pub trait Kernel {
    type Artifact: Artifact;

    /// Parse and load a compiled BPF object. Fails on empty or malformed
    /// input; kernel verification of individual programs happens later, in
    /// [`Artifact::prepare_program`].
    fn load_artifact(&self, bytes: &[u8]) -> Result<Self::Artifact>;

    /// Resolve an interface name to its index. Fails with
    /// [`crate::AttachError::InterfaceNotFound`] if the name does not exist.
    fn interface_index(&self, name: &str) -> Result<u32>;

    /// Make sure the interface has a clsact qdisc, creating one if needed.
    /// Reports whether this call created it; teardown scoping depends on
    /// that distinction.
    fn ensure_clsact(&self, interface: &str) -> Result<QdiscOwnership>;

    /// Remove the clsact qdisc from the interface. Only ever called for a
    /// qdisc this session created.
    fn remove_clsact(&self, interface: &str) -> Result<()>;
}

/// One loaded BPF object: named programs plus named config regions.
///
/// Dropping an artifact releases every kernel resource it holds, including
/// a live attachment; the orchestrator relies on this for unwinding.
pub trait Artifact {
    /// Resolve the named program, select its type from the hook kind, and
    /// load it into the kernel (running the verifier).
    fn prepare_program(&mut self, name: &str, kind: HookKind) -> Result<()>;

    /// Check that the named config region exists.
    fn resolve_region(&self, name: &str) -> Result<()>;

    /// Upsert `value` at `key` in the named region. The value width must
    /// match the region's compiled value width exactly. A single bounded
    /// map-update call, so concurrent readers never observe a torn value.
    fn write_region(&mut self, name: &str, key: u32, value: &[u8]) -> Result<()>;

    /// Read the `width`-byte value at `key` back out of the region.
    fn read_region(&self, name: &str, key: u32, width: usize) -> Result<Vec<u8>>;

    /// Attach the prepared program to the resolved hook. At most one live
    /// attachment per artifact.
    fn attach(&mut self, program: &str, hook: &ResolvedHook) -> Result<()>;

    /// Detach the live attachment, if any. No-op when nothing is attached.
    fn detach(&mut self) -> Result<()>;
}
