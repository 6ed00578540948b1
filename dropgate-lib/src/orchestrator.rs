use tracing::{debug, info, warn};

use crate::config::ConfigValue;
use crate::error::Result;
use crate::hook::{self, HookDescriptor, QdiscOwnership, ResolvedHook};
use crate::kernel::{Artifact, Kernel};

/// Everything one attachment needs: the compiled object, the two symbol
/// names inside it, and the configuration to install before attaching.
pub struct AttachRequest<'a> {
    /// Raw bytes of the compiled BPF object file.
    pub artifact: &'a [u8],
    /// Name of the program symbol to attach.
    pub program: &'a str,
    /// Name of the config map symbol to write.
    pub region: &'a str,
    /// Key within the config map (0 for every known artifact).
    pub key: u32,
    /// Value to install before the attach.
    pub value: ConfigValue,
    /// Where to attach.
    pub hook: HookDescriptor,
}

/// Loads an artifact, configures it and binds it to a hook, in that order,
/// unwinding everything this call created on any failure.
///
/// One call is one session: either it returns a live [`AttachmentHandle`]
/// or no kernel-visible side effect of the call persists.
pub struct AttachmentOrchestrator<K: Kernel> {
    kernel: K,
}

impl<K: Kernel> AttachmentOrchestrator<K> {
    pub fn new(kernel: K) -> Self {
        Self { kernel }
    }

    pub fn attach(&self, request: AttachRequest<'_>) -> Result<AttachmentHandle<'_, K>> {
        // Reject bad targets before any artifact resource exists.
        hook::validate(&self.kernel, &request.hook)?;

        let mut artifact = self.kernel.load_artifact(request.artifact)?;
        artifact.prepare_program(request.program, request.hook.kind())?;
        artifact.resolve_region(request.region)?;

        // Configuration must be visible to the program before the first
        // packet can reach it, so the write strictly precedes the attach.
        let encoded = request.value.encode()?;
        artifact.write_region(request.region, request.key, &encoded)?;
        if let Ok(readback) = artifact.read_region(request.region, request.key, encoded.len()) {
            debug!(
                region = request.region,
                key = request.key,
                value = ?readback,
                "configuration written"
            );
        }

        let resolved = hook::resolve(&self.kernel, &request.hook)?;

        if let Err(err) = artifact.attach(request.program, &resolved) {
            // The artifact unwinds when dropped below; the only resource
            // that outlives it is a qdisc this call just created.
            remove_created_qdisc(&self.kernel, &resolved);
            return Err(err);
        }

        info!(
            program = request.program,
            hook = %request.hook,
            value = %request.value,
            "program attached"
        );

        Ok(AttachmentHandle {
            kernel: &self.kernel,
            artifact: Some(artifact),
            hook: resolved,
        })
    }
}

fn remove_created_qdisc<K: Kernel>(kernel: &K, hook: &ResolvedHook) {
    if let ResolvedHook::IngressQueueing {
        interface,
        qdisc: QdiscOwnership::Created,
    } = hook
    {
        if let Err(err) = kernel.remove_clsact(interface) {
            warn!(interface = %interface, %err, "could not remove qdisc created during failed attach");
        }
    }
}

/// One live binding of a program to a hook.
///
/// The handle keeps the attached program's kernel resources alive and is the
/// only way to release them: call [`detach`](Self::detach), or drop the
/// handle and let it detach itself.
pub struct AttachmentHandle<'k, K: Kernel> {
    kernel: &'k K,
    artifact: Option<K::Artifact>,
    hook: ResolvedHook,
}

impl<K: Kernel> std::fmt::Debug for AttachmentHandle<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentHandle")
            .field("attached", &self.artifact.is_some())
            .field("hook", &self.hook)
            .finish()
    }
}

impl<K: Kernel> AttachmentHandle<'_, K> {
    /// Release the attachment and every kernel resource this session
    /// created. A clsact qdisc that pre-existed the session stays in place.
    ///
    /// Idempotent: the second and later calls are no-ops.
    pub fn detach(&mut self) -> Result<()> {
        let Some(mut artifact) = self.artifact.take() else {
            return Ok(());
        };
        let detach_result = artifact.detach();
        // Dropping the artifact releases the program and the config region.
        drop(artifact);
        let qdisc_result = match &self.hook {
            ResolvedHook::IngressQueueing {
                interface,
                qdisc: QdiscOwnership::Created,
            } => self.kernel.remove_clsact(interface),
            _ => Ok(()),
        };
        debug!("attachment released");
        detach_result.and(qdisc_result)
    }
}

impl<K: Kernel> Drop for AttachmentHandle<'_, K> {
    fn drop(&mut self) {
        if self.artifact.is_some() {
            if let Err(err) = self.detach() {
                warn!(%err, "detach during drop failed");
            }
        }
    }
}
