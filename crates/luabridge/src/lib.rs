//! Host-side bridge to an embedded, stack-based interpreter.
//!
//! The interpreter is reached only through [`GuestApi`]. Until a surface is
//! installed every operation fails with [`BridgeError::NotInitialized`];
//! [`Bridge::on_ready`] queues work for the moment it arrives.
//!
//! A bridge is single-threaded. Operations against one instance must be
//! serialized by the caller; distinct instances are independent.

pub mod config;
pub mod diagnostics;
pub mod error;

mod code;
mod ledger;
mod marshal;
mod pcall;
mod registry;
mod value;

pub use code::CodeHandle;
pub use config::BridgeConfig;
pub use diagnostics::{Diagnostic, Report, Severity};
pub use error::{BridgeError, ExecutionError, HandleKind, Result};
pub use ledger::LedgerStats;
pub use luabridge_contracts::{LuaType, StatusCode};
pub use luabridge_guest_core::GuestApi;
pub use marshal::{CallContext, GuestRef};
pub use registry::Handle;
pub use value::{HostFunction, HostValue};

use code::CodeManager;
use diagnostics::{Diagnostics, LB_CODE_NOTHING_LOADED, LB_CODE_UNDELIVERED};
use ledger::scratch_string;
use marshal::{Marshaller, Shared};
use registry::{CodeOwner, PendingCode, StateRegistry};

type ReadyCallback = Box<dyn FnOnce(&mut Bridge)>;

fn surface(slot: &mut Option<Box<dyn GuestApi>>) -> Result<&mut dyn GuestApi> {
    match slot.as_deref_mut() {
        Some(g) => Ok(g),
        None => Err(BridgeError::NotInitialized),
    }
}

pub struct Bridge {
    surface: Option<Box<dyn GuestApi>>,
    ready: Vec<ReadyCallback>,
    registry: StateRegistry,
    code: CodeManager,
    shared: Shared,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// A bridge with no surface yet, configured from the environment.
    pub fn new() -> Self {
        Self::with_config(*BridgeConfig::global())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        Self {
            surface: None,
            ready: Vec::new(),
            registry: StateRegistry::default(),
            code: CodeManager::default(),
            shared: Shared {
                diagnostics: Diagnostics::new(config.warn_to_stderr, config.max_diagnostics),
                config,
            },
        }
    }

    pub fn with_surface(surface: Box<dyn GuestApi>, config: BridgeConfig) -> Self {
        let mut bridge = Self::with_config(config);
        bridge.surface = Some(surface);
        bridge
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn is_ready(&self) -> bool {
        self.surface.is_some()
    }

    /// Installs the primitive surface and runs queued ready callbacks in
    /// registration order. A second install hands the surface back.
    pub fn install_surface(
        &mut self,
        surface: Box<dyn GuestApi>,
    ) -> std::result::Result<(), Box<dyn GuestApi>> {
        if self.surface.is_some() {
            return Err(surface);
        }
        self.surface = Some(surface);
        for cb in std::mem::take(&mut self.ready) {
            cb(self);
        }
        Ok(())
    }

    /// Runs `f` once the surface is installed, immediately if it already is.
    pub fn on_ready(&mut self, f: impl FnOnce(&mut Bridge) + 'static) {
        if self.is_ready() {
            f(self);
        } else {
            self.ready.push(Box::new(f));
        }
    }

    fn marshaller(&mut self, handle: Handle) -> Result<Marshaller<'_>> {
        let guest = surface(&mut self.surface)?;
        let instance = self.registry.get(handle)?;
        Ok(Marshaller::new(guest, handle, instance, self.shared.clone()))
    }

    pub fn create_instance(&mut self) -> Result<Handle> {
        let guest = surface(&mut self.surface)?;
        self.registry.create(guest)
    }

    /// Closes the instance and releases everything it owns. Unknown or
    /// already-destroyed handles fail with [`BridgeError::HandleNotFound`].
    pub fn destroy_instance(&mut self, handle: Handle) -> Result<()> {
        let guest = surface(&mut self.surface)?;
        self.registry.destroy(guest, handle)
    }

    pub fn instances(&self) -> Vec<Handle> {
        self.registry.handles()
    }

    pub fn set_global(&mut self, handle: Handle, name: &str, value: &HostValue) -> Result<()> {
        let mut m = self.marshaller(handle)?;
        let name_ptr = m.intern(name)?;
        m.push(value)?;
        m.guest.set_global(m.l, name_ptr);
        Ok(())
    }

    pub fn get_global(&mut self, handle: Handle, name: &str) -> Result<(HostValue, LuaType)> {
        let mut m = self.marshaller(handle)?;
        let name_ptr = m.intern(name)?;
        let base = m.depth();
        let ty = LuaType::from_raw(m.guest.get_global(m.l, name_ptr));
        let value = m.pull(-1);
        m.restore(base);
        Ok((value?, ty))
    }

    pub fn call_global(
        &mut self,
        handle: Handle,
        name: &str,
        args: &[HostValue],
    ) -> Result<Vec<HostValue>> {
        let mut m = self.marshaller(handle)?;
        pcall::call_global(&mut m, name, args)
    }

    /// Makes `source` the instance's next chunk, discarding whatever was loaded
    /// before. Persistent sources stay loaded after a successful `execute`.
    pub fn load(&mut self, handle: Handle, source: &str, persistent: bool) -> Result<()> {
        let guest = surface(&mut self.surface)?;
        let instance = self.registry.get(handle)?;
        let mut inst = instance.borrow_mut();
        inst.discard_pending(guest);
        let pending = if persistent {
            PendingCode {
                ptr: inst.ledger.intern_string(guest, source)?,
                owner: CodeOwner::Interned,
            }
        } else {
            PendingCode {
                ptr: scratch_string(guest, source)?,
                owner: CodeOwner::Scratch,
            }
        };
        inst.meta.pending_code = Some(pending);
        Ok(())
    }

    /// Runs the loaded chunk and returns its results.
    pub fn execute(&mut self, handle: Handle) -> Result<Vec<HostValue>> {
        let mut m = self.marshaller(handle)?;
        let pending = m.instance.borrow().meta.pending_code;
        let Some(code) = pending else {
            m.warn(Diagnostic::warning(
                LB_CODE_NOTHING_LOADED,
                format!("execute on instance {handle} with nothing loaded"),
            ));
            return Ok(Vec::new());
        };

        let out = pcall::run_chunk(&mut m, code.ptr);

        let mut inst = m.instance.borrow_mut();
        match code.owner {
            CodeOwner::Scratch => {
                inst.meta.pending_code = None;
                m.guest.free(code.ptr);
            }
            CodeOwner::Interned if out.is_err() => {
                inst.meta.pending_code = None;
            }
            CodeOwner::Interned => {}
        }
        out
    }

    pub fn prepare_code(&mut self, source: &str, persistent: bool) -> Result<CodeHandle> {
        let guest = surface(&mut self.surface)?;
        self.code.prepare(guest, source, persistent)
    }

    fn undelivered(&self, code: CodeHandle, op: &str) -> BridgeError {
        self.shared.diagnostics.record(
            Diagnostic::warning(
                LB_CODE_UNDELIVERED,
                format!("{op} on {code}, which was never prepared or is already released"),
            )
            .with_data("code", code.ptr().0),
        );
        BridgeError::handle_not_found(HandleKind::Code, code)
    }

    /// Runs prepared code on an instance. One-shot code is released whether
    /// the run succeeds or fails.
    pub fn execute_code(&mut self, handle: Handle, code: CodeHandle) -> Result<Vec<HostValue>> {
        surface(&mut self.surface)?;
        let Some(persistent) = self.code.lookup(code) else {
            return Err(self.undelivered(code, "execute_code"));
        };
        let instance = self.registry.get(handle)?;
        let guest = surface(&mut self.surface)?;
        let mut m = Marshaller::new(guest, handle, instance, self.shared.clone());
        let out = pcall::run_chunk(&mut m, code.ptr());
        if !persistent {
            self.code.release(&mut *m.guest, code);
        }
        out
    }

    pub fn release_code(&mut self, code: CodeHandle) -> Result<()> {
        let guest = surface(&mut self.surface)?;
        if self.code.release(guest, code) {
            Ok(())
        } else {
            Err(self.undelivered(code, "release_code"))
        }
    }

    pub fn live_code_handles(&self) -> Vec<CodeHandle> {
        self.code.live()
    }

    pub fn call_ref(&mut self, r: &GuestRef, args: &[HostValue]) -> Result<Vec<HostValue>> {
        let mut m = self.marshaller(r.handle())?;
        m.call_ref(r, args)
    }

    pub fn release_ref(&mut self, r: GuestRef) -> Result<()> {
        let mut m = self.marshaller(r.handle())?;
        m.release_ref(r)
    }

    pub fn stack_depth(&mut self, handle: Handle) -> Result<i32> {
        Ok(self.marshaller(handle)?.depth())
    }

    pub fn ledger_stats(&self, handle: Handle) -> Result<LedgerStats> {
        let instance = self.registry.get(handle)?;
        let stats = instance.borrow().ledger.stats();
        Ok(stats)
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.shared.diagnostics.snapshot()
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.shared.diagnostics.take()
    }

    pub fn report(&self) -> Report {
        self.shared.diagnostics.report()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let Some(guest) = self.surface.as_deref_mut() else {
            return;
        };
        for handle in self.registry.handles() {
            if let Err(e) = self.registry.destroy(guest, handle) {
                eprintln!("release instance {handle} failed: {e}");
            }
        }
        self.code.release_all(guest);
    }
}
