// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::any::{Any, TypeId};
use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use cranelift_entity::EntityRef;
use hashbrown::HashMap;

use crate::config::ModuleConfig;
use crate::errors::{Error, InstantiationError};
use crate::func::{Caller, Func, HostFunc};
use crate::indices::{DataIndex, ElemIndex, EntityIndex, FuncIndex, TypeIndex};
use crate::memory::LinearMemory;
use crate::module::{CompiledModule, Export, Module, SegmentMode};
use crate::sys::SysContext;
use crate::trap::Trap;
use crate::types::FuncType;
use crate::values::{VMVal, Val};

type CloseHook = Box<dyn FnOnce() -> crate::Result<()> + Send>;

/// What an imported function resolved to.
#[derive(Clone)]
pub(crate) enum ImportBinding {
    Host(Arc<HostFunc>),
    Export { instance: Instance, func: FuncIndex },
}

impl fmt::Debug for ImportBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(host) => f.debug_tuple("Host").field(host.ty()).finish(),
            Self::Export { instance, func } => f
                .debug_struct("Export")
                .field("instance", &instance.name())
                .field("func", func)
                .finish(),
        }
    }
}

/// The mutable state of an instance, only ever touched by the one call holding its lock.
#[derive(Debug)]
pub(crate) struct InstanceState {
    pub(crate) memory: Option<LinearMemory>,
    pub(crate) globals: Box<[VMVal]>,
    pub(crate) table: Box<[Option<FuncIndex>]>,
    /// Indexed by the function index of each imported function.
    pub(crate) imports: Box<[ImportBinding]>,
    pub(crate) data_dropped: Box<[bool]>,
    pub(crate) elem_dropped: Box<[bool]>,
    /// Current number of nested guest activations.
    pub(crate) depth: u32,
    /// Value slots charged to the current activations, see [`Module::frame_slots`].
    pub(crate) slots: u32,
}

/// An instance's state borrowed for the duration of one call.
///
/// Engines and host functions reach memory, globals, the table and imports through this.
pub(crate) struct Activation<'a> {
    pub(crate) instance: &'a Instance,
    pub(crate) state: &'a mut InstanceState,
}

impl<'a> Activation<'a> {
    pub(crate) fn reborrow(&mut self) -> Activation<'_> {
        Activation {
            instance: self.instance,
            state: &mut *self.state,
        }
    }

    pub(crate) fn instance(&self) -> &'a Instance {
        self.instance
    }

    pub(crate) fn module(&self) -> &'a Arc<Module> {
        self.instance.0.compiled.module()
    }

    pub(crate) fn max_call_depth(&self) -> u32 {
        self.instance.0.compiled.max_call_depth()
    }

    pub(crate) fn depth(&self) -> u32 {
        self.state.depth
    }

    pub(crate) fn set_depth(&mut self, depth: u32) {
        self.state.depth = depth;
    }

    pub(crate) fn max_stack_slots(&self) -> u32 {
        self.instance.0.compiled.max_stack_slots()
    }

    pub(crate) fn slots(&self) -> u32 {
        self.state.slots
    }

    pub(crate) fn set_slots(&mut self, slots: u32) {
        self.state.slots = slots;
    }

    /// Charges a new activation of `frame_slots` slots, or traps if either the call depth or
    /// the slot budget is exhausted.
    pub(crate) fn enter_frame(&mut self, frame_slots: u32) -> Result<(), Trap> {
        let slots = self.state.slots.saturating_add(frame_slots);
        if self.state.depth >= self.max_call_depth() || slots > self.max_stack_slots() {
            return Err(Trap::StackOverflow);
        }
        self.state.depth += 1;
        self.state.slots = slots;
        Ok(())
    }

    pub(crate) fn leave_frame(&mut self, frame_slots: u32) {
        self.state.depth = self.state.depth.saturating_sub(1);
        self.state.slots = self.state.slots.saturating_sub(frame_slots);
    }

    pub(crate) fn global(&self, index: u32) -> VMVal {
        self.state.globals[index as usize]
    }

    pub(crate) fn set_global(&mut self, index: u32, val: VMVal) {
        self.state.globals[index as usize] = val;
    }

    pub(crate) fn memory(&mut self) -> Result<&mut LinearMemory, Trap> {
        self.state.memory.as_mut().ok_or(Trap::MemoryOutOfBounds)
    }

    pub(crate) fn memory_size(&self) -> u32 {
        self.state.memory.as_ref().map_or(0, LinearMemory::size)
    }

    /// `memory.grow`, returning the previous size in pages or -1.
    pub(crate) fn memory_grow(&mut self, delta: u32) -> i32 {
        match self.state.memory.as_mut().and_then(|mem| mem.grow(delta)) {
            Some(old) => old as i32,
            None => -1,
        }
    }

    pub(crate) fn memory_copy(&mut self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        self.memory()?
            .copy_within(u64::from(dst), u64::from(src), len as usize)
    }

    pub(crate) fn memory_fill(&mut self, dst: u32, val: u8, len: u32) -> Result<(), Trap> {
        self.memory()?.fill(u64::from(dst), val, len as usize)
    }

    pub(crate) fn memory_init(
        &mut self,
        data: DataIndex,
        dst: u32,
        src: u32,
        len: u32,
    ) -> Result<(), Trap> {
        let module = self.module();
        let bytes: &[u8] = if self.state.data_dropped[data.index()] {
            &[]
        } else {
            &module.data[data].bytes
        };

        let end = u64::from(src) + u64::from(len);
        if end > bytes.len() as u64 {
            return Err(Trap::MemoryOutOfBounds);
        }
        let bytes = &bytes[src as usize..end as usize];
        self.memory()?.write(u64::from(dst), bytes)
    }

    pub(crate) fn data_drop(&mut self, data: DataIndex) {
        self.state.data_dropped[data.index()] = true;
    }

    pub(crate) fn table_init(
        &mut self,
        elem: ElemIndex,
        dst: u32,
        src: u32,
        len: u32,
    ) -> Result<(), Trap> {
        let module = self.module();
        let items: &[Option<FuncIndex>] = if self.state.elem_dropped[elem.index()] {
            &[]
        } else {
            &module.elements[elem].items
        };

        let src_end = u64::from(src) + u64::from(len);
        let dst_end = u64::from(dst) + u64::from(len);
        if src_end > items.len() as u64 || dst_end > self.state.table.len() as u64 {
            return Err(Trap::TableOutOfBounds);
        }
        self.state.table[dst as usize..dst_end as usize]
            .copy_from_slice(&items[src as usize..src_end as usize]);
        Ok(())
    }

    pub(crate) fn elem_drop(&mut self, elem: ElemIndex) {
        self.state.elem_dropped[elem.index()] = true;
    }

    pub(crate) fn table_copy(&mut self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let table_len = self.state.table.len() as u64;
        let src_end = u64::from(src) + u64::from(len);
        let dst_end = u64::from(dst) + u64::from(len);
        if src_end > table_len || dst_end > table_len {
            return Err(Trap::TableOutOfBounds);
        }
        self.state
            .table
            .copy_within(src as usize..src_end as usize, dst as usize);
        Ok(())
    }

    /// Looks up the function a `call_indirect` targets and checks its signature.
    pub(crate) fn resolve_indirect(&self, index: u32, ty: TypeIndex) -> Result<FuncIndex, Trap> {
        let entry = self
            .state
            .table
            .get(index as usize)
            .ok_or(Trap::TableOutOfBounds)?;
        let func = entry.ok_or(Trap::IndirectCallToNull)?;

        let module = self.module();
        if module.func_canonical_type(func) != module.canonical_type(ty) {
            return Err(Trap::BadSignature);
        }
        Ok(func)
    }

    /// Calls the imported function `func`. `values` holds the arguments and receives the results.
    pub(crate) fn call_import(&mut self, func: FuncIndex, values: &mut [VMVal]) -> crate::Result<()> {
        let binding = self.state.imports[func.index()].clone();
        match binding {
            ImportBinding::Host(host) => {
                let module = self.module();
                let import = module.import_of_func(func);
                if let Some(import) = import {
                    tracing::trace!(module = %import.module, field = %import.field, "host call");
                }

                host.call(Caller::new(self.reborrow()), values)
                    .map_err(|e| match import {
                        Some(import) => e.with_host_func_name(&import.module, &import.field),
                        None => e,
                    })
            }
            ImportBinding::Export { instance, func } => instance.invoke_raw(func, values),
        }
    }

    /// Calls any function of this instance.
    pub(crate) fn call_func(&mut self, func: FuncIndex, values: &mut [VMVal]) -> crate::Result<()> {
        let module = self.module();
        match module.defined_func_index(func) {
            Some(defined) => {
                let (depth, slots) = (self.state.depth, self.state.slots);
                let code = self.instance.0.compiled.code().clone();
                let res = code.invoke(self, defined, values);
                self.state.depth = depth;
                self.state.slots = slots;
                res
            }
            None => self.call_import(func, values),
        }
    }

    /// Calls an export of this instance from inside a call already holding its state.
    pub(crate) fn call_export(&mut self, name: &str, args: &[Val]) -> crate::Result<Vec<Val>> {
        self.instance.fail_if_closed()?;
        let func = self.instance.export_func(name)?;
        let ty = self.module().func_type(func);
        let mut values = prepare_args(ty, args)?;
        self.call_func(func, &mut values)?;
        Ok(collect_results(ty, &values))
    }
}

std::thread_local! {
    /// Instances with a call in progress on this thread, innermost last.
    static ACTIVE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks an instance as active on the current thread for as long as it lives.
struct ActiveGuard(usize);

impl ActiveGuard {
    fn enter(instance: &Instance) -> crate::Result<Self> {
        let key = instance.key();
        ACTIVE.with_borrow_mut(|active| {
            if active.contains(&key) {
                return Err(Error::Unsupported(alloc::format!(
                    "re-entrant call into instance \"{}\" outside of its Caller",
                    instance.name()
                )));
            }
            active.push(key);
            Ok(Self(key))
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with_borrow_mut(|active| {
            if let Some(pos) = active.iter().rposition(|key| *key == self.0) {
                active.remove(pos);
            }
        });
    }
}

/// An instantiated module.
///
/// Cheap to clone, all clones refer to the same instance. Calls into one instance are
/// serialized: a call from another thread blocks until the in-flight one returns.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);

struct InstanceInner {
    name: String,
    compiled: CompiledModule,
    /// Zero while running, `1 | code << 32` once the guest exited.
    exit_state: AtomicU64,
    closed: AtomicBool,
    released: AtomicBool,
    state: Mutex<InstanceState>,
    sys: SysContext,
    on_close: spin::Mutex<Vec<CloseHook>>,
    extensions: spin::Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.0.name)
            .field("closed", &self.is_closed())
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Creates an instance with already resolved imports. Runs the start function unless
    /// disabled; on any failure nothing of the instance remains reachable.
    pub(crate) fn new(
        compiled: &CompiledModule,
        imports: Box<[ImportBinding]>,
        imported_globals: Vec<VMVal>,
        config: ModuleConfig,
    ) -> crate::Result<Self> {
        let module = compiled.module();
        let name = config
            .name
            .clone()
            .or_else(|| module.name.clone())
            .unwrap_or_default();
        let skip_start = config.skip_start;

        let mut globals = imported_globals;
        for init in &module.global_initializers {
            let val = init.eval(&globals);
            globals.push(val);
        }

        let mut memory = match module.memory {
            Some(ty) => Some(
                LinearMemory::new(ty, compiled.memory_limit_pages()).ok_or(Error::MmapFailed)?,
            ),
            None => None,
        };

        let table_len = module.table.map_or(0, |ty| ty.minimum) as usize;
        let mut table = vec![None; table_len].into_boxed_slice();

        let mut elem_dropped = vec![false; module.elements.len()].into_boxed_slice();
        for (index, segment) in &module.elements {
            match &segment.mode {
                SegmentMode::Active { offset } => {
                    let offset = u64::from(offset.eval(&globals).get_u32());
                    let end = offset + segment.items.len() as u64;
                    if end > table.len() as u64 {
                        return Err(InstantiationError::SegmentOutOfBounds {
                            kind: "element",
                            index: index.as_u32(),
                        }
                        .into());
                    }
                    table[offset as usize..end as usize].copy_from_slice(&segment.items);
                    elem_dropped[index.index()] = true;
                }
                SegmentMode::Declared => elem_dropped[index.index()] = true,
                SegmentMode::Passive => {}
            }
        }

        let mut data_dropped = vec![false; module.data.len()].into_boxed_slice();
        for (index, segment) in &module.data {
            if let SegmentMode::Active { offset } = &segment.mode {
                let offset = u64::from(offset.eval(&globals).get_u32());
                memory
                    .as_mut()
                    .ok_or(Trap::MemoryOutOfBounds)
                    .and_then(|mem| mem.write(offset, &segment.bytes))
                    .map_err(|_| InstantiationError::SegmentOutOfBounds {
                        kind: "data",
                        index: index.as_u32(),
                    })?;
                data_dropped[index.index()] = true;
            }
        }

        let instance = Self(Arc::new(InstanceInner {
            name,
            compiled: compiled.clone(),
            exit_state: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            state: Mutex::new(InstanceState {
                memory,
                globals: globals.into_boxed_slice(),
                table,
                imports,
                data_dropped,
                elem_dropped,
                depth: 0,
                slots: 0,
            }),
            sys: SysContext::new(config),
            on_close: spin::Mutex::new(Vec::new()),
            extensions: spin::Mutex::new(HashMap::new()),
        }));

        tracing::debug!(instance = %instance.0.name, engine = compiled.engine_name(), "instantiated");

        if let Some(start) = module.start.filter(|_| !skip_start) {
            if let Err(e) = instance.invoke_raw(start, &mut []) {
                instance.0.closed.store(true, Ordering::Release);
                instance.release();
                return Err(InstantiationError::Start(Box::new(e)).into());
            }
        }

        Ok(instance)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn module(&self) -> &Arc<Module> {
        self.0.compiled.module()
    }

    pub fn compiled_module(&self) -> &CompiledModule {
        &self.0.compiled
    }

    pub fn sys(&self) -> &SysContext {
        &self.0.sys
    }

    pub fn exports(&self) -> impl ExactSizeIterator<Item = &Export> + '_ {
        self.module().exports()
    }

    /// Whether the instance was closed, explicitly or by an exit request.
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// The code the guest exited with, if it did.
    pub fn exit_code(&self) -> Option<u32> {
        match self.0.exit_state.load(Ordering::Acquire) {
            0 => None,
            state => Some((state >> 32) as u32),
        }
    }

    /// Latches the exit state. Returns `false` if another exit got there first.
    pub(crate) fn latch_exit(&self, code: u32) -> bool {
        let won = self
            .0
            .exit_state
            .compare_exchange(
                0,
                1 | (u64::from(code) << 32),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.0.closed.store(true, Ordering::Release);
            tracing::debug!(instance = %self.0.name, code, "guest exited");
        }
        won
    }

    /// Registers `hook` to run once when the instance is released.
    pub fn on_close(&self, hook: impl FnOnce() -> crate::Result<()> + Send + 'static) {
        self.0.on_close.lock().push(Box::new(hook));
    }

    /// Returns the instance's slot of type `T`, creating it with `init` on first use.
    ///
    /// Host modules use this to keep per-instance state that lives as long as the instance.
    pub fn extension<T: Any + Send + Sync>(&self, init: impl FnOnce() -> T) -> Arc<T> {
        let mut extensions = self.0.extensions.lock();
        if let Some(ext) = extensions
            .get(&TypeId::of::<T>())
            .and_then(|slot| slot.clone().downcast::<T>().ok())
        {
            return ext;
        }

        let ext = Arc::new(init());
        extensions.insert(TypeId::of::<T>(), ext.clone());
        ext
    }

    pub fn get_func(&self, name: &str) -> Option<Func> {
        let index = self.export_func(name).ok()?;
        Some(Func::new(self.clone(), index))
    }

    /// Reads an exported global.
    ///
    /// Returns `None` if there is no such global or when called from inside a call into this
    /// same instance, use [`Caller`] there.
    pub fn get_global(&self, name: &str) -> Option<Val> {
        let EntityIndex::Global(index) = self.module().export(name)? else {
            return None;
        };
        let ty = self.module().globals[index].content_type;
        self.with_state(|state| Val::from_vmval(state.globals[index.index()], ty))
            .ok()
    }

    /// Runs `f` with the instance's linear memory.
    ///
    /// Fails with [`Error::Unsupported`] if the module has no memory or when called from inside
    /// a call into this same instance.
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut LinearMemory) -> R) -> crate::Result<R> {
        self.with_state(|state| state.memory.as_mut().map(f))?
            .ok_or_else(|| Error::Unsupported(alloc::format!("instance \"{}\" has no memory", self.0.name)))
    }

    /// Calls the exported function `name`.
    pub fn call(&self, name: &str, args: &[Val]) -> crate::Result<Vec<Val>> {
        let func = self.export_func(name)?;
        self.call_index(func, args)
    }

    /// Calls the exported function `name` only if `pred` holds once the call holds the
    /// instance's state, returning `None` if it did not.
    ///
    /// `pred` runs while no other call into this instance can be in flight.
    pub fn call_if(
        &self,
        name: &str,
        args: &[Val],
        pred: impl FnOnce() -> bool,
    ) -> crate::Result<Option<Vec<Val>>> {
        let func = self.export_func(name)?;
        let ty = self.module().func_type(func);
        let mut values = prepare_args(ty, args)?;
        if self.invoke_if(func, &mut values, pred)? {
            Ok(Some(collect_results(ty, &values)))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn call_index(&self, func: FuncIndex, args: &[Val]) -> crate::Result<Vec<Val>> {
        let ty = self.module().func_type(func);
        let mut values = prepare_args(ty, args)?;
        self.invoke_raw(func, &mut values)?;
        Ok(collect_results(ty, &values))
    }

    /// Calls `func` with untyped values. `values` must be large enough for the parameters and
    /// the results.
    pub(crate) fn invoke_raw(&self, func: FuncIndex, values: &mut [VMVal]) -> crate::Result<()> {
        self.invoke_if(func, values, || true).map(|_| ())
    }

    fn invoke_if(
        &self,
        func: FuncIndex,
        values: &mut [VMVal],
        pred: impl FnOnce() -> bool,
    ) -> crate::Result<bool> {
        self.fail_if_closed()?;

        let res = {
            let _active = ActiveGuard::enter(self)?;
            let mut state = self.lock_state();
            self.fail_if_closed()?;
            if !pred() {
                return Ok(false);
            }

            let mut cx = Activation {
                instance: self,
                state: &mut state,
            };
            cx.call_func(func, values)
        };

        if self.is_closed() {
            for e in self.release() {
                tracing::warn!(instance = %self.0.name, "close hook failed: {e}");
            }
        }

        res.map(|()| true)
    }

    /// Closes the instance, releasing its memory and running its close hooks.
    ///
    /// Later calls fail with [`Error::Closed`]. When called from inside a call into this same
    /// instance, the release happens once that call returns.
    pub fn close(&self) -> crate::Result<()> {
        self.0.closed.store(true, Ordering::Release);

        let key = self.key();
        if ACTIVE.with_borrow(|active| active.contains(&key)) {
            return Ok(());
        }

        let errors = self.release();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::CloseFailed(errors))
        }
    }

    /// Runs the close hooks and drops the instance's state, exactly once.
    fn release(&self) -> Vec<Error> {
        if self.0.released.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        let hooks = core::mem::take(&mut *self.0.on_close.lock());
        let errors: Vec<Error> = hooks.into_iter().filter_map(|hook| hook().err()).collect();

        let mut state = self.lock_state();
        state.memory = None;
        state.imports = Box::default();
        state.table = Box::default();
        drop(state);

        self.0.extensions.lock().clear();

        tracing::debug!(instance = %self.0.name, exit_code = ?self.exit_code(), "released instance");
        errors
    }

    pub(crate) fn fail_if_closed(&self) -> crate::Result<()> {
        if self.is_closed() {
            Err(Error::Closed {
                module: self.0.name.clone(),
                exit_code: self.exit_code(),
            })
        } else {
            Ok(())
        }
    }

    pub(crate) fn export_func(&self, name: &str) -> crate::Result<FuncIndex> {
        match self.module().export(name) {
            Some(EntityIndex::Function(index)) => Ok(index),
            _ => Err(Error::UnknownExport(name.into())),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut InstanceState) -> R) -> crate::Result<R> {
        let _active = ActiveGuard::enter(self)?;
        let mut state = self.lock_state();
        Ok(f(&mut state))
    }

    fn lock_state(&self) -> MutexGuard<'_, InstanceState> {
        // A panic is caught at the host function boundary, the state stays consistent.
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

/// Type-checks `args` against `ty` and lays them out in a values buffer.
pub(crate) fn prepare_args(ty: &FuncType, args: &[Val]) -> crate::Result<Vec<VMVal>> {
    let matches = args.len() == ty.params().len()
        && args.iter().zip(ty.params()).all(|(arg, ty)| arg.ty() == *ty);
    if !matches {
        let got: Vec<String> = args.iter().map(|arg| alloc::format!("{}", arg.ty())).collect();
        return Err(Error::Type(alloc::format!(
            "expected parameters of {ty}, got ({})",
            got.join(" ")
        )));
    }

    let mut values = vec![VMVal::default(); ty.value_slots()];
    for (slot, arg) in values.iter_mut().zip(args) {
        *slot = arg.to_vmval();
    }
    Ok(values)
}

pub(crate) fn collect_results(ty: &FuncType, values: &[VMVal]) -> Vec<Val> {
    ty.results()
        .iter()
        .zip(values)
        .map(|(ty, raw)| Val::from_vmval(*raw, *ty))
        .collect()
}
