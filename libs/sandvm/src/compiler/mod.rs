// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An engine that compiles function bodies to native code with Cranelift.
//!
//! Compiled functions share one calling convention, see [`vmcontext`]. They never call each
//! other or the runtime through relocations, every callee is loaded from a table at run time,
//! so a module's code can be published as one position independent blob.

mod builtins;
mod code_memory;
mod stack;
mod state;
mod translator;
mod vmcontext;

use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::{fmt, mem, ptr};

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir::{self, AbiParam, ArgumentPurpose, Signature, UserFuncName, types};
use cranelift_codegen::isa::{self, CallConv, OwnedTargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_entity::EntityRef;
use target_lexicon::Triple;

use crate::compiler::builtins::BUILTINS;
use crate::compiler::code_memory::CodeMemory;
use crate::compiler::translator::FuncTranslator;
use crate::compiler::vmcontext::{HostState, VMContext, WasmFn, trap_status};
use crate::engine::{CompiledCode, Engine};
use crate::errors::Error;
use crate::indices::DefinedFuncIndex;
use crate::instance::Activation;
use crate::module::Module;
use crate::trap::Trap;
use crate::values::VMVal;

pub const ENGINE_NAME: &str = "compiler";

/// Code is emitted for x86-64 System V hosts with SSE4.1 only.
#[cfg(all(unix, target_arch = "x86_64"))]
pub(crate) fn is_supported() -> bool {
    std::is_x86_feature_detected!("sse4.1")
}

#[cfg(not(all(unix, target_arch = "x86_64")))]
pub(crate) fn is_supported() -> bool {
    false
}

/// The Cranelift signature of every compiled function, see [`WasmFn`].
fn wasm_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params
        .push(AbiParam::special(types::I64, ArgumentPurpose::VMContext));
    sig.params.push(AbiParam::new(types::I64));
    sig.returns.push(AbiParam::new(types::I32));
    sig
}

pub struct Compiler {
    isa: OwnedTargetIsa,
    /// Reusable per-function compilation state.
    contexts: spin::Mutex<Vec<CompilationContext>>,
}

struct CompilationContext {
    func_translator: FuncTranslator,
    codegen_context: cranelift_codegen::Context,
}

impl Default for CompilationContext {
    fn default() -> Self {
        Self {
            func_translator: FuncTranslator::new(),
            codegen_context: cranelift_codegen::Context::new(),
        }
    }
}

impl fmt::Debug for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiler")
            .field("triple", self.isa.triple())
            .finish_non_exhaustive()
    }
}

impl Compiler {
    /// Whether native code can be generated for the host.
    pub fn is_supported() -> bool {
        is_supported()
    }

    pub fn new() -> crate::Result<Self> {
        let unsupported = |e: &dyn fmt::Display| Error::Unsupported(e.to_string());

        let mut b = settings::builder();
        b.set("opt_level", "speed_and_size")
            .map_err(|e| unsupported(&e))?;
        b.set("libcall_call_conv", "isa_default")
            .map_err(|e| unsupported(&e))?;
        b.set("preserve_frame_pointers", "true")
            .map_err(|e| unsupported(&e))?;
        b.set("enable_probestack", "true")
            .map_err(|e| unsupported(&e))?;
        b.set("probestack_strategy", "inline")
            .map_err(|e| unsupported(&e))?;

        let target = Triple::host();
        let mut isa_builder = isa::lookup(target).map_err(|e| unsupported(&e))?;
        // Float rounding lowers to `roundss`/`roundsd`, without them Cranelift emits libcalls.
        isa_builder
            .enable("has_sse41")
            .map_err(|e| unsupported(&e))?;
        let isa = isa_builder
            .finish(settings::Flags::new(b))
            .map_err(|e| unsupported(&e))?;

        tracing::debug!(triple = %isa.triple(), "created compiler");
        Ok(Self {
            isa,
            contexts: spin::Mutex::new(Vec::new()),
        })
    }

    fn call_conv(&self) -> CallConv {
        CallConv::triple_default(self.isa.triple())
    }

    fn compile_into(
        &self,
        ctx: &mut CompilationContext,
        module: &Module,
        index: DefinedFuncIndex,
        text: &mut Vec<u8>,
    ) -> crate::Result<usize> {
        let call_conv = self.call_conv();
        let func_index = module.func_index(index);

        ctx.codegen_context.clear();
        ctx.codegen_context.func = ir::Function::with_name_signature(
            UserFuncName::user(0, func_index.as_u32()),
            wasm_signature(call_conv),
        );
        ctx.func_translator.translate(
            module,
            call_conv,
            index,
            &mut ctx.codegen_context.func,
        )?;

        let compiled = ctx
            .codegen_context
            .compile(&*self.isa, &mut ControlPlane::default())
            .map_err(|e| Error::Cranelift {
                func_name: module.func_name(func_index).into_owned(),
                message: e.inner.to_string(),
            })?;

        if !compiled.buffer.relocs().is_empty() {
            return Err(Error::Cranelift {
                func_name: module.func_name(func_index).into_owned(),
                message: "compiled code requires relocations".into(),
            });
        }

        let offset = text.len().next_multiple_of(16);
        text.resize(offset, 0);
        text.extend_from_slice(compiled.code_buffer());
        Ok(offset)
    }
}

impl Engine for Compiler {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn compile(&self, module: &Arc<Module>) -> crate::Result<Arc<dyn CompiledCode>> {
        let mut ctx = self.contexts.lock().pop().unwrap_or_default();

        let mut text = Vec::new();
        let mut offsets = Vec::with_capacity(module.bodies.len());
        let res = module
            .bodies
            .keys()
            .try_for_each(|index| -> crate::Result<()> {
                offsets.push(self.compile_into(&mut ctx, module, index, &mut text)?);
                Ok(())
            });
        self.contexts.lock().push(ctx);
        res?;

        let code = CodeMemory::publish(&text)?;
        let funcs = offsets
            .into_iter()
            .map(|offset| {
                // Safety: every offset is the start of a function compiled with the
                // `wasm_signature`, and the mapping lives as long as `code`
                unsafe { mem::transmute::<*const u8, WasmFn>(code.resolve(offset)) }
            })
            .collect();

        tracing::debug!(
            funcs = module.bodies.len(),
            bytes = text.len(),
            "compiled module to native code"
        );

        Ok(Arc::new(NativeCode {
            module: module.clone(),
            funcs,
            code,
        }))
    }
}

pub(crate) struct NativeCode {
    module: Arc<Module>,
    /// Entry points into `code`, by defined function index.
    funcs: Box<[WasmFn]>,
    code: CodeMemory,
}

impl fmt::Debug for NativeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCode")
            .field("module", &self.module.name())
            .field("funcs", &self.funcs.len())
            .field("code", &self.code)
            .finish()
    }
}

impl CompiledCode for NativeCode {
    fn engine_name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn invoke(
        &self,
        cx: &mut Activation<'_>,
        func: DefinedFuncIndex,
        values: &mut [VMVal],
    ) -> crate::Result<()> {
        let entry = *self.funcs.get(func.index()).ok_or_else(|| {
            Error::Unsupported(alloc::format!("no compiled code for {func:?}"))
        })?;
        let ty = self.module.func_type(self.module.func_index(func));
        debug_assert!(values.len() >= ty.value_slots());

        let mut vmctx = VMContext::new(self.funcs.as_ptr(), &raw const BUILTINS);
        vmctx.sync(cx.state);
        vmctx.depth = cx.depth();
        vmctx.max_depth = cx.max_call_depth();
        vmctx.slots = cx.slots();
        vmctx.max_slots = cx.max_stack_slots();

        let mut host = HostState { cx, pending: None };
        vmctx.host = ptr::from_mut(&mut host).cast();

        let vmctx_ptr = &raw mut vmctx;
        let values = values.as_mut_ptr();
        let status = stack::with_stack(|limit| {
            // Safety: `entry` was compiled with the `wasm_signature` and `values` has a slot
            // for every parameter and result. `vmctx` points to the state of this activation
            // which outlives the call.
            unsafe {
                (*vmctx_ptr).stack_limit = limit;
                entry(vmctx_ptr, values)
            }
        })
        .unwrap_or_else(|| trap_status(Trap::StackOverflow));

        host.cx.set_depth(vmctx.depth);
        host.cx.set_slots(vmctx.slots);
        host.finish(status)
    }
}
