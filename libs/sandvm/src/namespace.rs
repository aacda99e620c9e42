// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use crate::config::ModuleConfig;
use crate::errors::{Error, InstantiationError};
use crate::func::{HostFunc, IntoFunc};
use crate::indices::{EntityIndex, FuncIndex};
use crate::instance::{ImportBinding, Instance};
use crate::module::{CompiledModule, Module};
use crate::types::{EntityType, GlobalType};
use crate::values::{VMVal, Val};

/// The set of definitions imports are resolved against, and the instances created from them.
///
/// Cheap to clone, all clones share the same definitions.
#[derive(Clone, Default)]
pub struct Namespace(Arc<NamespaceInner>);

#[derive(Default)]
struct NamespaceInner {
    definitions: spin::Mutex<Definitions>,
    /// Named instances, `None` while the name is reserved by an instantiation in progress.
    named: spin::Mutex<HashMap<String, Option<Instance>>>,
    instances: spin::Mutex<Vec<Instance>>,
}

#[derive(Default)]
struct Definitions {
    string2idx: HashMap<Arc<str>, usize>,
    strings: Vec<Arc<str>>,
    map: HashMap<ImportKey, Definition>,
}

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
struct ImportKey {
    name: usize,
    module: usize,
}

#[derive(Debug, Clone)]
enum Definition {
    HostFunc(Arc<HostFunc>),
    Func(Instance, FuncIndex),
    Global(Val, GlobalType),
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("definitions", &self.0.definitions.lock().map.len())
            .field("instances", &self.0.instances.lock().len())
            .finish()
    }
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a host function from a Rust closure under `module::name`.
    pub fn func_wrap<Params, Results>(
        &self,
        module: &str,
        name: &str,
        func: impl IntoFunc<Params, Results>,
    ) -> crate::Result<&Self> {
        self.define_func(module, name, HostFunc::wrap(func))
    }

    /// Defines a host function under `module::name`.
    pub fn define_func(
        &self,
        module: &str,
        name: &str,
        func: impl Into<HostFunc>,
    ) -> crate::Result<&Self> {
        let mut defs = self.0.definitions.lock();
        let key = defs.import_key(module, name);
        defs.insert(key, Definition::HostFunc(Arc::new(func.into())))?;
        Ok(self)
    }

    /// Defines an immutable global under `module::name`.
    pub fn define_global(&self, module: &str, name: &str, val: Val) -> crate::Result<&Self> {
        let ty = GlobalType {
            content_type: val.ty(),
            mutable: false,
        };
        let mut defs = self.0.definitions.lock();
        let key = defs.import_key(module, name);
        defs.insert(key, Definition::Global(val, ty))?;
        Ok(self)
    }

    /// Defines every function and global export of `instance` under the module name
    /// `module_name`. Globals are defined with their current value. Nothing is defined if any
    /// of the names is taken.
    pub fn define_instance(&self, module_name: &str, instance: &Instance) -> crate::Result<&Self> {
        let module = instance.module();
        let mut exports = Vec::with_capacity(module.exports().len());
        for export in module.exports() {
            match export.index {
                EntityIndex::Function(index) => {
                    exports.push((export.name.as_str(), Definition::Func(instance.clone(), index)));
                }
                EntityIndex::Global(index) => {
                    if let Some(val) = instance.get_global(&export.name) {
                        exports.push((
                            export.name.as_str(),
                            Definition::Global(val, module.globals[index]),
                        ));
                    }
                }
                EntityIndex::Memory | EntityIndex::Table => {}
            }
        }

        let mut defs = self.0.definitions.lock();
        if let Some((name, _)) = exports
            .iter()
            .find(|(name, _)| defs.get(module_name, name).is_some())
        {
            return Err(already_defined(module_name, name));
        }
        for (name, def) in exports {
            let key = defs.import_key(module_name, name);
            defs.insert(key, def)?;
        }
        Ok(self)
    }

    /// Instantiates `module`, resolving its imports against this namespace.
    ///
    /// Instantiation is atomic: if an import is missing or mismatched, a segment does not fit or
    /// the start function fails, no instance is created or registered. An instance named through
    /// [`ModuleConfig::with_name`] has its exports defined under that name.
    pub fn instantiate(
        &self,
        module: &CompiledModule,
        config: ModuleConfig,
    ) -> crate::Result<Instance> {
        let reservation = match &config.name {
            Some(name) => Some(self.reserve(name)?),
            None => None,
        };

        let (imports, globals) = self.resolve_imports(module.module())?;
        let instance = Instance::new(module, imports, globals, config)?;

        if let Some(reservation) = reservation {
            if let Err(e) = reservation.register(&instance) {
                if let Err(close_err) = instance.close() {
                    tracing::warn!(%close_err, "failed to close unregistered instance");
                }
                return Err(e);
            }
        }

        self.0.instances.lock().push(instance.clone());
        Ok(instance)
    }

    /// The instance registered under `name`, if any.
    pub fn get_instance(&self, name: &str) -> Option<Instance> {
        self.0.named.lock().get(name).cloned().flatten()
    }

    /// Closes every instance created in this namespace.
    ///
    /// Every instance is closed even if some fail, the failures are collected into
    /// [`Error::CloseFailed`].
    pub fn close(&self) -> crate::Result<()> {
        let instances = core::mem::take(&mut *self.0.instances.lock());
        self.0.named.lock().clear();

        let mut errors = Vec::new();
        for instance in instances {
            match instance.close() {
                Ok(()) => {}
                Err(Error::CloseFailed(errs)) => errors.extend(errs),
                Err(e) => errors.push(e),
            }
        }

        tracing::debug!(errors = errors.len(), "closed namespace");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::CloseFailed(errors))
        }
    }

    /// Claims `name` for an instance about to be created. The claim is released when the
    /// returned reservation is dropped without registering an instance.
    fn reserve(&self, name: &str) -> crate::Result<NameReservation<'_>> {
        match self.0.named.lock().entry(name.to_string()) {
            Entry::Occupied(entry) => Err(already_defined(entry.key(), "")),
            Entry::Vacant(entry) => {
                entry.insert(None);
                Ok(NameReservation {
                    namespace: self,
                    name: name.to_string(),
                    registered: false,
                })
            }
        }
    }

    fn resolve_imports(
        &self,
        module: &Module,
    ) -> crate::Result<(Box<[ImportBinding]>, Vec<VMVal>)> {
        let defs = self.0.definitions.lock();
        let mut funcs = Vec::with_capacity(module.num_imported_funcs as usize);
        let mut globals = Vec::with_capacity(module.num_imported_globals as usize);

        for import in module.imports() {
            let unsupported = || InstantiationError::UnsupportedImport {
                module: import.module.clone(),
                field: import.field.clone(),
                kind: import.ty.kind(),
            };
            match &import.ty {
                EntityType::Memory(_) | EntityType::Table(_) => return Err(unsupported().into()),
                EntityType::Global(ty) if ty.mutable => return Err(unsupported().into()),
                _ => {}
            }

            let def = defs.get(&import.module, &import.field).ok_or_else(|| {
                InstantiationError::MissingImport {
                    module: import.module.clone(),
                    field: import.field.clone(),
                    kind: import.ty.kind(),
                }
            })?;

            let incompatible = |actual: String| InstantiationError::IncompatibleImport {
                module: import.module.clone(),
                field: import.field.clone(),
                expected: describe(&import.ty),
                actual,
            };

            match (&import.ty, def) {
                (EntityType::Function(expected), Definition::HostFunc(func)) => {
                    if func.ty() != expected {
                        return Err(incompatible(func.ty().to_string()).into());
                    }
                    funcs.push(ImportBinding::Host(func.clone()));
                }
                (EntityType::Function(expected), Definition::Func(instance, index)) => {
                    let actual = instance.module().func_type(*index);
                    if actual != expected {
                        return Err(incompatible(actual.to_string()).into());
                    }
                    funcs.push(ImportBinding::Export {
                        instance: instance.clone(),
                        func: *index,
                    });
                }
                (EntityType::Global(expected), Definition::Global(val, actual)) => {
                    if actual != expected {
                        return Err(incompatible(describe(&EntityType::Global(*actual))).into());
                    }
                    globals.push(val.to_vmval());
                }
                (_, def) => return Err(incompatible(def.describe()).into()),
            }
        }

        Ok((funcs.into_boxed_slice(), globals))
    }
}

struct NameReservation<'a> {
    namespace: &'a Namespace,
    name: String,
    registered: bool,
}

impl NameReservation<'_> {
    /// Defines the exports of `instance` under the reserved name and makes it visible through
    /// [`Namespace::get_instance`].
    fn register(mut self, instance: &Instance) -> crate::Result<()> {
        self.namespace.define_instance(&self.name, instance)?;
        self.namespace
            .0
            .named
            .lock()
            .insert(self.name.clone(), Some(instance.clone()));
        self.registered = true;
        Ok(())
    }
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        if self.registered {
            return;
        }
        let mut named = self.namespace.0.named.lock();
        if let Some(None) = named.get(&self.name) {
            named.remove(&self.name);
        }
    }
}

fn already_defined(module: &str, field: &str) -> Error {
    InstantiationError::AlreadyDefined {
        module: module.to_string(),
        field: field.to_string(),
    }
    .into()
}

fn describe(ty: &EntityType) -> String {
    match ty {
        EntityType::Function(ty) => ty.to_string(),
        EntityType::Global(ty) if ty.mutable => alloc::format!("(global (mut {}))", ty.content_type),
        EntityType::Global(ty) => alloc::format!("(global {})", ty.content_type),
        other => String::from(other.kind()),
    }
}

impl Definition {
    fn describe(&self) -> String {
        match self {
            Definition::HostFunc(func) => func.ty().to_string(),
            Definition::Func(instance, index) => instance.module().func_type(*index).to_string(),
            Definition::Global(_, ty) => describe(&EntityType::Global(*ty)),
        }
    }
}

impl Definitions {
    fn get(&self, module: &str, name: &str) -> Option<&Definition> {
        let key = ImportKey {
            module: *self.string2idx.get(module)?,
            name: *self.string2idx.get(name)?,
        };
        self.map.get(&key)
    }

    fn insert(&mut self, key: ImportKey, item: Definition) -> crate::Result<()> {
        match self.map.entry(key) {
            Entry::Occupied(_) => {
                return Err(already_defined(
                    &self.strings[key.module],
                    &self.strings[key.name],
                ));
            }
            Entry::Vacant(v) => {
                v.insert(item);
            }
        }

        Ok(())
    }

    fn import_key(&mut self, module: &str, name: &str) -> ImportKey {
        ImportKey {
            module: self.intern_str(module),
            name: self.intern_str(name),
        }
    }

    fn intern_str(&mut self, string: &str) -> usize {
        if let Some(idx) = self.string2idx.get(string) {
            return *idx;
        }
        let string: Arc<str> = string.into();
        let idx = self.strings.len();
        self.strings.push(string.clone());
        self.string2idx.insert(string, idx);
        idx
    }
}
