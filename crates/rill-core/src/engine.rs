//! Registry-owning compile facade.
//!
//! An [`Engine`] bundles everything compilation consumes — the
//! operator table, named constants, the selector key registry and the
//! compile options — and keeps it instance-local, so different
//! embedders can carry different registries safely. Compiled
//! [`Program`]s do not borrow the engine.

use crate::compiler;
use crate::program::{CompileError, CompileOptions, Program};
use crate::reader;
use crate::runtime::{OpEntry, Operators, SelectorKey};
use crate::value::Value;
use std::collections::HashMap;

pub struct Engine {
    operators: Operators,
    constants: HashMap<String, Value>,
    selectors: HashMap<String, SelectorKey>,
    options: CompileOptions,
}

impl Engine {
    /// Engine with builtin operators, no registered selectors or
    /// constants, and every option off.
    pub fn new() -> Self {
        Self {
            operators: Operators::new(),
            constants: HashMap::new(),
            selectors: HashMap::new(),
            options: CompileOptions::default(),
        }
    }

    /// Register or replace an operator. Returns the previous entry if
    /// present.
    pub fn register_operator(&mut self, name: impl Into<String>, entry: OpEntry) -> Option<OpEntry> {
        self.operators.register(name, entry)
    }

    /// Register a named constant resolved at parse time.
    pub fn register_constant(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.constants.insert(name.into(), value)
    }

    /// Register a selector name, assigning the next dense key.
    /// Registering the same name again returns its existing key.
    pub fn register_selector(&mut self, name: impl Into<String>) -> SelectorKey {
        let name = name.into();
        if let Some(key) = self.selectors.get(&name) {
            return *key;
        }
        let key = SelectorKey(self.selectors.len() as i16);
        self.selectors.insert(name, key);
        key
    }

    pub fn selector_key(&self, name: &str) -> Option<SelectorKey> {
        self.selectors.get(name).copied()
    }

    /// Number of registered selectors (keys are dense from zero).
    pub fn selector_count(&self) -> usize {
        self.selectors.len()
    }

    pub fn constant(&self, name: &str) -> Option<Value> {
        self.constants.get(name).cloned()
    }

    /// Access the operator registry (read-only).
    pub fn operators(&self) -> &Operators {
        &self.operators
    }

    pub fn options(&self) -> CompileOptions {
        self.options
    }

    pub fn options_mut(&mut self) -> &mut CompileOptions {
        &mut self.options
    }

    /// Compile a source expression into an immutable [`Program`].
    /// A `;;;;` directive header overrides the engine options for
    /// this source only.
    pub fn compile(&self, source: &str) -> Result<Program, CompileError> {
        let (ast, options) = reader::parse(self, source)?;
        compiler::lower(ast, options)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
