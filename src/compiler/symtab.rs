//! Probe symbol table
//!
//! Identifiers in a probe name either a global map or a context variable
//! supplied by the probe's provider (a field of the tracepoint record, a
//! saved register). Identifiers that were never declared are maps; their
//! type is inferred from how they are subscripted.

use crate::error::{Error, Loc, Result};
use crate::types::TypeRef;
use std::collections::HashMap;

/// What an identifier refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Global map, numbered in order of first use
    Map {
        /// Map id, used in map references
        id: usize,
    },
    /// Value at a fixed offset of the probe context
    Context {
        /// Byte offset into the context
        offset: i16,
    },
}

/// A named entity of a probe
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Identifier
    pub name: String,
    /// Type, once declared or inferred
    pub ty: Option<TypeRef>,
    /// Kind
    pub kind: SymbolKind,
}

/// Symbols of one probe
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    index: HashMap<String, usize>,
    maps: usize,
}

impl SymbolTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, name: &str, ty: Option<TypeRef>, kind: SymbolKind) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(Error::static_error(
                Loc::default(),
                format!("`{}` is already declared", name),
            ));
        }
        self.index.insert(name.to_string(), self.symbols.len());
        self.symbols.push(Symbol {
            name: name.to_string(),
            ty,
            kind,
        });
        Ok(())
    }

    /// Declare a context variable of type `ty` at `offset` into the context
    pub fn declare_context(&mut self, name: &str, ty: TypeRef, offset: i16) -> Result<()> {
        self.insert(name, Some(ty), SymbolKind::Context { offset })
    }

    /// Declare a map with a known type
    pub fn declare_map(&mut self, name: &str, ty: TypeRef) -> Result<()> {
        if !ty.is_map() {
            return Err(Error::type_error(
                Loc::default(),
                format!("`{}` declared as a map, but its type is '{}'", name, ty),
            ));
        }
        let id = self.maps;
        self.maps += 1;
        self.insert(name, Some(ty), SymbolKind::Map { id })
    }

    /// Look up a symbol
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.index.get(name).map(|&i| &self.symbols[i])
    }

    /// Look up a symbol, creating an untyped map for an unknown name
    pub fn resolve(&mut self, name: &str) -> &Symbol {
        if !self.index.contains_key(name) {
            let id = self.maps;
            self.maps += 1;
            self.index.insert(name.to_string(), self.symbols.len());
            self.symbols.push(Symbol {
                name: name.to_string(),
                ty: None,
                kind: SymbolKind::Map { id },
            });
        }
        &self.symbols[self.index[name]]
    }

    /// Record an inferred type. A type that is already set is kept.
    pub fn set_type(&mut self, name: &str, ty: TypeRef) {
        if let Some(&i) = self.index.get(name) {
            let sym = &mut self.symbols[i];
            if sym.ty.is_none() {
                sym.ty = Some(ty);
            }
        }
    }

    /// Map symbols ordered by id
    pub fn maps(&self) -> Vec<&Symbol> {
        let mut maps: Vec<&Symbol> = self
            .symbols
            .iter()
            .filter(|s| matches!(s.kind, SymbolKind::Map { .. }))
            .collect();
        maps.sort_by_key(|s| match s.kind {
            SymbolKind::Map { id } => id,
            SymbolKind::Context { .. } => usize::MAX,
        });
        maps
    }
}
