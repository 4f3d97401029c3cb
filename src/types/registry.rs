//! Concurrent type registry
//!
//! Holds every named type of a compilation unit: the built-in scalars,
//! struct definitions supplied by the host, and anonymous structs
//! synthesized by struct construction. Registration is insert-or-get, so
//! probes compiled in parallel agree on one `TypeRef` per name and per
//! anonymous shape.

use super::{Field, StructType, Type, TypeRef};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Registry of named types, shared by all probes of a compilation unit
#[derive(Debug)]
pub struct TypeRegistry {
    /// Name -> type
    types: DashMap<String, TypeRef>,
    /// Member types -> synthesized anonymous struct
    anon: DashMap<Vec<TypeRef>, TypeRef>,
    /// Counter for anonymous struct names
    next_anon: AtomicU64,
}

impl TypeRegistry {
    /// Creates a registry holding the built-in scalars
    pub fn new() -> Self {
        let reg = Self {
            types: DashMap::new(),
            anon: DashMap::new(),
            next_anon: AtomicU64::new(0),
        };
        for t in Type::builtin_scalars() {
            reg.add(t);
        }
        reg
    }

    /// Register `ty` under its name; returns the already registered type when
    /// the name is taken
    pub fn add(&self, ty: TypeRef) -> TypeRef {
        let name = match ty.as_ref() {
            Type::Struct(sou) => sou.name.clone(),
            other => other.to_string(),
        };
        self.types.entry(name).or_insert(ty).clone()
    }

    /// Look up a type by name
    pub fn lookup(&self, name: &str) -> Option<TypeRef> {
        self.types.get(name).map(|t| t.clone())
    }

    /// Anonymous struct with members `f0..fN` of the given types. The same
    /// member types always yield the same struct.
    pub fn anon_struct(&self, members: Vec<TypeRef>) -> TypeRef {
        if let Some(t) = self.anon.get(&members) {
            return t.clone();
        }

        let ty = self
            .anon
            .entry(members.clone())
            .or_insert_with(|| {
                let id = self.next_anon.fetch_add(1, Ordering::Relaxed);
                let fields = members
                    .iter()
                    .enumerate()
                    .map(|(i, t)| Field::new(format!("f{}", i), t.clone()))
                    .collect();
                Arc::new(Type::Struct(StructType {
                    name: format!(":anon_{}", id),
                    fields,
                    union: false,
                    packed: false,
                }))
            })
            .clone();

        tracing::trace!(ty = %ty, "registered anonymous struct");
        self.add(ty)
    }

    /// Number of registered names
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
