//! # Type System
//!
//! Types of the probe language as the compiler sees them: scalars and
//! pointers that fit in a register, and aggregates (arrays, structs,
//! unions) that live in the 512-byte stack frame. Maps are global
//! associative stores addressed by a fixed-size key.
//!
//! Types are immutable and shared as [`TypeRef`] (`Arc<Type>`), so the same
//! type value can be referenced from many nodes, symbols and registries
//! across compiler threads.
//!
//! ## Layout
//!
//! Struct members are laid out with natural alignment: every member starts
//! at a multiple of its own alignment and the total size is rounded up to
//! the alignment of the widest member. Packed structs skip both steps.
//! Union members all start at offset 0.

pub mod registry;

pub use registry::TypeRegistry;

use std::fmt;
use std::sync::Arc;

/// Shared, immutable type
pub type TypeRef = Arc<Type>;

/// Map backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    /// Hash table (default for inferred maps)
    Hash,
    /// Per-CPU hash table
    PerCpuHash,
    /// Array indexed by a u32 key
    Array,
}

impl MapKind {
    /// Kernel map type number
    pub fn bpf_map_type(self) -> u32 {
        match self {
            MapKind::Hash => 1,
            MapKind::Array => 2,
            MapKind::PerCpuHash => 5,
        }
    }
}

/// A named struct or union member
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    /// Member name
    pub name: String,
    /// Member type
    pub ty: TypeRef,
}

impl Field {
    /// Creates a member
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Struct or union definition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructType {
    /// Type name (anonymous structs are named `:anon_<n>`)
    pub name: String,
    /// Members in declaration order
    pub fields: Vec<Field>,
    /// All members overlap at offset 0
    pub union: bool,
    /// No alignment padding
    pub packed: bool,
}

/// Function signature, used for operator descriptors
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    /// Return type
    pub ret: TypeRef,
    /// Fixed parameters
    pub params: Vec<TypeRef>,
    /// Accepts arguments beyond `params`
    pub variadic: bool,
}

/// Probe language type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// No value
    Void,
    /// Integer scalar
    Scalar {
        /// Canonical name (`u32`, `char`, ...)
        name: &'static str,
        /// Width in bytes (1, 2, 4 or 8)
        size: usize,
        /// Signedness
        signed: bool,
    },
    /// Pointer into kernel or user memory
    Pointer(TypeRef),
    /// Fixed-length array
    Array {
        /// Element type
        of: TypeRef,
        /// Element count
        len: usize,
    },
    /// Struct or union
    Struct(StructType),
    /// Global associative store
    Map {
        /// Key type
        key: TypeRef,
        /// Value type
        value: TypeRef,
        /// Backend
        kind: MapKind,
    },
    /// Function
    Function(FuncType),
}

lazy_static::lazy_static! {
    static ref VOID: TypeRef = Arc::new(Type::Void);
    static ref SCALARS: Vec<TypeRef> = [
        ("char", 1, true),
        ("u8", 1, false),
        ("s8", 1, true),
        ("u16", 2, false),
        ("s16", 2, true),
        ("int", 4, true),
        ("u32", 4, false),
        ("s32", 4, true),
        ("u64", 8, false),
        ("s64", 8, true),
    ]
    .into_iter()
    .map(|(name, size, signed)| Arc::new(Type::Scalar { name, size, signed }))
    .collect();
}

/// Size of a pointer on the target machine
pub const POINTER_SIZE: usize = 8;

impl Type {
    /// The void type
    pub fn void() -> TypeRef {
        VOID.clone()
    }

    /// Built-in scalar by name
    pub fn scalar(name: &str) -> Option<TypeRef> {
        SCALARS
            .iter()
            .find(|t| matches!(t.as_ref(), Type::Scalar { name: n, .. } if *n == name))
            .cloned()
    }

    /// All built-in scalars
    pub fn builtin_scalars() -> impl Iterator<Item = TypeRef> {
        SCALARS.iter().cloned()
    }

    /// `char`
    pub fn char() -> TypeRef {
        SCALARS[0].clone()
    }

    /// `int`, the result type of comparisons
    pub fn int() -> TypeRef {
        SCALARS[5].clone()
    }

    /// `u64`
    pub fn u64() -> TypeRef {
        SCALARS[8].clone()
    }

    /// `s64`, the default type of numeric literals
    pub fn s64() -> TypeRef {
        SCALARS[9].clone()
    }

    /// Pointer to `ty`
    pub fn pointer_to(ty: TypeRef) -> TypeRef {
        Arc::new(Type::Pointer(ty))
    }

    /// `len` elements of `of`
    pub fn array_of(of: TypeRef, len: usize) -> TypeRef {
        Arc::new(Type::Array { of, len })
    }

    /// Map from `key` to `value`
    pub fn map_of(key: TypeRef, value: TypeRef, kind: MapKind) -> TypeRef {
        Arc::new(Type::Map { key, value, kind })
    }

    /// Named struct (or union) from members
    pub fn struct_of(name: impl Into<String>, fields: Vec<Field>) -> TypeRef {
        Arc::new(Type::Struct(StructType {
            name: name.into(),
            fields,
            union: false,
            packed: false,
        }))
    }

    /// Named union from members
    pub fn union_of(name: impl Into<String>, fields: Vec<Field>) -> TypeRef {
        Arc::new(Type::Struct(StructType {
            name: name.into(),
            fields,
            union: true,
            packed: false,
        }))
    }

    /// Function signature
    pub fn func(ret: TypeRef, params: Vec<TypeRef>, variadic: bool) -> TypeRef {
        Arc::new(Type::Function(FuncType {
            ret,
            params,
            variadic,
        }))
    }

    /// Size in bytes. Maps and functions have no storage of their own.
    pub fn size(&self) -> usize {
        match self {
            Type::Void | Type::Map { .. } | Type::Function(_) => 0,
            Type::Scalar { size, .. } => *size,
            Type::Pointer(_) => POINTER_SIZE,
            Type::Array { of, len } => of.size() * len,
            Type::Struct(sou) => sou.size(),
        }
    }

    /// Alignment in bytes
    pub fn align(&self) -> usize {
        match self {
            Type::Scalar { size, .. } => *size,
            Type::Pointer(_) => POINTER_SIZE,
            Type::Array { of, .. } => of.align(),
            Type::Struct(sou) => sou.align(),
            _ => 1,
        }
    }

    /// Integer scalar
    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Scalar { .. })
    }

    /// Signed integer scalar
    pub fn is_signed(&self) -> bool {
        matches!(self, Type::Scalar { signed: true, .. })
    }

    /// Pointer
    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_))
    }

    /// Map
    pub fn is_map(&self) -> bool {
        matches!(self, Type::Map { .. })
    }

    /// Value fits in a register (scalar or pointer)
    pub fn is_word(&self) -> bool {
        self.is_scalar() || self.is_pointer()
    }

    /// Array of one-byte scalars
    pub fn is_string(&self) -> bool {
        match self {
            Type::Array { of, .. } => matches!(of.as_ref(), Type::Scalar { size: 1, .. }),
            _ => false,
        }
    }

    /// Struct or union definition
    pub fn as_struct(&self) -> Option<&StructType> {
        match self {
            Type::Struct(sou) => Some(sou),
            _ => None,
        }
    }

    /// Byte offset of a struct/union member
    pub fn offset_of(&self, member: &str) -> Option<usize> {
        self.as_struct()?.offset_of(member)
    }

    /// Whether a value of type `other` may be stored where `self` is expected
    pub fn compatible(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Void, Type::Void) => true,
            (Type::Scalar { .. }, Type::Scalar { .. }) => true,
            (Type::Pointer(a), Type::Pointer(b)) => a.compatible(b),
            (Type::Array { of: a, len: la }, Type::Array { of: b, len: lb }) => {
                la == lb && a.compatible(b)
            }
            (Type::Struct(a), Type::Struct(b)) => a.name == b.name && a.union == b.union,
            (
                Type::Map {
                    key: ka, value: va, ..
                },
                Type::Map {
                    key: kb, value: vb, ..
                },
            ) => ka.compatible(kb) && va.compatible(vb),
            (Type::Function(a), Type::Function(b)) => {
                a.variadic == b.variadic
                    && a.ret.compatible(&b.ret)
                    && a.params.len() == b.params.len()
                    && a.params.iter().zip(&b.params).all(|(x, y)| x.compatible(y))
            }
            _ => false,
        }
    }
}

impl StructType {
    /// Member by name
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Byte offset of every member, in declaration order
    pub fn offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.fields.len());
        let mut end = 0;
        for f in &self.fields {
            if self.union {
                offsets.push(0);
                continue;
            }
            let offset = if self.packed {
                end
            } else {
                align_up(end, f.ty.align())
            };
            offsets.push(offset);
            end = offset + f.ty.size();
        }
        offsets
    }

    /// Byte offset of a member
    pub fn offset_of(&self, name: &str) -> Option<usize> {
        let idx = self.fields.iter().position(|f| f.name == name)?;
        self.offsets().get(idx).copied()
    }

    /// Alignment of the whole struct
    pub fn align(&self) -> usize {
        if self.packed {
            return 1;
        }
        self.fields.iter().map(|f| f.ty.align()).max().unwrap_or(1)
    }

    /// Total size including trailing padding
    pub fn size(&self) -> usize {
        let raw = if self.union {
            self.fields.iter().map(|f| f.ty.size()).max().unwrap_or(0)
        } else {
            self.offsets()
                .iter()
                .zip(&self.fields)
                .map(|(off, f)| off + f.ty.size())
                .max()
                .unwrap_or(0)
        };
        align_up(raw, self.align())
    }
}

/// Round `n` up to a multiple of `align`
pub fn align_up(n: usize, align: usize) -> usize {
    if align <= 1 {
        return n;
    }
    n.div_ceil(align) * align
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Scalar { name, .. } => write!(f, "{}", name),
            Type::Pointer(t) => write!(f, "{} *", t),
            Type::Array { of, len } => write!(f, "{}[{}]", of, len),
            Type::Struct(sou) if sou.union => write!(f, "union {}", sou.name),
            Type::Struct(sou) => write!(f, "struct {}", sou.name),
            Type::Map { key, value, .. } => write!(f, "map[{}]{}", key, value),
            Type::Function(func) => {
                write!(f, "{} (", func.ret)?;
                for (i, p) in func.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                if func.variadic {
                    if !func.params.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
        }
    }
}
