//! # Built-in Operators
//!
//! Every operator of the probe language is described by an
//! [`OperatorDescriptor`] in a process-wide registry, built once on first
//! use. A descriptor binds the operator name to its signature and to an
//! [`Operator`], whose behavior is provided through the [`Builtin`] hooks:
//!
//! | Hook | Pass | Purpose |
//! |------|------|---------|
//! | `rewrite` | rewrite | replace sugar with its expansion (`a->b`) |
//! | `static_validate` | validation | structural checks that need no types |
//! | `type_infer` | inference | assign a type to the node or to an argument |
//! | `ir_pre` | emission | negotiate storage before the arguments emit |
//! | `ir_post` | emission | emit the operator once the arguments are final |
//!
//! ## Operators
//!
//! | Name | Module | Arity |
//! |------|--------|-------|
//! | `.` `->` `u*` `:struct` | [`structs`] | 2, 2, 1, variadic |
//! | `[]` `=` `delete` | [`maps`] | 2, 2, 1 |
//! | `strcmp` `mem` `str` | [`strings`] | 2, 1-2, 1-2 |

pub mod maps;
pub mod strings;
pub mod structs;

use super::ir::Ir;
use super::node::{AllocRequest, Node};
use super::symtab::SymbolTable;
use super::CompileOptions;
use crate::error::{Error, Result};
use crate::types::{FuncType, Type, TypeRef, TypeRegistry};
use std::collections::HashMap;

/// Inference state shared by the hooks of one probe
pub struct InferCtx<'a> {
    /// Symbols of the probe
    pub symbols: &'a mut SymbolTable,
    /// Type registry of the compilation unit
    pub types: &'a TypeRegistry,
    /// Compiler options
    pub options: &'a CompileOptions,
}

impl InferCtx<'_> {
    /// Set the type of `node` unless it already has one. Identifiers also
    /// record the type in the symbol table.
    pub fn set_type(&mut self, node: &mut Node, ty: TypeRef) {
        if node.ty.is_some() {
            return;
        }
        if let Some(name) = node.ident_name() {
            self.symbols.set_type(name, ty.clone());
        }
        tracing::trace!(node = %node, ty = %ty, "inferred");
        node.ty = Some(ty);
    }
}

/// Emission state of one probe
pub struct EmitCtx<'a> {
    /// Stream being emitted
    pub ir: Ir,
    /// Symbols of the probe
    pub symbols: &'a SymbolTable,
    /// Compiler options
    pub options: &'a CompileOptions,
}

/// Storage requests returned by `ir_pre`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreAlloc {
    /// Request for the node itself, handed back to `ir_post`
    pub own: AllocRequest,
    /// One request per argument
    pub args: Vec<AllocRequest>,
}

impl PreAlloc {
    /// Keep the node's request, no preference for the arguments
    pub fn passthrough(node: &Node, req: AllocRequest) -> Self {
        Self {
            own: req,
            args: vec![AllocRequest::default(); node.args().len()],
        }
    }
}

/// Operator hooks. Every hook defaults to doing nothing.
pub trait Builtin: Sync {
    /// Assign a type to `node` or to one of its arguments, or defer by
    /// returning without assigning anything
    fn type_infer(&self, _node: &mut Node, _cx: &mut InferCtx<'_>) -> Result<()> {
        Ok(())
    }

    /// Replacement subtree for `node`
    fn rewrite(&self, _node: &Node) -> Option<Node> {
        None
    }

    /// Checks that need no type information
    fn static_validate(&self, _node: &Node) -> Result<()> {
        Ok(())
    }

    /// Storage negotiation, before the arguments emit
    fn ir_pre(&self, node: &mut Node, req: AllocRequest, _cx: &mut EmitCtx<'_>) -> Result<PreAlloc> {
        Ok(PreAlloc::passthrough(node, req))
    }

    /// Emission, after the arguments emitted
    fn ir_post(&self, _node: &mut Node, _req: AllocRequest, _cx: &mut EmitCtx<'_>) -> Result<()> {
        Ok(())
    }
}

/// Built-in operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `a.b`
    Dot,
    /// `a->b`
    Arrow,
    /// `*p`
    Deref,
    /// `:struct(a, b, ...)`
    Struct,
    /// `a[k]`
    Subscript,
    /// `a = b`
    Assign,
    /// `delete m[k]`
    Delete,
    /// `strcmp(a, b)`
    Strcmp,
    /// `mem(ptr[, len])`
    Mem,
    /// `str(ptr[, len])`
    Str,
}

impl Operator {
    /// Hook implementation of the operator
    pub fn builtin(self) -> &'static dyn Builtin {
        match self {
            Operator::Dot => &structs::Dot,
            Operator::Arrow => &structs::Arrow,
            Operator::Deref => &structs::Deref,
            Operator::Struct => &structs::StructLiteral,
            Operator::Subscript => &maps::Subscript,
            Operator::Assign => &maps::Assign,
            Operator::Delete => &maps::Delete,
            Operator::Strcmp => &strings::Strcmp,
            Operator::Mem => &strings::Mem,
            Operator::Str => &strings::Str,
        }
    }
}

/// Registered operator
#[derive(Debug, Clone)]
pub struct OperatorDescriptor {
    /// Name as it appears in the tree
    pub name: &'static str,
    /// Signature (always a function type)
    pub signature: TypeRef,
    /// The node type is the signature's return type, set before inference
    pub static_ret: bool,
    /// Implementation
    pub op: Operator,
}

impl OperatorDescriptor {
    /// Creates a descriptor
    pub fn new(name: &'static str, signature: TypeRef, op: Operator) -> Self {
        Self {
            name,
            signature,
            static_ret: false,
            op,
        }
    }

    /// Mark the return type as static
    pub fn static_ret(mut self) -> Self {
        self.static_ret = true;
        self
    }

    fn func(&self) -> Option<&FuncType> {
        match self.signature.as_ref() {
            Type::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Whether extra arguments beyond the fixed parameters are accepted
    pub fn variadic(&self) -> bool {
        self.func().is_some_and(|f| f.variadic)
    }

    /// Return type of the signature
    pub fn ret(&self) -> TypeRef {
        self.func().map(|f| f.ret.clone()).unwrap_or_else(Type::void)
    }

    /// Check the argument count of an application of this operator
    pub fn check_arity(&self, node: &Node) -> Result<()> {
        let params = self.func().map_or(0, |f| f.params.len());
        let got = node.args().len();
        let ok = if self.variadic() {
            got >= params
        } else {
            got == params
        };
        if ok {
            return Ok(());
        }
        Err(Error::Arity {
            op: self.name.to_string(),
            expected: if self.variadic() {
                format!("at least {}", params)
            } else {
                params.to_string()
            },
            got,
            loc: node.loc,
        })
    }
}

/// Name-keyed operator table
#[derive(Debug)]
pub struct OperatorRegistry {
    ops: HashMap<&'static str, OperatorDescriptor>,
}

impl OperatorRegistry {
    /// Build a registry, rejecting duplicate names
    pub fn new(descs: Vec<OperatorDescriptor>) -> Result<Self> {
        let mut ops = HashMap::with_capacity(descs.len());
        for d in descs {
            if !matches!(d.signature.as_ref(), Type::Function(_)) {
                return Err(Error::internal(format!(
                    "operator `{}` has a non-function signature",
                    d.name
                )));
            }
            let name = d.name;
            if ops.insert(name, d).is_some() {
                return Err(Error::internal(format!("operator `{}` registered twice", name)));
            }
        }
        Ok(Self { ops })
    }

    /// Descriptor by exact name
    pub fn get(&self, name: &str) -> Option<&OperatorDescriptor> {
        self.ops.get(name)
    }

    /// Descriptor for an operator node
    pub fn lookup(&self, node: &Node) -> Result<&OperatorDescriptor> {
        let name = node
            .func()
            .ok_or_else(|| Error::internal(format!("`{}` is not an operator application", node)))?;
        self.get(name).ok_or_else(|| Error::UnknownOperator {
            name: name.to_string(),
            loc: node.loc,
        })
    }

    /// Number of operators
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn binop() -> TypeRef {
    Type::func(Type::void(), vec![Type::void(), Type::void()], false)
}

fn unary() -> TypeRef {
    Type::func(Type::void(), vec![Type::void()], false)
}

fn vargs() -> TypeRef {
    Type::func(Type::void(), vec![], true)
}

/// Descriptors of all built-in operators
pub fn builtin_descriptors() -> Vec<OperatorDescriptor> {
    vec![
        OperatorDescriptor::new(".", binop(), Operator::Dot),
        OperatorDescriptor::new("->", binop(), Operator::Arrow),
        OperatorDescriptor::new("u*", unary(), Operator::Deref),
        OperatorDescriptor::new(":struct", vargs(), Operator::Struct),
        OperatorDescriptor::new("[]", binop(), Operator::Subscript),
        OperatorDescriptor::new("=", binop(), Operator::Assign),
        OperatorDescriptor::new("delete", unary(), Operator::Delete).static_ret(),
        OperatorDescriptor::new("strcmp", vargs(), Operator::Strcmp),
        OperatorDescriptor::new(
            "mem",
            Type::func(Type::void(), vec![Type::void()], true),
            Operator::Mem,
        ),
        OperatorDescriptor::new(
            "str",
            Type::func(Type::void(), vec![Type::void()], true),
            Operator::Str,
        ),
    ]
}

lazy_static::lazy_static! {
    static ref BUILTINS: Result<OperatorRegistry> = OperatorRegistry::new(builtin_descriptors());
}

/// The process-wide operator registry
pub fn registry() -> Result<&'static OperatorRegistry> {
    BUILTINS.as_ref().map_err(Clone::clone)
}

/// Arity check for variadic operators with a bounded argument count
pub(crate) fn expect_args(node: &Node, min: usize, max: usize) -> Result<()> {
    let got = node.args().len();
    if (min..=max).contains(&got) {
        return Ok(());
    }
    Err(Error::Arity {
        op: node.func().unwrap_or("?").to_string(),
        expected: if min == max {
            min.to_string()
        } else {
            format!("{} or {}", min, max)
        },
        got,
        loc: node.loc,
    })
}

/// Type of a node that inference must have set
pub(crate) fn typed(node: &Node) -> Result<TypeRef> {
    node.ty
        .clone()
        .ok_or_else(|| Error::internal(format!("`{}` has no type at emission", node)))
}
