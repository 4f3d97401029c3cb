//! Expression tree nodes
//!
//! A probe statement is a tree of [`Node`]s. Operator applications own their
//! argument nodes; identifiers, string literals and numeric literals are
//! leaves. Every node carries its resolved type (set at most once by
//! inference) and its storage state (set at most once by emission).

use super::ir::Reg;
use crate::error::Loc;
use crate::types::TypeRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Operator application: `func(args...)`
    Expr {
        /// Operator name (`.`, `[]`, `strcmp`, ...)
        func: String,
        /// Arguments in order
        args: Vec<Node>,
    },
    /// Reference to a map or context variable
    Ident(String),
    /// String literal (without the trailing NUL)
    Str(String),
    /// Numeric literal
    Num {
        /// Raw 64-bit value
        value: u64,
        /// Literal did not fit in a signed 64-bit integer
        unsigned: bool,
    },
}

/// Where a node's value lives once emitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Storage {
    /// Not allocated (yet), or the node has no value
    #[default]
    None,
    /// In a register
    Reg(Reg),
    /// In the stack frame, at this (negative) offset from the frame pointer
    Stack(i16),
}

/// Instruction-representation state of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Irs {
    /// Storage class and position
    pub loc: Storage,
    /// Size of the value in bytes
    pub size: usize,
}

impl Irs {
    /// Storage has been assigned
    pub fn is_allocated(&self) -> bool {
        self.loc != Storage::None
    }

    /// Frame offset when on the stack
    pub fn stack(&self) -> Option<i16> {
        match self.loc {
            Storage::Stack(off) => Some(off),
            _ => None,
        }
    }

    /// Register when in a register
    pub fn reg(&self) -> Option<Reg> {
        match self.loc {
            Storage::Reg(r) => Some(r),
            _ => None,
        }
    }
}

/// How a parent wants a child to materialize its value. Computed top down
/// before the child emits anything and consumed by the child's own emission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocRequest {
    /// Force stack storage
    pub stack: bool,
    /// Value is about to be overwritten, skip loading it
    pub lval: bool,
    /// Parent reads a single member, do not materialize the whole object
    pub dot: bool,
    /// Parent-chosen stack slot
    pub at: Option<i16>,
}

impl AllocRequest {
    /// Request stack storage
    pub fn stack() -> Self {
        Self {
            stack: true,
            ..Self::default()
        }
    }

    /// Request stack storage at a fixed offset
    pub fn at(offset: i16) -> Self {
        Self {
            stack: true,
            at: Some(offset),
            ..Self::default()
        }
    }

    /// Same request, forced onto the stack
    pub fn on_stack(mut self) -> Self {
        self.stack = true;
        self
    }

    /// Same request, marked as an assignment target
    pub fn lval(mut self) -> Self {
        self.lval = true;
        self
    }

    /// Same request, marked as single-member access
    pub fn dot(mut self) -> Self {
        self.dot = true;
        self
    }
}

/// Expression tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Payload
    pub kind: NodeKind,
    /// Resolved type
    #[serde(skip)]
    pub ty: Option<TypeRef>,
    /// Storage state
    #[serde(skip)]
    pub irs: Irs,
    /// Source location
    #[serde(skip)]
    pub loc: Loc,
    /// Names a member or is a compile-time constant, never emitted as a value
    #[serde(skip)]
    pub is_virtual: bool,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            ty: None,
            irs: Irs::default(),
            loc: Loc::default(),
            is_virtual: false,
        }
    }

    /// Operator application
    pub fn expr(func: impl Into<String>, args: Vec<Node>) -> Self {
        Self::new(NodeKind::Expr {
            func: func.into(),
            args,
        })
    }

    /// Identifier
    pub fn ident(name: impl Into<String>) -> Self {
        Self::new(NodeKind::Ident(name.into()))
    }

    /// String literal
    pub fn string(s: impl Into<String>) -> Self {
        Self::new(NodeKind::Str(s.into()))
    }

    /// Signed numeric literal
    pub fn num(value: i64) -> Self {
        Self::new(NodeKind::Num {
            value: value as u64,
            unsigned: false,
        })
    }

    /// Unsigned numeric literal
    pub fn unum(value: u64) -> Self {
        Self::new(NodeKind::Num {
            value,
            unsigned: value > i64::MAX as u64,
        })
    }

    /// Attach a source location
    pub fn at(mut self, loc: Loc) -> Self {
        self.loc = loc;
        self
    }

    /// `a.b`
    pub fn dot(base: Node, member: &str) -> Self {
        Self::expr(".", vec![base, Self::string(member)])
    }

    /// `a->b`
    pub fn arrow(base: Node, member: &str) -> Self {
        Self::expr("->", vec![base, Self::string(member)])
    }

    /// `*p`
    pub fn deref(ptr: Node) -> Self {
        Self::expr("u*", vec![ptr])
    }

    /// `m[k]`
    pub fn subscript(collection: Node, key: Node) -> Self {
        Self::expr("[]", vec![collection, key])
    }

    /// `l = r`
    pub fn assign(lval: Node, rval: Node) -> Self {
        Self::expr("=", vec![lval, rval])
    }

    /// Operator name, for operator applications
    pub fn func(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Expr { func, .. } => Some(func),
            _ => None,
        }
    }

    /// Whether this is an application of operator `name`
    pub fn is_op(&self, name: &str) -> bool {
        self.func() == Some(name)
    }

    /// Identifier name
    pub fn ident_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Ident(name) => Some(name),
            _ => None,
        }
    }

    /// String literal contents
    pub fn str_value(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric literal value
    pub fn num_value(&self) -> Option<u64> {
        match &self.kind {
            NodeKind::Num { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Arguments (empty for leaves)
    pub fn args(&self) -> &[Node] {
        match &self.kind {
            NodeKind::Expr { args, .. } => args,
            _ => &[],
        }
    }

    /// Mutable arguments (empty for leaves)
    pub fn args_mut(&mut self) -> &mut [Node] {
        match &mut self.kind {
            NodeKind::Expr { args, .. } => args,
            _ => &mut [],
        }
    }

    /// Resolved type
    pub fn ty(&self) -> Option<&TypeRef> {
        self.ty.as_ref()
    }

    /// Number of nodes in this subtree with a resolved type
    pub fn typed_count(&self) -> usize {
        let own = usize::from(self.ty.is_some());
        own + self.args().iter().map(Node::typed_count).sum::<usize>()
    }

    /// First node, in post order, without a type
    pub fn first_untyped(&self) -> Option<&Node> {
        self.args()
            .iter()
            .find_map(Node::first_untyped)
            .or(if self.ty.is_none() { Some(self) } else { None })
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Ident(name) => write!(f, "{}", name),
            NodeKind::Str(s) if self.is_virtual => write!(f, "{}", s),
            NodeKind::Str(s) => write!(f, "{:?}", s),
            NodeKind::Num { value, unsigned } => {
                if *unsigned {
                    write!(f, "{}", value)
                } else {
                    write!(f, "{}", *value as i64)
                }
            }
            NodeKind::Expr { func, args } => match (func.as_str(), args.as_slice()) {
                (".", [base, member]) if base.is_op("u*") => {
                    write!(f, "({}).{}", base, member.str_value().unwrap_or("?"))
                }
                (".", [base, member]) => write!(f, "{}.{}", base, member.str_value().unwrap_or("?")),
                ("->", [base, member]) => {
                    write!(f, "{}->{}", base, member.str_value().unwrap_or("?"))
                }
                ("u*", [ptr]) => write!(f, "*{}", ptr),
                ("[]", [coll, key]) => write!(f, "{}[{}]", coll, key),
                ("=", [lval, rval]) => write!(f, "{} = {}", lval, rval),
                _ => {
                    write!(f, "{}(", func)?;
                    for (i, a) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", a)?;
                    }
                    write!(f, ")")
                }
            },
        }
    }
}
