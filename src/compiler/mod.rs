//! # Probe Compiler - expression trees to BPF
//!
//! This module compiles the statements of a probe to a BPF program that a
//! loader can attach to a kernel tracing hook.
//!
//! ## Architecture
//!
//! ```text
//! Node trees → Rewrite → Validate → Infer (fixed point) → Emit → Lower → Verify
//! ```
//!
//! ## Usage
//!
//! ```
//! use probec::compiler::{CompileOptions, Compiler, Node, Probe};
//!
//! let mut probe = Probe::new("count_by_pid");
//! probe.declare_context("pid", probec::types::Type::u64(), 0)?;
//! // calls[pid] = 1
//! probe.push(Node::assign(
//!     Node::subscript(Node::ident("calls"), Node::ident("pid")),
//!     Node::num(1),
//! ));
//!
//! let compiler = Compiler::new(CompileOptions::default());
//! let compiled = compiler.compile(probe)?;
//! assert_eq!(compiled.maps[0].name, "calls");
//! # Ok::<(), probec::Error>(())
//! ```

pub mod builtins;
pub mod ir;
pub mod node;
pub mod passes;
pub mod symtab;
pub mod verifier;

pub use builtins::{registry, Builtin, Operator, OperatorDescriptor, OperatorRegistry};
pub use ir::{BpfInsn, Helper, Insn, Ir, Label, Reg};
pub use node::{AllocRequest, Irs, Node, NodeKind, Storage};
pub use symtab::{Symbol, SymbolKind, SymbolTable};
pub use verifier::{Verifier, VerifyError, VerifyResult};

use crate::error::{Error, Result};
use crate::types::{Type, TypeRef, TypeRegistry};
use builtins::{EmitCtx, InferCtx};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Compilation options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Default length of `mem`/`str` reads
    pub string_size: usize,
    /// Stack frame size of the target
    pub max_stack: usize,
    /// Capacity of every map
    pub map_elems: u32,
    /// Inference passes before giving up
    pub max_passes: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            string_size: 128,
            max_stack: 512,
            map_elems: 1024,
            max_passes: 64,
        }
    }
}

impl CompileOptions {
    /// Load options from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(e.to_string()))
    }

    /// Set the default `mem`/`str` length
    pub fn with_string_size(mut self, n: usize) -> Self {
        self.string_size = n;
        self
    }

    /// Set the stack frame size
    pub fn with_max_stack(mut self, n: usize) -> Self {
        self.max_stack = n;
        self
    }

    /// Set the map capacity
    pub fn with_map_elems(mut self, n: u32) -> Self {
        self.map_elems = n;
        self
    }

    /// Set the inference pass limit
    pub fn with_max_passes(mut self, n: usize) -> Self {
        self.max_passes = n;
        self
    }
}

/// Statements of one probe and the symbols they refer to
#[derive(Debug, Clone)]
pub struct Probe {
    /// Probe name, used in diagnostics
    pub name: String,
    /// Statements in execution order
    pub statements: Vec<Node>,
    /// Declared context variables and maps
    pub symbols: SymbolTable,
}

impl Probe {
    /// Creates an empty probe
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statements: Vec::new(),
            symbols: SymbolTable::new(),
        }
    }

    /// Append a statement
    pub fn push(&mut self, stmt: Node) {
        self.statements.push(stmt);
    }

    /// Declare a context variable
    pub fn declare_context(&mut self, name: &str, ty: TypeRef, offset: i16) -> Result<()> {
        self.symbols.declare_context(name, ty, offset)
    }

    /// Declare a map with a known type
    pub fn declare_map(&mut self, name: &str, ty: TypeRef) -> Result<()> {
        self.symbols.declare_map(name, ty)
    }
}

/// Map the loader must create before attaching a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapSpec {
    /// Map id used by `lddw` map references
    pub id: usize,
    /// Identifier in the probe
    pub name: String,
    /// Kernel map type number
    pub map_type: u32,
    /// Key size in bytes
    pub key_size: usize,
    /// Value size in bytes
    pub value_size: usize,
    /// Capacity
    pub max_entries: u32,
}

/// Compilation result of one probe
#[derive(Debug)]
pub struct CompiledProbe {
    /// Probe name
    pub name: String,
    /// Lowered instructions
    pub program: Vec<BpfInsn>,
    /// Encoded program
    pub bytecode: Vec<u8>,
    /// Symbolic instructions before lowering
    pub listing: Vec<Insn>,
    /// Maps used by the program, by id
    pub maps: Vec<MapSpec>,
    /// Stack bytes used
    pub stack_size: usize,
    /// Verifier report
    pub verification: VerifyResult,
}

impl CompiledProbe {
    /// Text listing of the symbolic instructions
    pub fn disassemble(&self) -> String {
        self.listing
            .iter()
            .map(|i| match i {
                Insn::Label(_) => format!("{}\n", i),
                _ => format!("    {}\n", i),
            })
            .collect()
    }
}

/// Probe to BPF compiler
pub struct Compiler {
    options: CompileOptions,
    types: Arc<TypeRegistry>,
}

impl Compiler {
    /// Create a compiler with a fresh type registry
    pub fn new(options: CompileOptions) -> Self {
        Self::with_types(options, Arc::new(TypeRegistry::new()))
    }

    /// Create a compiler sharing an existing type registry
    pub fn with_types(options: CompileOptions, types: Arc<TypeRegistry>) -> Self {
        Self { options, types }
    }

    /// Options in use
    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Type registry, for registering host struct definitions
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Compile one probe
    pub fn compile(&self, probe: Probe) -> Result<CompiledProbe> {
        let ops = registry()?;
        let Probe {
            name,
            mut statements,
            mut symbols,
        } = probe;

        // Phase 1: Rewrite and validate
        for stmt in statements.iter_mut() {
            passes::rewrite(stmt, ops)?;
            passes::validate(stmt, ops)?;
        }

        // Phase 2: Infer types until nothing changes
        self.infer(&mut statements, &mut symbols)?;

        // Phase 3: Emit
        let mut cx = EmitCtx {
            ir: Ir::new(self.options.max_stack),
            symbols: &symbols,
            options: &self.options,
        };
        cx.ir.emit(Insn::mov(Reg::CTX, Reg::R1));
        for stmt in statements.iter_mut() {
            passes::emit(stmt, AllocRequest::default(), ops, &mut cx)?;
        }
        cx.ir.emit(Insn::mov_imm(Reg::R0, 0));
        cx.ir.emit(Insn::exit());
        let ir = cx.ir;

        tracing::debug!(
            probe = %name,
            insns = ir.insns().len(),
            stack = ir.stack_size(),
            "emitted probe"
        );

        // Phase 4: Lower and verify
        let program = ir::lower(&ir)?;
        let verification = Verifier::new()
            .max_stack(self.options.max_stack)
            .verify(&program);
        if !verification.valid {
            let msgs: Vec<String> = verification.errors.iter().map(|e| e.to_string()).collect();
            return Err(Error::Verification(msgs.join("; ")));
        }

        let maps = self.map_specs(&symbols)?;
        Ok(CompiledProbe {
            name,
            bytecode: ir::encode_all(&program),
            program,
            listing: ir.insns().to_vec(),
            maps,
            stack_size: ir.stack_size(),
            verification,
        })
    }

    /// Compile several probes in parallel
    pub fn compile_all(&self, probes: Vec<Probe>) -> Vec<Result<CompiledProbe>> {
        probes.into_par_iter().map(|p| self.compile(p)).collect()
    }

    fn infer(&self, statements: &mut [Node], symbols: &mut SymbolTable) -> Result<()> {
        let ops = registry()?;
        let mut cx = InferCtx {
            symbols,
            types: &self.types,
            options: &self.options,
        };

        let typed = |stmts: &[Node]| stmts.iter().map(Node::typed_count).sum::<usize>();
        for pass in 1..=self.options.max_passes {
            let before = typed(&*statements);
            for stmt in statements.iter_mut() {
                passes::infer(stmt, ops, &mut cx)?;
            }
            let after = typed(&*statements);
            tracing::debug!(pass, typed = after, "inference pass");

            if statements.iter().all(|s| s.first_untyped().is_none()) {
                return Ok(());
            }
            if after == before {
                break;
            }
        }

        let untyped = statements
            .iter()
            .find_map(Node::first_untyped)
            .ok_or_else(|| Error::internal("inference stopped with every node typed"))?;
        Err(Error::UnresolvedType {
            node: untyped.to_string(),
            loc: untyped.loc,
        })
    }

    fn map_specs(&self, symbols: &SymbolTable) -> Result<Vec<MapSpec>> {
        symbols
            .maps()
            .into_iter()
            .map(|sym| {
                let id = match sym.kind {
                    SymbolKind::Map { id } => id,
                    SymbolKind::Context { .. } => {
                        return Err(Error::internal(format!("`{}` is not a map", sym.name)))
                    }
                };
                match sym.ty.as_deref() {
                    Some(Type::Map { key, value, kind }) => Ok(MapSpec {
                        id,
                        name: sym.name.clone(),
                        map_type: kind.bpf_map_type(),
                        key_size: key.size(),
                        value_size: value.size(),
                        max_entries: self.options.map_elems,
                    }),
                    _ => Err(Error::UnresolvedType {
                        node: sym.name.clone(),
                        loc: Default::default(),
                    }),
                }
            })
            .collect()
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Field, MapKind};

    fn compile(probe: Probe) -> Result<CompiledProbe> {
        Compiler::default().compile(probe)
    }

    #[test]
    fn test_options_from_json() {
        let opts = CompileOptions::from_json(r#"{"string_size": 64}"#).unwrap();
        assert_eq!(opts.string_size, 64);
        assert_eq!(opts.max_stack, 512);
        assert!(matches!(
            CompileOptions::from_json("{"),
            Err(Error::Config(_))
        ));
        assert_eq!(
            CompileOptions::default().with_max_passes(3).max_passes,
            3
        );
    }

    #[test]
    fn test_map_assignment_compiles() {
        let mut p = Probe::new("t");
        p.push(Node::assign(
            Node::subscript(Node::ident("m"), Node::num(1)),
            Node::num(2),
        ));
        let out = compile(p).unwrap();
        assert_eq!(out.maps.len(), 1);
        assert_eq!(out.maps[0].key_size, 8);
        assert_eq!(out.maps[0].value_size, 8);
        assert_eq!(out.maps[0].map_type, 1);
        assert!(out.verification.valid);
        assert!(out
            .listing
            .iter()
            .any(|i| i.helper() == Some(Helper::MapUpdateElem)));
        assert_eq!(out.bytecode.len(), out.program.iter().map(BpfInsn::size).sum::<usize>());
    }

    #[test]
    fn test_declared_map_kinds_reach_the_loader() {
        let u32_ty = Type::scalar("u32").unwrap();
        let mut p = Probe::new("t");
        p.declare_map("per_cpu", Type::map_of(Type::s64(), Type::u64(), MapKind::PerCpuHash))
            .unwrap();
        p.declare_map("slots", Type::map_of(u32_ty, Type::u64(), MapKind::Array))
            .unwrap();
        p.push(Node::assign(
            Node::subscript(Node::ident("per_cpu"), Node::num(1)),
            Node::num(2),
        ));
        p.push(Node::assign(
            Node::subscript(Node::ident("slots"), Node::num(3)),
            Node::num(4),
        ));

        let out = compile(p).unwrap();
        let kinds: Vec<_> = out
            .maps
            .iter()
            .map(|m| (m.name.as_str(), m.map_type, m.key_size))
            .collect();
        assert_eq!(kinds, vec![("per_cpu", 5, 8), ("slots", 2, 4)]);
    }

    #[test]
    fn test_bare_identifier_assignment_rejected() {
        let mut p = Probe::new("t");
        p.push(Node::assign(Node::ident("x"), Node::num(1)));
        assert!(matches!(compile(p), Err(Error::StaticError { .. })));
    }

    #[test]
    fn test_unknown_operator() {
        let mut p = Probe::new("t");
        p.push(Node::expr("frob", vec![]));
        assert!(matches!(compile(p), Err(Error::UnknownOperator { .. })));
    }

    #[test]
    fn test_underivable_type_reported() {
        let mut p = Probe::new("t");
        // a map that is read but never written has no type
        p.push(Node::assign(
            Node::subscript(Node::ident("a"), Node::num(1)),
            Node::subscript(Node::ident("b"), Node::num(1)),
        ));
        let err = compile(p).unwrap_err();
        assert!(matches!(err, Error::UnresolvedType { .. }), "{}", err);
        assert!(err.to_string().contains("could not determine type"));
    }

    #[test]
    fn test_inference_flows_across_statements() {
        let mut p = Probe::new("t");
        // b is typed by the second statement, a by the first once b is known
        p.push(Node::assign(
            Node::subscript(Node::ident("a"), Node::num(1)),
            Node::subscript(Node::ident("b"), Node::num(1)),
        ));
        p.push(Node::assign(
            Node::subscript(Node::ident("b"), Node::num(2)),
            Node::num(7),
        ));
        let out = compile(p).unwrap();
        assert_eq!(out.maps.len(), 2);
        assert!(out.maps.iter().all(|m| m.value_size == 8));
    }

    #[test]
    fn test_arrow_member_read() {
        let types = TypeRegistry::new();
        let s = types.add(Type::struct_of(
            "s",
            vec![
                Field::new("a", Type::scalar("s32").unwrap()),
                Field::new("b", Type::scalar("s8").unwrap()),
            ],
        ));
        let mut p = Probe::new("t");
        p.declare_context("p", Type::pointer_to(s), 0).unwrap();
        p.push(Node::assign(
            Node::subscript(Node::ident("m"), Node::num(0)),
            Node::arrow(Node::ident("p"), "b"),
        ));
        let out = compile(p).unwrap();
        let reads = out
            .listing
            .iter()
            .filter(|i| i.helper() == Some(Helper::ProbeRead))
            .count();
        assert_eq!(reads, 1);
    }

    #[test]
    fn test_compile_all_in_parallel() {
        let probes = (0..8)
            .map(|i| {
                let mut p = Probe::new(format!("p{}", i));
                p.push(Node::assign(
                    Node::subscript(Node::ident("m"), Node::num(i)),
                    Node::expr(":struct", vec![Node::num(i), Node::num(1)]),
                ));
                p
            })
            .collect();
        let out = Compiler::default().compile_all(probes);
        assert_eq!(out.len(), 8);
        assert!(out.iter().all(|r| r.is_ok()));
    }
}
