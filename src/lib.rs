//! # probec - tracing probes compiled to BPF
//!
//! Compiles the statements of a tracing probe (map updates, struct member
//! reads through kernel pointers, string comparisons, raw memory reads) to a
//! BPF program plus the list of maps the loader must create.
//!
//! ## Features
//!
//! - **Operator library** - `.`, `->`, `u*`, `[]`, `=`, `delete`, `:struct`,
//!   `strcmp`, `mem` and `str`, each with its own inference and emission hooks
//! - **Type inference** - map key and value types are inferred from use,
//!   across statements, until a fixed point
//! - **Verification** - lowered programs are checked for bounded jumps,
//!   frame-pointer writes and stack overruns before they are returned
//! - **Parallel** - probes of one unit compile concurrently and share a
//!   single type registry
//!
//! ## Quick Start
//!
//! ```rust
//! use probec::{CompileOptions, Compiler, Node, Probe, Type};
//!
//! # fn main() -> probec::Result<()> {
//! let mut probe = Probe::new("sys_enter_openat");
//! probe.declare_context("comm", Type::array_of(Type::char(), 16), 8)?;
//!
//! // hits[strcmp(comm, "sshd")] = 1
//! probe.push(Node::assign(
//!     Node::subscript(
//!         Node::ident("hits"),
//!         Node::expr("strcmp", vec![Node::ident("comm"), Node::string("sshd")]),
//!     ),
//!     Node::num(1),
//! ));
//!
//! let compiled = Compiler::new(CompileOptions::default()).compile(probe)?;
//! assert!(compiled.verification.valid);
//! assert_eq!(compiled.maps.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`compiler`] - passes, operator library, IR and verifier
//! - [`types`] - type representation and registry
//! - [`error`] - diagnostics

#![warn(missing_docs)]

pub mod compiler;
pub mod error;
pub mod types;

pub use compiler::{
    CompileOptions, CompiledProbe, Compiler, MapSpec, Node, NodeKind, Probe,
};
pub use error::{Error, ErrorSeverity, Loc, Result};
pub use types::{Field, MapKind, Type, TypeRef, TypeRegistry};
