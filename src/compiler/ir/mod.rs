//! # Instruction Representation
//!
//! Operators emit into an [`Ir`] stream of symbolic BPF instructions over
//! physical and virtual registers, with forward labels as jump targets.
//! [`lower`] turns a finished stream into encoded [`BpfInsn`]s.
//!
//! ## Module Structure
//!
//! ```text
//! ir/
//! ├── mod.rs          # This file - module definition and re-exports
//! ├── instruction.rs  # Opcodes, Reg, Insn, Label, Helper
//! ├── stream.rs       # Ir: append-only stream and emission primitives
//! └── lower.rs        # Virtual register assignment, label resolution, encoding
//! ```
//!
//! ## Register conventions
//!
//! | Register | Use |
//! |----------|-----|
//! | `r0` | helper return value, scratch for copies |
//! | `r1`-`r5` | helper arguments, clobbered by calls |
//! | `r6`-`r8` | virtual registers |
//! | `r9` | probe context, saved by the prologue |
//! | `r10` | frame pointer, read-only |

pub mod instruction;
pub mod lower;
pub mod stream;

pub use instruction::{Helper, Insn, Label, Reg};
pub use lower::{encode_all, lower, BpfInsn};
pub use stream::Ir;
