//! Tree walks of the compiler passes
//!
//! Operator nodes are dispatched to their [`Builtin`](super::builtins::Builtin)
//! hooks; leaves (literals and identifiers) are handled here.

use super::builtins::{EmitCtx, InferCtx, OperatorRegistry};
use super::ir::instruction::{alu, width};
use super::ir::{Insn, Reg};
use super::node::{AllocRequest, Node, NodeKind, Storage};
use super::symtab::SymbolKind;
use crate::error::{Error, Result};
use crate::types::Type;

/// Replace sugar with its expansion, outermost first. A replaced node is
/// offered to its own operator again.
pub fn rewrite(node: &mut Node, ops: &OperatorRegistry) -> Result<()> {
    while node.func().is_some() {
        let desc = ops.lookup(node)?;
        match desc.op.builtin().rewrite(node) {
            Some(new) => {
                tracing::trace!(from = %node, to = %new, "rewrite");
                *node = new;
            }
            None => break,
        }
    }
    for arg in node.args_mut() {
        rewrite(arg, ops)?;
    }
    Ok(())
}

/// Arity and structural checks of every operator node
pub fn validate(node: &Node, ops: &OperatorRegistry) -> Result<()> {
    if node.func().is_some() {
        let desc = ops.lookup(node)?;
        desc.check_arity(node)?;
        desc.op.builtin().static_validate(node)?;
    }
    node.args().iter().try_for_each(|arg| validate(arg, ops))
}

/// One inference pass over a tree, arguments before their operator
pub fn infer(node: &mut Node, ops: &OperatorRegistry, cx: &mut InferCtx<'_>) -> Result<()> {
    for arg in node.args_mut() {
        infer(arg, ops, cx)?;
    }
    // typed operators still get their hook, which may type an argument
    if node.func().is_some() {
        let desc = ops.lookup(node)?;
        if desc.static_ret && node.ty.is_none() {
            node.ty = Some(desc.ret());
        }
        return desc.op.builtin().type_infer(node, cx);
    }
    if node.ty.is_some() {
        return Ok(());
    }

    node.ty = match &node.kind {
        NodeKind::Num { unsigned: true, .. } => Some(Type::u64()),
        NodeKind::Num { .. } => Some(Type::s64()),
        NodeKind::Str(s) => Some(Type::array_of(Type::char(), s.len() + 1)),
        NodeKind::Ident(name) => cx.symbols.resolve(name).ty.clone(),
        NodeKind::Expr { .. } => None,
    };
    Ok(())
}

/// Emit a tree: `ir_pre`, then the arguments, then `ir_post`
pub fn emit(
    node: &mut Node,
    req: AllocRequest,
    ops: &OperatorRegistry,
    cx: &mut EmitCtx<'_>,
) -> Result<()> {
    if node.func().is_none() {
        return emit_leaf(node, req, cx);
    }

    let op = ops.lookup(node)?.op.builtin();
    let pre = op.ir_pre(node, req, cx)?;
    if pre.args.len() != node.args().len() {
        return Err(Error::internal(format!(
            "`{}`: {} storage requests for {} arguments",
            node,
            pre.args.len(),
            node.args().len()
        )));
    }

    tracing::trace!(node = %node, "emit");
    for (arg, r) in node.args_mut().iter_mut().zip(pre.args) {
        emit(arg, r, ops, cx)?;
    }
    op.ir_post(node, pre.own, cx)
}

fn emit_leaf(node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
    if node.is_virtual {
        return Ok(());
    }

    match node.kind.clone() {
        NodeKind::Num { value, .. } => {
            cx.ir.init_sym(node, req)?;
            cx.ir.emit_imm_to_sym(&node.irs, value)
        }
        NodeKind::Str(s) => {
            cx.ir.init_sym(node, req.on_stack())?;
            let off = node
                .irs
                .stack()
                .ok_or_else(|| Error::internal("string literal not on the stack"))?;
            let mut bytes = s.into_bytes();
            bytes.resize(node.irs.size, 0);
            cx.ir.emit_store_bytes(off, &bytes);
            Ok(())
        }
        NodeKind::Ident(name) => {
            let sym = cx
                .symbols
                .get(&name)
                .ok_or_else(|| Error::internal(format!("`{}` was never resolved", name)))?;
            match sym.kind {
                // consumers load the map reference themselves
                SymbolKind::Map { .. } => Ok(()),
                SymbolKind::Context { offset } => {
                    cx.ir.init_sym(node, req)?;
                    emit_context_load(node, offset, cx)
                }
            }
        }
        NodeKind::Expr { .. } => Err(Error::internal("operator emitted as a leaf")),
    }
}

/// Load a context variable at `offset` of the saved context into a node
fn emit_context_load(node: &Node, offset: i16, cx: &mut EmitCtx<'_>) -> Result<()> {
    let dst = node.irs;
    match (dst.loc, width(dst.size)) {
        (Storage::Reg(r), Some(sz)) => {
            cx.ir.emit(Insn::ldx(sz, r, Reg::CTX, offset));
            Ok(())
        }
        (Storage::Stack(_), Some(sz)) => {
            cx.ir.emit(Insn::ldx(sz, Reg::R0, Reg::CTX, offset));
            cx.ir.emit_reg_to_sym(&dst, Reg::R0)
        }
        (Storage::Stack(_), None) => {
            cx.ir.emit(Insn::mov(Reg::R3, Reg::CTX));
            cx.ir.emit(Insn::alu64_imm(alu::ADD, Reg::R3, i32::from(offset)));
            cx.ir.emit_read_to_sym(&dst, Reg::R3)
        }
        _ => Err(Error::internal(format!("no storage for context variable `{}`", node))),
    }
}
