//! Struct member access, dereference and struct construction

use super::{typed, Builtin, EmitCtx, InferCtx, PreAlloc};
use crate::compiler::ir::{Insn, Reg};
use crate::compiler::ir::instruction::{alu, width};
use crate::compiler::node::{AllocRequest, Node, Storage};
use crate::error::{Error, Result};
use crate::types::{StructType, Type, TypeRef};

/// Member name of a `.` or `->` node
fn member_name(node: &Node) -> Result<&str> {
    node.args()
        .get(1)
        .and_then(Node::str_value)
        .ok_or_else(|| Error::static_error(node.loc, format!("`{}`: member must be a name", node)))
}

/// Field type of `member` in the struct `ty`, or a type error against `base`
fn member_type(node: &Node, base: &Node, ty: &TypeRef, member: &str) -> Result<TypeRef> {
    let sou: &StructType = ty.as_struct().ok_or_else(|| {
        Error::type_error(
            node.loc,
            format!(
                "`{}` is neither struct nor union (type '{}')",
                base,
                base.ty().map_or_else(|| ty.to_string(), |t| t.to_string())
            ),
        )
    })?;
    sou.field(member).map(|f| f.ty.clone()).ok_or_else(|| {
        Error::type_error(
            node.loc,
            format!("type '{}' has no member named `{}`", ty, member),
        )
    })
}

/// `a.b`
pub struct Dot;

impl Builtin for Dot {
    fn static_validate(&self, node: &Node) -> Result<()> {
        member_name(node).map(|_| ())
    }

    fn type_infer(&self, node: &mut Node, cx: &mut InferCtx<'_>) -> Result<()> {
        if node.ty.is_some() {
            return Ok(());
        }
        let Some(base_ty) = node.args()[0].ty.clone() else {
            return Ok(());
        };

        let member = member_name(node)?.to_string();
        let ty = member_type(node, &node.args()[0], &base_ty, &member)?;
        node.args_mut()[1].is_virtual = true;
        cx.set_type(node, ty);
        Ok(())
    }

    fn ir_pre(&self, node: &mut Node, req: AllocRequest, _cx: &mut EmitCtx<'_>) -> Result<PreAlloc> {
        if node.args()[0].is_op("u*") {
            // (*ptr).member: the dereference leaves the load to us and the
            // member arrives through a helper read
            return Ok(PreAlloc {
                own: req.on_stack(),
                args: vec![AllocRequest::default().dot(), AllocRequest::default()],
            });
        }
        Ok(PreAlloc {
            own: req,
            args: vec![AllocRequest::stack(), AllocRequest::default()],
        })
    }

    fn ir_post(&self, node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        cx.ir.init_sym(node, req)?;

        let base = &node.args()[0];
        let base_ty = typed(base)?;
        let member = member_name(node)?;
        let offset = base_ty
            .offset_of(member)
            .ok_or_else(|| Error::internal(format!("no offset for member `{}`", member)))?;

        let dst = node.irs;
        if !base.irs.is_allocated() && base.is_op("u*") {
            // base is a u* that was not loaded, read the member only
            let ptr = base
                .args()
                .first()
                .ok_or_else(|| Error::internal("dereference without operand"))?;
            cx.ir.emit_sym_to_reg(Reg::R3, &ptr.irs)?;
            if offset != 0 {
                cx.ir.emit(Insn::alu64_imm(alu::ADD, Reg::R3, offset as i32));
            }
            return cx.ir.emit_read_to_sym(&dst, Reg::R3);
        }

        let at = base
            .irs
            .stack()
            .ok_or_else(|| Error::internal(format!("`{}` is not on the stack", base)))?
            + offset as i16;

        match dst.loc {
            Storage::Reg(r) => {
                let sz = width(dst.size).ok_or_else(|| {
                    Error::internal(format!("member of {} bytes in a register", dst.size))
                })?;
                cx.ir.emit(Insn::ldx(sz, r, Reg::FP, at));
                Ok(())
            }
            _ => {
                cx.ir.emit_ldbp(Reg::R3, at);
                cx.ir.emit_read_to_sym(&dst, Reg::R3)
            }
        }
    }
}

/// `a->b`, rewritten to `(*a).b`
pub struct Arrow;

impl Builtin for Arrow {
    fn static_validate(&self, node: &Node) -> Result<()> {
        member_name(node).map(|_| ())
    }

    fn rewrite(&self, node: &Node) -> Option<Node> {
        let [base, member] = node.args() else {
            return None;
        };
        let member = member.str_value()?;
        let deref = Node::deref(base.clone()).at(base.loc);
        Some(Node::dot(deref, member).at(node.loc))
    }

    fn type_infer(&self, node: &mut Node, cx: &mut InferCtx<'_>) -> Result<()> {
        if node.ty.is_some() {
            return Ok(());
        }
        let Some(base_ty) = node.args()[0].ty.clone() else {
            return Ok(());
        };

        let pointee = match base_ty.as_ref() {
            Type::Pointer(to) => to.clone(),
            _ => {
                return Err(Error::type_error(
                    node.loc,
                    format!("`{}` is not a pointer (type '{}')", node.args()[0], base_ty),
                ))
            }
        };

        let member = member_name(node)?.to_string();
        let ty = member_type(node, &node.args()[0], &pointee, &member)?;
        node.args_mut()[1].is_virtual = true;
        cx.set_type(node, ty);
        Ok(())
    }
}

/// `*p`
pub struct Deref;

impl Builtin for Deref {
    fn type_infer(&self, node: &mut Node, cx: &mut InferCtx<'_>) -> Result<()> {
        if node.ty.is_some() {
            return Ok(());
        }
        let Some(ptr_ty) = node.args()[0].ty.clone() else {
            return Ok(());
        };

        match ptr_ty.as_ref() {
            Type::Pointer(to) => {
                cx.set_type(node, to.clone());
                Ok(())
            }
            _ => Err(Error::type_error(
                node.loc,
                format!("can't dereference `{}` (type '{}')", node.args()[0], ptr_ty),
            )),
        }
    }

    fn ir_pre(&self, node: &mut Node, req: AllocRequest, _cx: &mut EmitCtx<'_>) -> Result<PreAlloc> {
        Ok(PreAlloc::passthrough(node, req.on_stack()))
    }

    fn ir_post(&self, node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        if req.dot {
            // parent reads one member through our operand
            return Ok(());
        }

        cx.ir.init_sym(node, req)?;
        if req.lval {
            return Ok(());
        }

        let ptr = node.args()[0].irs;
        cx.ir.emit_sym_to_reg(Reg::R0, &ptr)?;
        cx.ir.emit_read_to_sym(&node.irs, Reg::R0)
    }
}

/// `:struct(a, b, ...)`, an anonymous struct with members `f0..fN`
pub struct StructLiteral;

impl Builtin for StructLiteral {
    fn static_validate(&self, node: &Node) -> Result<()> {
        if node.args().is_empty() {
            return Err(Error::static_error(node.loc, "empty struct"));
        }
        Ok(())
    }

    fn type_infer(&self, node: &mut Node, cx: &mut InferCtx<'_>) -> Result<()> {
        if node.ty.is_some() {
            return Ok(());
        }

        let mut members = Vec::with_capacity(node.args().len());
        for arg in node.args() {
            match &arg.ty {
                Some(t) if t.size() > 0 => members.push(t.clone()),
                _ => return Ok(()),
            }
        }

        let ty = cx.types.anon_struct(members);
        cx.set_type(node, ty);
        Ok(())
    }

    fn ir_pre(&self, node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<PreAlloc> {
        let own = req.on_stack();
        cx.ir.init_sym(node, own)?;

        let ty = typed(node)?;
        let sou = ty
            .as_struct()
            .ok_or_else(|| Error::internal(format!("`{}` is not a struct", node)))?;
        let base = node
            .irs
            .stack()
            .ok_or_else(|| Error::internal("struct literal not on the stack"))?;

        let offsets = sou.offsets();
        let mut args = Vec::with_capacity(sou.fields.len());
        let mut end = 0;
        for ((field, &offset), arg) in sou.fields.iter().zip(&offsets).zip(node.args()) {
            if offset > end {
                cx.ir.emit_bzero(base + end as i16, offset - end);
            }
            end = offset + field.ty.size();

            args.push(if arg.irs.is_allocated() {
                AllocRequest::default()
            } else {
                AllocRequest::at(base + offset as i16)
            });
        }
        if ty.size() > end {
            cx.ir.emit_bzero(base + end as i16, ty.size() - end);
        }

        Ok(PreAlloc { own, args })
    }

    fn ir_post(&self, node: &mut Node, _req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        let ty = typed(node)?;
        let base = node
            .irs
            .stack()
            .ok_or_else(|| Error::internal("struct literal not on the stack"))?;
        let offsets = ty
            .as_struct()
            .ok_or_else(|| Error::internal(format!("`{}` is not a struct", node)))?
            .offsets();

        for (arg, offset) in node.args().iter().zip(offsets) {
            cx.ir.emit_sym_to_stack(base + offset as i16, &arg.irs)?;
        }
        Ok(())
    }
}
