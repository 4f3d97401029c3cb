//! Subscripts, assignment and deletion
//!
//! Maps are the only mutable state of a probe. A map subscript reads the
//! value stored under a key, or the zero value when the key is absent;
//! assigning to a map subscript stores the value and `delete` removes the
//! key. Arrays and pointers may be subscripted for reading.

use super::{typed, Builtin, EmitCtx, InferCtx, PreAlloc};
use crate::compiler::ir::instruction::alu;
use crate::compiler::ir::{Helper, Insn, Reg};
use crate::compiler::node::{AllocRequest, Irs, Node, Storage};
use crate::compiler::symtab::{SymbolKind, SymbolTable};
use crate::error::{Error, Result};
use crate::types::{MapKind, Type, TypeRef};

/// Id of the map named by `node`
fn map_id(node: &Node, symbols: &SymbolTable) -> Result<usize> {
    let name = node.ident_name().ok_or_else(|| {
        Error::unsupported(node.loc, format!("`{}` is not a map name", node))
    })?;
    match symbols.get(name).map(|s| s.kind) {
        Some(SymbolKind::Map { id }) => Ok(id),
        _ => Err(Error::internal(format!("`{}` is not a map", name))),
    }
}

/// Stack slot holding the key of a map subscript, converted to the width of
/// the map's key when it differs
fn map_key_slot(subscript: &Node, cx: &mut EmitCtx<'_>) -> Result<i16> {
    let [map, key] = subscript.args() else {
        return Err(Error::internal("subscript without map and key"));
    };
    let key_ty = match typed(map)?.as_ref() {
        Type::Map { key, .. } => key.clone(),
        other => return Err(Error::internal(format!("subscript of '{}' as a map", other))),
    };

    if key.irs.size == key_ty.size() {
        if let Some(off) = key.irs.stack() {
            return Ok(off);
        }
    }

    let mut slot = Irs::default();
    cx.ir.init_irs(&mut slot, &key_ty, AllocRequest::stack())?;
    if key.irs.size == key_ty.size() {
        cx.ir.emit_sym_to_sym(&slot, &key.irs)?;
    } else {
        let signed = key.irs.size < key_ty.size() && typed(key)?.is_signed();
        cx.ir.emit_widen_to_reg(Reg::R0, &key.irs, signed)?;
        cx.ir.emit_reg_to_sym(&slot, Reg::R0)?;
    }
    slot.stack()
        .ok_or_else(|| Error::internal("map key not on the stack"))
}

/// `map_update_elem(map, &key, &value, 0)` for the map subscript `lval`
fn map_update(lval: &Node, cx: &mut EmitCtx<'_>) -> Result<()> {
    let map = map_id(&lval.args()[0], cx.symbols)?;
    let key = map_key_slot(lval, cx)?;
    let value = lval
        .irs
        .stack()
        .ok_or_else(|| Error::internal("map value not on the stack"))?;

    cx.ir.emit_ldmap(Reg::R1, map);
    cx.ir.emit_ldbp(Reg::R2, key);
    cx.ir.emit_ldbp(Reg::R3, value);
    cx.ir.emit(Insn::mov_imm(Reg::R4, 0));
    cx.ir.emit_call(Helper::MapUpdateElem);
    Ok(())
}

/// `a[k]`
pub struct Subscript;

impl Subscript {
    /// Collection type known, result type unknown
    fn infer_up(node: &mut Node, coll_ty: &TypeRef, cx: &mut InferCtx<'_>) -> Result<()> {
        let [coll, key] = node.args() else {
            return Err(Error::internal("subscript without collection and key"));
        };
        let key_ty = typed(key)?;

        let indexed = matches!(coll_ty.as_ref(), Type::Array { .. } | Type::Pointer(_));
        if indexed && !key_ty.is_scalar() {
            return Err(Error::type_error(
                node.loc,
                format!(
                    "array subscript must be a scalar value, but `{}` is of type '{}'",
                    key, key_ty
                ),
            ));
        }

        let ty = match coll_ty.as_ref() {
            Type::Array { of, len } => {
                if let Some(idx) = key.num_value() {
                    if idx >= *len as u64 {
                        return Err(Error::type_error(
                            node.loc,
                            format!("index {} is out of bounds for `{}` (type '{}')", idx, coll, coll_ty),
                        ));
                    }
                }
                of.clone()
            }
            Type::Pointer(to) => to.clone(),
            Type::Map { key: mkey, value, .. } => {
                if !mkey.compatible(&key_ty) {
                    return Err(Error::type_error(
                        node.loc,
                        format!(
                            "`{}` (type '{}') can't be used as a key of `{}` (type '{}')",
                            key, key_ty, coll, coll_ty
                        ),
                    ));
                }
                value.clone()
            }
            _ => {
                return Err(Error::type_error(
                    node.loc,
                    format!("`{}` is not subscriptable (type '{}')", coll, coll_ty),
                ))
            }
        };

        // constant indices are folded into the access
        if indexed && key.num_value().is_some() {
            node.args_mut()[1].is_virtual = true;
        }
        cx.set_type(node, ty);
        Ok(())
    }

    /// Both sides typed: a map element must agree with the map's key and
    /// value types, which may have been fixed by another statement
    fn check_map_use(node: &Node, ty: &TypeRef, coll_ty: &TypeRef) -> Result<()> {
        let Type::Map { key: mkey, value, .. } = coll_ty.as_ref() else {
            return Ok(());
        };
        let [coll, key] = node.args() else {
            return Err(Error::internal("subscript without collection and key"));
        };
        let key_ty = typed(key)?;
        if !mkey.compatible(&key_ty) {
            return Err(Error::type_error(
                node.loc,
                format!(
                    "`{}` (type '{}') can't be used as a key of `{}` (type '{}')",
                    key, key_ty, coll, coll_ty
                ),
            ));
        }
        if !value.compatible(ty) {
            return Err(Error::type_error(
                node.loc,
                format!(
                    "`{}` (type '{}') doesn't match the values of `{}` (type '{}')",
                    node, ty, coll, coll_ty
                ),
            ));
        }
        Ok(())
    }

    fn post_map(node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        cx.ir.init_sym(node, req)?;
        if req.lval {
            // value is about to be overwritten or removed
            return Ok(());
        }

        let map = map_id(&node.args()[0], cx.symbols)?;
        let key = map_key_slot(node, cx)?;
        let dst = node.irs;
        let off = dst
            .stack()
            .ok_or_else(|| Error::internal("map value not on the stack"))?;

        cx.ir.emit_ldmap(Reg::R1, map);
        cx.ir.emit_ldbp(Reg::R2, key);
        cx.ir.emit_call(Helper::MapLookupElem);

        let miss = cx.ir.alloc_label();
        let hit = cx.ir.alloc_label();
        cx.ir.emit_jeq(Reg::R0, 0, miss);
        cx.ir.emit_read_to_sym(&dst, Reg::R0)?;
        cx.ir.emit(Insn::ja(hit));
        cx.ir.emit_label(miss)?;
        cx.ir.emit_bzero(off, dst.size);
        cx.ir.emit_label(hit)
    }

    fn post_array(node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        cx.ir.init_sym(node, req)?;

        let [arr, idx] = node.args() else {
            return Err(Error::internal("subscript without collection and key"));
        };
        let idx = idx
            .num_value()
            .ok_or_else(|| Error::internal("array index is not a constant"))?;
        let base = arr
            .irs
            .stack()
            .ok_or_else(|| Error::internal(format!("`{}` is not on the stack", arr)))?;
        let elem = Irs {
            loc: Storage::Stack(base + (idx as usize * node.irs.size) as i16),
            size: node.irs.size,
        };
        cx.ir.emit_sym_to_sym(&node.irs, &elem)
    }

    fn post_pointer(node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        cx.ir.init_sym(node, req)?;

        let [ptr, idx] = node.args() else {
            return Err(Error::internal("subscript without collection and key"));
        };
        let esize = node.irs.size as i64;

        cx.ir.emit_sym_to_reg(Reg::R3, &ptr.irs)?;
        match idx.num_value() {
            Some(i) => {
                let off = (i as i64).wrapping_mul(esize);
                let off = i32::try_from(off).map_err(|_| {
                    Error::unsupported(node.loc, format!("offset of `{}` does not fit in 32 bits", node))
                })?;
                if off != 0 {
                    cx.ir.emit(Insn::alu64_imm(alu::ADD, Reg::R3, off));
                }
            }
            None => {
                cx.ir.emit_sym_to_reg(Reg::R0, &idx.irs)?;
                cx.ir.emit(Insn::alu64_imm(alu::MUL, Reg::R0, esize as i32));
                cx.ir.emit(Insn::alu64_reg(alu::ADD, Reg::R3, Reg::R0));
            }
        }
        let dst = node.irs;
        cx.ir.emit_read_to_sym(&dst, Reg::R3)
    }
}

impl Builtin for Subscript {
    fn type_infer(&self, node: &mut Node, cx: &mut InferCtx<'_>) -> Result<()> {
        let [coll, key] = node.args() else {
            return Ok(());
        };
        if key.ty.is_none() {
            return Ok(());
        }

        match (node.ty.clone(), coll.ty.clone()) {
            (None, Some(coll_ty)) => Self::infer_up(node, &coll_ty, cx),
            (Some(ty), None) => {
                // lval of an assignment: the collection is a map from the
                // key type to the assigned type
                if coll.ident_name().is_none() {
                    return Err(Error::type_error(
                        node.loc,
                        format!("`{}` is not a map name", coll),
                    ));
                }
                let key_ty = typed(key)?;
                let map = Type::map_of(key_ty, ty, MapKind::Hash);
                cx.set_type(&mut node.args_mut()[0], map);
                Ok(())
            }
            (Some(ty), Some(coll_ty)) => Self::check_map_use(node, &ty, &coll_ty),
            (None, None) => Ok(()),
        }
    }

    fn ir_pre(&self, node: &mut Node, req: AllocRequest, _cx: &mut EmitCtx<'_>) -> Result<PreAlloc> {
        let coll_ty = typed(&node.args()[0])?;
        match coll_ty.as_ref() {
            Type::Map { .. } => Ok(PreAlloc {
                own: req.on_stack(),
                args: vec![AllocRequest::default(), AllocRequest::stack()],
            }),
            Type::Array { .. } => {
                let idx = &node.args()[1];
                if idx.num_value().is_none() {
                    return Err(Error::unsupported(
                        node.loc,
                        format!("non-constant index `{}` into array `{}`", idx, node.args()[0]),
                    ));
                }
                Ok(PreAlloc {
                    own: req,
                    args: vec![AllocRequest::stack(), AllocRequest::default()],
                })
            }
            Type::Pointer(_) => Ok(PreAlloc::passthrough(node, req.on_stack())),
            other => Err(Error::internal(format!("subscript of '{}'", other))),
        }
    }

    fn ir_post(&self, node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        let coll_ty = typed(&node.args()[0])?;
        if req.lval && !coll_ty.is_map() {
            return Err(Error::unsupported(
                node.loc,
                format!("can't write to `{}`, only map elements are assignable", node),
            ));
        }

        match coll_ty.as_ref() {
            Type::Map { .. } => Self::post_map(node, req, cx),
            Type::Array { .. } => Self::post_array(node, req, cx),
            Type::Pointer(_) => Self::post_pointer(node, req, cx),
            other => Err(Error::internal(format!("subscript of '{}'", other))),
        }
    }
}

/// `a = b`
pub struct Assign;

impl Builtin for Assign {
    fn static_validate(&self, node: &Node) -> Result<()> {
        let lval = &node.args()[0];
        if !lval.is_op("[]") {
            return Err(Error::static_error(
                node.loc,
                format!("can't assign a value to `{}`", lval),
            ));
        }
        Ok(())
    }

    fn type_infer(&self, node: &mut Node, cx: &mut InferCtx<'_>) -> Result<()> {
        if node.ty.is_some() {
            return Ok(());
        }
        let Some(rty) = node.args()[1].ty.clone() else {
            return Ok(());
        };
        if rty.size() == 0 {
            return Err(Error::type_error(
                node.loc,
                format!("`{}` (type '{}') has no value to assign", node.args()[1], rty),
            ));
        }

        match node.args()[0].ty.clone() {
            None => cx.set_type(&mut node.args_mut()[0], rty),
            Some(lty) if lty.compatible(&rty) => {}
            Some(lty) => {
                let [lval, rval] = node.args() else {
                    return Err(Error::internal("assignment without operands"));
                };
                return Err(Error::type_error(
                    node.loc,
                    format!(
                        "can't assign `{}` (type '{}'), to `{}` (type '{}')",
                        rval, rty, lval, lty
                    ),
                ));
            }
        }

        cx.set_type(node, Type::void());
        Ok(())
    }

    fn ir_pre(&self, node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<PreAlloc> {
        let lty = typed(&node.args()[0])?;
        let rty = typed(&node.args()[1])?;

        let own = req.on_stack();
        cx.ir.init_irs(&mut node.irs, &lty, own)?;
        let slot = node
            .irs
            .stack()
            .ok_or_else(|| Error::internal("assignment slot not on the stack"))?;

        // the right value lands in the target slot unless it needs a
        // width conversion on the way
        let rreq = if rty.size() == lty.size() {
            AllocRequest::at(slot)
        } else {
            AllocRequest::stack()
        };

        Ok(PreAlloc {
            own,
            args: vec![AllocRequest::at(slot).lval(), rreq],
        })
    }

    fn ir_post(&self, node: &mut Node, _req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        let [lval, rval] = node.args() else {
            return Err(Error::internal("assignment without operands"));
        };

        if lval.irs.size == rval.irs.size {
            cx.ir.emit_sym_to_sym(&lval.irs, &rval.irs)?;
        } else {
            let signed = rval.irs.size < lval.irs.size && typed(rval)?.is_signed();
            cx.ir.emit_widen_to_reg(Reg::R0, &rval.irs, signed)?;
            cx.ir.emit_reg_to_sym(&lval.irs, Reg::R0)?;
        }

        if lval.is_op("[]") {
            map_update(lval, cx)?;
        }
        Ok(())
    }
}

/// `delete m[k]`
pub struct Delete;

impl Builtin for Delete {
    fn static_validate(&self, node: &Node) -> Result<()> {
        let arg = &node.args()[0];
        if !arg.is_op("[]") {
            return Err(Error::static_error(
                node.loc,
                format!("can't delete `{}`, a map was expected", arg),
            ));
        }
        Ok(())
    }

    fn ir_pre(&self, node: &mut Node, req: AllocRequest, _cx: &mut EmitCtx<'_>) -> Result<PreAlloc> {
        Ok(PreAlloc {
            own: req,
            args: vec![AllocRequest::stack().lval()],
        })
    }

    fn ir_post(&self, node: &mut Node, _req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        let target = &node.args()[0];
        let map = map_id(&target.args()[0], cx.symbols)?;
        let key = map_key_slot(target, cx)?;

        cx.ir.emit_ldmap(Reg::R1, map);
        cx.ir.emit_ldbp(Reg::R2, key);
        cx.ir.emit_call(Helper::MapDeleteElem);
        Ok(())
    }
}
