//! String comparison and typed memory reads

use super::{expect_args, typed, Builtin, EmitCtx, InferCtx, PreAlloc};
use crate::compiler::ir::instruction::{alu, size, width};
use crate::compiler::ir::{Helper, Insn, Ir, Reg};
use crate::compiler::node::{AllocRequest, Node, NodeKind};
use crate::error::{Error, Result};
use crate::types::Type;

/// Byte-wise comparison of the stack strings at `a` and `b` (or of `a`
/// against the literal `lit`) into `dst`, stopping at the first difference
fn strcmp_emit(ir: &mut Ir, dst: Reg, a: i16, b: i16, lit: Option<&[u8]>, len: usize) -> Result<()> {
    let done = ir.alloc_label();

    for i in 0..len {
        let off = i as i16;
        ir.emit(Insn::ldx(size::B, dst, Reg::FP, a + off));

        let lit_byte = lit.map(|bytes| bytes.get(i).copied().unwrap_or(0));
        match lit_byte {
            Some(byte) => ir.emit(Insn::alu64_imm(alu::SUB, dst, i32::from(byte))),
            None => {
                ir.emit(Insn::ldx(size::B, Reg::R1, Reg::FP, b + off));
                ir.emit(Insn::alu64_reg(alu::SUB, dst, Reg::R1));
            }
        }

        if i + 1 == len {
            break;
        }
        match lit_byte {
            // end of the literal, nothing left to compare
            Some(0) => break,
            Some(_) => {}
            None => ir.emit_jeq(Reg::R1, 0, done),
        }
        ir.emit_jne(dst, 0, done);
    }

    ir.emit_label(done)
}

/// `strcmp(a, b)`: zero when equal, otherwise the difference of the first
/// differing bytes
pub struct Strcmp;

impl Builtin for Strcmp {
    fn static_validate(&self, node: &Node) -> Result<()> {
        expect_args(node, 2, 2)
    }

    fn type_infer(&self, node: &mut Node, cx: &mut InferCtx<'_>) -> Result<()> {
        if node.ty.is_some() {
            return Ok(());
        }
        if node.args().iter().any(|a| a.ty.is_none()) {
            return Ok(());
        }

        let mut literals = 0;
        for arg in node.args_mut() {
            if arg.str_value().is_some() {
                arg.is_virtual = true;
                literals += 1;
                continue;
            }
            let ty = typed(arg)?;
            if !ty.is_string() {
                return Err(Error::type_error(
                    arg.loc,
                    format!("`{}` is of type '{}', a string was expected", arg, ty),
                ));
            }
        }
        if literals == 2 {
            return Err(Error::type_error(
                node.loc,
                "strcmp of two literals, at least one operand must be a string value",
            ));
        }

        cx.set_type(node, Type::int());
        Ok(())
    }

    fn ir_pre(&self, node: &mut Node, req: AllocRequest, _cx: &mut EmitCtx<'_>) -> Result<PreAlloc> {
        Ok(PreAlloc {
            own: req,
            args: vec![AllocRequest::stack(), AllocRequest::stack()],
        })
    }

    fn ir_post(&self, node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        cx.ir.init_sym(node, req)?;

        let [mut a, mut b] = match node.args() {
            [a, b] => [a, b],
            _ => return Err(Error::internal("strcmp without two operands")),
        };
        // literal goes second
        let swapped = a.str_value().is_some();
        if swapped {
            std::mem::swap(&mut a, &mut b);
        }

        let lit: Option<Vec<u8>> = match &b.kind {
            NodeKind::Str(s) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                Some(bytes)
            }
            _ => None,
        };

        let a_off = a
            .irs
            .stack()
            .ok_or_else(|| Error::internal(format!("`{}` is not on the stack", a)))?;
        let b_off = match lit {
            Some(_) => 0,
            None => b
                .irs
                .stack()
                .ok_or_else(|| Error::internal(format!("`{}` is not on the stack", b)))?,
        };
        let len = typed(a)?.size().min(typed(b)?.size());

        let dst = node.irs.reg().unwrap_or(Reg::R0);
        strcmp_emit(&mut cx.ir, dst, a_off, b_off, lit.as_deref(), len)?;
        if swapped {
            cx.ir.emit(Insn::alu64_imm(alu::NEG, dst, 0));
        }

        let irs = node.irs;
        cx.ir.emit_reg_to_sym(&irs, dst)
    }
}

/// Arguments of `mem`/`str` and their result type
fn mem_type_infer(node: &mut Node, cx: &mut InferCtx<'_>) -> Result<()> {
    if node.ty.is_some() {
        return Ok(());
    }
    if node.args().iter().any(|a| a.ty.is_none()) {
        return Ok(());
    }

    let src = &node.args()[0];
    let src_ty = typed(src)?;
    // anything that fits in a pointer register is taken as an address
    if width(src_ty.size()).is_none() {
        return Err(Error::type_error(
            node.loc,
            format!("can not cast `{}`, of type '{}', to a pointer", src, src_ty),
        ));
    }

    let mut len = cx.options.string_size;
    if let Some(arg) = node.args().get(1) {
        let Some(n) = arg.num_value() else {
            return Err(Error::type_error(
                node.loc,
                format!(
                    "length must be a constant, but `{}` is of type '{}'",
                    arg,
                    typed(arg)?
                ),
            ));
        };
        if n > cx.options.max_stack as u64 {
            return Err(Error::type_error(
                node.loc,
                format!(
                    "length is larger than the maximum allowed stack size ({})",
                    cx.options.max_stack
                ),
            ));
        }
        if n == 0 {
            return Err(Error::type_error(node.loc, "length must be at least 1"));
        }
        len = n as usize;
        node.args_mut()[1].is_virtual = true;
    }

    cx.set_type(node, Type::array_of(Type::char(), len));
    Ok(())
}

/// `mem(ptr[, len])`: `len` raw bytes read from `ptr`
pub struct Mem;

impl Builtin for Mem {
    fn static_validate(&self, node: &Node) -> Result<()> {
        expect_args(node, 1, 2)
    }

    fn type_infer(&self, node: &mut Node, cx: &mut InferCtx<'_>) -> Result<()> {
        mem_type_infer(node, cx)
    }

    fn ir_pre(&self, node: &mut Node, req: AllocRequest, _cx: &mut EmitCtx<'_>) -> Result<PreAlloc> {
        Ok(PreAlloc::passthrough(node, req.on_stack()))
    }

    fn ir_post(&self, node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        cx.ir.init_sym(node, req)?;
        let ptr = node.args()[0].irs;
        cx.ir.emit_sym_to_reg(Reg::R3, &ptr)?;
        let dst = node.irs;
        cx.ir.emit_read_to_sym(&dst, Reg::R3)
    }
}

/// `str(ptr[, len])`: NUL-terminated string of at most `len` bytes read
/// from `ptr`
pub struct Str;

impl Builtin for Str {
    fn static_validate(&self, node: &Node) -> Result<()> {
        expect_args(node, 1, 2)
    }

    fn type_infer(&self, node: &mut Node, cx: &mut InferCtx<'_>) -> Result<()> {
        mem_type_infer(node, cx)
    }

    fn ir_pre(&self, node: &mut Node, req: AllocRequest, _cx: &mut EmitCtx<'_>) -> Result<PreAlloc> {
        Ok(PreAlloc::passthrough(node, req.on_stack()))
    }

    fn ir_post(&self, node: &mut Node, req: AllocRequest, cx: &mut EmitCtx<'_>) -> Result<()> {
        cx.ir.init_sym(node, req)?;
        let dst = node.irs;
        let off = dst
            .stack()
            .ok_or_else(|| Error::internal("string buffer not on the stack"))?;

        cx.ir.emit_bzero(off, dst.size);
        cx.ir.emit_sym_to_reg(Reg::R3, &node.args()[0].irs)?;
        cx.ir.emit_ldbp(Reg::R1, off);
        cx.ir.emit(Insn::mov_imm(Reg::R2, dst.size as i32));
        cx.ir.emit_call(Helper::ProbeReadStr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::symtab::SymbolTable;
    use crate::compiler::CompileOptions;
    use crate::types::{Field, TypeRef, TypeRegistry};

    fn infer(op: &dyn Builtin, node: &mut Node) -> Result<()> {
        let mut symbols = SymbolTable::new();
        let types = TypeRegistry::new();
        let options = CompileOptions::default();
        let mut cx = InferCtx {
            symbols: &mut symbols,
            types: &types,
            options: &options,
        };
        op.type_infer(node, &mut cx)
    }

    fn typed_node(mut n: Node, ty: TypeRef) -> Node {
        n.ty = Some(ty);
        n
    }

    fn lit(s: &str) -> Node {
        typed_node(Node::string(s), Type::array_of(Type::char(), s.len() + 1))
    }

    #[test]
    fn test_strcmp_types() {
        let s = typed_node(Node::ident("comm"), Type::array_of(Type::char(), 16));
        let mut n = Node::expr("strcmp", vec![lit("sshd"), s]);
        infer(&Strcmp, &mut n).unwrap();
        assert_eq!(n.ty, Some(Type::int()));
        assert!(n.args()[0].is_virtual);
        assert!(!n.args()[1].is_virtual);
    }

    #[test]
    fn test_strcmp_rejects_non_strings_and_two_literals() {
        let x = typed_node(Node::ident("x"), Type::u64());
        let mut n = Node::expr("strcmp", vec![x, lit("a")]);
        let err = infer(&Strcmp, &mut n).unwrap_err().to_string();
        assert!(err.contains("a string was expected"), "{}", err);

        let mut n = Node::expr("strcmp", vec![lit("a"), lit("b")]);
        assert!(matches!(
            infer(&Strcmp, &mut n),
            Err(Error::TypeError { .. })
        ));

        let one = Node::expr("strcmp", vec![lit("a")]);
        assert!(matches!(
            Strcmp.static_validate(&one),
            Err(Error::Arity { .. })
        ));
    }

    #[test]
    fn test_strcmp_loop_stops_at_literal_nul() {
        let mut ir = Ir::new(512);
        strcmp_emit(&mut ir, Reg::R0, -16, 0, Some(b"ab\0"), 3).unwrap();
        let loads = ir
            .insns()
            .iter()
            .filter(|i| matches!(i, Insn::Op { code, .. } if code & 0x07 == 0x01))
            .count();
        assert_eq!(loads, 3);
        // no compare after the NUL byte
        assert!(matches!(
            ir.insns()[ir.insns().len() - 2],
            Insn::Op { .. }
        ));
    }

    #[test]
    fn test_mem_types() {
        let x = typed_node(Node::ident("x"), Type::u64());
        let mut n = Node::expr("mem", vec![x.clone(), typed_node(Node::num(10), Type::s64())]);
        infer(&Mem, &mut n).unwrap();
        assert_eq!(n.ty, Some(Type::array_of(Type::char(), 10)));
        assert!(n.args()[1].is_virtual);

        let mut n = Node::expr("str", vec![x.clone()]);
        infer(&Str, &mut n).unwrap();
        assert_eq!(n.ty, Some(Type::array_of(Type::char(), 128)));

        let mut n = Node::expr("mem", vec![x.clone(), typed_node(Node::num(10000), Type::s64())]);
        let err = infer(&Mem, &mut n).unwrap_err().to_string();
        assert!(err.contains("maximum allowed stack size (512)"), "{}", err);

        let len = typed_node(Node::ident("n"), Type::int());
        let mut n = Node::expr("mem", vec![x, len]);
        let err = infer(&Mem, &mut n).unwrap_err().to_string();
        assert!(err.contains("length must be a constant"), "{}", err);

        let s = typed_node(Node::ident("s"), Type::array_of(Type::char(), 16));
        let mut n = Node::expr("mem", vec![s]);
        let err = infer(&Mem, &mut n).unwrap_err().to_string();
        assert!(err.contains("to a pointer"), "{}", err);
    }

    #[test]
    fn test_mem_source_needs_pointer_width() {
        let handle = Type::struct_of("handle", vec![Field::new("addr", Type::u64())]);
        let h = typed_node(Node::ident("h"), handle);
        let mut n = Node::expr("mem", vec![h, typed_node(Node::num(4), Type::s64())]);
        infer(&Mem, &mut n).unwrap();
        assert_eq!(n.ty, Some(Type::array_of(Type::char(), 4)));

        let odd = Type::array_of(Type::char(), 3);
        let mut n = Node::expr("str", vec![typed_node(Node::ident("o"), odd)]);
        let err = infer(&Str, &mut n).unwrap_err().to_string();
        assert!(err.contains("can not cast `o`"), "{}", err);
    }
}
