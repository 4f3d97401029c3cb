//! Instruction stream and emission primitives
//!
//! Operators append to one [`Ir`] per probe. Stack slots are handed out
//! downwards from the frame pointer and never reused; virtual registers are
//! numbered in allocation order and assigned to machine registers by
//! [`super::lower`].

use super::instruction::{alu, jmp, width, Helper, Insn, Label, Reg};
use crate::compiler::node::{AllocRequest, Irs, Node, Storage};
use crate::error::{Error, Loc, Result};
use crate::types::{align_up, Type};

/// Instruction stream of one probe
#[derive(Debug, Clone)]
pub struct Ir {
    insns: Vec<Insn>,
    next_label: u32,
    bound: Vec<bool>,
    next_vreg: u32,
    sp: usize,
    max_stack: usize,
}

impl Ir {
    /// Creates an empty stream with a frame of at most `max_stack` bytes
    pub fn new(max_stack: usize) -> Self {
        Self {
            insns: Vec::new(),
            next_label: 0,
            bound: Vec::new(),
            next_vreg: 0,
            sp: 0,
            max_stack,
        }
    }

    /// Emitted instructions
    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    /// Bytes of stack allocated so far
    pub fn stack_size(&self) -> usize {
        self.sp
    }

    /// Whether `label` has been bound
    pub fn is_bound(&self, label: Label) -> bool {
        self.bound.get(label.0 as usize).copied().unwrap_or(false)
    }

    /// Append one instruction
    pub fn emit(&mut self, insn: Insn) {
        tracing::trace!(insn = %insn, "emit");
        self.insns.push(insn);
    }

    /// Reserve a label for a later `emit_label`
    pub fn alloc_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        self.bound.push(false);
        l
    }

    /// Bind `label` to the current position
    pub fn emit_label(&mut self, label: Label) -> Result<()> {
        match self.bound.get_mut(label.0 as usize) {
            Some(b) if !*b => *b = true,
            Some(_) => return Err(Error::internal(format!("label L{} bound twice", label.0))),
            None => return Err(Error::internal(format!("label L{} was never allocated", label.0))),
        }
        self.insns.push(Insn::Label(label));
        Ok(())
    }

    /// Fresh virtual register
    pub fn alloc_reg(&mut self) -> Reg {
        let r = Reg::Virt(self.next_vreg);
        self.next_vreg += 1;
        r
    }

    /// Reserve `size` bytes of stack aligned to `align`, returning the
    /// frame-pointer relative offset of the slot
    pub fn alloc_stack(&mut self, size: usize, align: usize) -> Result<i16> {
        let sp = align_up(self.sp + size.max(1), align.clamp(1, 8));
        if sp > self.max_stack {
            return Err(Error::resource(
                Loc::default(),
                format!(
                    "stack exhausted: {} bytes needed, {} available",
                    sp, self.max_stack
                ),
            ));
        }
        self.sp = sp;
        Ok(-(sp as i16))
    }

    /// Assign storage for a value of type `ty`. Already allocated storage
    /// is kept.
    pub fn init_irs(&mut self, irs: &mut Irs, ty: &Type, req: AllocRequest) -> Result<()> {
        if irs.is_allocated() {
            return Ok(());
        }

        irs.size = ty.size();
        if let Some(off) = req.at {
            irs.loc = Storage::Stack(off);
        } else if ty.is_word() && !req.stack {
            irs.loc = Storage::Reg(self.alloc_reg());
        } else if irs.size > 0 {
            irs.loc = Storage::Stack(self.alloc_stack(irs.size, ty.align())?);
        }
        Ok(())
    }

    /// Assign storage for a node according to its type
    pub fn init_sym(&mut self, node: &mut Node, req: AllocRequest) -> Result<()> {
        let ty = node
            .ty
            .clone()
            .ok_or_else(|| Error::internal(format!("`{}` has no type at emission", node)))?;
        self.init_irs(&mut node.irs, &ty, req)
    }

    /// `dst = fp + off`
    pub fn emit_ldbp(&mut self, dst: Reg, off: i16) {
        self.emit(Insn::mov(dst, Reg::FP));
        self.emit(Insn::alu64_imm(alu::ADD, dst, i32::from(off)));
    }

    /// `dst = &map`
    pub fn emit_ldmap(&mut self, dst: Reg, map: usize) {
        self.emit(Insn::LdMap { dst, map });
    }

    /// Helper call
    pub fn emit_call(&mut self, helper: Helper) {
        self.emit(Insn::call(helper));
    }

    /// Zero `size` bytes of stack at `off`
    pub fn emit_bzero(&mut self, off: i16, size: usize) {
        let mut off = i32::from(off);
        let mut left = size;
        while left > 0 {
            let w = chunk(off, off, left);
            if let Some(sz) = width(w) {
                self.emit(Insn::st_imm(sz, Reg::FP, off as i16, 0));
            }
            off += w as i32;
            left -= w;
        }
    }

    /// Copy `size` bytes of stack from `src` to `dst` through `r0`
    pub fn emit_memcpy(&mut self, dst: i16, src: i16, size: usize) {
        if dst == src {
            return;
        }
        let (mut d, mut s) = (i32::from(dst), i32::from(src));
        let mut left = size;
        while left > 0 {
            let w = chunk(d, s, left);
            if let Some(sz) = width(w) {
                self.emit(Insn::ldx(sz, Reg::R0, Reg::FP, s as i16));
                self.emit(Insn::stx(sz, Reg::FP, Reg::R0, d as i16));
            }
            d += w as i32;
            s += w as i32;
            left -= w;
        }
    }

    /// Store `bytes` to the stack at `off` with immediate stores
    pub fn emit_store_bytes(&mut self, off: i16, bytes: &[u8]) {
        let mut at = i32::from(off);
        let mut i = 0;
        while i < bytes.len() {
            let w = chunk(at, at, (bytes.len() - i).min(4));
            let mut imm = [0u8; 4];
            imm[..w].copy_from_slice(&bytes[i..i + w]);
            if let Some(sz) = width(w) {
                self.emit(Insn::st_imm(sz, Reg::FP, at as i16, i32::from_le_bytes(imm)));
            }
            at += w as i32;
            i += w;
        }
    }

    /// Materialize the constant `value` into a node's storage
    pub fn emit_imm_to_sym(&mut self, dst: &Irs, value: u64) -> Result<()> {
        let small = i32::try_from(value as i64).ok();
        match (dst.loc, small) {
            (Storage::Reg(r), Some(imm)) => self.emit(Insn::mov_imm(r, imm)),
            (Storage::Reg(r), None) => self.emit(Insn::LdImm64 { dst: r, imm: value }),
            (Storage::Stack(off), Some(imm)) => {
                let sz = width(dst.size).ok_or_else(|| {
                    Error::internal(format!("constant stored into {} bytes", dst.size))
                })?;
                self.emit(Insn::st_imm(sz, Reg::FP, off, imm));
            }
            (Storage::Stack(_), None) => {
                self.emit(Insn::LdImm64 {
                    dst: Reg::R0,
                    imm: value,
                });
                self.emit_reg_to_sym(dst, Reg::R0)?;
            }
            (Storage::None, _) => return Err(Error::internal("constant without storage")),
        }
        Ok(())
    }

    /// Load a materialized value into `dst`
    pub fn emit_sym_to_reg(&mut self, dst: Reg, src: &Irs) -> Result<()> {
        match src.loc {
            Storage::Reg(r) => {
                if r != dst {
                    self.emit(Insn::mov(dst, r));
                }
                Ok(())
            }
            Storage::Stack(off) => {
                let sz = width(src.size).ok_or_else(|| {
                    Error::internal(format!("can't load {} bytes into a register", src.size))
                })?;
                self.emit(Insn::ldx(sz, dst, Reg::FP, off));
                Ok(())
            }
            Storage::None => Err(Error::internal("load from a value with no storage")),
        }
    }

    /// Load a node's value into `dst` widened to 64 bits, sign-extending a
    /// narrower signed value
    pub fn emit_widen_to_reg(&mut self, dst: Reg, src: &Irs, signed: bool) -> Result<()> {
        self.emit_sym_to_reg(dst, src)?;
        if signed && src.size < 8 {
            let shift = 64 - 8 * src.size as i32;
            self.emit(Insn::alu64_imm(alu::LSH, dst, shift));
            self.emit(Insn::alu64_imm(alu::ARSH, dst, shift));
        }
        Ok(())
    }

    /// Store register `src` into a node's storage
    pub fn emit_reg_to_sym(&mut self, dst: &Irs, src: Reg) -> Result<()> {
        match dst.loc {
            Storage::Reg(r) => {
                if r != src {
                    self.emit(Insn::mov(r, src));
                }
                Ok(())
            }
            Storage::Stack(off) => {
                let sz = width(dst.size).ok_or_else(|| {
                    Error::internal(format!("can't store a register into {} bytes", dst.size))
                })?;
                self.emit(Insn::stx(sz, Reg::FP, src, off));
                Ok(())
            }
            Storage::None => Err(Error::internal("store to a value with no storage")),
        }
    }

    /// Copy a materialized value to the stack at `off`
    pub fn emit_sym_to_stack(&mut self, off: i16, src: &Irs) -> Result<()> {
        match src.loc {
            Storage::Reg(r) => {
                let sz = width(src.size).ok_or_else(|| {
                    Error::internal(format!("register value of {} bytes", src.size))
                })?;
                self.emit(Insn::stx(sz, Reg::FP, r, off));
                Ok(())
            }
            Storage::Stack(s) => {
                self.emit_memcpy(off, s, src.size);
                Ok(())
            }
            Storage::None => Err(Error::internal("copy from a value with no storage")),
        }
    }

    /// Copy one materialized value onto another
    pub fn emit_sym_to_sym(&mut self, dst: &Irs, src: &Irs) -> Result<()> {
        match dst.loc {
            Storage::Reg(r) => self.emit_sym_to_reg(r, src),
            Storage::Stack(off) => self.emit_sym_to_stack(off, src),
            Storage::None => Err(Error::internal("copy to a value with no storage")),
        }
    }

    /// `probe_read(&dst, dst.size, src)`. Clobbers `r0`-`r5`.
    pub fn emit_read_to_sym(&mut self, dst: &Irs, src: Reg) -> Result<()> {
        let off = dst
            .stack()
            .ok_or_else(|| Error::internal("helper read into a value not on the stack"))?;
        if src != Reg::R3 {
            self.emit(Insn::mov(Reg::R3, src));
        }
        self.emit(Insn::mov_imm(Reg::R2, dst.size as i32));
        self.emit_ldbp(Reg::R1, off);
        self.emit_call(Helper::ProbeRead);
        Ok(())
    }

    /// `if reg == imm goto label`
    pub fn emit_jeq(&mut self, reg: Reg, imm: i32, label: Label) {
        self.emit(Insn::jmp_imm(jmp::JEQ, reg, imm, label));
    }

    /// `if reg != imm goto label`
    pub fn emit_jne(&mut self, reg: Reg, imm: i32, label: Label) {
        self.emit(Insn::jmp_imm(jmp::JNE, reg, imm, label));
    }
}

/// Largest access width usable at both offsets for the remaining length
fn chunk(a: i32, b: i32, left: usize) -> usize {
    [8usize, 4, 2, 1]
        .into_iter()
        .find(|&w| w <= left && a.rem_euclid(w as i32) == 0 && b.rem_euclid(w as i32) == 0)
        .unwrap_or(1)
}
