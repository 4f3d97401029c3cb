//! Lowering from the symbolic stream to encoded BPF
//!
//! Two steps: virtual registers are assigned to the callee-saved registers
//! `r6`-`r8` with a linear scan over live intervals (`r9` holds the probe
//! context), then labels are resolved into relative slot offsets.

use super::instruction::{class, mode, size, Insn, Label, Reg, PSEUDO_MAP_FD};
use super::stream::Ir;
use crate::error::{Error, Loc, Result};
use std::collections::HashMap;

/// Registers available to virtual registers
const ALLOCATABLE: [u8; 3] = [6, 7, 8];

/// Encoded BPF instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInsn {
    /// Full opcode byte
    pub opcode: u8,
    /// Destination register (0-10)
    pub dst: u8,
    /// Source register (0-10)
    pub src: u8,
    /// Signed offset for memory access and jumps
    pub offset: i16,
    /// 32-bit immediate value
    pub imm: i32,
    /// For lddw: upper 32 bits of the 64-bit immediate
    pub imm64_hi: Option<u32>,
}

impl BpfInsn {
    /// Creates a standard 8-byte instruction
    pub fn new(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Self {
        Self {
            opcode,
            dst,
            src,
            offset,
            imm,
            imm64_hi: None,
        }
    }

    /// Creates a 16-byte `lddw`
    pub fn lddw(dst: u8, src: u8, value: u64) -> Self {
        Self {
            opcode: class::LD | size::DW | mode::IMM,
            dst,
            src,
            offset: 0,
            imm: value as i32,
            imm64_hi: Some((value >> 32) as u32),
        }
    }

    /// Little-endian encoding, 16 bytes for `lddw`
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; 8];
        bytes[0] = self.opcode;
        bytes[1] = (self.dst & 0xf) | ((self.src & 0xf) << 4);
        bytes[2..4].copy_from_slice(&self.offset.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.imm.to_le_bytes());

        if let Some(hi) = self.imm64_hi {
            bytes.extend_from_slice(&[0u8; 4]);
            bytes.extend_from_slice(&hi.to_le_bytes());
        }
        bytes
    }

    /// Size in bytes (8, or 16 for `lddw`)
    pub fn size(&self) -> usize {
        if self.imm64_hi.is_some() {
            16
        } else {
            8
        }
    }

    /// Number of 8-byte slots
    pub fn slots(&self) -> usize {
        self.size() / 8
    }
}

/// Map every virtual register in `insns` to a physical one
fn assign_registers(insns: &[Insn]) -> Result<HashMap<u32, u8>> {
    let mut intervals: HashMap<u32, (usize, usize)> = HashMap::new();
    for (i, insn) in insns.iter().enumerate() {
        for reg in insn.regs() {
            if let Reg::Virt(v) = reg {
                let iv = intervals.entry(v).or_insert((i, i));
                iv.1 = i;
            }
        }
    }

    let mut order: Vec<(u32, usize, usize)> =
        intervals.into_iter().map(|(v, (s, e))| (v, s, e)).collect();
    order.sort_by_key(|&(v, s, _)| (s, v));

    let mut assigned = HashMap::new();
    let mut active: Vec<(usize, u8)> = Vec::new();
    let mut free: Vec<u8> = ALLOCATABLE.iter().rev().copied().collect();

    for (v, start, end) in order {
        active.retain(|&(e, r)| {
            if e < start {
                free.push(r);
                false
            } else {
                true
            }
        });

        let reg = free.pop().ok_or_else(|| {
            Error::resource(
                Loc::default(),
                format!(
                    "expression needs more than {} live registers",
                    ALLOCATABLE.len()
                ),
            )
        })?;
        active.push((end, reg));
        assigned.insert(v, reg);
    }

    Ok(assigned)
}

fn phys(reg: Reg, assigned: &HashMap<u32, u8>) -> Result<u8> {
    match reg {
        Reg::Phys(n) => Ok(n),
        Reg::Virt(v) => assigned
            .get(&v)
            .copied()
            .ok_or_else(|| Error::internal(format!("v{} has no register", v))),
    }
}

/// Lower a stream to encoded instructions
pub fn lower(ir: &Ir) -> Result<Vec<BpfInsn>> {
    let insns = ir.insns();
    let assigned = assign_registers(insns)?;

    // Slot of every instruction and label
    let mut slots = Vec::with_capacity(insns.len());
    let mut labels: HashMap<Label, usize> = HashMap::new();
    let mut slot = 0;
    for insn in insns {
        slots.push(slot);
        if let Insn::Label(l) = insn {
            labels.insert(*l, slot);
        }
        slot += insn.slots();
    }

    let mut out = Vec::with_capacity(slot);
    for (insn, &at) in insns.iter().zip(&slots) {
        match insn {
            Insn::Label(_) => {}
            Insn::Op {
                code,
                dst,
                src,
                off,
                imm,
            } => out.push(BpfInsn::new(
                *code,
                phys(*dst, &assigned)?,
                phys(*src, &assigned)?,
                *off,
                *imm,
            )),
            Insn::LdImm64 { dst, imm } => out.push(BpfInsn::lddw(phys(*dst, &assigned)?, 0, *imm)),
            Insn::LdMap { dst, map } => out.push(BpfInsn::lddw(
                phys(*dst, &assigned)?,
                PSEUDO_MAP_FD,
                *map as u64,
            )),
            Insn::Jump {
                code,
                dst,
                src,
                imm,
                target,
            } => {
                let to = *labels
                    .get(target)
                    .ok_or_else(|| Error::internal(format!("jump to unbound label L{}", target.0)))?;
                if to <= at {
                    return Err(Error::internal(format!(
                        "backward jump to L{} at slot {}",
                        target.0, at
                    )));
                }
                let offset = (to - at - 1) as i64;
                if offset > i16::MAX as i64 {
                    return Err(Error::internal(format!("jump offset too large: {}", offset)));
                }
                out.push(BpfInsn::new(
                    *code,
                    phys(*dst, &assigned)?,
                    phys(*src, &assigned)?,
                    offset as i16,
                    *imm,
                ));
            }
        }
    }

    tracing::debug!(
        insns = out.len(),
        vregs = assigned.len(),
        "lowered instruction stream"
    );
    Ok(out)
}

/// Concatenated encoding of a program
pub fn encode_all(program: &[BpfInsn]) -> Vec<u8> {
    program.iter().flat_map(BpfInsn::encode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::instruction::{alu, jmp};

    #[test]
    fn test_lddw_encoding() {
        let i = BpfInsn::lddw(1, PSEUDO_MAP_FD, 3);
        let bytes = i.encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 0x18);
        assert_eq!(bytes[1], 0x11);
        assert_eq!(&bytes[4..8], &3i32.to_le_bytes());
    }

    #[test]
    fn test_jump_offsets_count_lddw_slots() {
        let mut ir = Ir::new(512);
        let done = ir.alloc_label();
        ir.emit(Insn::jmp_imm(jmp::JEQ, Reg::R0, 0, done));
        ir.emit_ldmap(Reg::R1, 0);
        ir.emit(Insn::mov_imm(Reg::R2, 1));
        ir.emit_label(done).unwrap();
        ir.emit(Insn::exit());

        let out = lower(&ir).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].offset, 3);
    }

    #[test]
    fn test_unbound_label_is_internal_error() {
        let mut ir = Ir::new(512);
        let l = ir.alloc_label();
        ir.emit(Insn::ja(l));
        assert!(matches!(lower(&ir), Err(Error::Internal(_))));
    }

    #[test]
    fn test_virtual_registers_reuse_after_last_use() {
        let mut ir = Ir::new(512);
        for _ in 0..5 {
            let v = ir.alloc_reg();
            ir.emit(Insn::mov_imm(v, 1));
            ir.emit(Insn::mov(Reg::R0, v));
        }
        let out = lower(&ir).unwrap();
        assert!(out.iter().all(|i| i.dst <= 8 && i.src <= 8));
    }

    #[test]
    fn test_too_many_live_registers() {
        let mut ir = Ir::new(512);
        let regs: Vec<_> = (0..4).map(|_| ir.alloc_reg()).collect();
        for r in &regs {
            ir.emit(Insn::mov_imm(*r, 1));
        }
        for r in &regs {
            ir.emit(Insn::alu64_reg(alu::ADD, Reg::R0, *r));
        }
        assert!(matches!(lower(&ir), Err(Error::ResourceLimit { .. })));
    }
}
