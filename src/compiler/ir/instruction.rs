//! BPF instruction definitions
//!
//! Instructions are kept symbolic until lowering: registers may be virtual
//! and jumps name a [`Label`] instead of an offset.

use std::fmt;

// =============================================================================
// INSTRUCTION ENCODING
// =============================================================================

/// Instruction classes (lower 3 bits)
pub mod class {
    /// Wide immediate load (`lddw`)
    pub const LD: u8 = 0x00;
    /// Load from memory
    pub const LDX: u8 = 0x01;
    /// Store immediate
    pub const ST: u8 = 0x02;
    /// Store register
    pub const STX: u8 = 0x03;
    /// 32-bit ALU
    pub const ALU: u8 = 0x04;
    /// 64-bit jumps
    pub const JMP: u8 = 0x05;
    /// 64-bit ALU
    pub const ALU64: u8 = 0x07;
}

/// ALU operation codes (bits 4-7)
pub mod alu {
    /// Addition
    pub const ADD: u8 = 0x00;
    /// Subtraction
    pub const SUB: u8 = 0x10;
    /// Multiplication
    pub const MUL: u8 = 0x20;
    /// Left shift
    pub const LSH: u8 = 0x60;
    /// Negation
    pub const NEG: u8 = 0x80;
    /// Arithmetic right shift
    pub const ARSH: u8 = 0xc0;
    /// Move
    pub const MOV: u8 = 0xb0;
}

/// Jump operation codes
pub mod jmp {
    /// Unconditional
    pub const JA: u8 = 0x00;
    /// ==
    pub const JEQ: u8 = 0x10;
    /// !=
    pub const JNE: u8 = 0x50;
    /// Helper call
    pub const CALL: u8 = 0x80;
    /// Return
    pub const EXIT: u8 = 0x90;
}

/// Memory size modifiers
pub mod size {
    /// 32-bit word
    pub const W: u8 = 0x00;
    /// 16-bit half
    pub const H: u8 = 0x08;
    /// 8-bit byte
    pub const B: u8 = 0x10;
    /// 64-bit double word
    pub const DW: u8 = 0x18;
}

/// Memory mode modifiers
pub mod mode {
    /// Immediate (lddw)
    pub const IMM: u8 = 0x00;
    /// Memory (reg + offset)
    pub const MEM: u8 = 0x60;
}

/// Operand is an immediate
pub const SRC_IMM: u8 = 0x00;
/// Operand is a register
pub const SRC_REG: u8 = 0x08;

/// `lddw` source marker for a map reference
pub const PSEUDO_MAP_FD: u8 = 1;

/// Size modifier for an access of `bytes` bytes
pub fn width(bytes: usize) -> Option<u8> {
    match bytes {
        1 => Some(size::B),
        2 => Some(size::H),
        4 => Some(size::W),
        8 => Some(size::DW),
        _ => None,
    }
}

/// Access width in bytes of a size modifier
pub fn width_bytes(sz: u8) -> usize {
    match sz & 0x18 {
        size::B => 1,
        size::H => 2,
        size::W => 4,
        _ => 8,
    }
}

// =============================================================================
// REGISTERS AND HELPERS
// =============================================================================

/// Register operand: physical, or virtual until lowering assigns one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// Physical register r0-r10
    Phys(u8),
    /// Virtual register
    Virt(u32),
}

impl Reg {
    /// Return value / scratch
    pub const R0: Reg = Reg::Phys(0);
    /// Argument 1
    pub const R1: Reg = Reg::Phys(1);
    /// Argument 2
    pub const R2: Reg = Reg::Phys(2);
    /// Argument 3
    pub const R3: Reg = Reg::Phys(3);
    /// Argument 4
    pub const R4: Reg = Reg::Phys(4);
    /// Saved probe context
    pub const CTX: Reg = Reg::Phys(9);
    /// Frame pointer (read-only)
    pub const FP: Reg = Reg::Phys(10);
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Phys(n) => write!(f, "r{}", n),
            Reg::Virt(n) => write!(f, "v{}", n),
        }
    }
}

/// Kernel helper functions, called by numeric id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Helper {
    /// `void *map_lookup_elem(map, key)`
    MapLookupElem = 1,
    /// `int map_update_elem(map, key, value, flags)`
    MapUpdateElem = 2,
    /// `int map_delete_elem(map, key)`
    MapDeleteElem = 3,
    /// `int probe_read(dst, size, unsafe_src)`
    ProbeRead = 4,
    /// `int probe_read_str(dst, size, unsafe_src)`
    ProbeReadStr = 45,
}

impl Helper {
    /// Helper for a numeric id
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(Helper::MapLookupElem),
            2 => Some(Helper::MapUpdateElem),
            3 => Some(Helper::MapDeleteElem),
            4 => Some(Helper::ProbeRead),
            45 => Some(Helper::ProbeReadStr),
            _ => None,
        }
    }
}

/// Forward jump target, bound with `Ir::emit_label`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

// =============================================================================
// INSTRUCTIONS
// =============================================================================

/// Symbolic BPF instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// One 8-byte instruction
    Op {
        /// Full opcode byte
        code: u8,
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
        /// Signed offset for memory access
        off: i16,
        /// 32-bit immediate
        imm: i32,
    },
    /// 64-bit immediate load (two slots)
    LdImm64 {
        /// Destination register
        dst: Reg,
        /// Value
        imm: u64,
    },
    /// Map reference load (two slots)
    LdMap {
        /// Destination register
        dst: Reg,
        /// Map id
        map: usize,
    },
    /// Jump to a label
    Jump {
        /// Full opcode byte
        code: u8,
        /// Compared register
        dst: Reg,
        /// Compared register, for register-operand jumps
        src: Reg,
        /// Compared immediate
        imm: i32,
        /// Target
        target: Label,
    },
    /// Label binding point, emits nothing
    Label(Label),
}

impl Insn {
    fn op(code: u8, dst: Reg, src: Reg, off: i16, imm: i32) -> Self {
        Insn::Op {
            code,
            dst,
            src,
            off,
            imm,
        }
    }

    /// 64-bit ALU operation with immediate operand
    pub fn alu64_imm(op: u8, dst: Reg, imm: i32) -> Self {
        Self::op(class::ALU64 | op | SRC_IMM, dst, Reg::R0, 0, imm)
    }

    /// 64-bit ALU operation with register operand
    pub fn alu64_reg(op: u8, dst: Reg, src: Reg) -> Self {
        Self::op(class::ALU64 | op | SRC_REG, dst, src, 0, 0)
    }

    /// 32-bit ALU operation with immediate operand
    pub fn alu32_imm(op: u8, dst: Reg, imm: i32) -> Self {
        Self::op(class::ALU | op | SRC_IMM, dst, Reg::R0, 0, imm)
    }

    /// 32-bit ALU operation with register operand
    pub fn alu32_reg(op: u8, dst: Reg, src: Reg) -> Self {
        Self::op(class::ALU | op | SRC_REG, dst, src, 0, 0)
    }

    /// `dst = imm`
    pub fn mov_imm(dst: Reg, imm: i32) -> Self {
        Self::alu64_imm(alu::MOV, dst, imm)
    }

    /// `dst = src`
    pub fn mov(dst: Reg, src: Reg) -> Self {
        Self::alu64_reg(alu::MOV, dst, src)
    }

    /// `dst = *(src + off)`
    pub fn ldx(sz: u8, dst: Reg, src: Reg, off: i16) -> Self {
        Self::op(class::LDX | sz | mode::MEM, dst, src, off, 0)
    }

    /// `*(dst + off) = src`
    pub fn stx(sz: u8, dst: Reg, src: Reg, off: i16) -> Self {
        Self::op(class::STX | sz | mode::MEM, dst, src, off, 0)
    }

    /// `*(dst + off) = imm`
    pub fn st_imm(sz: u8, dst: Reg, off: i16, imm: i32) -> Self {
        Self::op(class::ST | sz | mode::MEM, dst, Reg::R0, off, imm)
    }

    /// Helper call
    pub fn call(helper: Helper) -> Self {
        Self::op(class::JMP | jmp::CALL, Reg::R0, Reg::R0, 0, helper as i32)
    }

    /// Return from the program
    pub fn exit() -> Self {
        Self::op(class::JMP | jmp::EXIT, Reg::R0, Reg::R0, 0, 0)
    }

    /// Conditional jump on an immediate
    pub fn jmp_imm(op: u8, dst: Reg, imm: i32, target: Label) -> Self {
        Insn::Jump {
            code: class::JMP | op | SRC_IMM,
            dst,
            src: Reg::R0,
            imm,
            target,
        }
    }

    /// Unconditional jump
    pub fn ja(target: Label) -> Self {
        Insn::Jump {
            code: class::JMP | jmp::JA,
            dst: Reg::R0,
            src: Reg::R0,
            imm: 0,
            target,
        }
    }

    /// Number of 8-byte slots this instruction occupies once encoded
    pub fn slots(&self) -> usize {
        match self {
            Insn::LdImm64 { .. } | Insn::LdMap { .. } => 2,
            Insn::Label(_) => 0,
            _ => 1,
        }
    }

    /// Registers read or written
    pub fn regs(&self) -> Vec<Reg> {
        match self {
            Insn::Op { dst, src, .. } | Insn::Jump { dst, src, .. } => vec![*dst, *src],
            Insn::LdImm64 { dst, .. } | Insn::LdMap { dst, .. } => vec![*dst],
            Insn::Label(_) => vec![],
        }
    }

    /// Helper called by this instruction
    pub fn helper(&self) -> Option<Helper> {
        match self {
            Insn::Op { code, imm, .. } if *code == class::JMP | jmp::CALL => Helper::from_id(*imm),
            _ => None,
        }
    }
}

fn alu_name(op: u8) -> &'static str {
    match op {
        alu::ADD => "add",
        alu::SUB => "sub",
        alu::MUL => "mul",
        alu::LSH => "lsh",
        alu::ARSH => "arsh",
        alu::NEG => "neg",
        alu::MOV => "mov",
        _ => "alu?",
    }
}

fn jmp_name(op: u8) -> &'static str {
    match op {
        jmp::JA => "ja",
        jmp::JEQ => "jeq",
        jmp::JNE => "jne",
        _ => "j?",
    }
}

fn size_suffix(code: u8) -> &'static str {
    match code & 0x18 {
        size::B => "b",
        size::H => "h",
        size::W => "w",
        _ => "dw",
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Label(l) => write!(f, "L{}:", l.0),
            Insn::LdImm64 { dst, imm } => write!(f, "lddw {}, {:#x}", dst, imm),
            Insn::LdMap { dst, map } => write!(f, "lddw {}, map#{}", dst, map),
            Insn::Jump {
                code,
                dst,
                src,
                imm,
                target,
            } => {
                let op = code & 0xf0;
                if op == jmp::JA {
                    write!(f, "ja L{}", target.0)
                } else if code & SRC_REG != 0 {
                    write!(f, "{} {}, {}, L{}", jmp_name(op), dst, src, target.0)
                } else {
                    write!(f, "{} {}, {}, L{}", jmp_name(op), dst, imm, target.0)
                }
            }
            Insn::Op {
                code,
                dst,
                src,
                off,
                imm,
            } => {
                let op = code & 0xf0;
                match code & 0x07 {
                    class::ALU64 | class::ALU => {
                        let suffix = if code & 0x07 == class::ALU { "32" } else { "" };
                        if op == alu::NEG {
                            write!(f, "neg{} {}", suffix, dst)
                        } else if code & SRC_REG != 0 {
                            write!(f, "{}{} {}, {}", alu_name(op), suffix, dst, src)
                        } else {
                            write!(f, "{}{} {}, {}", alu_name(op), suffix, dst, imm)
                        }
                    }
                    class::LDX => write!(f, "ldx{} {}, [{}{:+}]", size_suffix(*code), dst, src, off),
                    class::STX => write!(f, "stx{} [{}{:+}], {}", size_suffix(*code), dst, off, src),
                    class::ST => write!(f, "st{} [{}{:+}], {}", size_suffix(*code), dst, off, imm),
                    class::JMP if op == jmp::CALL => match Helper::from_id(*imm) {
                        Some(h) => write!(f, "call {:?}", h),
                        None => write!(f, "call {}", imm),
                    },
                    class::JMP if op == jmp::EXIT => write!(f, "exit"),
                    _ => write!(f, ".byte {:#04x}", code),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_bytes() {
        match Insn::mov_imm(Reg::R0, 42) {
            Insn::Op { code, imm, .. } => {
                assert_eq!(code, 0xb7);
                assert_eq!(imm, 42);
            }
            other => panic!("unexpected {:?}", other),
        }
        match Insn::ldx(size::B, Reg::R1, Reg::FP, -8) {
            Insn::Op { code, .. } => assert_eq!(code, 0x71),
            other => panic!("unexpected {:?}", other),
        }
        match Insn::call(Helper::ProbeRead) {
            Insn::Op { code, imm, .. } => {
                assert_eq!(code, 0x85);
                assert_eq!(imm, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_widths() {
        assert_eq!(width(4), Some(size::W));
        assert_eq!(width(3), None);
        assert_eq!(width_bytes(size::H), 2);
        assert_eq!(width_bytes(size::DW), 8);
    }

    #[test]
    fn test_display() {
        assert_eq!(Insn::ldx(size::W, Reg::Virt(1), Reg::FP, -8).to_string(), "ldxw v1, [r10-8]");
        assert_eq!(Insn::alu32_imm(alu::SUB, Reg::R0, 97).to_string(), "sub32 r0, 97");
        assert_eq!(Insn::call(Helper::MapLookupElem).to_string(), "call MapLookupElem");
        assert_eq!(Insn::jmp_imm(jmp::JNE, Reg::R0, 0, Label(3)).to_string(), "jne r0, 0, L3");
    }
}
