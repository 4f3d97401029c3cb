//! # BPF Program Verifier
//!
//! Checks a lowered program against the static constraints of the in-kernel
//! verifier before it is handed to a loader.

use super::ir::instruction::{class, jmp, mode, size, width_bytes};
use super::ir::BpfInsn;

/// `lddw` opcode
const LDDW: u8 = class::LD | size::DW | mode::IMM;

/// Maximum number of instructions in one program
pub const MAX_INSTRUCTIONS: usize = 4096;

/// Frame pointer register
const FP: u8 = 10;

/// Verification result with warnings
#[derive(Debug)]
pub struct VerifyResult {
    /// Program may be loaded
    pub valid: bool,
    /// Errors that prevent loading
    pub errors: Vec<VerifyError>,
    /// Warnings (non-fatal)
    pub warnings: Vec<String>,
    /// Statistics
    pub stats: ProgramStats,
}

/// Program statistics
#[derive(Debug, Default)]
pub struct ProgramStats {
    /// Total instruction count
    pub instruction_count: usize,
    /// Total bytecode size in bytes
    pub bytecode_size: usize,
    /// Deepest frame-pointer relative access, in bytes
    pub max_stack_depth: usize,
    /// Number of helper calls
    pub helper_calls: usize,
    /// Number of jumps
    pub jumps: usize,
}

/// Verification error types
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// Program has no instructions
    EmptyProgram,

    /// Program exceeds instruction limit.
    TooManyInstructions {
        /// Actual instruction count in the program
        count: usize,
        /// Maximum allowed instructions
        limit: usize,
    },

    /// Jump target out of bounds.
    JumpOutOfBounds {
        /// Slot of the jump instruction
        slot: usize,
        /// Target slot position
        target: i64,
    },

    /// Jump to itself or an earlier slot.
    BackwardJump {
        /// Slot of the jump instruction
        slot: usize,
        /// Target slot position
        target: i64,
    },

    /// Invalid register number.
    InvalidRegister {
        /// Slot of the instruction
        slot: usize,
        /// Invalid register number (must be 0-10)
        reg: u8,
    },

    /// Write to the read-only frame pointer.
    FramePointerWrite {
        /// Slot of the instruction
        slot: usize,
    },

    /// Stack access outside the frame.
    StackOutOfBounds {
        /// Slot of the instruction
        slot: usize,
        /// Frame pointer relative offset
        offset: i16,
        /// Access width in bytes
        width: usize,
    },

    /// `lddw` without its second slot.
    TruncatedWideLoad {
        /// Slot of the instruction
        slot: usize,
    },

    /// Last instruction is not `exit`.
    NoExitInstruction,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::EmptyProgram => write!(f, "Program is empty"),
            VerifyError::TooManyInstructions { count, limit } => {
                write!(f, "Too many instructions: {} (limit: {})", count, limit)
            }
            VerifyError::JumpOutOfBounds { slot, target } => {
                write!(f, "Jump at slot {} targets out of bounds: {}", slot, target)
            }
            VerifyError::BackwardJump { slot, target } => {
                write!(f, "Jump at slot {} goes backwards to {}", slot, target)
            }
            VerifyError::InvalidRegister { slot, reg } => {
                write!(f, "Invalid register {} at slot {}", reg, slot)
            }
            VerifyError::FramePointerWrite { slot } => {
                write!(f, "Write to r10 at slot {}", slot)
            }
            VerifyError::StackOutOfBounds {
                slot,
                offset,
                width,
            } => write!(
                f,
                "Stack access of {} bytes at r10{:+} out of frame (slot {})",
                width, offset, slot
            ),
            VerifyError::TruncatedWideLoad { slot } => {
                write!(f, "lddw at slot {} is missing its second half", slot)
            }
            VerifyError::NoExitInstruction => {
                write!(f, "Program does not end with an exit instruction")
            }
        }
    }
}

/// BPF program verifier
pub struct Verifier {
    /// Maximum allowed instructions
    max_instructions: usize,
    /// Frame size in bytes
    max_stack: usize,
    /// Strict mode (treat warnings as errors)
    strict: bool,
}

impl Verifier {
    /// Creates a verifier with kernel defaults.
    ///
    /// Defaults:
    /// - `max_instructions`: [`MAX_INSTRUCTIONS`]
    /// - `max_stack`: 512
    /// - `strict`: `false` (warnings don't fail verification)
    pub fn new() -> Self {
        Self {
            max_instructions: MAX_INSTRUCTIONS,
            max_stack: 512,
            strict: false,
        }
    }

    /// Enable strict mode
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Set custom instruction limit
    pub fn max_instructions(mut self, limit: usize) -> Self {
        self.max_instructions = limit;
        self
    }

    /// Set the frame size
    pub fn max_stack(mut self, bytes: usize) -> Self {
        self.max_stack = bytes;
        self
    }

    /// Verify a program
    pub fn verify(&self, program: &[BpfInsn]) -> VerifyResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let mut stats = ProgramStats {
            instruction_count: program.len(),
            bytecode_size: program.iter().map(BpfInsn::size).sum(),
            ..ProgramStats::default()
        };

        if program.is_empty() {
            errors.push(VerifyError::EmptyProgram);
        }

        // lddw takes 2 slots, all others take 1 slot
        let mut slot_positions: Vec<usize> = Vec::with_capacity(program.len());
        let mut current_slot: usize = 0;
        for instr in program.iter() {
            slot_positions.push(current_slot);
            current_slot += instr.slots();
        }
        let total_slots = current_slot;

        if total_slots > self.max_instructions {
            errors.push(VerifyError::TooManyInstructions {
                count: total_slots,
                limit: self.max_instructions,
            });
        }

        for (instr, &slot) in program.iter().zip(&slot_positions) {
            let op_class = instr.opcode & 0x07;
            let op_code = instr.opcode & 0xf0;

            for reg in [instr.dst, instr.src] {
                if reg > 10 {
                    errors.push(VerifyError::InvalidRegister { slot, reg });
                }
            }

            let writes_dst = matches!(op_class, class::ALU | class::ALU64 | class::LDX)
                || instr.opcode == LDDW;
            if writes_dst && instr.dst == FP {
                errors.push(VerifyError::FramePointerWrite { slot });
            }

            if instr.opcode == LDDW && instr.imm64_hi.is_none() {
                errors.push(VerifyError::TruncatedWideLoad { slot });
            }

            // Frame pointer relative memory access
            let base = match op_class {
                class::LDX => Some(instr.src),
                class::ST | class::STX => Some(instr.dst),
                _ => None,
            };
            if base == Some(FP) {
                let width = width_bytes(instr.opcode);
                let lo = i64::from(instr.offset);
                let hi = lo + width as i64;
                if lo < -(self.max_stack as i64) || hi > 0 {
                    errors.push(VerifyError::StackOutOfBounds {
                        slot,
                        offset: instr.offset,
                        width,
                    });
                } else {
                    stats.max_stack_depth = stats.max_stack_depth.max((-lo) as usize);
                }
            }

            if op_class == class::JMP {
                match op_code {
                    jmp::CALL => stats.helper_calls += 1,
                    jmp::EXIT => {}
                    _ => {
                        stats.jumps += 1;
                        // PC = current_slot + 1 + offset
                        let target = slot as i64 + 1 + i64::from(instr.offset);
                        if target <= slot as i64 {
                            errors.push(VerifyError::BackwardJump { slot, target });
                        } else if target as usize >= total_slots {
                            errors.push(VerifyError::JumpOutOfBounds { slot, target });
                        }
                    }
                }
            }
        }

        let ends_in_exit = program
            .last()
            .is_some_and(|i| i.opcode == class::JMP | jmp::EXIT);
        if !program.is_empty() && !ends_in_exit {
            errors.push(VerifyError::NoExitInstruction);
        }

        if stats.max_stack_depth > self.max_stack * 3 / 4 {
            warnings.push(format!(
                "Stack usage {} bytes is close to the {} byte frame",
                stats.max_stack_depth, self.max_stack
            ));
        }
        for w in &warnings {
            tracing::warn!(warning = %w, "verifier");
        }

        let valid = errors.is_empty() && (!self.strict || warnings.is_empty());

        VerifyResult {
            valid,
            errors,
            warnings,
            stats,
        }
    }
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit() -> BpfInsn {
        BpfInsn::new(0x95, 0, 0, 0, 0)
    }

    #[test]
    fn test_empty_program() {
        let result = Verifier::new().verify(&[]);
        assert!(!result.valid);
        assert_eq!(result.errors, vec![VerifyError::EmptyProgram]);
    }

    #[test]
    fn test_simple_valid_program() {
        let program = vec![
            BpfInsn::new(0xb7, 0, 0, 0, 42), // mov64 r0, 42
            exit(),
        ];
        let result = Verifier::new().verify(&program);
        assert!(result.valid, "Errors: {:?}", result.errors);
        assert_eq!(result.stats.bytecode_size, 16);
    }

    #[test]
    fn test_no_exit_error() {
        let program = vec![BpfInsn::new(0xb7, 0, 0, 0, 42)];
        let result = Verifier::new().verify(&program);
        assert!(!result.valid);
        assert!(result.errors.contains(&VerifyError::NoExitInstruction));
    }

    #[test]
    fn test_invalid_register_and_fp_write() {
        let program = vec![
            BpfInsn::new(0xb7, 15, 0, 0, 42),
            BpfInsn::new(0xb7, 10, 0, 0, 0),
            exit(),
        ];
        let result = Verifier::new().verify(&program);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::InvalidRegister { reg: 15, .. })));
        assert!(result
            .errors
            .contains(&VerifyError::FramePointerWrite { slot: 1 }));
    }

    #[test]
    fn test_jumps_must_go_forward() {
        let program = vec![
            BpfInsn::new(0x05, 0, 0, -1, 0), // ja -1 (to itself)
            BpfInsn::new(0x15, 0, 0, 5, 0),  // jeq past the end
            exit(),
        ];
        let result = Verifier::new().verify(&program);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::BackwardJump { slot: 0, .. })));
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::JumpOutOfBounds { slot: 1, .. })));
    }

    #[test]
    fn test_stack_bounds() {
        let program = vec![
            BpfInsn::new(0x7a, 10, 0, -520, 0), // stdw [r10-520], 0
            BpfInsn::new(0x61, 0, 10, -2, 0),   // ldxw r0, [r10-2]
            BpfInsn::new(0x71, 0, 10, -1, 0),   // ldxb r0, [r10-1]
            exit(),
        ];
        let result = Verifier::new().verify(&program);
        let oob: Vec<_> = result
            .errors
            .iter()
            .filter(|e| matches!(e, VerifyError::StackOutOfBounds { .. }))
            .collect();
        assert_eq!(oob.len(), 2);
    }

    #[test]
    fn test_truncated_lddw() {
        let program = vec![BpfInsn::new(0x18, 1, 0, 0, 0), exit()];
        let result = Verifier::new().verify(&program);
        assert!(result
            .errors
            .contains(&VerifyError::TruncatedWideLoad { slot: 0 }));
    }
}
