//! Minimal BPF interpreter for running compiled probes in tests
//!
//! Supports exactly what the compiler emits: 32/64-bit `mov add sub mul
//! neg`, loads and stores, `ja jeq jne`, `lddw` (plain and map
//! references), `exit`, and the map and probe-read helpers.

#![allow(dead_code)]

use probec::compiler::MapSpec;
use probec::{CompileOptions, CompiledProbe, Compiler, Probe};
use std::collections::HashMap;

pub const STACK_BASE: u64 = 0x1000_0000;
pub const CTX_BASE: u64 = 0x2000_0000;
pub const KMEM_BASE: u64 = 0x3000_0000;
const VALUE_BASE: u64 = 0x4000_0000;
const VALUE_STRIDE: u64 = 0x1000;
const MAP_HANDLE: u64 = 0x5000_0000;

const STEP_LIMIT: usize = 100_000;

/// Byte that fills the stack before a run, so unwritten bytes are visible
pub const POISON: u8 = 0xAA;

/// One map and its values; values live in an arena so lookups can hand
/// out stable addresses
#[derive(Debug, Default)]
pub struct FakeMap {
    pub key_size: usize,
    pub value_size: usize,
    index: HashMap<Vec<u8>, usize>,
    arena: Vec<Vec<u8>>,
}

impl FakeMap {
    fn new(spec: &MapSpec) -> Self {
        Self {
            key_size: spec.key_size,
            value_size: spec.value_size,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.index.get(key).map(|&i| self.arena[i].as_slice())
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> usize {
        assert_eq!(key.len(), self.key_size, "key width");
        assert_eq!(value.len(), self.value_size, "value width");
        match self.index.get(key) {
            Some(&i) => {
                self.arena[i] = value.to_vec();
                i
            }
            None => {
                self.arena.push(value.to_vec());
                self.index.insert(key.to_vec(), self.arena.len() - 1);
                self.arena.len() - 1
            }
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        self.index.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }
}

/// Machine state for one run
pub struct Vm {
    pub regs: [u64; 11],
    pub stack: Vec<u8>,
    pub ctx: Vec<u8>,
    pub kmem: Vec<u8>,
    pub maps: Vec<FakeMap>,
    pub helper_calls: Vec<i32>,
}

impl Vm {
    pub fn new(probe: &CompiledProbe, ctx: Vec<u8>) -> Self {
        Self {
            regs: [0; 11],
            stack: vec![POISON; 512],
            ctx,
            kmem: Vec::new(),
            maps: probe.maps.iter().map(FakeMap::new).collect(),
            helper_calls: Vec::new(),
        }
    }

    pub fn with_kmem(mut self, kmem: Vec<u8>) -> Self {
        self.kmem = kmem;
        self
    }

    pub fn map(&self, name: &str, probe: &CompiledProbe) -> &FakeMap {
        let spec = probe
            .maps
            .iter()
            .find(|m| m.name == name)
            .unwrap_or_else(|| panic!("no map `{}`", name));
        &self.maps[spec.id]
    }

    pub fn map_mut(&mut self, name: &str, probe: &CompiledProbe) -> &mut FakeMap {
        let id = probe
            .maps
            .iter()
            .find(|m| m.name == name)
            .unwrap_or_else(|| panic!("no map `{}`", name))
            .id;
        &mut self.maps[id]
    }

    fn region(&mut self, addr: u64, len: usize) -> &mut [u8] {
        let end = addr + len as u64;
        let (mem, base): (&mut [u8], u64) = if (STACK_BASE..STACK_BASE + 512).contains(&addr) {
            (self.stack.as_mut_slice(), STACK_BASE)
        } else if (CTX_BASE..CTX_BASE + self.ctx.len() as u64).contains(&addr) {
            (self.ctx.as_mut_slice(), CTX_BASE)
        } else if (KMEM_BASE..KMEM_BASE + self.kmem.len() as u64).contains(&addr) {
            (self.kmem.as_mut_slice(), KMEM_BASE)
        } else if addr >= VALUE_BASE && addr < MAP_HANDLE {
            let slot = ((addr - VALUE_BASE) / VALUE_STRIDE) as usize;
            let map = slot / 0x100;
            let idx = slot % 0x100;
            let value = &mut self.maps[map].arena[idx];
            let base = VALUE_BASE + slot as u64 * VALUE_STRIDE;
            (value.as_mut_slice(), base)
        } else {
            panic!("access to unmapped address {:#x}", addr);
        };
        let lo = (addr - base) as usize;
        let hi = (end - base) as usize;
        assert!(hi <= mem.len(), "access past the end of region at {:#x}", addr);
        &mut mem[lo..hi]
    }

    fn load(&mut self, addr: u64, width: usize) -> u64 {
        let bytes = self.region(addr, width);
        let mut buf = [0u8; 8];
        buf[..width].copy_from_slice(bytes);
        u64::from_le_bytes(buf)
    }

    fn store(&mut self, addr: u64, width: usize, value: u64) {
        let bytes = value.to_le_bytes();
        self.region(addr, width).copy_from_slice(&bytes[..width]);
    }

    fn read(&mut self, addr: u64, len: usize) -> Vec<u8> {
        self.region(addr, len).to_vec()
    }

    fn map_of(&self, handle: u64) -> usize {
        assert!(handle >= MAP_HANDLE, "not a map reference: {:#x}", handle);
        (handle - MAP_HANDLE) as usize
    }

    fn call(&mut self, id: i32) -> u64 {
        self.helper_calls.push(id);
        let [_, r1, r2, r3, ..] = self.regs;
        match id {
            // map_lookup_elem
            1 => {
                let map = self.map_of(r1);
                let key = self.read(r2, self.maps[map].key_size);
                match self.maps[map].index.get(&key) {
                    Some(&i) => VALUE_BASE + ((map * 0x100 + i) as u64) * VALUE_STRIDE,
                    None => 0,
                }
            }
            // map_update_elem
            2 => {
                let map = self.map_of(r1);
                let key = self.read(r2, self.maps[map].key_size);
                let value = self.read(r3, self.maps[map].value_size);
                self.maps[map].insert(&key, &value);
                0
            }
            // map_delete_elem
            3 => {
                let map = self.map_of(r1);
                let key = self.read(r2, self.maps[map].key_size);
                if self.maps[map].remove(&key) {
                    0
                } else {
                    (-2i64) as u64
                }
            }
            // probe_read
            4 => {
                let data = self.read(r3, r2 as usize);
                self.region(r1, r2 as usize).copy_from_slice(&data);
                0
            }
            // probe_read_str
            45 => {
                let max = r2 as usize;
                let mut data = Vec::with_capacity(max);
                while data.len() + 1 < max {
                    let b = self.read(r3 + data.len() as u64, 1)[0];
                    if b == 0 {
                        break;
                    }
                    data.push(b);
                }
                data.push(0);
                let n = data.len();
                self.region(r1, n).copy_from_slice(&data);
                n as u64
            }
            other => panic!("unknown helper {}", other),
        }
    }

    /// Run `bytecode` to `exit`, returning `r0`
    pub fn run(&mut self, bytecode: &[u8]) -> u64 {
        let slots: Vec<&[u8]> = bytecode.chunks(8).collect();
        self.regs[1] = CTX_BASE;
        self.regs[10] = STACK_BASE + 512;

        let mut pc = 0usize;
        for _ in 0..STEP_LIMIT {
            let s = slots[pc];
            let op = s[0];
            let dst = (s[1] & 0xf) as usize;
            let src = (s[1] >> 4) as usize;
            let off = i16::from_le_bytes([s[2], s[3]]) as i64;
            let imm = i32::from_le_bytes([s[4], s[5], s[6], s[7]]);

            let class = op & 0x07;
            let code = op & 0xf0;
            let width = match op & 0x18 {
                0x00 => 4,
                0x08 => 2,
                0x10 => 1,
                _ => 8,
            };
            pc += 1;

            match class {
                // lddw
                0x00 => {
                    assert_eq!(op, 0x18, "unsupported ld opcode {:#x}", op);
                    let hi = i32::from_le_bytes([
                        slots[pc][4],
                        slots[pc][5],
                        slots[pc][6],
                        slots[pc][7],
                    ]);
                    let value = (imm as u32 as u64) | ((hi as u32 as u64) << 32);
                    self.regs[dst] = if src == 1 { MAP_HANDLE + value } else { value };
                    pc += 1;
                }
                // ldx
                0x01 => {
                    let addr = self.regs[src].wrapping_add(off as u64);
                    self.regs[dst] = self.load(addr, width);
                }
                // st
                0x02 => {
                    let addr = self.regs[dst].wrapping_add(off as u64);
                    self.store(addr, width, imm as i64 as u64);
                }
                // stx
                0x03 => {
                    let addr = self.regs[dst].wrapping_add(off as u64);
                    self.store(addr, width, self.regs[src]);
                }
                // alu / alu64
                0x04 | 0x07 => {
                    let is64 = class == 0x07;
                    let operand = if op & 0x08 != 0 {
                        self.regs[src]
                    } else {
                        imm as i64 as u64
                    };
                    let a = self.regs[dst];
                    let r = match code {
                        0x00 => a.wrapping_add(operand),
                        0x10 => a.wrapping_sub(operand),
                        0x20 => a.wrapping_mul(operand),
                        0x60 => a.wrapping_shl(operand as u32),
                        0x80 => a.wrapping_neg(),
                        0xb0 => operand,
                        0xc0 if is64 => ((a as i64) >> (operand & 63)) as u64,
                        0xc0 => ((a as i32) >> (operand & 31)) as u32 as u64,
                        other => panic!("unsupported alu op {:#x}", other),
                    };
                    self.regs[dst] = if is64 { r } else { r as u32 as u64 };
                }
                // jmp
                0x05 => match code {
                    0x00 => pc = (pc as i64 + off) as usize,
                    0x10 | 0x50 => {
                        let rhs = if op & 0x08 != 0 {
                            self.regs[src]
                        } else {
                            imm as i64 as u64
                        };
                        let eq = self.regs[dst] == rhs;
                        if eq == (code == 0x10) {
                            pc = (pc as i64 + off) as usize;
                        }
                    }
                    0x80 => {
                        self.regs[0] = self.call(imm);
                        // helper calls clobber the argument registers
                        for r in 1..=5 {
                            self.regs[r] = 0xdead_beef;
                        }
                    }
                    0x90 => return self.regs[0],
                    other => panic!("unsupported jmp op {:#x}", other),
                },
                other => panic!("unsupported class {:#x}", other),
            }
        }
        panic!("program did not exit within {} steps", STEP_LIMIT);
    }
}

/// Compile with default options
pub fn compile(probe: Probe) -> probec::Result<CompiledProbe> {
    Compiler::new(CompileOptions::default()).compile(probe)
}

/// Compile a probe and run it once against `ctx`
pub fn run(probe: Probe, ctx: Vec<u8>) -> (CompiledProbe, Vm) {
    let compiled = compile(probe).expect("compile");
    let mut vm = Vm::new(&compiled, ctx);
    vm.run(&compiled.bytecode);
    (compiled, vm)
}

/// Little-endian bytes of a `u64`
pub fn le64(v: u64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}
