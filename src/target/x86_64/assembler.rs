//! Tools for generating code using the x86_64 instruction set.
//!
//! The focus here is in concrete x86_64 instructions. One method call on an
//! Assembler generates one instruction. This ensures that documentation about
//! the x86_64 instructions set applies to the code we assemble.
//!
//! We make no attempt to be exhaustive. We implement the subset of x86_64
//! that call-boundary stubs need: register and stack moves, thread-block
//! accesses through a segment override, a locked compare-and-exchange, and a
//! few control-flow instructions. Where we have freedom to do so, we choose
//! to make the subset as regular as possible, sometimes ignoring more
//! efficient encodings.

use super::super::super::buffer::{Buffer};
use super::super::super::label::{Patch};
use super::{Register, Xmm, Operand, Precision, BinaryOp, Condition, Segment, Width};
use Precision::*;

/** Computes the displacement from `from` to `to`. */
pub fn disp(from: usize, to: usize) -> isize {
    if from > isize::MAX as usize || to > isize::MAX as usize {
        panic!("Displacements greater than isize::MAX are not supported");
    }
    (to as isize) - (from as isize)
}

/** Computes the i32 displacement from `from` to `to`, if possible. */
pub fn disp32(from: usize, to: usize) -> i32 {
    let disp = disp(from, to);
    if disp > i32::MAX as isize || disp < i32::MIN as isize {
        panic!("The displacement does not fit in 32 bits");
    }
    disp as i32
}

/**
 * A value which, if used as the `rel32` part of a control-flow instruction,
 * is likely to result in an immediate crash.
 */
const UNKNOWN_DISP: i32 = -0x80000000;

/** Like [`disp32()`] but returns `UNKNOWN_DISP` if `to` is `None`. */
pub fn optional_disp32(from: usize, to: Option<usize>) -> i32 {
    to.map_or(UNKNOWN_DISP, |to| disp32(from, to))
}

/**
 * An assembler, implementing a regularish subset of x86_64.
 *
 * There is a `write_x()` method for each encoding pattern `x`. A typical
 * pattern is "ROOM" meaning a REX byte, two opcode bytes, and a ModR/M byte.
 * Memory operands are `(base, disp32)` pairs, or absolute 32-bit addresses
 * within a [`Segment`].
 */
pub struct Assembler<B: Buffer> {
    /// The area we're filling with code.
    buffer: B,
}

impl<B: Buffer> Assembler<B> {
    /** Construct an Assembler that writes to `buffer` */
    pub fn new(buffer: B) -> Self {
        Assembler {buffer}
    }

    /** Get the assembly pointer. */
    pub fn get_pos(&self) -> usize {
        self.buffer.get_pos()
    }

    pub fn into_buffer(self) -> B { self.buffer }

    // Patterns and constants.

    /** Writes an 8-bit signed immediate constant. */
    pub fn write_imm8(&mut self, immediate: i8) {
        self.buffer.write(u64::from(immediate as u8), 1);
    }

    /** Writes a 32-bit signed immediate constant. */
    pub fn write_imm32(&mut self, immediate: i32) {
        self.buffer.write(u64::from(immediate as u32), 4);
    }

    /** Writes a 64-bit signed immediate constant. */
    pub fn write_imm64(&mut self, immediate: i64) {
        self.buffer.write(immediate as u64, 8);
    }

    /** Writes a 32-bit displacement from `self.get_pos()+4` to `target`. */
    pub fn write_rel32(&mut self, target: Option<usize>) {
        let pos = self.get_pos();
        self.write_imm32(optional_disp32(pos + 4, target));
    }

    /** Writes an instruction with pattern "OO", and no registers. */
    pub fn write_oo_0(&mut self, opcode: u64) {
        self.buffer.write(opcode, 2);
    }

    /** Writes an instruction with pattern "RO", and one register. */
    pub fn write_ro_1(&mut self, mut opcode: u64, prec: Precision, rd: Register) {
        opcode |= prec.w_bit();
        opcode |= 0x0701 & rd.mask();
        self.buffer.write(opcode, 2);
    }

    /** Writes an instruction with pattern "ROM" and one register. */
    pub fn write_rom_1(&mut self, mut opcode: u64, prec: Precision, rm: impl Operand) {
        opcode |= prec.w_bit();
        opcode |= 0x070001 & rm.mask();
        self.buffer.write(opcode, 3);
    }

    /** Writes an instruction with pattern "ROM" and two registers. */
    pub fn write_rom_2(&mut self, mut opcode: u64, prec: Precision, rm: impl Operand, reg: impl Operand) {
        opcode |= prec.w_bit();
        opcode |= 0x070001 & rm.mask();
        opcode |= 0x380004 & reg.mask();
        self.buffer.write(opcode, 3);
    }

    /** Writes an instruction with pattern "ROOM" and two registers. */
    pub fn write_room_2(&mut self, mut opcode: u64, prec: Precision, rm: impl Operand, reg: impl Operand) {
        opcode |= prec.w_bit();
        opcode |= 0x07000001 & rm.mask();
        opcode |= 0x38000004 & reg.mask();
        self.buffer.write(opcode, 4);
    }

    /**
     * If `rm` is `RSP` or `R12`, writes the byte `0x24`, otherwise does
     * nothing.
     *
     * This is necessary after a ModR/M byte if `rm` is used as a memory
     * operand, because the bit pattern 100 in the `rm` field indicates the
     * presence of a SIB byte. `0x24` is a SIB byte with 100 in the `index`
     * field, indicating no index, and 100 in the `base` field, matching `rm`.
     */
    pub fn write_sib_fix(&mut self, rm: Register) {
        if (rm as usize) & 7 == 4 {
            self.buffer.write_byte(0x24);
        }
    }

    /**
     * Writes a segment-override prefix followed by an instruction with
     * pattern "ROM", whose memory operand is the absolute address `disp`.
     * `reg` is the mask of the register in the `reg` field, or zero.
     */
    pub fn write_segment_rom(&mut self, segment: Segment, mut opcode: u64, prec: Precision, reg: u64, disp: i32) {
        self.buffer.write_byte(segment as u8);
        opcode |= prec.w_bit();
        opcode |= 0x380004 & reg;
        // ModR/M with `mod` 00 and `rm` 100, then a SIB byte meaning "no base".
        opcode |= 0x040000;
        self.buffer.write(opcode, 3);
        self.buffer.write_byte(0x25);
        self.write_imm32(disp);
    }

    // Moves.

    /** Move register to register. */
    pub fn move_(&mut self, prec: Precision, dest: Register, src: Register) {
        self.write_rom_2(0xC08B40, prec, src, dest);
    }

    /** Move memory to register. */
    pub fn load(&mut self, prec: Precision, dest: Register, src: (Register, i32)) {
        self.write_rom_2(0x808B40, prec, src.0, dest);
        self.write_sib_fix(src.0);
        self.write_imm32(src.1);
    }

    /** Move register to memory. */
    pub fn store(&mut self, prec: Precision, dest: (Register, i32), src: Register) {
        self.write_rom_2(0x808940, prec, dest.0, src);
        self.write_sib_fix(dest.0);
        self.write_imm32(dest.1);
    }

    /** Load effective address. */
    pub fn lea(&mut self, dest: Register, src: (Register, i32)) {
        self.write_rom_2(0x808D40, P64, src.0, dest);
        self.write_sib_fix(src.0);
        self.write_imm32(src.1);
    }

    /**
     * Move constant to register.
     * If `imm` is zero, this will assemble the "zero idiom" xor instruction,
     * which corrupts the status flags. Use `const_preserving_flags` to avoid
     * this problem.
     */
    pub fn const_(&mut self, prec: Precision, dest: Register, mut imm: i64) {
        if prec == P32 {
            imm &= 0xFFFFFFFF;
        }
        if imm == 0 {
            self.op(BinaryOp::Xor, P32, dest, dest);
        } else {
            self.const_preserving_flags(prec, dest, imm);
        }
    }

    /** Move constant to register. */
    pub fn const_preserving_flags(&mut self, prec: Precision, dest: Register, mut imm: i64) {
        if prec == P32 {
            imm &= 0xFFFFFFFF;
        }
        if i64::from(imm as u32) == imm {
            self.write_ro_1(0xB840, P32, dest);
            self.write_imm32(imm as i32);
        } else if i64::from(imm as i32) == imm {
            self.write_rom_1(0xC0C740, P64, dest);
            self.write_imm32(imm as i32);
        } else {
            self.write_ro_1(0xB840, P64, dest);
            self.write_imm64(imm);
        }
    }

    /** Sign- or zero-extend the low bits of a register. */
    pub fn extend(&mut self, width: Width, dest: Register, src: Register) {
        let opcode = match width {
            Width::U8 => 0xC0B60F40,
            Width::S8 => 0xC0BE0F40,
            Width::U16 => 0xC0B70F40,
            Width::S16 => 0xC0BF0F40,
        };
        self.write_room_2(opcode, P32, src, dest);
    }

    // Arithmetic.

    /** Op register to register. */
    pub fn op(&mut self, op: BinaryOp, prec: Precision, dest: Register, src: Register) {
        self.write_rom_2(op.rm_reg(true), prec, dest, src);
    }

    /** Op constant to register. */
    pub fn const_op(&mut self, op: BinaryOp, prec: Precision, dest: Register, imm: i32) {
        self.write_rom_1(op.rm_imm(true), prec, dest);
        self.write_imm32(imm);
    }

    /** Bitwise AND of two registers, setting the flags only. */
    pub fn test(&mut self, prec: Precision, src1: Register, src2: Register) {
        self.write_rom_2(0xC08540, prec, src1, src2);
    }

    /** Bitwise AND of a register and a constant, setting the flags only. */
    pub fn const_test(&mut self, prec: Precision, src: Register, imm: i32) {
        self.write_rom_1(0xC0F740, prec, src);
        self.write_imm32(imm);
    }

    /** Bitwise AND of memory and a register, setting the flags only. */
    pub fn load_test(&mut self, prec: Precision, src1: (Register, i32), src2: Register) {
        self.write_rom_2(0x808540, prec, src1.0, src2);
        self.write_sib_fix(src1.0);
        self.write_imm32(src1.1);
    }

    /** Bitwise AND of memory and a constant, setting the flags only. */
    pub fn load_const_test(&mut self, prec: Precision, src: (Register, i32), imm: i32) {
        self.write_rom_1(0x80F740, prec, src.0);
        self.write_sib_fix(src.0);
        self.write_imm32(src.1);
        self.write_imm32(imm);
    }

    /** Compare a byte of memory with a constant. */
    pub fn load_const_cmp_byte(&mut self, src: (Register, i32), imm: i8) {
        self.write_rom_1(0xB88040, P32, src.0);
        self.write_sib_fix(src.0);
        self.write_imm32(src.1);
        self.write_imm8(imm);
    }

    /**
     * `test eax, [rax]`, with no REX prefix. This is the half of the implicit
     * suspend check that faults.
     */
    pub fn test_ra_indirect(&mut self) {
        self.buffer.write(0x0085, 2);
    }

    // Thread-block accesses.

    /** Move memory at `segment:[disp]` to register. */
    pub fn segment_load(&mut self, segment: Segment, prec: Precision, dest: Register, disp: i32) {
        self.write_segment_rom(segment, 0x008B40, prec, dest.mask(), disp);
    }

    /** Move register to memory at `segment:[disp]`. */
    pub fn segment_store(&mut self, segment: Segment, prec: Precision, disp: i32, src: Register) {
        self.write_segment_rom(segment, 0x008940, prec, src.mask(), disp);
    }

    /** Move sign-extended 32-bit constant to memory at `segment:[disp]`. */
    pub fn segment_store_const(&mut self, segment: Segment, prec: Precision, disp: i32, imm: i32) {
        self.write_segment_rom(segment, 0x00C740, prec, 0, disp);
        self.write_imm32(imm);
    }

    /** Op constant to memory at `segment:[disp]`, e.g. compare it. */
    pub fn segment_const_op(&mut self, segment: Segment, op: BinaryOp, prec: Precision, disp: i32, imm: i32) {
        self.write_segment_rom(segment, op.rm_imm(false) & !0xC00000, prec, 0, disp);
        self.write_imm32(imm);
    }

    /** Bitwise AND of memory at `segment:[disp]` and a constant, setting the flags only. */
    pub fn segment_const_test(&mut self, segment: Segment, prec: Precision, disp: i32, imm: i32) {
        self.write_segment_rom(segment, 0x00F740, prec, 0, disp);
        self.write_imm32(imm);
    }

    /** Call the address stored at `segment:[disp]`. */
    pub fn segment_call(&mut self, segment: Segment, disp: i32) {
        self.write_segment_rom(segment, 0x10FF40, P32, 0, disp);
    }

    /**
     * `lock cmpxchg segment:[disp], src` on 32 bits. Compares `RA` with the
     * memory; if equal, stores `src`, otherwise loads the memory into `RA`.
     * Sets Z on success.
     */
    pub fn segment_lock_cmpxchg(&mut self, segment: Segment, disp: i32, src: Register) {
        self.buffer.write_byte(segment as u8);
        self.buffer.write_byte(0xF0);
        let opcode = 0x04B10F40 | (0x38000004 & src.mask());
        self.buffer.write(opcode, 4);
        self.buffer.write_byte(0x25);
        self.write_imm32(disp);
    }

    // SSE.

    /** Move memory to an SSE register: `movss` (4 bytes) or `movsd` (8 bytes). */
    pub fn load_float(&mut self, size: usize, dest: Xmm, src: (Register, i32)) {
        self.buffer.write_byte(Self::float_prefix(size));
        self.write_room_2(0x80100F40, P32, src.0, dest);
        self.write_sib_fix(src.0);
        self.write_imm32(src.1);
    }

    /** Move an SSE register to memory: `movss` (4 bytes) or `movsd` (8 bytes). */
    pub fn store_float(&mut self, size: usize, dest: (Register, i32), src: Xmm) {
        self.buffer.write_byte(Self::float_prefix(size));
        self.write_room_2(0x80110F40, P32, dest.0, src);
        self.write_sib_fix(dest.0);
        self.write_imm32(dest.1);
    }

    /** Move an SSE register to an SSE register (`movaps`). */
    pub fn move_float(&mut self, dest: Xmm, src: Xmm) {
        self.write_room_2(0xC0280F40, P32, src, dest);
    }

    fn float_prefix(size: usize) -> u8 {
        match size {
            4 => 0xF3,
            8 => 0xF2,
            _ => panic!("Bad size {} for an SSE register", size),
        }
    }

    // Control flow.

    /** Conditional branch. Returns the [`Patch`] of the instruction. */
    pub fn jump_if(&mut self, cc: Condition, is_true: bool, target: Option<usize>) -> Patch {
        let patch = Patch::new(self.get_pos());
        self.write_oo_0(cc.jump_if(is_true));
        self.write_rel32(target);
        patch
    }

    /** Unconditional jump to a constant. Returns the [`Patch`] of the instruction. */
    pub fn const_jump(&mut self, target: Option<usize>) -> Patch {
        let patch = Patch::new(self.get_pos());
        self.buffer.write_byte(0xE9);
        self.write_rel32(target);
        patch
    }

    /** Unconditional jump to the address stored in memory. */
    pub fn load_jump(&mut self, target: (Register, i32)) {
        self.write_rom_1(0xA0FF40, P32, target.0);
        self.write_sib_fix(target.0);
        self.write_imm32(target.1);
    }

    /** Unconditional call to the address stored in memory. */
    pub fn load_call(&mut self, target: (Register, i32)) {
        self.write_rom_1(0x90FF40, P32, target.0);
        self.write_sib_fix(target.0);
        self.write_imm32(target.1);
    }

    /**
     * Change the target of the instruction at `patch` from `old_target` to
     * `new_target`.
     * - patch - a conditional or unconditional jump.
     * - old_target - an offset from the beginning of the buffer, or `None`.
     * - new_target - an offset from the beginning of the buffer, or `None`.
     */
    pub fn patch(&mut self, patch: Patch, old_target: Option<usize>, new_target: Option<usize>) {
        let pos = patch.address();
        let at = if self.buffer.read_byte(pos) == 0x0F && (self.buffer.read_byte(pos + 1) & 0xF0) == 0x80 {
            // jump_if
            pos + 2
        } else if self.buffer.read_byte(pos) == 0xE9 {
            // const_jump
            pos + 1
        } else {
            panic!("not a jump instruction");
        };
        let old_disp = self.buffer.read(at, 4) as u32 as i32;
        assert_eq!(old_disp, optional_disp32(at + 4, old_target));
        let new_disp = optional_disp32(at + 4, new_target);
        self.buffer.overwrite(at, u64::from(new_disp as u32), 4);
    }

    pub fn ret(&mut self) {
        self.buffer.write_byte(0xC3);
    }

    /** Breakpoint trap. */
    pub fn int3(&mut self) {
        self.buffer.write_byte(0xCC);
    }

    /** Push a register. */
    pub fn push(&mut self, rd: Register) {
        self.write_ro_1(0x5040, P32, rd);
    }

    /** Pop a register. */
    pub fn pop(&mut self, rd: Register) {
        self.write_ro_1(0x5840, P32, rd);
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;
    use super::super::{ALL_REGISTERS, ALL_BINARY_OPS, ALL_CONDITIONS};
    use super::super::super::super::buffer::{VecU8};
    #[cfg(target_arch = "x86_64")]
    use super::super::super::super::buffer::{Mmap};
    use Register::*;
    use BinaryOp::*;
    use Condition::*;
    use Xmm::*;

    use std::cmp::{max};

    use iced_x86::{Decoder, DecoderOptions, FormatMnemonicOptions, Formatter, Instruction, NasmFormatter};

    fn new_assembler() -> Assembler<VecU8> {
        Assembler::new(VecU8::new())
    }

    /** Decode the given x86_64 `code_bytes` as if they were at address 0. */
    pub fn decode(code_bytes: &[u8]) -> Vec<Instruction> {
        Decoder::new(64, code_bytes, DecoderOptions::NONE).into_iter().collect()
    }

    /** Format the mnemonic, without prefixes, of each of `instructions`. */
    pub fn mnemonics(instructions: &[Instruction]) -> Vec<String> {
        let mut formatter = NasmFormatter::new();
        instructions.iter().map(|instruction| {
            let mut mnemonic = String::new();
            formatter.format_mnemonic_options(instruction, &mut mnemonic, FormatMnemonicOptions::NO_PREFIXES);
            mnemonic
        }).collect()
    }

    /**
     * Disassemble the given x64_64 `code_bytes` as if they were at address 0,
     * and compare the disassembly with `expected`.
     */
    pub fn disassemble(code_bytes: &[u8], expected: Vec<&str>)
    -> Result<(), Vec<String>> {
        let mut formatter = NasmFormatter::new();
        let mut ips = Vec::new();
        let mut byteses = Vec::new();
        let mut observed = Vec::new();
        for instruction in decode(code_bytes) {
            let start = instruction.ip() as usize;
            let len = instruction.len();
            ips.push(start);
            byteses.push(code_bytes[start..][..len].iter().rev().map(
                |b| format!("{:02X}", b)
            ).collect::<Vec<String>>().join(" "));
            let mut assembly = String::with_capacity(80);
            formatter.format(&instruction, &mut assembly);
            observed.push(assembly);
        };

        let mut error = false;
        for i in 0..max(expected.len(), observed.len()) {
            let e_line = if i < expected.len() { expected[i] } else { "missing" };
            let o_line = if i < observed.len() { &observed[i] } else { "missing" };
            if e_line != o_line {
                println!("Difference in line {}", i+1);
                if i < observed.len() {
                    println!("{:016X}   {:>32}   {}", ips[i], byteses[i], o_line);
                }
                println!("{:>16}   {:>32}   {}", "Expected", "", e_line);
                error = true;
            }
        }
        if error { Err(observed) } else { Ok(()) }
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn add5() {
        let mut a = Assembler::new(VecU8::new());
        a.move_(P64, RA, RDI);
        a.const_op(Add, P64, RA, 5);
        a.ret();
        let code = Mmap::from_code(&a.into_buffer().into_vec()).expect("Couldn't allocate");
        let (_, result) = code.execute(|bytes| {
            let f: extern "C" fn(i64) -> i64 = unsafe {std::mem::transmute(bytes.as_ptr())};
            f(42)
        }).expect("Couldn't change permissions");
        assert_eq!(result, 42 + 5);
    }

    const IMM: i32 = 0x76543210;
    const DISP: i32 = 0x12345678;

    /** Test that the Registers are named correctly. */
    #[test]
    fn regs() {
        let mut a = new_assembler();
        for &r in &ALL_REGISTERS {
            a.move_(P32, r, r);
        }
        disassemble(&a.buffer, vec![
            "mov eax,eax",
            "mov ecx,ecx",
            "mov edx,edx",
            "mov ebx,ebx",
            "mov esp,esp",
            "mov ebp,ebp",
            "mov esi,esi",
            "mov edi,edi",
            "mov r8d,r8d",
            "mov r9d,r9d",
            "mov r10d,r10d",
            "mov r11d,r11d",
            "mov r12d,r12d",
            "mov r13d,r13d",
            "mov r14d,r14d",
            "mov r15d,r15d",
        ]).unwrap();
    }

    /** Test that we can assemble all the different sizes of constant. */
    #[test]
    fn const_() {
        let mut a = new_assembler();
        for &p in &[P32, P64] {
            for &c in &[0, 1, 1000, 0x76543210, 0x76543210FEDCBA98] {
                a.const_(p, R8, c);
                a.const_(p, R15, !c);
            }
        }
        disassemble(&a.buffer, vec![
            "xor r8d,r8d",
            "mov r15d,0FFFFFFFFh",
            "mov r8d,1",
            "mov r15d,0FFFFFFFEh",
            "mov r8d,3E8h",
            "mov r15d,0FFFFFC17h",
            "mov r8d,76543210h",
            "mov r15d,89ABCDEFh",
            "mov r8d,0FEDCBA98h",
            "mov r15d,1234567h",
            "xor r8d,r8d",
            "mov r15,0FFFFFFFFFFFFFFFFh",
            "mov r8d,1",
            "mov r15,0FFFFFFFFFFFFFFFEh",
            "mov r8d,3E8h",
            "mov r15,0FFFFFFFFFFFFFC17h",
            "mov r8d,76543210h",
            "mov r15,0FFFFFFFF89ABCDEFh",
            "mov r8,76543210FEDCBA98h",
            "mov r15,89ABCDEF01234567h",
        ]).unwrap();
    }

    /** Test that we can assemble all the different kinds of "MOV". */
    #[test]
    fn move_() {
        let mut a = new_assembler();
        for &p in &[P32, P64] {
            a.move_(p, R10, R9);
            a.store(p, (R8, DISP), R10);
            a.store(p, (R12, DISP), R10);
            a.load(p, R11, (R8, DISP));
            a.load(p, R11, (RSP, DISP));
        }
        a.lea(RDI, (RSP, 0x18));
        disassemble(&a.buffer, vec![
            "mov r10d,r9d",
            "mov [r8+12345678h],r10d",
            "mov [r12+12345678h],r10d",
            "mov r11d,[r8+12345678h]",
            "mov r11d,[rsp+12345678h]",
            "mov r10,r9",
            "mov [r8+12345678h],r10",
            "mov [r12+12345678h],r10",
            "mov r11,[r8+12345678h]",
            "mov r11,[rsp+12345678h]",
            "lea rdi,[rsp+18h]",
        ]).unwrap();
    }

    /** Test that all the BinaryOps are named correctly. */
    #[test]
    fn binary_op() {
        let mut a = new_assembler();
        for &op in &ALL_BINARY_OPS {
            a.op(op, P32, R10, R9);
        }
        a.const_op(Or, P64, R11, 2);
        disassemble(&a.buffer, vec![
            "add r10d,r9d",
            "or r10d,r9d",
            "adc r10d,r9d",
            "sbb r10d,r9d",
            "and r10d,r9d",
            "sub r10d,r9d",
            "xor r10d,r9d",
            "cmp r10d,r9d",
            "or r11,2",
        ]).unwrap();
    }

    #[test]
    fn tests() {
        let mut a = new_assembler();
        a.test(P32, RD, RD);
        a.const_test(P32, RSI, 2);
        a.load_test(P64, (RSP, -0x2000), RA);
        a.load_const_test(P32, (RDI, 4), 0x20000000);
        a.load_const_cmp_byte((R11, 8), 0);
        disassemble(&a.buffer, vec![
            "test edx,edx",
            "test esi,2",
            "test [rsp-2000h],rax",
            "test dword [rdi+4],20000000h",
            "cmp byte [r11+8],0",
        ]).unwrap();
    }

    #[test]
    fn extend() {
        let mut a = new_assembler();
        a.extend(Width::U8, RA, RA);
        a.extend(Width::S8, RSI, RSI);
        a.extend(Width::U16, R9, R9);
        a.extend(Width::S16, RD, RD);
        disassemble(&a.buffer, vec![
            "movzx eax,al",
            "movsx esi,sil",
            "movzx r9d,r9w",
            "movsx edx,dx",
        ]).unwrap();
    }

    #[test]
    fn floats() {
        let mut a = new_assembler();
        a.load_float(4, XMM0, (RSP, 8));
        a.load_float(8, XMM12, (R12, 8));
        a.store_float(8, (RSP, 16), XMM15);
        a.move_float(XMM1, XMM9);
        disassemble(&a.buffer, vec![
            "movss xmm0,[rsp+8]",
            "movsd xmm12,[r12+8]",
            "movsd [rsp+10h],xmm15",
            "movaps xmm1,xmm9",
        ]).unwrap();
    }

    /** Test the instructions that address the thread block. */
    #[test]
    fn segments() {
        let mut a = new_assembler();
        a.segment_load(Segment::GS, P64, R11, 0xA8);
        a.segment_store(Segment::GS, P64, 0x20, RSP);
        a.segment_store_const(Segment::GS, P64, 0x30, 0);
        a.segment_const_op(Segment::GS, Cmp, P32, 0x40, 0);
        a.segment_const_test(Segment::GS, P32, 0, 7);
        a.segment_call(Segment::GS, 0x50);
        a.segment_lock_cmpxchg(Segment::GS, 0, R11);
        let instructions = decode(&a.buffer);
        assert_eq!(mnemonics(&instructions), vec!["mov", "mov", "mov", "cmp", "test", "call", "cmpxchg"]);
        let disps: Vec<u64> = instructions.iter().map(|i| i.memory_displacement64()).collect();
        assert_eq!(disps, vec![0xA8, 0x20, 0x30, 0x40, 0, 0x50, 0]);
        for instruction in &instructions {
            assert_eq!(instruction.memory_segment(), iced_x86::Register::GS);
            assert_eq!(instruction.memory_base(), iced_x86::Register::None);
        }
        assert_eq!(instructions[0].op0_register(), iced_x86::Register::R11);
        assert_eq!(instructions[1].op1_register(), iced_x86::Register::RSP);
        assert_eq!(instructions[6].op1_register(), iced_x86::Register::R11D);
        assert!(instructions[6].has_lock_prefix());
    }

    /** The bytes of the implicit suspend check are fixed. */
    #[test]
    fn suspend_check_bytes() {
        let mut a = new_assembler();
        a.segment_load(Segment::GS, P64, RA, 0xA8);
        a.test_ra_indirect();
        assert_eq!(&a.buffer[..], &[0x65, 0x48, 0x8B, 0x04, 0x25, 0xA8, 0, 0, 0, 0x85, 0x00]);
    }

    #[test]
    fn calls() {
        let mut a = new_assembler();
        a.load_call((RDI, 0x18));
        a.load_jump((R12, -8));
        a.push(RB);
        a.push(R15);
        a.pop(R15);
        a.pop(RB);
        a.int3();
        a.ret();
        disassemble(&a.buffer, vec![
            "call qword [rdi+18h]",
            "jmp qword [r12-8]",
            "push rbx",
            "push r15",
            "pop r15",
            "pop rbx",
            "int3",
            "ret",
        ]).unwrap();
    }

    /** Test that all the condition codes are named correctly. */
    #[test]
    fn condition() {
        let mut a = new_assembler();
        for &cc in &ALL_CONDITIONS {
            a.jump_if(cc, true, Some(0x100));
        }
        disassemble(&a.buffer, vec![
            "jo near 0000000000000100h",
            "jno near 0000000000000100h",
            "jb near 0000000000000100h",
            "jae near 0000000000000100h",
            "je near 0000000000000100h",
            "jne near 0000000000000100h",
            "jbe near 0000000000000100h",
            "ja near 0000000000000100h",
            "js near 0000000000000100h",
            "jns near 0000000000000100h",
            "jp near 0000000000000100h",
            "jnp near 0000000000000100h",
            "jl near 0000000000000100h",
            "jge near 0000000000000100h",
            "jle near 0000000000000100h",
            "jg near 0000000000000100h",
        ]).unwrap();
    }

    /** Test that we can patch jumps. */
    #[test]
    fn patch() {
        let mut a = new_assembler();
        let p1 = a.jump_if(Z, false, None);
        let p2 = a.const_jump(None);
        a.patch(p1, None, Some(0x28));
        a.patch(p2, None, Some(0));
        let instructions = decode(&a.buffer);
        assert_eq!(mnemonics(&instructions), vec!["jne", "jmp"]);
        assert_eq!(instructions[0].near_branch64(), 0x28);
        assert_eq!(instructions[1].near_branch64(), 0);
        assert_eq!(&a.buffer[6..11], &[0xE9, 0xF5, 0xFF, 0xFF, 0xFF]);
        a.patch(p1, Some(0x28), Some(0x30));
        let instructions = decode(&a.buffer);
        assert_eq!(instructions[0].near_branch64(), 0x30);
    }
}
