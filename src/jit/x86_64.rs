//! x86-64 instruction encoding.
//!
//! Minimal encoder for the baseline translator: 64-bit moves, integer
//! arithmetic, flag tests, stack ops and control flow. Instructions append
//! to a plain byte buffer; relocation targets are recorded by the caller at
//! the offset of the patched field, never here.

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// REX.B bit (register used as base/rm).
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// REX.R bit (register used as reg field).
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }

    /// Callee-saved under System V AMD64.
    pub fn is_nonvolatile(self) -> bool {
        matches!(
            self,
            Reg::Rbx | Reg::Rbp | Reg::R12 | Reg::R13 | Reg::R14 | Reg::R15
        )
    }
}

/// x86-64 condition codes (Jcc, SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    E = 0x4,
    Ne = 0x5,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
    B = 0x2,
    A = 0x7,
}

impl Cond {
    pub fn invert(self) -> Self {
        match self {
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
            Cond::B => Cond::A,
            Cond::A => Cond::B,
        }
    }
}

/// Assembler over a borrowed output buffer.
pub struct Asm<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> Asm<'a> {
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    pub fn offset(&self) -> usize {
        self.out.len()
    }

    fn u8(&mut self, b: u8) {
        self.out.push(b);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn rex_w(&mut self, reg: Reg, rm: Reg) {
        self.u8(0x48 | reg.rex_r() | rm.rex_b());
    }

    fn rex_w_single(&mut self, rm: Reg) {
        self.u8(0x48 | rm.rex_b());
    }

    /// mod: 2 bits, reg: 3 bits, rm: 3 bits
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// ModR/M + SIB + displacement for a `[base + disp]` operand with
    /// `reg_field` in the reg slot. RSP/R12 need a SIB byte; RBP/R13 cannot
    /// use the no-displacement form.
    fn mem(&mut self, reg_field: u8, base: Reg, disp: i32) {
        let needs_sib = base == Reg::Rsp || base == Reg::R12;
        let no_disp = disp == 0 && base != Reg::Rbp && base != Reg::R13;
        let rm = if needs_sib { 0b100 } else { base.code() };

        if no_disp {
            self.u8(Self::modrm(0b00, reg_field, rm));
            if needs_sib {
                self.u8(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.u8(Self::modrm(0b01, reg_field, rm));
            if needs_sib {
                self.u8(0x24);
            }
            self.u8(disp as u8);
        } else {
            self.u8(Self::modrm(0b10, reg_field, rm));
            if needs_sib {
                self.u8(0x24);
            }
            self.u32(disp as u32);
        }
    }

    // ---- data movement ----

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.u8(0x89);
        self.u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_w_single(dst);
        self.u8(0xC7);
        self.u8(Self::modrm(0b11, 0, dst.code()));
        self.u32(imm as u32);
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex_w_single(dst);
        self.u8(0xB8 + dst.code());
        self.u64(imm as u64);
    }

    /// MOV r64, [base + disp]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.u8(0x8B);
        self.mem(dst.code(), base, disp);
    }

    /// MOV [base + disp], r64
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_w(src, base);
        self.u8(0x89);
        self.mem(src.code(), base, disp);
    }

    /// MOV QWORD PTR [base + disp], imm32 (sign-extended)
    pub fn mov_mi32(&mut self, base: Reg, disp: i32, imm: i32) {
        self.rex_w_single(base);
        self.u8(0xC7);
        self.mem(0, base, disp);
        self.u32(imm as u32);
    }

    // ---- arithmetic ----

    /// ADD r64, r64
    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.u8(0x01);
        self.u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// ADD r64, imm32 (imm8 form when it fits)
    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.u8(0x83);
            self.u8(Self::modrm(0b11, 0, dst.code()));
            self.u8(imm as u8);
        } else {
            self.u8(0x81);
            self.u8(Self::modrm(0b11, 0, dst.code()));
            self.u32(imm as u32);
        }
    }

    /// SUB r64, r64
    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.u8(0x29);
        self.u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SUB r64, imm32 (imm8 form when it fits)
    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.u8(0x83);
            self.u8(Self::modrm(0b11, 5, dst.code()));
            self.u8(imm as u8);
        } else {
            self.u8(0x81);
            self.u8(Self::modrm(0b11, 5, dst.code()));
            self.u32(imm as u32);
        }
    }

    /// IMUL r64, r64
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(dst, src);
        self.u8(0x0F);
        self.u8(0xAF);
        self.u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// CMP r64, r64
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.u8(0x39);
        self.u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// TEST r64, r64
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.u8(0x85);
        self.u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// XOR r64, r64
    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.u8(0x31);
        self.u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SETcc r8
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        if dst.needs_rex_ext()
            || dst == Reg::Rsp
            || dst == Reg::Rbp
            || dst == Reg::Rsi
            || dst == Reg::Rdi
        {
            // SPL/BPL/SIL/DIL and R8B-R15B need a REX prefix
            self.u8(0x40 | dst.rex_b());
        }
        self.u8(0x0F);
        self.u8(0x90 + cond as u8);
        self.u8(Self::modrm(0b11, 0, dst.code()));
    }

    /// MOVZX r64, r8
    pub fn movzx_r64_r8(&mut self, dst: Reg, src: Reg) {
        self.rex_w(dst, src);
        self.u8(0x0F);
        self.u8(0xB6);
        self.u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    // ---- stack ----

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.u8(0x41);
        }
        self.u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.u8(0x41);
        }
        self.u8(0x58 + reg.code());
    }

    // ---- control flow ----

    /// JMP rel8
    pub fn jmp_rel8(&mut self, offset: i8) {
        self.u8(0xEB);
        self.u8(offset as u8);
    }

    /// JMP rel32
    pub fn jmp_rel32(&mut self, offset: i32) {
        self.u8(0xE9);
        self.u32(offset as u32);
    }

    /// Jcc rel8
    pub fn jcc_rel8(&mut self, cond: Cond, offset: i8) {
        self.u8(0x70 + cond as u8);
        self.u8(offset as u8);
    }

    /// Jcc rel32
    pub fn jcc_rel32(&mut self, cond: Cond, offset: i32) {
        self.u8(0x0F);
        self.u8(0x80 + cond as u8);
        self.u32(offset as u32);
    }

    /// CALL rel32
    pub fn call_rel32(&mut self, offset: i32) {
        self.u8(0xE8);
        self.u32(offset as u32);
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.u8(0x41);
        }
        self.u8(0xFF);
        self.u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// RET
    pub fn ret(&mut self) {
        self.u8(0xC3);
    }

    /// RET imm16 (callee reverts `imm` bytes of arguments)
    pub fn ret_imm16(&mut self, imm: u16) {
        self.u8(0xC2);
        self.u16(imm);
    }

    /// NOP
    pub fn nop(&mut self) {
        self.u8(0x90);
    }
}

/// Worst-case encoded size of any jump this backend appends to a block
/// during address finalization (jcc rel32 = 6 bytes, rounded up).
pub const MAX_JUMP_BYTES: i64 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut Asm)) -> Vec<u8> {
        let mut buf = Vec::new();
        f(&mut Asm::new(&mut buf));
        buf
    }

    #[test]
    fn test_mov_rr() {
        assert_eq!(emit(|a| a.mov_rr(Reg::Rax, Reg::Rcx)), [0x48, 0x89, 0xC8]);
        assert_eq!(emit(|a| a.mov_rr(Reg::R8, Reg::Rax)), [0x49, 0x89, 0xC0]);
    }

    #[test]
    fn test_mov_mem_forms() {
        // mov rax, [rbp - 8]
        assert_eq!(
            emit(|a| a.mov_rm(Reg::Rax, Reg::Rbp, -8)),
            [0x48, 0x8B, 0x45, 0xF8]
        );
        // mov [rsp + 8], rax needs SIB
        assert_eq!(
            emit(|a| a.mov_mr(Reg::Rsp, 8, Reg::Rax)),
            [0x48, 0x89, 0x44, 0x24, 0x08]
        );
        // mov qword [rbp - 16], 0
        assert_eq!(
            emit(|a| a.mov_mi32(Reg::Rbp, -16, 0)),
            [0x48, 0xC7, 0x45, 0xF0, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_large_disp_uses_disp32() {
        let bytes = emit(|a| a.mov_rm(Reg::Rax, Reg::Rbp, -0x1000));
        assert_eq!(bytes[..3], [0x48, 0x8B, 0x85]);
        assert_eq!(bytes.len(), 3 + 4);
    }

    #[test]
    fn test_jumps() {
        assert_eq!(emit(|a| a.jmp_rel8(-2)), [0xEB, 0xFE]);
        assert_eq!(emit(|a| a.jcc_rel8(Cond::E, 5)), [0x74, 0x05]);
        let long = emit(|a| a.jcc_rel32(Cond::Ne, 0x100));
        assert_eq!(long[..2], [0x0F, 0x85]);
        assert_eq!(long.len(), 6);
        assert!(long.len() as i64 <= MAX_JUMP_BYTES);
    }

    #[test]
    fn test_push_pop_extended() {
        assert_eq!(emit(|a| a.push(Reg::Rbx)), [0x53]);
        assert_eq!(emit(|a| a.push(Reg::R12)), [0x41, 0x54]);
        assert_eq!(emit(|a| a.pop(Reg::R12)), [0x41, 0x5C]);
    }

    #[test]
    fn test_ret_forms() {
        assert_eq!(emit(|a| a.ret()), [0xC3]);
        assert_eq!(emit(|a| a.ret_imm16(16)), [0xC2, 0x10, 0x00]);
    }

    #[test]
    fn test_cmp_set_sequence() {
        let bytes = emit(|a| {
            a.cmp_rr(Reg::Rax, Reg::Rcx);
            a.setcc(Cond::E, Reg::Rax);
            a.movzx_r64_r8(Reg::Rax, Reg::Rax);
        });
        assert_eq!(bytes[..3], [0x48, 0x39, 0xC8]);
    }
}
