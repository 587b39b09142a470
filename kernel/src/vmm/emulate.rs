//! x86 instruction emulation for MMIO faults.
//!
//! When a guest faults on an emulated-device address and the hardware
//! exit info cannot describe the access, the faulting instruction is
//! fetched and executed here. The decoder understands legacy and REX
//! prefixes (VEX/EVEX are recognized and rejected), ModR/M, SIB,
//! displacements and immediates; the executor covers the instructions
//! guests actually aim at device memory: `mov` and its immediate forms,
//! `movzx`/`movsx`, string `movs`/`stos` with REP, `cmpxchg`, and the
//! `bt`/`bts`/`btr`/`btc` family.
//!
//! Memory operands inside the faulting region go through the matched
//! [`MmioDevice`]; the other side of a string move goes through the
//! guest-RAM environment. On success the guest RIP advances by exactly
//! the consumed byte count.

use super::{MmioDevice, RegisterState, MAX_INSTRUCTION_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulateError {
    /// Opcode or encoding outside the supported set.
    Unsupported(u8),
    /// Ran off the end of the fetched bytes.
    Truncated,
    /// A guest address could not be translated or accessed.
    BadAddress,
}

/// Guest-RAM side of string operations.
pub trait EmulateEnv {
    /// Guest-virtual to guest-physical.
    fn translate(&self, va: u64) -> Option<u64>;
    fn read_ram(&self, gpa: u64, buf: &mut [u8]) -> Result<(), EmulateError>;
    fn write_ram(&self, gpa: u64, data: &[u8]) -> Result<(), EmulateError>;
}

const RFLAGS_CF: u64 = 1 << 0;
const RFLAGS_ZF: u64 = 1 << 6;
const RFLAGS_DF: u64 = 1 << 10;

const EFER_LMA: u64 = 1 << 10;
const CS_ATTRIB_LONG: u16 = 1 << 13;
const CS_ATTRIB_DB: u16 = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpuMode {
    Bits16,
    Bits32,
    Bits64,
}

fn cpu_mode(regs: &RegisterState) -> CpuMode {
    if regs.efer & EFER_LMA != 0 && regs.cs.attrib & CS_ATTRIB_LONG != 0 {
        CpuMode::Bits64
    } else if regs.cs.attrib & CS_ATTRIB_DB != 0 {
        CpuMode::Bits32
    } else {
        CpuMode::Bits16
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Rex {
    present: bool,
    w: bool,
    r: bool,
    b: bool,
}

#[derive(Debug, Clone, Copy)]
struct Modrm {
    mode: u8,
    reg: u8,
    rm: u8,
}

fn parse_modrm(byte: u8) -> Modrm {
    Modrm {
        mode: (byte >> 6) & 0b11,
        reg: (byte >> 3) & 0b111,
        rm: byte & 0b111,
    }
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn next_u8(&mut self) -> Result<u8, EmulateError> {
        let byte = *self.bytes.get(self.pos).ok_or(EmulateError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek_u8(&self) -> Result<u8, EmulateError> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(EmulateError::Truncated)
    }

    fn next_imm(&mut self, size: usize) -> Result<u64, EmulateError> {
        let mut value = 0u64;
        for i in 0..size {
            value |= (self.next_u8()? as u64) << (8 * i);
        }
        Ok(value)
    }

    /// Consume the addressing bytes of a memory-form ModR/M: SIB,
    /// displacement. The effective address itself is not needed; the
    /// hardware already reported the faulting guest-physical address.
    fn skip_memory_operand(&mut self, modrm: Modrm, mode: CpuMode) -> Result<(), EmulateError> {
        if mode == CpuMode::Bits16 {
            match (modrm.mode, modrm.rm) {
                (0, 6) => {
                    self.next_imm(2)?;
                }
                (1, _) => {
                    self.next_imm(1)?;
                }
                (2, _) => {
                    self.next_imm(2)?;
                }
                _ => {}
            }
            return Ok(());
        }

        if modrm.rm == 4 {
            let sib = self.next_u8()?;
            // Base 101 with mod 00 carries a disp32 of its own.
            if modrm.mode == 0 && sib & 0b111 == 5 {
                self.next_imm(4)?;
            }
        }

        match modrm.mode {
            0 if modrm.rm == 5 => {
                // disp32, RIP-relative in 64-bit mode.
                self.next_imm(4)?;
            }
            1 => {
                self.next_imm(1)?;
            }
            2 => {
                self.next_imm(4)?;
            }
            _ => {}
        }

        Ok(())
    }
}

/// Read a general register by extended index, honoring the legacy
/// high-byte registers when no REX prefix is in play.
fn read_reg(regs: &RegisterState, index: u8, size: u8, rex: Rex) -> u64 {
    if size == 1 && !rex.present && (4..8).contains(&index) {
        // AH, CH, DH, BH.
        let base = gpr(regs, index - 4);
        return (base >> 8) & 0xFF;
    }

    let value = gpr(regs, index);
    match size {
        1 => value & 0xFF,
        2 => value & 0xFFFF,
        4 => value & 0xFFFF_FFFF,
        _ => value,
    }
}

fn write_reg(regs: &mut RegisterState, index: u8, size: u8, rex: Rex, value: u64) {
    if size == 1 && !rex.present && (4..8).contains(&index) {
        let slot = gpr_mut(regs, index - 4);
        *slot = (*slot & !0xFF00) | ((value & 0xFF) << 8);
        return;
    }

    let slot = gpr_mut(regs, index);
    match size {
        1 => *slot = (*slot & !0xFF) | (value & 0xFF),
        2 => *slot = (*slot & !0xFFFF) | (value & 0xFFFF),
        // 32-bit writes zero the upper half.
        4 => *slot = value & 0xFFFF_FFFF,
        _ => *slot = value,
    }
}

fn gpr(regs: &RegisterState, index: u8) -> u64 {
    match index {
        0 => regs.rax,
        1 => regs.rcx,
        2 => regs.rdx,
        3 => regs.rbx,
        4 => regs.rsp,
        5 => regs.rbp,
        6 => regs.rsi,
        7 => regs.rdi,
        8 => regs.r8,
        9 => regs.r9,
        10 => regs.r10,
        11 => regs.r11,
        12 => regs.r12,
        13 => regs.r13,
        14 => regs.r14,
        15 => regs.r15,
        _ => unreachable!("register index out of range"),
    }
}

fn gpr_mut(regs: &mut RegisterState, index: u8) -> &mut u64 {
    match index {
        0 => &mut regs.rax,
        1 => &mut regs.rcx,
        2 => &mut regs.rdx,
        3 => &mut regs.rbx,
        4 => &mut regs.rsp,
        5 => &mut regs.rbp,
        6 => &mut regs.rsi,
        7 => &mut regs.rdi,
        8 => &mut regs.r8,
        9 => &mut regs.r9,
        10 => &mut regs.r10,
        11 => &mut regs.r11,
        12 => &mut regs.r12,
        13 => &mut regs.r13,
        14 => &mut regs.r14,
        15 => &mut regs.r15,
        _ => unreachable!("register index out of range"),
    }
}

fn sign_extend(value: u64, from_bytes: u8) -> u64 {
    let shift = 64 - from_bytes as u32 * 8;
    (((value << shift) as i64) >> shift) as u64
}

fn size_mask(size: u8) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        4 => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

struct Access<'a> {
    driver: &'a dyn MmioDevice,
    region: (u64, u64),
}

impl Access<'_> {
    fn contains(&self, gpa: u64) -> bool {
        gpa >= self.region.0 && gpa < self.region.0 + self.region.1
    }

    fn read(&self, gpa: u64, size: u8) -> u64 {
        self.driver.mmio_read(gpa, size) & size_mask(size)
    }

    fn write(&self, gpa: u64, value: u64, size: u8) {
        self.driver.mmio_write(gpa, value & size_mask(size), size);
    }
}

/// Decode and execute the instruction at the guest's RIP, whose memory
/// operand faulted at `gpa` inside `region`. Advances `regs.rip` past
/// the instruction on success.
pub fn emulate_instruction(
    regs: &mut RegisterState,
    instruction: &[u8; MAX_INSTRUCTION_SIZE],
    gpa: u64,
    region: (u64, u64),
    driver: &dyn MmioDevice,
    env: &dyn EmulateEnv,
) -> Result<(), EmulateError> {
    let mode = cpu_mode(regs);
    let mut decoder = Decoder::new(instruction);
    let access = Access { driver, region };

    let mut operand_override = false;
    let mut rep = false;
    let mut rex = Rex::default();

    // Legacy prefixes, any order.
    loop {
        match decoder.peek_u8()? {
            0x66 => {
                operand_override = true;
                decoder.next_u8()?;
            }
            0x67 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 | 0xF0 => {
                decoder.next_u8()?;
            }
            0xF2 | 0xF3 => {
                rep = true;
                decoder.next_u8()?;
            }
            _ => break,
        }
    }

    // REX only exists in 64-bit mode; elsewhere 0x40..0x4F are inc/dec.
    if mode == CpuMode::Bits64 {
        let byte = decoder.peek_u8()?;
        if (0x40..=0x4F).contains(&byte) {
            decoder.next_u8()?;
            rex = Rex {
                present: true,
                w: byte & 0b1000 != 0,
                r: byte & 0b0100 != 0,
                b: byte & 0b0001 != 0,
            };
        }
    }

    // VEX/EVEX encoded instructions never target device registers in
    // any guest worth running; recognize and refuse.
    match decoder.peek_u8()? {
        byte @ (0xC4 | 0xC5 | 0x62) if mode != CpuMode::Bits16 => {
            return Err(EmulateError::Unsupported(byte));
        }
        _ => {}
    }

    let op_size = || -> u8 {
        if rex.w {
            8
        } else if operand_override {
            match mode {
                CpuMode::Bits16 => 4,
                _ => 2,
            }
        } else if mode == CpuMode::Bits16 {
            2
        } else {
            4
        }
    };

    let opcode = decoder.next_u8()?;
    match opcode {
        // mov r/m8, r8
        0x88 => {
            let modrm = parse_modrm(decoder.next_u8()?);
            decoder.skip_memory_operand(modrm, mode)?;
            let value = read_reg(regs, modrm.reg + if rex.r { 8 } else { 0 }, 1, rex);
            access.write(gpa, value, 1);
        }
        // mov r/m, r
        0x89 => {
            let modrm = parse_modrm(decoder.next_u8()?);
            decoder.skip_memory_operand(modrm, mode)?;
            let size = op_size();
            let value = read_reg(regs, modrm.reg + if rex.r { 8 } else { 0 }, size, rex);
            access.write(gpa, value, size);
        }
        // mov r8, r/m8
        0x8A => {
            let modrm = parse_modrm(decoder.next_u8()?);
            decoder.skip_memory_operand(modrm, mode)?;
            let value = access.read(gpa, 1);
            write_reg(regs, modrm.reg + if rex.r { 8 } else { 0 }, 1, rex, value);
        }
        // mov r, r/m
        0x8B => {
            let modrm = parse_modrm(decoder.next_u8()?);
            decoder.skip_memory_operand(modrm, mode)?;
            let size = op_size();
            let value = access.read(gpa, size);
            write_reg(regs, modrm.reg + if rex.r { 8 } else { 0 }, size, rex, value);
        }
        // mov r/m8, imm8
        0xC6 => {
            let modrm = parse_modrm(decoder.next_u8()?);
            if modrm.reg != 0 {
                return Err(EmulateError::Unsupported(opcode));
            }
            decoder.skip_memory_operand(modrm, mode)?;
            let imm = decoder.next_imm(1)?;
            access.write(gpa, imm, 1);
        }
        // mov r/m, imm (imm32 sign-extended for 64-bit operands)
        0xC7 => {
            let modrm = parse_modrm(decoder.next_u8()?);
            if modrm.reg != 0 {
                return Err(EmulateError::Unsupported(opcode));
            }
            decoder.skip_memory_operand(modrm, mode)?;
            let size = op_size();
            let imm_bytes = size.min(4);
            let mut imm = decoder.next_imm(imm_bytes as usize)?;
            if size == 8 {
                imm = sign_extend(imm, 4);
            }
            access.write(gpa, imm, size);
        }
        // movs m8 / m
        0xA4 | 0xA5 => {
            let size = if opcode == 0xA4 { 1 } else { op_size() };
            string_movs(regs, &access, env, size, rep)?;
        }
        // stos m8 / m
        0xAA | 0xAB => {
            let size = if opcode == 0xAA { 1 } else { op_size() };
            string_stos(regs, &access, env, size, rep)?;
        }
        // Two-byte map.
        0x0F => {
            let opcode2 = decoder.next_u8()?;
            match opcode2 {
                // movzx / movsx from r/m8 or r/m16
                0xB6 | 0xB7 | 0xBE | 0xBF => {
                    let modrm = parse_modrm(decoder.next_u8()?);
                    decoder.skip_memory_operand(modrm, mode)?;
                    let src_size = if opcode2 & 1 == 0 { 1 } else { 2 };
                    let dst_size = op_size();
                    let mut value = access.read(gpa, src_size);
                    if opcode2 >= 0xBE {
                        value = sign_extend(value, src_size) & size_mask(dst_size);
                    }
                    write_reg(
                        regs,
                        modrm.reg + if rex.r { 8 } else { 0 },
                        dst_size,
                        rex,
                        value,
                    );
                }
                // cmpxchg r/m, r
                0xB0 | 0xB1 => {
                    let modrm = parse_modrm(decoder.next_u8()?);
                    decoder.skip_memory_operand(modrm, mode)?;
                    let size = if opcode2 == 0xB0 { 1 } else { op_size() };
                    let current = access.read(gpa, size);
                    let expected = read_reg(regs, 0, size, rex);
                    if current == expected {
                        let new = read_reg(regs, modrm.reg + if rex.r { 8 } else { 0 }, size, rex);
                        access.write(gpa, new, size);
                        regs.rflags |= RFLAGS_ZF;
                    } else {
                        write_reg(regs, 0, size, rex, current);
                        regs.rflags &= !RFLAGS_ZF;
                    }
                }
                // bt/bts/btr/btc r/m, r
                0xA3 | 0xAB | 0xB3 | 0xBB => {
                    let modrm = parse_modrm(decoder.next_u8()?);
                    decoder.skip_memory_operand(modrm, mode)?;
                    let size = op_size();
                    let bit = read_reg(regs, modrm.reg + if rex.r { 8 } else { 0 }, size, rex);
                    bit_test(regs, &access, gpa, size, bit as i64, opcode2)?;
                }
                // Group 8: bt/bts/btr/btc r/m, imm8
                0xBA => {
                    let modrm = parse_modrm(decoder.next_u8()?);
                    decoder.skip_memory_operand(modrm, mode)?;
                    let size = op_size();
                    let imm = decoder.next_imm(1)?;
                    let op = match modrm.reg {
                        4 => 0xA3, // bt
                        5 => 0xAB, // bts
                        6 => 0xB3, // btr
                        7 => 0xBB, // btc
                        _ => return Err(EmulateError::Unsupported(opcode2)),
                    };
                    // Immediate offsets wrap within the operand.
                    let bit = (imm % (size as u64 * 8)) as i64;
                    bit_test(regs, &access, gpa, size, bit, op)?;
                }
                other => return Err(EmulateError::Unsupported(other)),
            }
        }
        other => return Err(EmulateError::Unsupported(other)),
    }

    regs.rip += decoder.pos as u64;
    Ok(())
}

/// The bit-test family against device memory. Register-form bit offsets
/// may reach outside the faulting operand; the access address moves in
/// operand-size steps accordingly.
fn bit_test(
    regs: &mut RegisterState,
    access: &Access<'_>,
    gpa: u64,
    size: u8,
    bit: i64,
    op: u8,
) -> Result<(), EmulateError> {
    let bits = size as i64 * 8;
    let word_index = bit.div_euclid(bits);
    let bit_index = bit.rem_euclid(bits) as u64;

    let addr = (gpa as i64 + word_index * size as i64) as u64;
    if !access.contains(addr) {
        return Err(EmulateError::BadAddress);
    }

    let value = access.read(addr, size);
    let mask = 1u64 << bit_index;

    if value & mask != 0 {
        regs.rflags |= RFLAGS_CF;
    } else {
        regs.rflags &= !RFLAGS_CF;
    }

    let new = match op {
        0xA3 => return Ok(()), // bt: read-only
        0xAB => value | mask,
        0xB3 => value & !mask,
        0xBB => value ^ mask,
        _ => unreachable!(),
    };
    access.write(addr, new, size);

    Ok(())
}

fn step(direction_down: bool, size: u8) -> i64 {
    if direction_down {
        -(size as i64)
    } else {
        size as i64
    }
}

/// `movs`: memory to memory through rsi/rdi. Whichever side lands in the
/// device region goes through the driver; the other side is guest RAM.
fn string_movs(
    regs: &mut RegisterState,
    access: &Access<'_>,
    env: &dyn EmulateEnv,
    size: u8,
    rep: bool,
) -> Result<(), EmulateError> {
    let down = regs.rflags & RFLAGS_DF != 0;
    let mut count = if rep { regs.rcx } else { 1 };

    while count > 0 {
        let src_va = regs.ds.base + regs.rsi;
        let dst_va = regs.es.base + regs.rdi;

        let src_gpa = env.translate(src_va).ok_or(EmulateError::BadAddress)?;
        let dst_gpa = env.translate(dst_va).ok_or(EmulateError::BadAddress)?;

        let value = if access.contains(src_gpa) {
            access.read(src_gpa, size)
        } else {
            let mut buf = [0u8; 8];
            env.read_ram(src_gpa, &mut buf[..size as usize])?;
            u64::from_le_bytes(buf)
        };

        if access.contains(dst_gpa) {
            access.write(dst_gpa, value, size);
        } else {
            let buf = value.to_le_bytes();
            env.write_ram(dst_gpa, &buf[..size as usize])?;
        }

        regs.rsi = regs.rsi.wrapping_add(step(down, size) as u64);
        regs.rdi = regs.rdi.wrapping_add(step(down, size) as u64);

        count -= 1;
        if rep {
            regs.rcx = count;
        }
    }

    Ok(())
}

/// `stos`: store rAX at es:rdi, device or RAM side.
fn string_stos(
    regs: &mut RegisterState,
    access: &Access<'_>,
    env: &dyn EmulateEnv,
    size: u8,
    rep: bool,
) -> Result<(), EmulateError> {
    let down = regs.rflags & RFLAGS_DF != 0;
    let mut count = if rep { regs.rcx } else { 1 };
    let value = regs.rax & size_mask(size);

    while count > 0 {
        let dst_va = regs.es.base + regs.rdi;
        let dst_gpa = env.translate(dst_va).ok_or(EmulateError::BadAddress)?;

        if access.contains(dst_gpa) {
            access.write(dst_gpa, value, size);
        } else {
            let buf = value.to_le_bytes();
            env.write_ram(dst_gpa, &buf[..size as usize])?;
        }

        regs.rdi = regs.rdi.wrapping_add(step(down, size) as u64);

        count -= 1;
        if rep {
            regs.rcx = count;
        }
    }

    Ok(())
}
