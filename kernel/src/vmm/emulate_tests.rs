//! Emulator self tests: hand-assembled instructions against a recording
//! device, no guest required.

use crate::sync::IrqTicketLock;

use super::emulate::{emulate_instruction, EmulateEnv, EmulateError};
use super::{MmioDevice, RegisterState, Segment, MAX_INSTRUCTION_SIZE};

const DEVICE_BASE: u64 = 0xE000_0000;
const DEVICE_LEN: u64 = 64;
const RAM_BASE: u64 = 0x1000;

/// 64 bytes of device registers with last-access bookkeeping.
struct TestDevice {
    mem: IrqTicketLock<[u8; DEVICE_LEN as usize]>,
}

impl TestDevice {
    fn new() -> Self {
        Self {
            mem: IrqTicketLock::new([0; DEVICE_LEN as usize]),
        }
    }

    fn fill(&self, offset: usize, bytes: &[u8]) {
        self.mem.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn snapshot(&self, offset: usize, len: usize) -> u64 {
        let mem = self.mem.lock();
        let mut value = 0u64;
        for i in 0..len {
            value |= (mem[offset + i] as u64) << (8 * i);
        }
        value
    }
}

impl MmioDevice for TestDevice {
    fn mmio_read(&self, addr: u64, size: u8) -> u64 {
        let offset = (addr - DEVICE_BASE) as usize;
        self.snapshot(offset, size as usize)
    }

    fn mmio_write(&self, addr: u64, value: u64, size: u8) {
        let offset = (addr - DEVICE_BASE) as usize;
        let bytes = value.to_le_bytes();
        self.mem.lock()[offset..offset + size as usize].copy_from_slice(&bytes[..size as usize]);
    }
}

/// Flat-mapped scratch RAM for the string-op tests.
struct TestEnv {
    ram: IrqTicketLock<[u8; 64]>,
}

impl TestEnv {
    fn new() -> Self {
        Self {
            ram: IrqTicketLock::new([0; 64]),
        }
    }
}

impl EmulateEnv for TestEnv {
    fn translate(&self, va: u64) -> Option<u64> {
        Some(va)
    }

    fn read_ram(&self, gpa: u64, buf: &mut [u8]) -> Result<(), EmulateError> {
        let offset = (gpa - RAM_BASE) as usize;
        buf.copy_from_slice(&self.ram.lock()[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_ram(&self, gpa: u64, data: &[u8]) -> Result<(), EmulateError> {
        let offset = (gpa - RAM_BASE) as usize;
        self.ram.lock()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// 64-bit flat state.
fn long_mode_regs() -> RegisterState {
    let mut regs = RegisterState::default();
    regs.rflags = 0x2;
    regs.efer = 1 << 10; // LMA
    regs.cs = Segment {
        selector: 0x08,
        base: 0,
        limit: u32::MAX,
        attrib: 0x209B, // present, code, long
    };
    regs
}

fn instr(bytes: &[u8]) -> [u8; MAX_INSTRUCTION_SIZE] {
    let mut buf = [0u8; MAX_INSTRUCTION_SIZE];
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

fn run_one(
    regs: &mut RegisterState,
    bytes: &[u8],
    gpa: u64,
    device: &TestDevice,
    env: &TestEnv,
) {
    emulate_instruction(
        regs,
        &instr(bytes),
        gpa,
        (DEVICE_BASE, DEVICE_LEN),
        device,
        env,
    )
    .expect("emulation failed");
}

fn test_mov_stores_and_loads() {
    let device = TestDevice::new();
    let env = TestEnv::new();
    let mut regs = long_mode_regs();

    // mov [rbx], eax
    regs.rax = 0xDEAD_BEEF_1122_3344;
    run_one(&mut regs, &[0x89, 0x03], DEVICE_BASE, &device, &env);
    assert_eq!(device.snapshot(0, 4), 0x1122_3344);
    assert_eq!(regs.rip, 2);

    // REX.W mov [rbx+8], rax
    run_one(&mut regs, &[0x48, 0x89, 0x43, 0x08], DEVICE_BASE + 8, &device, &env);
    assert_eq!(device.snapshot(8, 8), 0xDEAD_BEEF_1122_3344);
    assert_eq!(regs.rip, 2 + 4);

    // mov ecx, [rbx]
    let rip_before = regs.rip;
    run_one(&mut regs, &[0x8B, 0x0B], DEVICE_BASE, &device, &env);
    assert_eq!(regs.rcx, 0x1122_3344);
    assert_eq!(regs.rip, rip_before + 2);

    // mov byte [rbx+1], 0x7F
    run_one(&mut regs, &[0xC6, 0x43, 0x01, 0x7F], DEVICE_BASE + 1, &device, &env);
    assert_eq!(device.snapshot(1, 1), 0x7F);

    log::info!("emulate tests: mov ok");
}

fn test_movzx_movsx() {
    let device = TestDevice::new();
    let env = TestEnv::new();
    let mut regs = long_mode_regs();

    device.fill(0, &[0x80]);

    // movzx eax, byte [rbx]
    run_one(&mut regs, &[0x0F, 0xB6, 0x03], DEVICE_BASE, &device, &env);
    assert_eq!(regs.rax, 0x80);
    assert_eq!(regs.rip, 3);

    // movsx ecx, byte [rbx]: sign bit spreads through the dword,
    // the dword write zeroes the top half.
    run_one(&mut regs, &[0x0F, 0xBE, 0x0B], DEVICE_BASE, &device, &env);
    assert_eq!(regs.rcx, 0xFFFF_FF80);

    log::info!("emulate tests: movzx/movsx ok");
}

fn test_cmpxchg() {
    let device = TestDevice::new();
    let env = TestEnv::new();
    let mut regs = long_mode_regs();

    device.fill(0, &0x11u32.to_le_bytes());

    // cmpxchg [rbx], ecx with eax == memory: store happens, ZF set.
    regs.rax = 0x11;
    regs.rcx = 0x22;
    run_one(&mut regs, &[0x0F, 0xB1, 0x0B], DEVICE_BASE, &device, &env);
    assert_eq!(device.snapshot(0, 4), 0x22);
    assert!(regs.rflags & (1 << 6) != 0);

    // Mismatch: memory wins, ZF clear, eax reloaded.
    regs.rax = 0x33;
    run_one(&mut regs, &[0x0F, 0xB1, 0x0B], DEVICE_BASE, &device, &env);
    assert_eq!(regs.rax, 0x22);
    assert!(regs.rflags & (1 << 6) == 0);

    log::info!("emulate tests: cmpxchg ok");
}

fn test_bit_ops() {
    let device = TestDevice::new();
    let env = TestEnv::new();
    let mut regs = long_mode_regs();

    // bts dword [rbx], 3
    run_one(&mut regs, &[0x0F, 0xBA, 0x2B, 0x03], DEVICE_BASE, &device, &env);
    assert_eq!(device.snapshot(0, 4), 0b1000);
    assert!(regs.rflags & 1 == 0); // bit was clear before

    // bt dword [rbx], 3: CF reflects the set bit, memory untouched.
    run_one(&mut regs, &[0x0F, 0xBA, 0x23, 0x03], DEVICE_BASE, &device, &env);
    assert_eq!(device.snapshot(0, 4), 0b1000);
    assert!(regs.rflags & 1 != 0);

    // btr clears it again.
    run_one(&mut regs, &[0x0F, 0xBA, 0x33, 0x03], DEVICE_BASE, &device, &env);
    assert_eq!(device.snapshot(0, 4), 0);

    // Register-form bt reaches past the operand dword.
    device.fill(4, &[0x01]);
    regs.rcx = 32;
    run_one(&mut regs, &[0x0F, 0xA3, 0x0B], DEVICE_BASE, &device, &env);
    assert!(regs.rflags & 1 != 0);

    log::info!("emulate tests: bit ops ok");
}

fn test_string_ops() {
    let device = TestDevice::new();
    let env = TestEnv::new();
    let mut regs = long_mode_regs();

    // rep stosd into the device: 4 dwords of eax.
    regs.rax = 0xA5A5_A5A5;
    regs.rcx = 4;
    regs.rdi = DEVICE_BASE;
    run_one(&mut regs, &[0xF3, 0xAB], DEVICE_BASE, &device, &env);
    assert_eq!(regs.rcx, 0);
    assert_eq!(regs.rdi, DEVICE_BASE + 16);
    for i in 0..4 {
        assert_eq!(device.snapshot(i * 4, 4), 0xA5A5_A5A5);
    }

    // movsb RAM -> device.
    env.write_ram(RAM_BASE, &[0xCD]).unwrap();
    regs.rsi = RAM_BASE;
    regs.rdi = DEVICE_BASE + 32;
    run_one(&mut regs, &[0xA4], DEVICE_BASE + 32, &device, &env);
    assert_eq!(device.snapshot(32, 1), 0xCD);
    assert_eq!(regs.rsi, RAM_BASE + 1);

    // movsb device -> RAM.
    regs.rsi = DEVICE_BASE + 32;
    regs.rdi = RAM_BASE + 8;
    run_one(&mut regs, &[0xA4], DEVICE_BASE + 32, &device, &env);
    let mut byte = [0u8; 1];
    env.read_ram(RAM_BASE + 8, &mut byte).unwrap();
    assert_eq!(byte[0], 0xCD);

    log::info!("emulate tests: string ops ok");
}

fn test_rejects_vex() {
    let device = TestDevice::new();
    let env = TestEnv::new();
    let mut regs = long_mode_regs();

    let result = emulate_instruction(
        &mut regs,
        &instr(&[0xC5, 0xF8, 0x28, 0x03]), // vmovaps xmm0, [rbx]
        DEVICE_BASE,
        (DEVICE_BASE, DEVICE_LEN),
        &device,
        &env,
    );
    assert!(matches!(result, Err(EmulateError::Unsupported(_))));

    log::info!("emulate tests: VEX rejection ok");
}

pub fn run() {
    test_mov_stores_and_loads();
    test_movzx_movsx();
    test_cmpxchg();
    test_bit_ops();
    test_string_ops();
    test_rejects_vex();
}
