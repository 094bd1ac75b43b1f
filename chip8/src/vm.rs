//! Virtual machine.
use std::{
    fmt::{self, Write},
    time::Duration,
};

use log::{debug, trace, warn};

use crate::{
    bytecode::{Instr, Op},
    constants::*,
    cpu::Chip8Cpu,
    devices::{EntropyRng, KeyCode, RandomSource, SeededRng},
    error::{Chip8Error, Chip8Result},
    Chip8DisplayBuffer,
};

pub struct Chip8Vm {
    cpu: Chip8Cpu,
    rng: Box<dyn RandomSource>,
    conf: Chip8Conf,
}

impl Chip8Vm {
    /// Create an initialized machine.
    ///
    /// Random numbers are reproducible when the configuration carries a seed.
    pub fn new(conf: Chip8Conf) -> Self {
        let rng: Box<dyn RandomSource> = match conf.seed {
            Some(seed) => Box::new(SeededRng::new(seed)),
            None => Box::new(EntropyRng::new()),
        };
        Self::with_rng(conf, rng)
    }

    /// Create an initialized machine drawing random numbers from the given source.
    pub fn with_rng(conf: Chip8Conf, rng: Box<dyn RandomSource>) -> Self {
        let mut vm = Chip8Vm {
            cpu: Chip8Cpu::new(),
            rng,
            conf,
        };
        vm.initialize();
        vm
    }

    /// Configuration that was used to instantiate the VM.
    pub fn config(&self) -> &Chip8Conf {
        &self.conf
    }

    pub fn cpu(&self) -> &Chip8Cpu {
        &self.cpu
    }

    /// Clear memory, registers, stack, timers and display, then reload
    /// the built-in font and reseed the random source.
    pub fn initialize(&mut self) {
        self.cpu.reset();
        self.rng.reseed();
        debug!("machine initialized, pc=0x{:03X}", self.cpu.pc);
    }

    pub fn load_font(&mut self, fontset: &[u8]) -> Chip8Result<()> {
        if fontset.len() != FONTSET_DATA_LENGTH {
            return Err(Chip8Error::Font(format!(
                "fontset data must be {FONTSET_DATA_LENGTH} bytes, got {}",
                fontset.len()
            )));
        }

        let start = FONTSET_START as usize;
        self.cpu.ram[start..start + FONTSET_DATA_LENGTH].copy_from_slice(fontset);

        Ok(())
    }

    /// Write the program into memory at `MEM_START`.
    ///
    /// Nothing else is touched, so call [`Chip8Vm::initialize`] first to
    /// avoid leaking a previous program.
    pub fn load_bytecode(&mut self, bytecode: &[u8]) -> Chip8Result<()> {
        if !check_program_size(bytecode) {
            return Err(Chip8Error::LargeProgram {
                len: bytecode.len(),
            });
        }

        self.cpu.ram[MEM_START..MEM_START + bytecode.len()].copy_from_slice(bytecode);
        debug!("loaded {} bytes at 0x{MEM_START:03X}", bytecode.len());

        Ok(())
    }

    pub fn display_buffer(&self) -> Chip8DisplayBuffer {
        &self.cpu.display
    }
}

/// Whether the program fits in memory after `MEM_START`.
#[inline]
pub fn check_program_size(bytecode: &[u8]) -> bool {
    bytecode.len() <= MAX_PROGRAM_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Flow {
    Ok,
    /// Program counter has jumped to a new address.
    ///
    /// This is useful for the caller to avoid being
    /// blocked on infinite or long running loops.
    ///
    /// This is returned when the interpreter encounters:
    ///
    /// - 1nnn (`JP addr`)
    /// - 2nnn (`CALL addr`)
    /// - 00EE (`RET`)
    /// - Bnnn (`JP V0, addr`)
    Jump,
    /// The display buffer changed during this cycle.
    Draw,
    /// Wait for a keypress.
    ///
    /// This is triggered by the opcode `Fx0A` (`LD Vx, K`), which holds
    /// the program counter until a key is pressed, and loads the key value into `Vx`.
    KeyWait,
}

/// VM Configuration Parameters.
#[derive(Debug, Default, Clone)]
pub struct Chip8Conf {
    /// Pace for the driver loop. The VM itself is not clocked.
    pub clock_frequency: Option<Hz>,
    /// Seed for the random number source.
    pub seed: Option<u64>,
}

/// CPU clock frequency, in hertz (per second)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Hz(pub u64);

impl From<Hz> for Duration {
    fn from(freq: Hz) -> Self {
        if freq.0 == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(NANOS_IN_SECOND / freq.0)
        }
    }
}

/// Keyboard and display
impl Chip8Vm {
    /// Sets the keyboard key input state.
    pub fn set_key(&mut self, key: KeyCode, pressed: bool) {
        self.cpu.set_key_state(key.as_u8(), pressed);
    }

    /// Replace the state of all 16 keys.
    pub fn set_keys(&mut self, keys: &[bool; KEY_COUNT as usize]) {
        for (key_id, pressed) in keys.iter().enumerate() {
            self.cpu.set_key_state(key_id as u8, *pressed);
        }
    }

    /// Clear the keyboard input state, setting all keys to up.
    pub fn clear_keys(&mut self) {
        self.cpu.clear_keys()
    }

    /// Whether the display changed since the last call.
    pub fn take_redraw(&mut self) -> bool {
        self.cpu.take_redraw()
    }

    /// Whether the sound timer ran out since the last call.
    pub fn take_tone(&mut self) -> bool {
        self.cpu.take_tone()
    }
}

/// Interpreter
impl Chip8Vm {
    /// Execute up to `step_count` cycles, stopping at the first error.
    ///
    /// Returns the control flow of the last executed cycle.
    pub fn run_steps(&mut self, step_count: usize) -> Chip8Result<Flow> {
        let mut flow = Flow::Ok;

        for _ in 0..step_count {
            flow = self.step()?;
        }

        Ok(flow)
    }

    /// Execute one fetch-decode-execute cycle, then count down the timers.
    ///
    /// An error leaves the machine exactly as it was before the call.
    pub fn step(&mut self) -> Chip8Result<Flow> {
        // Each instruction is two bytes, with the opcode identity in the first 4-bit nibble.
        let op = Op::decode_instr(Instr::from_bytes(self.cpu.instr()?));

        op_trace(self.cpu.pc, &op);

        let control_flow = self.exec(op)?;

        // Count down timers
        if self.cpu.tick_timers() {
            debug!("sound timer ran out");
        }

        Ok(control_flow)
    }

    #[inline(always)]
    fn reg(&self, vx: u8) -> u8 {
        self.cpu.registers[vx as usize]
    }

    #[inline(always)]
    fn set_reg(&mut self, vx: u8, value: u8) {
        self.cpu.registers[vx as usize] = value;
    }

    /// Write the flag register first, then the result.
    ///
    /// When `Vx` is `VF` the result wins.
    #[inline(always)]
    fn set_reg_flag(&mut self, vx: u8, value: u8, flag: bool) {
        self.cpu.registers[FLAG_REGISTER] = flag as u8;
        self.cpu.registers[vx as usize] = value;
    }

    /// Advance past the next instruction when the condition holds.
    #[inline(always)]
    fn skip_if(&mut self, cond: bool) {
        self.cpu.pc += if cond { 4 } else { 2 };
    }

    /// Execute a decoded instruction, updating the program counter.
    fn exec(&mut self, op: Op) -> Chip8Result<Flow> {
        let mut control_flow = Flow::Ok;

        match op {
            // 00E0 (CLS)
            //
            // Clear display
            Op::ClearScreen => {
                self.cpu.clear_display();
                self.cpu.pc += 2;
                control_flow = Flow::Draw;
            }
            // 00EE (RET)
            //
            // Return from a subroutine.
            // The stack holds the address of the call, so step over it.
            Op::Return => {
                let address = self.cpu.pop_return()?;
                self.cpu.pc = address + 2;
                control_flow = Flow::Jump;
            }
            // 1nnn (JP addr)
            //
            // Jump to address.
            Op::JumpAddress { address } => {
                self.cpu.pc = address;
                control_flow = Flow::Jump;
            }
            // 2nnn (CALL addr)
            //
            // Call subroutine at NNN.
            Op::Call { address } => {
                self.cpu.push_return(self.cpu.pc)?;
                self.cpu.pc = address;
                control_flow = Flow::Jump;
            }
            // 3xnn (SE Vx, byte)
            //
            // Skip the next instruction if register VX equals value NN.
            Op::Skip_Eq_Byte { vx, nn } => self.skip_if(self.reg(vx) == nn),
            // 4xnn (SNE Vx, byte)
            //
            // Skip the next instruction if register VX does not equal value NN.
            Op::Skip_NotEq_Byte { vx, nn } => self.skip_if(self.reg(vx) != nn),
            // 5xy0 (SE Vx, Vy)
            //
            // Skip the next instruction if register VX equals value VY.
            Op::Skip_Eq { vx, vy } => self.skip_if(self.reg(vx) == self.reg(vy)),
            // 6xnn (LD Vx, byte)
            //
            // Set register VX to value NN.
            Op::Load_Byte { vx, nn } => {
                self.set_reg(vx, nn);
                self.cpu.pc += 2;
            }
            // 7xnn (ADD Vx, byte)
            //
            // Add value NN to register VX. Carry flag is not set.
            Op::Add_Byte { vx, nn } => {
                self.set_reg(vx, self.reg(vx).wrapping_add(nn));
                self.cpu.pc += 2;
            }
            // Arithmetic instructions indentified by n
            Op::Load_Vx_Vy { .. }
            | Op::Or_Vx_Vy { .. }
            | Op::And_Vx_Vy { .. }
            | Op::Xor_Vx_Vy { .. }
            | Op::Add_Vx_Vy { .. }
            | Op::Sub_Vx_Vy { .. }
            | Op::ShiftRight { .. }
            | Op::SubReverse_Vx_Vy { .. }
            | Op::ShiftLeft { .. } => {
                self.exec_math(op);
                self.cpu.pc += 2;
            }
            // 9xy0 (SNE Vx, Vy)
            //
            // Skip next instruction if Vx != Vy.
            Op::Skip_NotEq { vx, vy } => self.skip_if(self.reg(vx) != self.reg(vy)),
            // Annn (LD I, addr)
            //
            // Set address register I to value NNN.
            Op::Load_Address { address } => {
                self.cpu.address = address;
                self.cpu.pc += 2;
            }
            // Bnnn (JP V0, addr)
            //
            // Jump to location nnn + V0.
            Op::Jump_V0 { address } => {
                self.cpu.pc = address + self.reg(0) as Address;
                control_flow = Flow::Jump;
            }
            // Cxnn (RND Vx, byte)
            //
            // Generate random number.
            // Set register VX to the result of bitwise AND between a random number and NN.
            Op::Random { vx, nn } => {
                let value = self.rng.random_byte() & nn;
                self.set_reg(vx, value);
                self.cpu.pc += 2;
            }
            // Dxyn (DRW Vx, Vy, nibble)
            Op::Draw { vx, vy, n } => {
                self.draw(vx, vy, n);
                self.cpu.pc += 2;
                control_flow = Flow::Draw;
            }
            // Keyboard, timers and memory instructions identified by nn
            Op::Skip_Key { .. }
            | Op::Skip_NotKey { .. }
            | Op::Load_Vx_DT { .. }
            | Op::Wait_Key { .. }
            | Op::Load_DT_Vx { .. }
            | Op::Load_ST_Vx { .. }
            | Op::Add_I_Vx { .. }
            | Op::Load_Font { .. }
            | Op::Store_Bcd { .. }
            | Op::Store_Registers { .. }
            | Op::Load_Registers { .. } => control_flow = self.exec_misc(op),
            // ----------------------------------------------------------------
            // Unsupported operation.
            Op::Unknown(word) => {
                // Empty memory after the end of a program decodes as 0000.
                if word == 0 {
                    trace!("{:04X}: empty instruction", self.cpu.pc);
                } else {
                    warn!("{:04X}: unknown opcode 0x{word:04X}", self.cpu.pc);
                }
                self.cpu.pc += 2;
            }
        }

        Ok(control_flow)
    }

    /// Execute an arithmetic instruction
    ///
    /// Both operands are read before either register is written.
    #[inline]
    fn exec_math(&mut self, op: Op) {
        match op {
            // 8xy0 (LD Vx, Vy)
            //
            // Store the value of register VY in register VX.
            Op::Load_Vx_Vy { vx, vy } => self.set_reg(vx, self.reg(vy)),
            // 8xy1 (OR Vx, Vy)
            Op::Or_Vx_Vy { vx, vy } => self.set_reg(vx, self.reg(vx) | self.reg(vy)),
            // 8xy2 (AND Vx, Vy)
            Op::And_Vx_Vy { vx, vy } => self.set_reg(vx, self.reg(vx) & self.reg(vy)),
            // 8xy3 (XOR Vx, Vy)
            Op::Xor_Vx_Vy { vx, vy } => self.set_reg(vx, self.reg(vx) ^ self.reg(vy)),
            // 8xy4 (ADD Vx, Vy)
            //
            // ADDs VY to VX, and stores the result in VX.
            // Overflow is wrapped.
            // If overflow, set VF to 1, else 0.
            Op::Add_Vx_Vy { vx, vy } => {
                let (x, y) = (self.reg(vx), self.reg(vy));
                let (result, carry) = x.overflowing_add(y);
                self.set_reg_flag(vx, result, carry);
            }
            // 8xy5 (SUB Vx, Vy)
            //
            // Subtracts VY from VX, and stores the result in VX.
            // VF is set to 0 when there is a borrow, set to 1 when there isn't.
            Op::Sub_Vx_Vy { vx, vy } => {
                let (x, y) = (self.reg(vx), self.reg(vy));
                self.set_reg_flag(vx, x.wrapping_sub(y), y <= x);
            }
            // 8xy6 (SHR Vx)
            //
            // VF is set to the least-significant bit of Vx, then Vx is shifted right by 1.
            // VY is unused.
            Op::ShiftRight { vx } => {
                let x = self.reg(vx);
                self.set_reg_flag(vx, x >> 1, x & 1 == 1);
            }
            // 8xy7 (SUBN Vx, Vy)
            //
            // Subtracts VX from VY, and stores the result in VX.
            // VF is set to 0 when there is a borrow, set to 1 when there isn't.
            Op::SubReverse_Vx_Vy { vx, vy } => {
                let (x, y) = (self.reg(vx), self.reg(vy));
                self.set_reg_flag(vx, y.wrapping_sub(x), y >= x);
            }
            // 8xyE (SHL Vx)
            //
            // VF is set to the most-significant bit of Vx, then Vx is shifted left by 1.
            // VY is unused.
            Op::ShiftLeft { vx } => {
                let x = self.reg(vx);
                self.set_reg_flag(vx, x << 1, x >> 7 == 1);
            }
            _ => unreachable!("not an arithmetic instruction: {op}"),
        }
    }

    /// Draw sprite to the display buffer, at coordinate as per registers Vx and Vy.
    ///
    /// Sprite is encoded as 8 pixels wide, N pixels high, stored in bits located in
    /// memory pointed to by address register I.
    ///
    /// If the sprite is drawn outside of the display area, it is wrapped around to the other side.
    ///
    /// If the drawing operation erases existing pixels in the display buffer, register VF is set to
    /// 1, and set to 0 if no display bits are unset. This is used for collision detection.
    fn draw(&mut self, vx: u8, vy: u8, n: u8) {
        let (x, y) = (self.reg(vx) as usize, self.reg(vy) as usize);
        let address = self.cpu.address as usize;

        self.cpu.registers[FLAG_REGISTER] = 0;
        self.cpu.redraw = true;

        for r in 0..n as usize {
            // Each row is 8 bits representing the 8 pixels of the sprite.
            let row = self.cpu.read_byte(address + r);

            for c in 0..8 {
                if ((row >> (7 - c)) & 1) == 1 && self.cpu.toggle_pixel(x + c, y + r) {
                    self.cpu.registers[FLAG_REGISTER] = 1;
                }
            }
        }
    }

    /// Execute a miscellaneous instruction
    #[inline]
    fn exec_misc(&mut self, op: Op) -> Flow {
        match op {
            // ----------------------------------------------------------------
            // Ex9E (SKP Vx)
            //
            // Keys outside the keypad are never pressed.
            Op::Skip_Key { vx } => {
                let pressed = self.cpu.key_state(self.reg(vx));
                self.skip_if(pressed);
                return Flow::Ok;
            }
            // ExA1 (SKNP Vx)
            Op::Skip_NotKey { vx } => {
                let pressed = self.cpu.key_state(self.reg(vx));
                self.skip_if(!pressed);
                return Flow::Ok;
            }
            // ----------------------------------------------------------------
            // Fx07 (LD Vx, DT)
            //
            // Set Vx = delay timer value.
            Op::Load_Vx_DT { vx } => self.set_reg(vx, self.cpu.delay_timer),
            // Fx0A (LD Vx, K)
            //
            // Wait for a key press, store the value of the key in Vx.
            // Execution stays on this instruction until a key is pressed.
            Op::Wait_Key { vx } => match self.cpu.first_key() {
                Some(k) => self.set_reg(vx, k),
                None => return Flow::KeyWait,
            },
            // Fx15 (LD DT, Vx)
            //
            // Set delay timer = Vx.
            Op::Load_DT_Vx { vx } => self.cpu.delay_timer = self.reg(vx),
            // Fx18 (LD ST, Vx)
            //
            // Set sound timer = Vx.
            Op::Load_ST_Vx { vx } => self.cpu.sound_timer = self.reg(vx),
            // Fx1E (ADD I, Vx)
            //
            // Add Vx to I
            Op::Add_I_Vx { vx } => {
                self.cpu.address = self.cpu.address.wrapping_add(self.reg(vx) as Address);
            }
            // Fx29 (LD F, Vx)
            //
            // Set I = location of sprite for digit Vx.
            Op::Load_Font { vx } => {
                let x = self.reg(vx) as Address;
                self.cpu.address = FONTSET_START + x * FONTSET_HEIGHT as Address;
            }
            // Fx33 (LD B, Vx)
            //
            // Store the binary-coded decimal representation of Vx
            // in the memory locations I, I+1, and I+2.
            #[rustfmt::skip]
            Op::Store_Bcd { vx } => {
                let addr = self.cpu.address as usize;
                let x = self.reg(vx);
                self.cpu.write_byte(addr,     x / 100);
                self.cpu.write_byte(addr + 1, x / 10 % 10);
                self.cpu.write_byte(addr + 2, x % 10);
            }
            // Fx55 (LD [I], Vx)
            //
            // Store registers V0 through Vx in memory starting at location I.
            Op::Store_Registers { vx } => {
                let addr = self.cpu.address as usize;
                for v in 0..=vx as usize {
                    self.cpu.write_byte(addr + v, self.cpu.registers[v]);
                }
            }
            // Fx65 (LD Vx, [I])
            //
            // Read registers V0 through Vx from memory starting at location I.
            Op::Load_Registers { vx } => {
                let addr = self.cpu.address as usize;
                for v in 0..=vx as usize {
                    self.cpu.registers[v] = self.cpu.read_byte(addr + v);
                }
            }
            _ => unreachable!("not a miscellaneous instruction: {op}"),
        }

        self.cpu.pc += 2;
        Flow::Ok
    }
}

/// Troubleshooting
impl Chip8Vm {
    /// Returns the contents of the memory as a human readable string.
    pub fn dump_ram(&self, count: usize) -> Result<String, fmt::Error> {
        let iter = self
            .cpu
            .ram
            .iter()
            .enumerate()
            .skip(MEM_START)
            .take(count)
            .step_by(2);
        let mut buf = String::new();

        for (i, op) in iter {
            writeln!(buf, "{:04X}: {:02X}{:02X}", i, op, self.cpu.read_byte(i + 1))?;
        }

        Ok(buf)
    }

    pub fn dump_display(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();

        for y in 0..DISPLAY_HEIGHT {
            for x in 0..DISPLAY_WIDTH {
                if self.cpu.display[x + y * DISPLAY_WIDTH] {
                    write!(buf, "#")?;
                } else {
                    write!(buf, ".")?;
                }
            }
            writeln!(buf)?;
        }

        Ok(buf)
    }
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace(pc: Address, op: &Op) {
    trace!("{pc:04X}: {op}");
}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace(_: Address, _: &Op) {}

#[cfg(test)]
mod test {
    use super::*;

    /// Random source that always returns the same byte.
    struct FixedRng(u8);

    impl RandomSource for FixedRng {
        fn random_byte(&mut self) -> u8 {
            self.0
        }
    }

    fn new_vm() -> Chip8Vm {
        Chip8Vm::with_rng(Chip8Conf::default(), Box::new(FixedRng(0xFF)))
    }

    /// Write the instruction at the program counter and execute it.
    fn run_opcode(vm: &mut Chip8Vm, opcode: u16) -> Chip8Result<Flow> {
        let pc = vm.cpu.pc as usize;
        vm.cpu.ram[pc..pc + 2].copy_from_slice(&opcode.to_be_bytes());
        vm.step()
    }

    #[test]
    fn test_clock_hz() {
        let interval: Duration = Hz(60).into();
        assert_eq!(interval.as_millis(), 16);
        let interval: Duration = Hz(0).into();
        assert_eq!(interval, Duration::ZERO);
    }

    #[test]
    fn test_initialize() {
        let mut vm = new_vm();
        vm.load_bytecode(&[0x60, 0x01]).unwrap();
        vm.step().unwrap();
        vm.cpu.address = 0x123;
        vm.cpu.delay_timer = 9;

        vm.initialize();

        assert_eq!(vm.cpu.pc, 0x200);
        assert_eq!(vm.cpu.address, 0);
        assert_eq!(vm.cpu.sp, 0);
        assert_eq!(vm.cpu.delay_timer, 0);
        assert_eq!(vm.cpu.registers, [0; REGISTER_COUNT]);
        assert_eq!(vm.cpu.ram[0x200], 0);
        assert_eq!(&vm.cpu.ram[..FONTSET_DATA_LENGTH], &FONTSET[..]);
    }

    #[test]
    fn test_load_bytecode() {
        let mut vm = new_vm();
        vm.cpu.registers[2] = 0x42;

        vm.load_bytecode(&[0xA2, 0x2A, 0x60, 0x0C]).unwrap();
        assert_eq!(&vm.cpu.ram[0x200..0x204], &[0xA2, 0x2A, 0x60, 0x0C]);
        // Loading does not otherwise touch state.
        assert_eq!(vm.cpu.registers[2], 0x42);

        vm.load_bytecode(&vec![0xFF; MAX_PROGRAM_SIZE]).unwrap();
        assert_eq!(vm.cpu.ram[MEM_SIZE - 1], 0xFF);

        assert!(matches!(
            vm.load_bytecode(&vec![0; MAX_PROGRAM_SIZE + 1]),
            Err(Chip8Error::LargeProgram { len }) if len == MAX_PROGRAM_SIZE + 1
        ));
    }

    #[test]
    fn test_load_font() {
        let mut vm = new_vm();
        assert!(matches!(vm.load_font(&[0; 10]), Err(Chip8Error::Font(_))));

        vm.load_font(&[0xAA; FONTSET_DATA_LENGTH]).unwrap();
        assert_eq!(vm.cpu.ram[0], 0xAA);
        assert_eq!(vm.cpu.ram[FONTSET_DATA_LENGTH - 1], 0xAA);
    }

    #[test]
    fn test_clear_screen() {
        let mut vm = new_vm();
        vm.cpu.display[100] = true;

        assert_eq!(run_opcode(&mut vm, 0x00E0).unwrap(), Flow::Draw);
        assert!(vm.cpu.display.iter().all(|px| !px));
        assert!(vm.take_redraw());
        assert_eq!(vm.cpu.pc, 0x202);
    }

    #[test]
    fn test_call_and_return() {
        let mut vm = new_vm();

        // 2NNN: Calls subroutine at NNN
        assert_eq!(run_opcode(&mut vm, 0x2345).unwrap(), Flow::Jump);
        assert_eq!(vm.cpu.pc, 0x345);
        assert_eq!(vm.cpu.sp, 1);
        assert_eq!(vm.cpu.stack[0], 0x200);

        // 00EE: Return from subroutine
        assert_eq!(run_opcode(&mut vm, 0x00EE).unwrap(), Flow::Jump);
        assert_eq!(vm.cpu.sp, 0);
        assert_eq!(vm.cpu.pc, 0x202);
    }

    #[test]
    fn test_return_from_nested() {
        let mut vm = new_vm();
        vm.cpu.sp = 5;
        vm.cpu.stack[4] = 0x400;

        run_opcode(&mut vm, 0x00EE).unwrap();
        assert_eq!(vm.cpu.sp, 4);
        assert_eq!(vm.cpu.pc, 0x402);
    }

    #[test]
    fn test_stack_underflow_is_fatal() {
        let mut vm = new_vm();
        vm.cpu.delay_timer = 5;

        let err = run_opcode(&mut vm, 0x00EE).unwrap_err();
        assert!(matches!(err, Chip8Error::StackUnderflow { pc: 0x200 }));

        // No part of the cycle was applied.
        assert_eq!(vm.cpu.pc, 0x200);
        assert_eq!(vm.cpu.sp, 0);
        assert_eq!(vm.cpu.delay_timer, 5);
    }

    #[test]
    fn test_stack_overflow_is_fatal() {
        let mut vm = new_vm();

        // Each call jumps to the next instruction.
        for i in 0..STACK_SIZE {
            let next = 0x202 + i as u16 * 2;
            run_opcode(&mut vm, 0x2000 | next).unwrap();
        }
        assert_eq!(vm.cpu.sp, STACK_SIZE);
        assert_eq!(vm.cpu.pc, 0x220);

        let err = run_opcode(&mut vm, 0x2300).unwrap_err();
        assert!(matches!(err, Chip8Error::StackOverflow { pc: 0x220 }));
        assert_eq!(vm.cpu.sp, STACK_SIZE);
        assert_eq!(vm.cpu.pc, 0x220);
    }

    #[test]
    fn test_jump() {
        let mut vm = new_vm();
        assert_eq!(run_opcode(&mut vm, 0x1765).unwrap(), Flow::Jump);
        assert_eq!(vm.cpu.pc, 0x765);
    }

    #[test]
    fn test_skip_byte() {
        // 3XNN: Skips the next instruction if VX equals NN
        let mut vm = new_vm();
        vm.cpu.registers[5] = 0xDC;
        run_opcode(&mut vm, 0x35DC).unwrap();
        assert_eq!(vm.cpu.pc, 0x204);
        run_opcode(&mut vm, 0x3511).unwrap();
        assert_eq!(vm.cpu.pc, 0x206);

        // 4XNN: Skips the next instruction if VX doesn't equal NN
        let mut vm = new_vm();
        vm.cpu.registers[5] = 0xDC;
        run_opcode(&mut vm, 0x45DC).unwrap();
        assert_eq!(vm.cpu.pc, 0x202);
        run_opcode(&mut vm, 0x4511).unwrap();
        assert_eq!(vm.cpu.pc, 0x206);
    }

    #[test]
    fn test_skip_register() {
        // 5XY0: Skips the next instruction if VX equals VY
        let mut vm = new_vm();
        vm.cpu.registers[8] = 0xCC;
        vm.cpu.registers[6] = 0xBB;
        vm.cpu.registers[5] = 0xCC;
        run_opcode(&mut vm, 0x5860).unwrap();
        assert_eq!(vm.cpu.pc, 0x202);
        run_opcode(&mut vm, 0x5580).unwrap();
        assert_eq!(vm.cpu.pc, 0x206);
        run_opcode(&mut vm, 0x5660).unwrap();
        assert_eq!(vm.cpu.pc, 0x20A);

        // 9XY0: Skips the next instruction if VX doesn't equal VY
        let mut vm = new_vm();
        vm.cpu.registers[4] = 34;
        vm.cpu.registers[1] = 54;
        run_opcode(&mut vm, 0x9410).unwrap();
        assert_eq!(vm.cpu.pc, 0x204);
        vm.cpu.registers[1] = 34;
        run_opcode(&mut vm, 0x9410).unwrap();
        assert_eq!(vm.cpu.pc, 0x206);
    }

    #[test]
    fn test_load_and_add_byte() {
        let mut vm = new_vm();
        run_opcode(&mut vm, 0x63BC).unwrap();
        assert_eq!(vm.cpu.registers[3], 0xBC);

        vm.cpu.registers[5] = 58;
        run_opcode(&mut vm, 0x75AB).unwrap();
        assert_eq!(vm.cpu.registers[5], 229);

        // Wraps without touching the carry flag.
        vm.cpu.registers[5] = 200;
        run_opcode(&mut vm, 0x7564).unwrap();
        assert_eq!(vm.cpu.registers[5], 44);
        assert_eq!(vm.cpu.registers[0xF], 0);
        assert_eq!(vm.cpu.pc, 0x206);
    }

    #[test]
    fn test_bitwise() {
        let mut vm = new_vm();
        vm.cpu.registers[2] = 0xAF;
        run_opcode(&mut vm, 0x8920).unwrap();
        assert_eq!(vm.cpu.registers[9], 0xAF);

        for (opcode, expected) in [
            (0x8741, 0xDE | 0x47),
            (0x8742, 0xDE & 0x47),
            (0x8743, 0xDE ^ 0x47),
        ] {
            let mut vm = new_vm();
            vm.cpu.registers[7] = 0xDE;
            vm.cpu.registers[4] = 0x47;
            run_opcode(&mut vm, opcode).unwrap();
            assert_eq!(vm.cpu.registers[7], expected, "0x{opcode:04X}");
            assert_eq!(vm.cpu.pc, 0x202);
        }
    }

    #[test]
    fn test_add_with_carry() {
        let mut vm = new_vm();
        vm.cpu.registers[7] = 128;
        vm.cpu.registers[8] = 128;
        run_opcode(&mut vm, 0x8874).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 1);
        assert_eq!(vm.cpu.registers[8], 0);

        vm.cpu.registers[7] = 79;
        vm.cpu.registers[8] = 115;
        run_opcode(&mut vm, 0x8874).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 0);
        assert_eq!(vm.cpu.registers[8], 79 + 115);

        // Exactly 255 does not carry.
        vm.cpu.registers[7] = 255;
        vm.cpu.registers[8] = 0;
        run_opcode(&mut vm, 0x8874).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 0);
        assert_eq!(vm.cpu.registers[8], 255);
    }

    #[test]
    fn test_subtract() {
        // 8XY5: VY is subtracted from VX
        let mut vm = new_vm();
        vm.cpu.registers[7] = 128;
        vm.cpu.registers[8] = 128;
        run_opcode(&mut vm, 0x8875).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 1);
        assert_eq!(vm.cpu.registers[8], 0);

        vm.cpu.registers[7] = 200;
        vm.cpu.registers[8] = 100;
        run_opcode(&mut vm, 0x8875).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 0);
        assert_eq!(vm.cpu.registers[8], 156);

        // 8XY7: VX is subtracted from VY
        let mut vm = new_vm();
        vm.cpu.registers[7] = 128;
        vm.cpu.registers[8] = 128;
        run_opcode(&mut vm, 0x8877).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 1);
        assert_eq!(vm.cpu.registers[8], 0);

        vm.cpu.registers[7] = 100;
        vm.cpu.registers[8] = 200;
        run_opcode(&mut vm, 0x8877).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 0);
        assert_eq!(vm.cpu.registers[8], 156);
    }

    #[test]
    fn test_shift() {
        let mut vm = new_vm();
        vm.cpu.registers[2] = 0b01010101;
        run_opcode(&mut vm, 0x82F6).unwrap();
        assert_eq!(vm.cpu.registers[2], 0b00101010);
        assert_eq!(vm.cpu.registers[0xF], 1);
        run_opcode(&mut vm, 0x82F6).unwrap();
        assert_eq!(vm.cpu.registers[2], 0b00010101);
        assert_eq!(vm.cpu.registers[0xF], 0);

        let mut vm = new_vm();
        vm.cpu.registers[2] = 0b10101010;
        run_opcode(&mut vm, 0x82FE).unwrap();
        assert_eq!(vm.cpu.registers[2], 0b01010100);
        assert_eq!(vm.cpu.registers[0xF], 1);
        run_opcode(&mut vm, 0x82FE).unwrap();
        assert_eq!(vm.cpu.registers[2], 0b10101000);
        assert_eq!(vm.cpu.registers[0xF], 0);
    }

    /// The flag is written before the result, so VF as destination keeps the result.
    #[test]
    fn test_flag_register_as_destination() {
        let mut vm = new_vm();
        vm.cpu.registers[0xF] = 200;
        vm.cpu.registers[1] = 100;
        run_opcode(&mut vm, 0x8F14).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 44);
    }

    #[test]
    fn test_load_address_and_jump_offset() {
        let mut vm = new_vm();
        run_opcode(&mut vm, 0xAABC).unwrap();
        assert_eq!(vm.cpu.address, 0xABC);

        vm.cpu.registers[0] = 0x43;
        assert_eq!(run_opcode(&mut vm, 0xB2BB).unwrap(), Flow::Jump);
        assert_eq!(vm.cpu.pc, 0x43 + 0x2BB);
    }

    #[test]
    fn test_random_masked() {
        let mut vm = Chip8Vm::with_rng(Chip8Conf::default(), Box::new(FixedRng(0xF0)));
        run_opcode(&mut vm, 0xC33C).unwrap();
        assert_eq!(vm.cpu.registers[3], 0x30);

        let mut vm = Chip8Vm::new(Chip8Conf::default());
        for _ in 0..32 {
            run_opcode(&mut vm, 0xC300 | 0b10101010).unwrap();
            assert_eq!(vm.cpu.registers[3] & 0b01010101, 0);
        }
    }

    #[test]
    fn test_random_reseeded_on_initialize() {
        let conf = Chip8Conf {
            seed: Some(1234),
            ..Default::default()
        };
        let mut vm = Chip8Vm::new(conf);
        run_opcode(&mut vm, 0xC1FF).unwrap();
        run_opcode(&mut vm, 0xC2FF).unwrap();
        let first = (vm.cpu.registers[1], vm.cpu.registers[2]);

        vm.initialize();
        run_opcode(&mut vm, 0xC1FF).unwrap();
        run_opcode(&mut vm, 0xC2FF).unwrap();
        assert_eq!((vm.cpu.registers[1], vm.cpu.registers[2]), first);
    }

    #[test]
    fn test_draw_font_glyph() {
        let mut vm = new_vm();
        // Glyph "0" lives at address 0.
        vm.cpu.address = 0;
        vm.cpu.registers[0] = 2;
        vm.cpu.registers[1] = 3;

        assert_eq!(run_opcode(&mut vm, 0xD015).unwrap(), Flow::Draw);
        assert_eq!(vm.cpu.registers[0xF], 0);
        assert!(vm.take_redraw());

        // 0xF0 top row, 0x90 second row.
        let row = |y: usize| &vm.cpu.display[y * DISPLAY_WIDTH..y * DISPLAY_WIDTH + 8];
        assert_eq!(row(3), &[false, false, true, true, true, true, false, false]);
        assert_eq!(row(4), &[false, false, true, false, false, true, false, false]);
        assert_eq!(vm.cpu.display.iter().filter(|px| **px).count(), 14);

        // Drawing the same sprite again erases it and reports the collision.
        run_opcode(&mut vm, 0xD015).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 1);
        assert!(vm.cpu.display.iter().all(|px| !px));
    }

    #[test]
    #[rustfmt::skip]
    fn test_draw_collision() {
        let mut vm = new_vm();

        // Draw two sprites next to each other.
        // The zero bits of the second draw must not erase
        // the pixels of the first draw
        //
        // draw sprite 1
        // ____####, vf == 0
        //
        // draw sprite 2
        // ####____, vf == 0
        vm.load_bytecode(&[
            0xA2, 0x0C, // LD I, .sprite
            0x60, 0x04, // LD v0, 4
            0x61, 0x00, // LD v1, 0
            0xD0, 0x11, // DRW v0, v1, 1
            0x60, 0x00, // LD v0, 0
            0xD0, 0x11, // DRW v0, v1, 1
            // .sprite
            0b11110000,
            0b00000000,
        ]).unwrap();

        vm.run_steps(6).unwrap();

        assert!(vm.display_buffer()[0]); // sprite 2
        assert!(vm.display_buffer()[4]); // sprite 1
        assert!(vm.display_buffer()[7]);
        assert!(!vm.display_buffer()[8]);
        assert_eq!(vm.cpu.registers[0xF], 0);
    }

    #[test]
    fn test_draw_wraps_around_edges() {
        let mut vm = new_vm();
        vm.cpu.address = 0x300;
        vm.cpu.ram[0x300] = 0b11110000;
        vm.cpu.ram[0x301] = 0b11110000;
        vm.cpu.registers[0] = 62;
        vm.cpu.registers[1] = 31;

        run_opcode(&mut vm, 0xD012).unwrap();

        let px = |x: usize, y: usize| vm.cpu.display[x + y * DISPLAY_WIDTH];
        assert!(px(62, 31) && px(63, 31) && px(0, 31) && px(1, 31));
        assert!(px(62, 0) && px(63, 0) && px(0, 0) && px(1, 0));
        assert!(!px(2, 0));
        assert_eq!(vm.cpu.registers[0xF], 0);
    }

    /// Collision is only raised, never cleared mid-sprite.
    #[test]
    fn test_draw_collision_sticks() {
        let mut vm = new_vm();
        vm.cpu.address = 0x300;
        vm.cpu.ram[0x300] = 0b10000000;
        vm.cpu.ram[0x301] = 0b01000000;
        vm.cpu.display[0] = true;

        run_opcode(&mut vm, 0xD002).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 1);
        assert!(!vm.cpu.display[0]);
        assert!(vm.cpu.display[1 + DISPLAY_WIDTH]);
    }

    #[test]
    fn test_skip_key() {
        // EX9E: Skips the next instruction if the key stored in VX is pressed
        let mut vm = new_vm();
        vm.cpu.registers[4] = 0xE;
        vm.set_key(KeyCode::KeyE, true);
        run_opcode(&mut vm, 0xE49E).unwrap();
        assert_eq!(vm.cpu.pc, 0x204);
        vm.set_key(KeyCode::KeyE, false);
        run_opcode(&mut vm, 0xE49E).unwrap();
        assert_eq!(vm.cpu.pc, 0x206);

        // EXA1: Skips the next instruction if the key stored in VX isn't pressed
        let mut vm = new_vm();
        vm.cpu.registers[4] = 0xE;
        vm.set_key(KeyCode::KeyE, true);
        run_opcode(&mut vm, 0xE4A1).unwrap();
        assert_eq!(vm.cpu.pc, 0x202);
        vm.set_key(KeyCode::KeyE, false);
        run_opcode(&mut vm, 0xE4A1).unwrap();
        assert_eq!(vm.cpu.pc, 0x206);

        // Keys beyond the keypad read as released.
        let mut vm = new_vm();
        vm.set_keys(&[true; 16]);
        vm.cpu.registers[4] = 0x20;
        run_opcode(&mut vm, 0xE4A1).unwrap();
        assert_eq!(vm.cpu.pc, 0x204);
    }

    /// Fx0A (LD Vx, K)
    ///
    /// Wait for a keypress, then store the key value in Vx.
    /// The VM must stall while waiting, and signal the state to the outer executer.
    #[test]
    #[rustfmt::skip]
    fn test_key_wait() {
        let mut vm = new_vm();
        vm.load_bytecode(&[
            0xF1, 0x0A, // LD v1, K
            0x62, 0x42  // LD v2, 0x42  ; sentinal
        ]).unwrap();
        vm.cpu.delay_timer = 10;

        // machine must stall
        for _ in 0..6 {
            assert_eq!(vm.step().unwrap(), Flow::KeyWait);
            assert_eq!(vm.cpu.pc, MEM_START as Address);
        }
        assert_eq!(vm.cpu.registers[1], 0);

        // timers keep running while stalled
        assert_eq!(vm.cpu.delay_timer, 4);

        // machine has yielded, waiting for any key to be pressed.
        vm.set_key(KeyCode::KeyC, true);
        vm.set_key(KeyCode::Key5, true);

        // machine will now advance, taking the lowest key
        assert_eq!(vm.step().unwrap(), Flow::Ok);
        assert_eq!(vm.cpu.pc, MEM_START as Address + 2);
        assert_eq!(vm.cpu.registers[1], 0x05);

        // Ensure the machine is continuing
        vm.step().unwrap();
        assert_eq!(vm.cpu.pc, MEM_START as Address + 4);
        assert_eq!(vm.cpu.registers[2], 0x42); // sentinal
    }

    #[test]
    fn test_timers() {
        // FX07: Sets VX to the value of the delay timer
        let mut vm = new_vm();
        vm.cpu.delay_timer = 120;
        run_opcode(&mut vm, 0xF207).unwrap();
        assert_eq!(vm.cpu.registers[2], 120);
        assert_eq!(vm.cpu.delay_timer, 119);

        // FX15: Sets the delay timer to VX, counted down once at the end of the cycle.
        let mut vm = new_vm();
        vm.cpu.registers[8] = 123;
        run_opcode(&mut vm, 0xF815).unwrap();
        assert_eq!(vm.cpu.delay_timer, 122);

        // FX18: Sets the sound timer to VX
        let mut vm = new_vm();
        vm.cpu.registers[8] = 123;
        run_opcode(&mut vm, 0xF818).unwrap();
        assert_eq!(vm.cpu.sound_timer, 122);
        assert!(!vm.take_tone());
    }

    #[test]
    fn test_tone_fires_once() {
        let mut vm = new_vm();
        vm.cpu.registers[1] = 3;
        run_opcode(&mut vm, 0xF118).unwrap();
        assert_eq!(vm.cpu.sound_timer, 2);
        assert!(!vm.take_tone());

        // Empty memory runs as unknown opcodes.
        vm.step().unwrap();
        assert!(!vm.take_tone());
        vm.step().unwrap();
        assert_eq!(vm.cpu.sound_timer, 0);
        assert!(vm.take_tone());

        vm.step().unwrap();
        assert!(!vm.take_tone());
    }

    #[test]
    fn test_timers_count_down_one_per_cycle() {
        let mut vm = new_vm();
        vm.cpu.delay_timer = 3;
        let mut last = vm.cpu.delay_timer;

        for _ in 0..8 {
            vm.step().unwrap();
            let now = vm.cpu.delay_timer;
            assert!(now == last.saturating_sub(1));
            last = now;
        }
        assert_eq!(vm.cpu.delay_timer, 0);
    }

    #[test]
    fn test_add_address() {
        let mut vm = new_vm();
        vm.cpu.address = 23;
        vm.cpu.registers[5] = 149;
        run_opcode(&mut vm, 0xF51E).unwrap();
        assert_eq!(vm.cpu.address, 23 + 149);
    }

    #[test]
    fn test_font_address() {
        let mut vm = new_vm();
        vm.cpu.registers[8] = 8;
        run_opcode(&mut vm, 0xF829).unwrap();
        assert_eq!(vm.cpu.address, 40);
    }

    #[test]
    fn test_bcd() {
        let mut vm = new_vm();
        vm.cpu.address = 0x300;
        vm.cpu.registers[1] = 254;
        run_opcode(&mut vm, 0xF133).unwrap();
        assert_eq!(&vm.cpu.ram[0x300..0x303], &[2, 5, 4]);

        vm.cpu.registers[1] = 7;
        run_opcode(&mut vm, 0xF133).unwrap();
        assert_eq!(&vm.cpu.ram[0x300..0x303], &[0, 0, 7]);
    }

    #[test]
    fn test_store_registers() {
        let mut vm = new_vm();
        vm.cpu.address = 0x300;
        vm.cpu.registers[0] = 0xAB;
        vm.cpu.registers[4] = 0xCB;
        vm.cpu.registers[5] = 0xDB;
        run_opcode(&mut vm, 0xF455).unwrap();
        assert_eq!(vm.cpu.ram[0x300], 0xAB);
        assert_eq!(vm.cpu.ram[0x304], 0xCB);
        assert_eq!(vm.cpu.ram[0x305], 0);
        // I is left alone.
        assert_eq!(vm.cpu.address, 0x300);
    }

    #[test]
    fn test_load_registers() {
        let mut vm = new_vm();
        vm.cpu.address = 0x300;
        vm.cpu.ram[0x300] = 0xAB;
        vm.cpu.ram[0x304] = 0xCB;
        vm.cpu.ram[0x305] = 0xDB;
        run_opcode(&mut vm, 0xF465).unwrap();
        assert_eq!(vm.cpu.registers[0], 0xAB);
        assert_eq!(vm.cpu.registers[4], 0xCB);
        assert_eq!(vm.cpu.registers[5], 0);
    }

    #[test]
    fn test_store_load_round_trip() {
        let mut rng = SeededRng::new(0x5EED);

        for x in 0..REGISTER_COUNT as u16 {
            let mut vm = new_vm();
            for v in vm.cpu.registers.iter_mut() {
                *v = rng.random_byte();
            }
            let original = vm.cpu.registers;
            vm.cpu.address = 0x400;

            run_opcode(&mut vm, 0xF055 | (x << 8)).unwrap();
            vm.cpu.registers = [0; REGISTER_COUNT];
            run_opcode(&mut vm, 0xF065 | (x << 8)).unwrap();

            let x = x as usize;
            assert_eq!(vm.cpu.registers[..=x], original[..=x], "x = {x}");
            assert!(vm.cpu.registers[x + 1..].iter().all(|v| *v == 0));
        }
    }

    #[test]
    fn test_unknown_opcode_advances() {
        let mut vm = new_vm();
        vm.cpu.registers = [7; REGISTER_COUNT];

        for opcode in [0xF1FF, 0x0123, 0x5121, 0x8128] {
            let pc = vm.cpu.pc;
            assert_eq!(run_opcode(&mut vm, opcode).unwrap(), Flow::Ok);
            assert_eq!(vm.cpu.pc, pc + 2);
        }
        assert_eq!(vm.cpu.registers, [7; REGISTER_COUNT]);
    }

    #[test]
    fn test_fetch_out_of_bounds_halts() {
        let mut vm = new_vm();
        vm.cpu.pc = 0xFFF;
        vm.cpu.delay_timer = 3;

        let err = vm.step().unwrap_err();
        assert!(matches!(err, Chip8Error::FetchOutOfBounds { pc: 0xFFF }));
        assert!(err.is_halt());
        assert_eq!(vm.cpu.pc, 0xFFF);
        assert_eq!(vm.cpu.delay_timer, 3);

        // Last valid instruction slot.
        vm.cpu.pc = 0xFFE;
        vm.step().unwrap();
        assert_eq!(vm.cpu.pc, 0x1000);
        assert!(vm.step().is_err());
    }

    #[test]
    fn test_dump_display() {
        let mut vm = new_vm();
        vm.cpu.display[0] = true;
        vm.cpu.display[DISPLAY_WIDTH + 1] = true;

        let dump = vm.dump_display().unwrap();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), DISPLAY_HEIGHT);
        assert!(lines[0].starts_with("#."));
        assert!(lines[1].starts_with(".#."));
        assert_eq!(lines[2], ".".repeat(DISPLAY_WIDTH));
    }

    #[test]
    fn test_dump_ram() {
        let mut vm = new_vm();
        vm.load_bytecode(&[0x00, 0xE0, 0x12, 0x00]).unwrap();
        assert_eq!(vm.dump_ram(4).unwrap(), "0200: 00E0\n0202: 1200\n");
    }
}
