//! CPU and memory state.
use crate::{
    constants::*,
    error::{Chip8Error, Chip8Result},
};

/// Core state for a chip8 interpreter.
pub struct Chip8Cpu {
    // ------------------------------------------------------------------------
    // Registers
    /// Program counter pointing to the current position in the bytecode.
    pub(crate) pc: Address,
    /// Stack pointer, the number of return addresses on the stack.
    pub(crate) sp: usize,
    /// General purpose registers for temporary values.
    ///
    /// Register 16 (VF) is used for either the carry flag or borrow switch depending on opcode.
    pub(crate) registers: [u8; REGISTER_COUNT],
    /// Pointer register used for temporarily storing an address. Since addresses are 12 bits, only the
    /// lowest (rightmost) bits are used.
    pub(crate) address: Address,
    /// (DT) Delay timer that counts down to 0.
    pub(crate) delay_timer: u8,
    /// (ST) Sound timer that counts down to 0.
    pub(crate) sound_timer: u8,
    /// Keyboard input state. Pressed is a 1 bit, released is a 0 bit.
    pub(crate) key_state: u16,

    // ------------------------------------------------------------------------
    // Memory
    /// Main memory storage space.
    pub(crate) ram: Box<[u8; MEM_SIZE]>,
    /// Stack of return pointers used for jumping when a routine call finishes.
    pub(crate) stack: [Address; STACK_SIZE],
    /// Screen buffer that is drawn too.
    pub(crate) display: Box<[bool; DISPLAY_BUFFER_SIZE]>,

    // ------------------------------------------------------------------------
    // Signals
    /// The display buffer changed since the renderer last looked.
    pub(crate) redraw: bool,
    /// The sound timer ran out since the audio device last looked.
    pub(crate) tone: bool,
}

impl Default for Chip8Cpu {
    fn default() -> Self {
        Self {
            pc: MEM_START as Address,
            sp: 0,
            registers: [0; REGISTER_COUNT],
            address: 0,
            delay_timer: 0,
            sound_timer: 0,
            key_state: 0,

            ram: Box::new([0; MEM_SIZE]),
            stack: [0; STACK_SIZE],
            display: Box::new([false; DISPLAY_BUFFER_SIZE]),

            redraw: false,
            tone: false,
        }
    }
}

impl Chip8Cpu {
    pub fn new() -> Self {
        let mut cpu = Self::default();
        cpu.reset();
        cpu
    }

    /// Zero everything except the keyboard, and load the built-in font.
    ///
    /// Keyboard state belongs to the input device and survives a reset.
    pub(crate) fn reset(&mut self) {
        self.pc = MEM_START as Address;
        self.sp = 0;
        self.registers.fill(0);
        self.address = 0;
        self.delay_timer = 0;
        self.sound_timer = 0;

        self.ram.fill(0);
        self.stack.fill(0);
        self.display.fill(false);
        self.ram[FONTSET_START as usize..FONTSET_START as usize + FONTSET_DATA_LENGTH]
            .copy_from_slice(&FONTSET);

        self.redraw = false;
        self.tone = false;
    }

    pub fn pc(&self) -> Address {
        self.pc
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Value of register `Vx`. Only the lowest nibble of the index is used.
    pub fn register(&self, vx: u8) -> u8 {
        self.registers[vx as usize & 0xF]
    }

    pub fn registers(&self) -> &[u8; REGISTER_COUNT] {
        &self.registers
    }

    /// Address register `I`.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn delay_timer(&self) -> u8 {
        self.delay_timer
    }

    pub fn sound_timer(&self) -> u8 {
        self.sound_timer
    }

    pub fn ram(&self) -> &[u8; MEM_SIZE] {
        &self.ram
    }

    /// Return addresses currently on the stack, oldest first.
    pub fn stack(&self) -> &[Address] {
        &self.stack[..self.sp]
    }

    pub fn display(&self) -> &[bool; DISPLAY_BUFFER_SIZE] {
        &self.display
    }

    // ------------------------------------------------------------------------
    // Memory

    /// Read a byte. Addresses wrap around the 4K address space.
    #[inline(always)]
    pub fn read_byte(&self, address: usize) -> u8 {
        self.ram[address & ADDRESS_MASK]
    }

    /// Write a byte. Addresses wrap around the 4K address space.
    #[inline(always)]
    pub fn write_byte(&mut self, address: usize, value: u8) {
        self.ram[address & ADDRESS_MASK] = value;
    }

    /// Extract the instruction at the current program counter.
    #[inline(always)]
    pub fn instr(&self) -> Chip8Result<[u8; 2]> {
        let pc = self.pc as usize;
        if pc + 1 >= MEM_SIZE {
            return Err(Chip8Error::FetchOutOfBounds { pc: self.pc });
        }
        Ok([self.ram[pc], self.ram[pc + 1]])
    }

    // ------------------------------------------------------------------------
    // Call stack

    /// Push a return address. Fails without changing state when all
    /// levels are in use.
    #[inline]
    pub fn push_return(&mut self, address: Address) -> Chip8Result<()> {
        if self.sp >= STACK_SIZE {
            return Err(Chip8Error::StackOverflow { pc: self.pc });
        }
        self.stack[self.sp] = address;
        self.sp += 1;
        Ok(())
    }

    /// Pop the most recent return address. Fails without changing state
    /// when the stack is empty.
    #[inline]
    pub fn pop_return(&mut self) -> Chip8Result<Address> {
        if self.sp == 0 {
            return Err(Chip8Error::StackUnderflow { pc: self.pc });
        }
        self.sp -= 1;
        Ok(self.stack[self.sp])
    }

    // ------------------------------------------------------------------------
    // Display

    pub fn clear_display(&mut self) {
        self.display.fill(false);
        self.redraw = true;
    }

    /// Flip the pixel at the given coordinate, wrapping around the edges
    /// of the screen.
    ///
    /// Returns `true` when the pixel was erased.
    #[inline]
    pub fn toggle_pixel(&mut self, x: usize, y: usize) -> bool {
        let d = (x & DISPLAY_WIDTH_MASK) + (y & DISPLAY_HEIGHT_MASK) * DISPLAY_WIDTH;
        let old_px = self.display[d];
        self.display[d] = !old_px;
        self.redraw = true;
        old_px
    }

    /// Check and clear the redraw signal.
    pub fn take_redraw(&mut self) -> bool {
        std::mem::take(&mut self.redraw)
    }

    /// Check and clear the tone signal.
    pub fn take_tone(&mut self) -> bool {
        std::mem::take(&mut self.tone)
    }

    // ------------------------------------------------------------------------
    // Timers

    /// Count down both timers by one.
    ///
    /// Raises the tone signal when the sound timer runs out.
    /// Returns `true` if it did.
    #[inline]
    pub fn tick_timers(&mut self) -> bool {
        self.delay_timer = self.delay_timer.saturating_sub(1);

        let tone = self.sound_timer == 1;
        self.sound_timer = self.sound_timer.saturating_sub(1);
        if tone {
            self.tone = true;
        }
        tone
    }

    // ------------------------------------------------------------------------
    // Keyboard

    pub fn set_key_state(&mut self, key_id: u8, state: bool) {
        if key_id < KEY_COUNT {
            if state {
                self.key_state |= 1 << key_id;
            } else {
                self.key_state &= !(1 << key_id);
            }
        }
    }

    pub fn key_state(&self, key_id: u8) -> bool {
        if key_id < KEY_COUNT {
            self.key_state & (1 << key_id) > 0
        } else {
            false
        }
    }

    /// Check whether any key is pressed down.
    #[inline(always)]
    pub fn any_key(&self) -> bool {
        self.key_state > 0
    }

    /// Retrieve the value of the first key that is pressed down.
    #[inline]
    pub fn first_key(&self) -> Option<u8> {
        if self.any_key() {
            Some(self.key_state.trailing_zeros() as u8)
        } else {
            None
        }
    }

    /// Clear the keyboard input state, setting all keys to up.
    #[inline(always)]
    pub fn clear_keys(&mut self) {
        self.key_state = 0;
    }
}
