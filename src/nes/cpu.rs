use serde::Serialize;

use super::bus::Bus;
use super::{
    FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO,
};

const NMI_VECTOR: u16 = 0xFFFA;
const RESET_VECTOR: u16 = 0xFFFC;
const IRQ_VECTOR: u16 = 0xFFFE;
const INTERRUPT_CYCLES: u32 = 7;
const OAM_DMA_STALL: u32 = 513;

// Bits of P that exist in the register itself. Break and bit 5 only appear
// in copies pushed to the stack.
const LIVE_FLAGS: u8 = !(FLAG_BREAK | FLAG_UNUSED);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuRegisters {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub sp: u8,
    pub pc: u16,
}

// When an indexed access touches the un-carried address first.
#[derive(Clone, Copy, PartialEq, Eq)]
enum DummyRead {
    OnCarry,
    Always,
}

#[derive(Debug, Clone, Copy, Default)]
struct InterruptLines {
    nmi_line: bool,
    nmi_pending: bool,
    irq_line: bool,
    // CLI, SEI and PLP change I one instruction late for IRQ purposes.
    irq_delay: bool,
    prev_interrupt_disable: bool,
}

// Ricoh 2A03 core without the audio unit. One `tick` is one CPU cycle: the
// whole instruction executes on its first cycle and the rest are counted
// down, so bus side effects land at instruction granularity.
pub struct Cpu {
    pub(crate) a: u8,
    pub(crate) x: u8,
    pub(crate) y: u8,
    pub(crate) p: u8,
    pub(crate) sp: u8,
    pub(crate) pc: u16,

    cycles: u32,
    total_cycles: u64,
    halted: bool,
    idle: bool,
    idle_cycles: u32,
    idle_loop_skip: bool,
    interrupts: InterruptLines,
}

impl Cpu {
    pub fn new(idle_loop_skip: bool) -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            p: FLAG_INTERRUPT,
            sp: 0xFD,
            pc: 0,
            cycles: 0,
            total_cycles: 0,
            halted: false,
            idle: false,
            idle_cycles: 0,
            idle_loop_skip,
            interrupts: InterruptLines::default(),
        }
    }

    pub fn reset(&mut self, bus: &mut Bus) {
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.p = FLAG_INTERRUPT;
        self.sp = 0xFD;
        self.halted = false;
        self.idle = false;
        self.idle_cycles = 0;
        self.total_cycles = 0;
        self.interrupts = InterruptLines::default();
        self.pc = bus.read_u16(RESET_VECTOR);
        self.cycles = INTERRUPT_CYCLES - 1;
        log::debug!("CPU reset, PC=${:04X}", self.pc);
    }

    pub fn registers(&self) -> CpuRegisters {
        CpuRegisters {
            a: self.a,
            x: self.x,
            y: self.y,
            p: self.p,
            sp: self.sp,
            pc: self.pc,
        }
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    // Level of the maskable interrupt input. Nothing on the supported
    // boards drives it; hosts and expansion hardware may.
    pub fn set_irq_line(&mut self, level: bool) {
        self.interrupts.irq_line = level;
    }

    pub fn tick(&mut self, bus: &mut Bus) {
        self.total_cycles += 1;

        let nmi_line = bus.nmi_line();
        let nmi_edge = nmi_line && !self.interrupts.nmi_line;
        self.interrupts.nmi_line = nmi_line;

        if self.cycles > 0 {
            self.cycles -= 1;
            self.interrupts.nmi_pending |= nmi_edge;
            return;
        }

        if self.halted {
            return;
        }

        // An edge seen on this boundary cycle is serviced at the next one.
        if self.interrupts.nmi_pending {
            self.interrupts.nmi_pending = nmi_edge;
            self.service_interrupt(bus, NMI_VECTOR);
            return;
        }
        self.interrupts.nmi_pending = nmi_edge;

        if self.poll_irq() {
            self.service_interrupt(bus, IRQ_VECTOR);
            self.set_flag(FLAG_INTERRUPT, true);
            return;
        }

        if self.idle && self.idle_loop_skip {
            self.cycles = self.idle_cycles - 1;
            return;
        }

        let opcode_pc = self.pc;
        let opcode = self.fetch_byte(bus);
        self.idle = false;
        let mut cycles = self.execute(bus, opcode, opcode_pc);
        if self.idle {
            self.idle_cycles = cycles;
        }

        if bus.take_dma_request() {
            cycles += OAM_DMA_STALL + (self.total_cycles & 1) as u32;
        }
        self.cycles = cycles - 1;
    }

    // Runs cycles up to and through the next instruction or interrupt
    // entry, returning how many cycles it took.
    pub fn step(&mut self, bus: &mut Bus) -> u32 {
        while self.cycles > 0 {
            self.tick(bus);
        }
        let start = self.total_cycles;
        self.tick(bus);
        while self.cycles > 0 {
            self.tick(bus);
        }
        (self.total_cycles - start) as u32
    }

    fn poll_irq(&mut self) -> bool {
        let lines = &mut self.interrupts;
        if !lines.irq_line {
            lines.irq_delay = false;
            return false;
        }
        if lines.irq_delay {
            lines.irq_delay = false;
            return !lines.prev_interrupt_disable;
        }
        (self.p & FLAG_INTERRUPT) == 0
    }

    fn delay_interrupt(&mut self) {
        self.interrupts.irq_delay = true;
        self.interrupts.prev_interrupt_disable = self.get_flag(FLAG_INTERRUPT);
    }

    fn service_interrupt(&mut self, bus: &mut Bus, vector: u16) {
        self.push_u16(bus, self.pc);
        self.push(bus, self.p | FLAG_UNUSED);
        self.pc = bus.read_u16(vector);
        self.idle = false;
        self.cycles = INTERRUPT_CYCLES - 1;
        log::trace!("interrupt via ${vector:04X} -> ${:04X}", self.pc);
    }

    fn execute(&mut self, bus: &mut Bus, opcode: u8, opcode_pc: u16) -> u32 {
        let aaa = opcode >> 5;
        let bbb = (opcode >> 2) & 0x07;
        match opcode & 0x03 {
            0x00 => self.exec_group0(bus, opcode, opcode_pc),
            0x01 => self.exec_group1(bus, aaa, bbb),
            0x02 => self.exec_group2(bus, opcode, aaa, bbb, opcode_pc),
            _ => self.exec_unofficial(bus, aaa, bbb),
        }
    }

    fn exec_group1(&mut self, bus: &mut Bus, aaa: u8, bbb: u8) -> u32 {
        let is_store = aaa == 4;
        let dummy = if is_store {
            DummyRead::Always
        } else {
            DummyRead::OnCarry
        };

        if bbb == 2 {
            // `STA #imm` decodes as a two-byte NOP.
            let value = self.fetch_byte(bus);
            if !is_store {
                self.exec_group1_alu(aaa, value);
            }
            return 2;
        }

        let (addr, page_crossed, cycles) = match bbb {
            0 => (self.addr_indx(bus), false, 6),
            1 => (self.addr_zp(bus), false, 3),
            3 => (self.addr_abs(bus), false, 4),
            4 => {
                let (addr, page) = self.addr_indy(bus, dummy);
                (addr, page, 5)
            }
            5 => (self.addr_zp_indexed(bus, self.x), false, 4),
            6 => {
                let (addr, page) = self.addr_abs_indexed(bus, self.y, dummy);
                (addr, page, 4)
            }
            _ => {
                let (addr, page) = self.addr_abs_indexed(bus, self.x, dummy);
                (addr, page, 4)
            }
        };

        if is_store {
            bus.write(addr, self.a);
            return match bbb {
                4 => 6,
                6 | 7 => 5,
                _ => cycles,
            };
        }

        let value = bus.read(addr);
        self.exec_group1_alu(aaa, value);
        cycles + page_crossed as u32
    }

    fn exec_group1_alu(&mut self, aaa: u8, value: u8) {
        match aaa {
            0 => self.ora(value),
            1 => self.and(value),
            2 => self.eor(value),
            3 => self.adc(value),
            5 => {
                self.a = value;
                self.update_zn(self.a);
            }
            6 => self.compare(self.a, value),
            7 => self.sbc(value),
            _ => {}
        }
    }

    fn exec_group2(&mut self, bus: &mut Bus, opcode: u8, aaa: u8, bbb: u8, opcode_pc: u16) -> u32 {
        match (aaa, bbb) {
            (_, 4) | (0..=3, 0) => self.jam(opcode, opcode_pc),
            (4 | 6 | 7, 0) => {
                self.fetch_byte(bus);
                2
            }
            (0..=3 | 6 | 7, 6) => 2,
            (4, 2) => {
                self.a = self.x;
                self.update_zn(self.a);
                2
            }
            (4, 6) => {
                self.sp = self.x;
                2
            }
            (5, 2) => {
                self.x = self.a;
                self.update_zn(self.x);
                2
            }
            (5, 6) => {
                self.x = self.sp;
                self.update_zn(self.x);
                2
            }
            (6, 2) => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
                2
            }
            (7, 2) => 2,
            (4, 7) => {
                let (addr, _) = self.addr_abs_indexed(bus, self.y, DummyRead::Always);
                let base = addr.wrapping_sub(self.y as u16);
                self.unstable_store(bus, addr, base, self.x);
                5
            }
            (4, _) => self.exec_stx(bus, bbb),
            (5, _) => self.exec_ldx(bus, bbb),
            _ => {
                let op = match aaa {
                    0 => RmwOp::Asl,
                    1 => RmwOp::Rol,
                    2 => RmwOp::Lsr,
                    3 => RmwOp::Ror,
                    6 => RmwOp::Dec,
                    _ => RmwOp::Inc,
                };
                self.exec_rmw(bus, bbb, op)
            }
        }
    }

    fn exec_stx(&mut self, bus: &mut Bus, bbb: u8) -> u32 {
        let (addr, cycles) = match bbb {
            1 => (self.addr_zp(bus), 3),
            3 => (self.addr_abs(bus), 4),
            _ => (self.addr_zp_indexed(bus, self.y), 4),
        };
        bus.write(addr, self.x);
        cycles
    }

    fn exec_ldx(&mut self, bus: &mut Bus, bbb: u8) -> u32 {
        let cycles = match bbb {
            0 => {
                self.x = self.fetch_byte(bus);
                2
            }
            1 => {
                let addr = self.addr_zp(bus);
                self.x = bus.read(addr);
                3
            }
            3 => {
                let addr = self.addr_abs(bus);
                self.x = bus.read(addr);
                4
            }
            5 => {
                let addr = self.addr_zp_indexed(bus, self.y);
                self.x = bus.read(addr);
                4
            }
            _ => {
                let (addr, page) = self.addr_abs_indexed(bus, self.y, DummyRead::OnCarry);
                self.x = bus.read(addr);
                4 + page as u32
            }
        };
        self.update_zn(self.x);
        cycles
    }

    fn exec_rmw(&mut self, bus: &mut Bus, bbb: u8, op: RmwOp) -> u32 {
        let (addr, cycles) = match bbb {
            2 => {
                self.a = self.apply_rmw(op, self.a);
                return 2;
            }
            1 => (self.addr_zp(bus), 5),
            3 => (self.addr_abs(bus), 6),
            5 => (self.addr_zp_indexed(bus, self.x), 6),
            _ => {
                let (addr, _) = self.addr_abs_indexed(bus, self.x, DummyRead::Always);
                (addr, 7)
            }
        };

        let value = bus.read(addr);
        bus.write(addr, value);
        let out = self.apply_rmw(op, value);
        bus.write(addr, out);
        cycles
    }

    fn apply_rmw(&mut self, op: RmwOp, value: u8) -> u8 {
        match op {
            RmwOp::Asl => self.asl(value),
            RmwOp::Rol => self.rol(value),
            RmwOp::Lsr => self.lsr(value),
            RmwOp::Ror => self.ror(value),
            RmwOp::Dec => {
                let out = value.wrapping_sub(1);
                self.update_zn(out);
                out
            }
            RmwOp::Inc => {
                let out = value.wrapping_add(1);
                self.update_zn(out);
                out
            }
        }
    }

    // The `cc = 11` column: combined RMW+ALU ops, SAX/LAX, immediate
    // oddities and the unstable high-byte stores.
    fn exec_unofficial(&mut self, bus: &mut Bus, aaa: u8, bbb: u8) -> u32 {
        match (aaa, bbb) {
            (_, 2) => {
                let imm = self.fetch_byte(bus);
                self.exec_unofficial_immediate(aaa, imm);
                2
            }
            // SHA (zp),Y
            (4, 4) => {
                let (addr, _) = self.addr_indy(bus, DummyRead::Always);
                let base = addr.wrapping_sub(self.y as u16);
                self.unstable_store(bus, addr, base, self.a & self.x);
                6
            }
            // TAS abs,Y
            (4, 6) => {
                let (addr, _) = self.addr_abs_indexed(bus, self.y, DummyRead::Always);
                let base = addr.wrapping_sub(self.y as u16);
                self.sp = self.a & self.x;
                self.unstable_store(bus, addr, base, self.sp);
                5
            }
            // SHA abs,Y
            (4, 7) => {
                let (addr, _) = self.addr_abs_indexed(bus, self.y, DummyRead::Always);
                let base = addr.wrapping_sub(self.y as u16);
                self.unstable_store(bus, addr, base, self.a & self.x);
                5
            }
            // SAX
            (4, _) => {
                let (addr, cycles) = match bbb {
                    0 => (self.addr_indx(bus), 6),
                    1 => (self.addr_zp(bus), 3),
                    3 => (self.addr_abs(bus), 4),
                    _ => (self.addr_zp_indexed(bus, self.y), 4),
                };
                bus.write(addr, self.a & self.x);
                cycles
            }
            // LAS abs,Y
            (5, 6) => {
                let (addr, page) = self.addr_abs_indexed(bus, self.y, DummyRead::OnCarry);
                let value = bus.read(addr) & self.sp;
                self.a = value;
                self.x = value;
                self.sp = value;
                self.update_zn(value);
                4 + page as u32
            }
            // LAX
            (5, _) => {
                let (addr, page, cycles) = match bbb {
                    0 => (self.addr_indx(bus), false, 6),
                    1 => (self.addr_zp(bus), false, 3),
                    3 => (self.addr_abs(bus), false, 4),
                    4 => {
                        let (addr, page) = self.addr_indy(bus, DummyRead::OnCarry);
                        (addr, page, 5)
                    }
                    5 => (self.addr_zp_indexed(bus, self.y), false, 4),
                    _ => {
                        let (addr, page) = self.addr_abs_indexed(bus, self.y, DummyRead::OnCarry);
                        (addr, page, 4)
                    }
                };
                let value = bus.read(addr);
                self.a = value;
                self.x = value;
                self.update_zn(value);
                cycles + page as u32
            }
            _ => {
                let (addr, cycles) = match bbb {
                    0 => (self.addr_indx(bus), 8),
                    1 => (self.addr_zp(bus), 5),
                    3 => (self.addr_abs(bus), 6),
                    4 => (self.addr_indy(bus, DummyRead::Always).0, 8),
                    5 => (self.addr_zp_indexed(bus, self.x), 6),
                    6 => (self.addr_abs_indexed(bus, self.y, DummyRead::Always).0, 7),
                    _ => (self.addr_abs_indexed(bus, self.x, DummyRead::Always).0, 7),
                };
                let op = match aaa {
                    0 => UnofficialRmwOp::Slo,
                    1 => UnofficialRmwOp::Rla,
                    2 => UnofficialRmwOp::Sre,
                    3 => UnofficialRmwOp::Rra,
                    6 => UnofficialRmwOp::Dcp,
                    _ => UnofficialRmwOp::Isc,
                };
                self.exec_unofficial_rmw(bus, addr, op);
                cycles
            }
        }
    }

    fn exec_unofficial_immediate(&mut self, aaa: u8, imm: u8) {
        match aaa {
            // ANC
            0 | 1 => {
                self.a &= imm;
                self.update_zn(self.a);
                self.set_flag(FLAG_CARRY, (self.a & 0x80) != 0);
            }
            // ALR
            2 => {
                self.a &= imm;
                self.a = self.lsr(self.a);
            }
            // ARR
            3 => {
                self.a &= imm;
                let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
                self.a = (self.a >> 1) | carry_in;
                self.update_zn(self.a);
                self.set_flag(FLAG_CARRY, (self.a & 0x40) != 0);
                self.set_flag(
                    FLAG_OVERFLOW,
                    (((self.a >> 6) & 0x01) ^ ((self.a >> 5) & 0x01)) != 0,
                );
            }
            // ANE, with the commonly observed magic constant
            4 => {
                self.a = (self.a | 0xEE) & self.x & imm;
                self.update_zn(self.a);
            }
            // LXA
            5 => {
                self.a = (self.a | 0xEE) & imm;
                self.x = self.a;
                self.update_zn(self.a);
            }
            // AXS
            6 => {
                let in_ax = self.a & self.x;
                self.set_flag(FLAG_CARRY, in_ax >= imm);
                self.x = in_ax.wrapping_sub(imm);
                self.update_zn(self.x);
            }
            _ => self.sbc(imm),
        }
    }

    fn exec_unofficial_rmw(&mut self, bus: &mut Bus, addr: u16, op: UnofficialRmwOp) {
        let value = bus.read(addr);
        bus.write(addr, value);

        let out = match op {
            UnofficialRmwOp::Slo => {
                let shifted = self.asl(value);
                self.ora(shifted);
                shifted
            }
            UnofficialRmwOp::Rla => {
                let shifted = self.rol(value);
                self.and(shifted);
                shifted
            }
            UnofficialRmwOp::Sre => {
                let shifted = self.lsr(value);
                self.eor(shifted);
                shifted
            }
            UnofficialRmwOp::Rra => {
                let shifted = self.ror(value);
                self.adc(shifted);
                shifted
            }
            UnofficialRmwOp::Dcp => {
                let decremented = value.wrapping_sub(1);
                self.compare(self.a, decremented);
                decremented
            }
            UnofficialRmwOp::Isc => {
                let incremented = value.wrapping_add(1);
                self.sbc(incremented);
                incremented
            }
        };

        bus.write(addr, out);
    }

    // SHA/SHX/SHY/TAS: the value is ANDed with the base high byte + 1, and
    // a page crossing corrupts the high byte of the target address.
    fn unstable_store(&mut self, bus: &mut Bus, addr: u16, base: u16, value: u8) {
        let h = ((base >> 8) as u8).wrapping_add(1);
        let value = value & h;
        let write_addr = if (base & 0xFF00) != (addr & 0xFF00) {
            ((value as u16) << 8) | (addr & 0x00FF)
        } else {
            addr
        };
        bus.write(write_addr, value);
    }

    fn jam(&mut self, opcode: u8, opcode_pc: u16) -> u32 {
        self.halted = true;
        log::warn!("CPU jammed by opcode ${opcode:02X} at ${opcode_pc:04X}");
        2
    }

    fn exec_group0(&mut self, bus: &mut Bus, opcode: u8, opcode_pc: u16) -> u32 {
        match opcode {
            0x00 => {
                self.fetch_byte(bus);
                self.push_u16(bus, self.pc);
                self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_INTERRUPT, true);
                self.pc = bus.read_u16(IRQ_VECTOR);
                7
            }
            0x08 => {
                bus.read(self.pc);
                self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED);
                3
            }
            0x10 => self.branch(bus, !self.get_flag(FLAG_NEGATIVE), opcode_pc),
            0x18 => {
                self.set_flag(FLAG_CARRY, false);
                2
            }
            0x20 => {
                let addr = self.fetch_word(bus);
                self.push_u16(bus, self.pc.wrapping_sub(1));
                self.pc = addr;
                6
            }
            0x24 => {
                let addr = self.addr_zp(bus);
                let value = bus.read(addr);
                self.bit(value);
                3
            }
            0x28 => {
                bus.read(self.pc);
                self.delay_interrupt();
                self.p = self.pop(bus) & LIVE_FLAGS;
                4
            }
            0x2C => {
                let addr = self.addr_abs(bus);
                let value = bus.read(addr);
                self.bit(value);
                4
            }
            0x30 => self.branch(bus, self.get_flag(FLAG_NEGATIVE), opcode_pc),
            0x38 => {
                self.set_flag(FLAG_CARRY, true);
                2
            }
            0x40 => {
                bus.read(self.pc);
                self.p = self.pop(bus) & LIVE_FLAGS;
                self.pc = self.pop_u16(bus);
                6
            }
            0x48 => {
                bus.read(self.pc);
                self.push(bus, self.a);
                3
            }
            0x4C => {
                self.pc = self.fetch_word(bus);
                self.idle = self.pc == opcode_pc;
                3
            }
            0x50 => self.branch(bus, !self.get_flag(FLAG_OVERFLOW), opcode_pc),
            0x58 => {
                self.delay_interrupt();
                self.set_flag(FLAG_INTERRUPT, false);
                2
            }
            0x60 => {
                bus.read(self.pc);
                self.pc = self.pop_u16(bus).wrapping_add(1);
                6
            }
            0x68 => {
                bus.read(self.pc);
                self.a = self.pop(bus);
                self.update_zn(self.a);
                4
            }
            0x6C => {
                let ptr = self.fetch_word(bus);
                self.pc = bus.read_u16_page_wrapped(ptr);
                // A pointer in I/O space can change under the loop.
                self.idle = self.pc == opcode_pc && !(0x2000..=0x401F).contains(&ptr);
                5
            }
            0x70 => self.branch(bus, self.get_flag(FLAG_OVERFLOW), opcode_pc),
            0x78 => {
                self.delay_interrupt();
                self.set_flag(FLAG_INTERRUPT, true);
                2
            }
            0x80 => {
                self.fetch_byte(bus);
                2
            }
            0x84 => {
                let addr = self.addr_zp(bus);
                bus.write(addr, self.y);
                3
            }
            0x88 => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
                2
            }
            0x8C => {
                let addr = self.addr_abs(bus);
                bus.write(addr, self.y);
                4
            }
            0x90 => self.branch(bus, !self.get_flag(FLAG_CARRY), opcode_pc),
            0x94 => {
                let addr = self.addr_zp_indexed(bus, self.x);
                bus.write(addr, self.y);
                4
            }
            0x98 => {
                self.a = self.y;
                self.update_zn(self.a);
                2
            }
            0x9C => {
                let (addr, _) = self.addr_abs_indexed(bus, self.x, DummyRead::Always);
                let base = addr.wrapping_sub(self.x as u16);
                self.unstable_store(bus, addr, base, self.y);
                5
            }
            0xA0 => {
                self.y = self.fetch_byte(bus);
                self.update_zn(self.y);
                2
            }
            0xA4 => {
                let addr = self.addr_zp(bus);
                self.y = bus.read(addr);
                self.update_zn(self.y);
                3
            }
            0xA8 => {
                self.y = self.a;
                self.update_zn(self.y);
                2
            }
            0xAC => {
                let addr = self.addr_abs(bus);
                self.y = bus.read(addr);
                self.update_zn(self.y);
                4
            }
            0xB0 => self.branch(bus, self.get_flag(FLAG_CARRY), opcode_pc),
            0xB4 => {
                let addr = self.addr_zp_indexed(bus, self.x);
                self.y = bus.read(addr);
                self.update_zn(self.y);
                4
            }
            0xB8 => {
                self.set_flag(FLAG_OVERFLOW, false);
                2
            }
            0xBC => {
                let (addr, page) = self.addr_abs_indexed(bus, self.x, DummyRead::OnCarry);
                self.y = bus.read(addr);
                self.update_zn(self.y);
                4 + page as u32
            }
            0xC0 => {
                let value = self.fetch_byte(bus);
                self.compare(self.y, value);
                2
            }
            0xC4 => {
                let addr = self.addr_zp(bus);
                let value = bus.read(addr);
                self.compare(self.y, value);
                3
            }
            0xC8 => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
                2
            }
            0xCC => {
                let addr = self.addr_abs(bus);
                let value = bus.read(addr);
                self.compare(self.y, value);
                4
            }
            0xD0 => self.branch(bus, !self.get_flag(FLAG_ZERO), opcode_pc),
            0xD8 => {
                self.set_flag(FLAG_DECIMAL, false);
                2
            }
            0xE0 => {
                let value = self.fetch_byte(bus);
                self.compare(self.x, value);
                2
            }
            0xE4 => {
                let addr = self.addr_zp(bus);
                let value = bus.read(addr);
                self.compare(self.x, value);
                3
            }
            0xE8 => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
                2
            }
            0xEC => {
                let addr = self.addr_abs(bus);
                let value = bus.read(addr);
                self.compare(self.x, value);
                4
            }
            0xF0 => self.branch(bus, self.get_flag(FLAG_ZERO), opcode_pc),
            0xF8 => {
                self.set_flag(FLAG_DECIMAL, true);
                2
            }

            0x04 | 0x44 | 0x64 => {
                let addr = self.addr_zp(bus);
                bus.read(addr);
                3
            }
            0x0C => {
                let addr = self.addr_abs(bus);
                bus.read(addr);
                4
            }
            0x14 | 0x34 | 0x54 | 0x74 | 0xD4 | 0xF4 => {
                let addr = self.addr_zp_indexed(bus, self.x);
                bus.read(addr);
                4
            }
            // 0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC
            _ => {
                let (addr, page) = self.addr_abs_indexed(bus, self.x, DummyRead::OnCarry);
                bus.read(addr);
                4 + page as u32
            }
        }
    }

    fn addr_zp(&mut self, bus: &mut Bus) -> u16 {
        self.fetch_byte(bus) as u16
    }

    fn addr_zp_indexed(&mut self, bus: &mut Bus, index: u8) -> u16 {
        let base = self.fetch_byte(bus);
        bus.read(base as u16);
        base.wrapping_add(index) as u16
    }

    fn addr_abs(&mut self, bus: &mut Bus) -> u16 {
        self.fetch_word(bus)
    }

    // `abs,X` / `abs,Y`. Returns the effective address and whether the
    // index carried into the high byte.
    fn addr_abs_indexed(&mut self, bus: &mut Bus, index: u8, dummy: DummyRead) -> (u16, bool) {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(index as u16);
        (addr, Self::dummy_read(bus, base, addr, dummy))
    }

    fn addr_indx(&mut self, bus: &mut Bus) -> u16 {
        let zp = self.fetch_byte(bus);
        bus.read(zp as u16);
        Self::read_zp_u16(bus, zp.wrapping_add(self.x))
    }

    fn addr_indy(&mut self, bus: &mut Bus, dummy: DummyRead) -> (u16, bool) {
        let zp = self.fetch_byte(bus);
        let base = Self::read_zp_u16(bus, zp);
        let addr = base.wrapping_add(self.y as u16);
        (addr, Self::dummy_read(bus, base, addr, dummy))
    }

    fn dummy_read(bus: &mut Bus, base: u16, addr: u16, dummy: DummyRead) -> bool {
        let page_crossed = (base & 0xFF00) != (addr & 0xFF00);
        if (page_crossed && dummy == DummyRead::OnCarry) || dummy == DummyRead::Always {
            bus.read((base & 0xFF00) | (addr & 0x00FF));
        }
        page_crossed
    }

    fn read_zp_u16(bus: &mut Bus, addr: u8) -> u16 {
        let lo = bus.read(addr as u16) as u16;
        let hi = bus.read(addr.wrapping_add(1) as u16) as u16;
        (hi << 8) | lo
    }

    fn branch(&mut self, bus: &mut Bus, condition: bool, opcode_pc: u16) -> u32 {
        let offset = self.fetch_byte(bus) as i8;
        if !condition {
            return 2;
        }

        let old_pc = self.pc;
        bus.read(old_pc);
        let new_pc = old_pc.wrapping_add(offset as i16 as u16);
        self.pc = new_pc;
        self.idle = new_pc == opcode_pc;

        if (old_pc & 0xFF00) != (new_pc & 0xFF00) {
            bus.read((old_pc & 0xFF00) | (new_pc & 0x00FF));
            4
        } else {
            3
        }
    }

    fn fetch_byte(&mut self, bus: &mut Bus) -> u8 {
        let value = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self, bus: &mut Bus) -> u16 {
        let lo = self.fetch_byte(bus) as u16;
        let hi = self.fetch_byte(bus) as u16;
        (hi << 8) | lo
    }

    fn push(&mut self, bus: &mut Bus, value: u8) {
        bus.write(0x0100 | self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop(&mut self, bus: &mut Bus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x0100 | self.sp as u16)
    }

    fn push_u16(&mut self, bus: &mut Bus, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pop_u16(&mut self, bus: &mut Bus) -> u16 {
        let lo = self.pop(bus) as u16;
        let hi = self.pop(bus) as u16;
        (hi << 8) | lo
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
    }

    fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn ora(&mut self, value: u8) {
        self.a |= value;
        self.update_zn(self.a);
    }

    fn and(&mut self, value: u8) {
        self.a &= value;
        self.update_zn(self.a);
    }

    fn eor(&mut self, value: u8) {
        self.a ^= value;
        self.update_zn(self.a);
    }

    fn bit(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, (self.a & value) == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
        self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(result);
    }

    fn adc(&mut self, value: u8) {
        let carry_in = self.get_flag(FLAG_CARRY) as u16;
        let a = self.a as u16;
        let b = value as u16;

        if !self.get_flag(FLAG_DECIMAL) {
            let result = a + b + carry_in;
            let out = result as u8;
            self.set_flag(FLAG_CARRY, result > 0xFF);
            self.set_flag(FLAG_OVERFLOW, ((self.a ^ out) & (value ^ out) & 0x80) != 0);
            self.a = out;
            self.update_zn(self.a);
            return;
        }

        let mut low = (a & 0x0F) + (b & 0x0F) + carry_in;
        if low >= 0x0A {
            low = ((low + 0x06) & 0x0F) + 0x10;
        }
        let mut result = (a & 0xF0) + (b & 0xF0) + low;
        // V comes from the sum before the high nibble is adjusted.
        let overflow = ((a ^ b) & 0x80) == 0 && ((a ^ result) & 0x80) != 0;
        if result >= 0xA0 {
            result += 0x60;
        }

        self.set_flag(FLAG_OVERFLOW, overflow);
        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.a = result as u8;
        self.update_zn(self.a);
    }

    fn sbc(&mut self, value: u8) {
        let borrow = !self.get_flag(FLAG_CARRY) as i16;
        let a = self.a as i16;
        let b = value as i16;
        let binary = a - b - borrow;

        self.set_flag(FLAG_CARRY, binary >= 0);
        self.set_flag(
            FLAG_OVERFLOW,
            ((self.a ^ value) & 0x80) != 0 && ((self.a ^ binary as u8) & 0x80) != 0,
        );

        self.a = if self.get_flag(FLAG_DECIMAL) {
            let mut low = (a & 0x0F) - (b & 0x0F) - borrow;
            if low < 0 {
                low = ((low - 0x06) & 0x0F) - 0x10;
            }
            let mut result = (a & 0xF0) - (b & 0xF0) + low;
            if result < 0 {
                result -= 0x60;
            }
            result as u8
        } else {
            binary as u8
        };
        self.update_zn(self.a);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = self.get_flag(FLAG_CARRY) as u8;
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }
}

#[derive(Clone, Copy)]
enum RmwOp {
    Asl,
    Rol,
    Lsr,
    Ror,
    Dec,
    Inc,
}

#[derive(Clone, Copy)]
enum UnofficialRmwOp {
    Slo,
    Rla,
    Sre,
    Rra,
    Dcp,
    Isc,
}
