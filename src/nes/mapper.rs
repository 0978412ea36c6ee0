use anyhow::{Result, bail};

use super::cartridge::{Cartridge, mapper_name};

const BANK_1K: usize = 0x0400;
const PRG_RAM_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
    FourScreen,
}

// Raw cartridge memory plus the 1KB-granular bank maps every board shares.
//
// `prg_map` covers `$8000-$FFFF` (32 slots) and `chr_map` covers the PPU
// pattern space `$0000-$1FFF` (8 slots). Every entry is a byte offset that is
// already reduced modulo the size of the array it points into.
struct BankMaps {
    prg_rom: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    prg_ram: Vec<u8>,
    prg_map: [usize; 32],
    chr_map: [usize; 8],
    mirroring: Mirroring,
}

impl BankMaps {
    fn new(cart: Cartridge) -> Self {
        let mut prg_rom = cart.prg_rom;
        if prg_rom.is_empty() {
            prg_rom = vec![0; BANK_1K];
        }
        let mut chr = cart.chr_data;
        if chr.is_empty() {
            chr = vec![0; BANK_1K];
        }

        let mut maps = Self {
            prg_rom,
            chr,
            chr_is_ram: cart.chr_is_ram,
            prg_ram: vec![0; PRG_RAM_SIZE],
            prg_map: [0; 32],
            chr_map: [0; 8],
            mirroring: cart.mirroring,
        };
        for slot in 0..32 {
            maps.prg_map[slot] = (slot * BANK_1K) % maps.prg_rom.len();
        }
        for slot in 0..8 {
            maps.chr_map[slot] = (slot * BANK_1K) % maps.chr.len();
        }
        maps
    }

    fn prg_banks(&self, size: usize) -> usize {
        (self.prg_rom.len() / size).max(1)
    }

    fn chr_banks(&self, size: usize) -> usize {
        (self.chr.len() / size).max(1)
    }

    fn map_prg(&mut self, size: usize, window: usize, bank: usize) {
        let slots = size / BANK_1K;
        let base = (bank % self.prg_banks(size)) * size;
        for i in 0..slots {
            let slot = window * slots + i;
            self.prg_map[slot] = (base + i * BANK_1K) % self.prg_rom.len();
        }
    }

    fn map_chr(&mut self, size: usize, window: usize, bank: usize) {
        let slots = size / BANK_1K;
        let base = (bank % self.chr_banks(size)) * size;
        for i in 0..slots {
            let slot = window * slots + i;
            self.chr_map[slot] = (base + i * BANK_1K) % self.chr.len();
        }
    }

    fn cpu_read(&self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.prg_ram[(addr as usize - 0x6000) % PRG_RAM_SIZE],
            0x8000..=0xFFFF => {
                let slot = ((addr & 0x7FFF) >> 10) as usize;
                let idx = self.prg_map[slot] + (addr as usize & 0x03FF);
                self.prg_rom[idx % self.prg_rom.len()]
            }
            // Nothing drives the data bus here; the high address byte lingers.
            _ => (addr >> 8) as u8,
        }
    }

    fn write_prg_ram(&mut self, addr: u16, value: u8) {
        if (0x6000..=0x7FFF).contains(&addr) {
            self.prg_ram[(addr as usize - 0x6000) % PRG_RAM_SIZE] = value;
        }
    }

    fn chr_index(&self, addr: u16) -> usize {
        let addr = addr & 0x1FFF;
        let idx = self.chr_map[(addr >> 10) as usize] + (addr as usize & 0x03FF);
        idx % self.chr.len()
    }

    fn chr_read(&self, addr: u16) -> u8 {
        self.chr[self.chr_index(addr)]
    }

    fn chr_write(&mut self, addr: u16, value: u8) {
        if self.chr_is_ram {
            let idx = self.chr_index(addr);
            self.chr[idx] = value;
        }
    }
}

#[derive(Debug, Clone)]
struct Mmc1 {
    shift_register: u8,
    write_count: u8,
    control: u8,
    chr_bank0: u8,
    chr_bank1: u8,
    prg_bank: u8,
    prg_outer_bank: bool,
}

impl Mmc1 {
    fn new() -> Self {
        Self {
            shift_register: 0,
            write_count: 0,
            control: 0x0C,
            chr_bank0: 0,
            chr_bank1: 0,
            prg_bank: 0,
            prg_outer_bank: false,
        }
    }

    fn write(&mut self, banks: &mut BankMaps, addr: u16, value: u8) {
        if (value & 0x80) != 0 {
            self.shift_register = 0;
            self.write_count = 0;
            self.control |= 0x0C;
            self.apply(banks);
            return;
        }

        self.shift_register = (self.shift_register >> 1) | ((value & 0x01) << 4);
        self.write_count += 1;
        if self.write_count < 5 {
            return;
        }

        let data = self.shift_register;
        match (addr >> 13) & 0x03 {
            0 => {
                self.control = data;
                banks.mirroring = match data & 0x03 {
                    0 => Mirroring::OneScreenLower,
                    1 => Mirroring::OneScreenUpper,
                    2 => Mirroring::Vertical,
                    _ => Mirroring::Horizontal,
                };
            }
            1 => {
                self.chr_bank0 = data;
                if banks.prg_rom.len() > 256 * 1024 {
                    self.prg_outer_bank = (data & 0x10) != 0;
                }
            }
            2 => self.chr_bank1 = data,
            _ => self.prg_bank = data & 0x0F,
        }
        log::debug!(
            "MMC1 commit ${:04X} <- ${:02X} (control=${:02X})",
            addr & 0xE000,
            data,
            self.control
        );
        self.shift_register = 0;
        self.write_count = 0;
        self.apply(banks);
    }

    fn apply(&self, banks: &mut BankMaps) {
        if (self.control & 0x10) != 0 {
            banks.map_chr(0x1000, 0, self.chr_bank0 as usize);
            banks.map_chr(0x1000, 1, self.chr_bank1 as usize);
        } else {
            banks.map_chr(0x2000, 0, (self.chr_bank0 >> 1) as usize);
        }

        let outer = if self.prg_outer_bank { 16 } else { 0 };
        let last = if banks.prg_rom.len() > 256 * 1024 {
            outer + 15
        } else {
            banks.prg_banks(0x4000) - 1
        };
        let prg = self.prg_bank as usize;
        if (self.control & 0x08) == 0 {
            let first = (prg & 0x0E) + outer;
            banks.map_prg(0x4000, 0, first);
            banks.map_prg(0x4000, 1, first + 1);
        } else if (self.control & 0x04) == 0 {
            banks.map_prg(0x4000, 0, outer);
            banks.map_prg(0x4000, 1, prg + outer);
        } else {
            banks.map_prg(0x4000, 0, prg + outer);
            banks.map_prg(0x4000, 1, last);
        }
    }
}

#[derive(Debug, Clone)]
struct Mmc2 {
    prg_bank: u8,
    chr_fd_0000: u8,
    chr_fe_0000: u8,
    chr_fd_1000: u8,
    chr_fe_1000: u8,
    latch0_is_fe: bool,
    latch1_is_fe: bool,
}

impl Mmc2 {
    fn new(banks: &mut BankMaps) -> Self {
        let count = banks.prg_banks(0x2000);
        let mmc2 = Self {
            prg_bank: count.saturating_sub(4) as u8,
            chr_fd_0000: 0,
            chr_fe_0000: 0,
            chr_fd_1000: 0,
            chr_fe_1000: 0,
            latch0_is_fe: true,
            latch1_is_fe: true,
        };
        banks.map_prg(0x2000, 0, mmc2.prg_bank as usize);
        banks.map_prg(0x2000, 1, count.saturating_sub(3));
        banks.map_prg(0x2000, 2, count.saturating_sub(2));
        banks.map_prg(0x2000, 3, count.saturating_sub(1));
        mmc2.apply_chr(banks);
        mmc2
    }

    fn write(&mut self, banks: &mut BankMaps, addr: u16, value: u8) {
        match addr {
            0xA000..=0xAFFF => {
                self.prg_bank = value & 0x0F;
                banks.map_prg(0x2000, 0, self.prg_bank as usize);
                log::debug!("MMC2 PRG bank {}", self.prg_bank);
            }
            0xB000..=0xBFFF => self.chr_fd_0000 = value & 0x1F,
            0xC000..=0xCFFF => self.chr_fe_0000 = value & 0x1F,
            0xD000..=0xDFFF => self.chr_fd_1000 = value & 0x1F,
            0xE000..=0xEFFF => self.chr_fe_1000 = value & 0x1F,
            0xF000..=0xFFFF => {
                banks.mirroring = if (value & 0x01) == 0 {
                    Mirroring::Vertical
                } else {
                    Mirroring::Horizontal
                };
            }
            _ => {}
        }
        self.apply_chr(banks);
    }

    fn apply_chr(&self, banks: &mut BankMaps) {
        let left = if self.latch0_is_fe {
            self.chr_fe_0000
        } else {
            self.chr_fd_0000
        };
        let right = if self.latch1_is_fe {
            self.chr_fe_1000
        } else {
            self.chr_fd_1000
        };
        banks.map_chr(0x1000, 0, left as usize);
        banks.map_chr(0x1000, 1, right as usize);
    }

    // Tile $FD/$FE fetches flip the latch of the half they were read from.
    fn update_latches(&mut self, banks: &mut BankMaps, addr: u16) {
        let changed = match addr {
            0x0FD8 => {
                self.latch0_is_fe = false;
                true
            }
            0x0FE8 => {
                self.latch0_is_fe = true;
                true
            }
            0x1FD8..=0x1FDF => {
                self.latch1_is_fe = false;
                true
            }
            0x1FE8..=0x1FEF => {
                self.latch1_is_fe = true;
                true
            }
            _ => false,
        };
        if changed {
            self.apply_chr(banks);
        }
    }
}

#[derive(Debug, Clone)]
enum Board {
    Nrom,
    Mmc1(Mmc1),
    Unrom { bank_select: u8 },
    Mmc2(Mmc2),
}

// Cartridge hardware: the shared bank maps plus the board-specific
// registers that reprogram them.
pub struct Mapper {
    id: u8,
    banks: BankMaps,
    board: Board,
}

impl Mapper {
    pub fn new(cart: Cartridge) -> Result<Self> {
        let id = cart.mapper_id;
        let mut banks = BankMaps::new(cart);
        let board = match id {
            0 => Board::Nrom,
            1 => {
                let mmc1 = Mmc1::new();
                mmc1.apply(&mut banks);
                Board::Mmc1(mmc1)
            }
            2 => {
                let last = banks.prg_banks(0x4000) - 1;
                banks.map_prg(0x4000, 0, 0);
                banks.map_prg(0x4000, 1, last);
                Board::Unrom { bank_select: 0 }
            }
            9 => Board::Mmc2(Mmc2::new(&mut banks)),
            other => bail!("unsupported mapper {other} ({})", mapper_name(other)),
        };
        Ok(Self { id, banks, board })
    }

    pub fn name(&self) -> &'static str {
        mapper_name(self.id)
    }

    pub fn mirroring(&self) -> Mirroring {
        self.banks.mirroring
    }

    pub fn cpu_read(&self, addr: u16) -> u8 {
        self.banks.cpu_read(addr)
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8) {
        if addr < 0x8000 {
            self.banks.write_prg_ram(addr, value);
            return;
        }

        match &mut self.board {
            Board::Nrom => {}
            Board::Mmc1(mmc1) => mmc1.write(&mut self.banks, addr, value),
            Board::Unrom { bank_select } => {
                *bank_select = value & 0x0F;
                self.banks.map_prg(0x4000, 0, *bank_select as usize);
                log::debug!("UNROM PRG bank {}", *bank_select);
            }
            Board::Mmc2(mmc2) => mmc2.write(&mut self.banks, addr, value),
        }
    }

    // Pattern-table read. MMC2 boards change their CHR mapping as a side
    // effect, which is why this needs `&mut self`.
    pub fn ppu_read(&mut self, addr: u16) -> u8 {
        let addr = addr & 0x1FFF;
        let value = self.banks.chr_read(addr);
        if let Board::Mmc2(mmc2) = &mut self.board {
            mmc2.update_latches(&mut self.banks, addr);
        }
        value
    }

    pub fn ppu_write(&mut self, addr: u16, value: u8) {
        self.banks.chr_write(addr & 0x1FFF, value);
    }

    #[cfg(test)]
    fn prg_map(&self) -> [usize; 32] {
        self.banks.prg_map
    }

    #[cfg(test)]
    fn chr_map(&self) -> [usize; 8] {
        self.banks.chr_map
    }

    #[cfg(test)]
    fn mmc1_control(&self) -> Option<(u8, u8)> {
        match &self.board {
            Board::Mmc1(mmc1) => Some((mmc1.control, mmc1.write_count)),
            _ => None,
        }
    }
}
