pub mod bus;
pub mod cartridge;
pub mod config;
pub mod controller;
pub mod cpu;
pub mod mapper;
pub mod ppu;

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use sha1::{Digest, Sha1};
use std::path::Path;

use bus::Bus;
use cartridge::{CHR_UNIT, Cartridge, PRG_UNIT};
use config::{Config, TvSystem};
use controller::{ButtonState, StandardController};
use cpu::{Cpu, CpuRegisters};
use mapper::Mapper;
use ppu::Ppu;

pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

pub(crate) const FLAG_CARRY: u8 = 0x01;
pub(crate) const FLAG_ZERO: u8 = 0x02;
pub(crate) const FLAG_INTERRUPT: u8 = 0x04;
pub(crate) const FLAG_DECIMAL: u8 = 0x08;
pub(crate) const FLAG_BREAK: u8 = 0x10;
pub(crate) const FLAG_UNUSED: u8 = 0x20;
pub(crate) const FLAG_OVERFLOW: u8 = 0x40;
pub(crate) const FLAG_NEGATIVE: u8 = 0x80;

// One emulated console with a cartridge inserted.
//
// The CPU, bus, PPU and mapper are built together from a cartridge and are
// thrown away together when another ROM is loaded. The controller handle
// survives ROM changes so a host input thread can keep using it.
pub struct Nes {
    config: Config,
    buttons: ButtonState,
    cpu: Cpu,
    bus: Bus,
}

impl Nes {
    pub fn from_rom_path(path: &Path, config: Config) -> Result<Self> {
        let cart = Cartridge::from_file(path)?;
        Self::from_cartridge(cart, config, ButtonState::new())
    }

    pub fn from_rom_bytes(bytes: &[u8], config: Config) -> Result<Self> {
        let cart = Cartridge::from_bytes(bytes)?;
        Self::from_cartridge(cart, config, ButtonState::new())
    }

    // Swaps in a new cartridge. On error the running core is left intact.
    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path)?;
        *self = Self::from_cartridge(cart, self.config.clone(), self.buttons.clone())?;
        Ok(())
    }

    pub fn load_rom_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let cart = Cartridge::from_bytes(bytes)?;
        *self = Self::from_cartridge(cart, self.config.clone(), self.buttons.clone())?;
        Ok(())
    }

    fn from_cartridge(cart: Cartridge, config: Config, buttons: ButtonState) -> Result<Self> {
        log::info!(
            "loaded {} (mapper {}), PRG {}x16KB, CHR {}x8KB{}, {:?} mirroring{}, {:?}",
            cart.mapper_name(),
            cart.mapper_id,
            cart.prg_rom.len() / PRG_UNIT,
            cart.chr_data.len() / CHR_UNIT,
            if cart.chr_is_ram { " RAM" } else { "" },
            cart.mirroring,
            if cart.has_battery_backed_ram { ", battery" } else { "" },
            config.tv_system,
        );
        if cart.pal_hint && config.tv_system == TvSystem::Ntsc {
            log::info!("header marks this image as PAL; running with the configured NTSC timing");
        }

        let mapper = Mapper::new(cart)?;
        let controller = StandardController::new(buttons.clone());
        let bus = Bus::new(Ppu::new(config.tv_system), mapper, Box::new(controller));
        let cpu = Cpu::new(config.idle_loop_skip);

        let mut nes = Self {
            config,
            buttons,
            cpu,
            bus,
        };
        nes.reset();
        Ok(nes)
    }

    pub fn reset(&mut self) {
        self.bus.reset();
        self.cpu.reset(&mut self.bus);
    }

    // Runs PPU dots until the scanline counter moves on, clocking the CPU
    // whenever the PPU divider says it is due.
    pub fn run_scanline(&mut self) {
        let scanline = self.bus.ppu.scanline();
        while self.bus.ppu.scanline() == scanline {
            if self.bus.clock_ppu() {
                self.cpu.tick(&mut self.bus);
            }
        }
    }

    // Runs scanlines until the next frame starts and returns the frame
    // that just completed.
    pub fn run_frame(&mut self) -> &[u16] {
        let frame = self.bus.ppu.frame_count();
        while self.bus.ppu.frame_count() == frame {
            self.run_scanline();
        }
        self.bus.ppu.frame_buffer()
    }

    pub fn frame_buffer(&self) -> &[u16] {
        self.bus.ppu.frame_buffer()
    }

    pub fn frame_count(&self) -> u64 {
        self.bus.ppu.frame_count()
    }

    pub fn set_controller_state(&self, state: u8) {
        self.buttons.set(state);
    }

    pub fn controller_handle(&self) -> ButtonState {
        self.buttons.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cpu_registers(&self) -> CpuRegisters {
        self.cpu.registers()
    }

    pub fn total_cpu_cycles(&self) -> u64 {
        self.cpu.total_cycles()
    }

    pub fn cpu_halted(&self) -> bool {
        self.cpu.halted()
    }

    pub fn peek_ram(&self, addr: u16) -> u8 {
        self.bus.peek_ram(addr)
    }

    pub fn peek_palette(&self, index: usize) -> u8 {
        self.bus.ppu.peek_palette(index)
    }

    pub fn ppu_position(&self) -> (u16, u16) {
        (self.bus.ppu.scanline(), self.bus.ppu.cycle())
    }

    pub fn mapper_name(&self) -> &'static str {
        self.bus.mapper.name()
    }
}

// SHA-1 of a frame's pixels (little-endian `u16`s), base64-encoded. Used
// by the runners to compare frames against recorded digests.
pub fn frame_digest(frame: &[u16]) -> String {
    let mut hasher = Sha1::new();
    for pixel in frame {
        hasher.update(pixel.to_le_bytes());
    }
    BASE64_STANDARD.encode(hasher.finalize())
}
