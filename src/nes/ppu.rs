use super::config::TvSystem;
use super::mapper::{Mapper, Mirroring};

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;

const MASK_GREYSCALE: u8 = 0x01;
const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;
const MASK_EMPHASIS: u8 = 0xE0;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

const SPRITE_BEHIND_BG: u8 = 0x20;
const SPRITE_FLIP_H: u8 = 0x40;
const SPRITE_FLIP_V: u8 = 0x80;

const VBLANK_SCANLINE: u16 = 241;
const LAST_CYCLE: u16 = 340;

const POWER_UP_PALETTE: [u8; 32] = [
    0x09, 0x01, 0x00, 0x01, 0x00, 0x02, 0x02, 0x0D, 0x08, 0x10, 0x08, 0x24, 0x00, 0x00, 0x04, 0x2C,
    0x09, 0x01, 0x34, 0x03, 0x00, 0x04, 0x00, 0x14, 0x08, 0x3A, 0x00, 0x02, 0x00, 0x20, 0x2C, 0x08,
];

// 2C02/2C07 picture processor, clocked one dot at a time.
//
// Output pixels are 9-bit values: the 6-bit palette index in bits 0-5 and
// the three colour emphasis bits from `$2001` in bits 6-8.
pub struct Ppu {
    tv: TvSystem,

    ctrl: u8,
    mask: u8,
    status: u8,

    oam_addr: u8,
    oam_start: u8,
    oam: [u8; 256],
    secondary_oam: [u8; 32],
    vram: [u8; 4096],
    palette: [u8; 32],

    v: u16,
    t: u16,
    fine_x: u8,
    write_toggle: bool,
    read_buffer: u8,
    open_bus: u8,
    vblank_suppress: bool,

    next_tile_id: u8,
    next_tile_attr: u8,
    next_tile_lsb: u8,
    next_tile_msb: u8,
    bg_shift_pattern_lo: u16,
    bg_shift_pattern_hi: u16,
    bg_shift_attr_lo: u16,
    bg_shift_attr_hi: u16,

    sprite_count: usize,
    sprite_zero_slot: Option<usize>,
    // Bit 0 holds the leftmost pixel of each sprite row.
    sprite_patterns_lo: [u8; 8],
    sprite_patterns_hi: [u8; 8],
    sprite_attributes: [u8; 8],
    sprite_x: [u8; 8],

    scanline: u16,
    cycle: u16,
    frame_count: u64,
    divider: u8,
    divider_slot: usize,

    front_buffer: Vec<u16>,
    back_buffer: Vec<u16>,
}

impl Ppu {
    pub fn new(tv: TvSystem) -> Self {
        Self {
            tv,
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam_start: 0,
            oam: [0; 256],
            secondary_oam: [0xFF; 32],
            vram: [0; 4096],
            palette: POWER_UP_PALETTE,
            v: 0,
            t: 0,
            fine_x: 0,
            write_toggle: false,
            read_buffer: 0,
            open_bus: 0,
            vblank_suppress: false,
            next_tile_id: 0,
            next_tile_attr: 0,
            next_tile_lsb: 0,
            next_tile_msb: 0,
            bg_shift_pattern_lo: 0,
            bg_shift_pattern_hi: 0,
            bg_shift_attr_lo: 0,
            bg_shift_attr_hi: 0,
            sprite_count: 0,
            sprite_zero_slot: None,
            sprite_patterns_lo: [0; 8],
            sprite_patterns_hi: [0; 8],
            sprite_attributes: [0; 8],
            sprite_x: [0; 8],
            scanline: 0,
            cycle: 0,
            frame_count: 0,
            divider: 0,
            divider_slot: 0,
            front_buffer: vec![0; FRAME_WIDTH * FRAME_HEIGHT],
            back_buffer: vec![0; FRAME_WIDTH * FRAME_HEIGHT],
        }
    }

    // Returns the registers and the dot counter to their power-up values.
    // VRAM, OAM and palette contents survive, as on hardware.
    pub fn reset(&mut self) {
        self.ctrl = 0;
        self.mask = 0;
        self.status = 0;
        self.oam_addr = 0;
        self.oam_start = 0;
        self.v = 0;
        self.t = 0;
        self.fine_x = 0;
        self.write_toggle = false;
        self.read_buffer = 0;
        self.open_bus = 0;
        self.vblank_suppress = false;
        self.sprite_count = 0;
        self.sprite_zero_slot = None;
        self.scanline = 0;
        self.cycle = 0;
        self.frame_count = 0;
        self.divider = 0;
        self.divider_slot = 0;
        self.front_buffer.fill(0);
        self.back_buffer.fill(0);
    }

    pub fn frame_buffer(&self) -> &[u16] {
        &self.front_buffer
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    pub fn cycle(&self) -> u16 {
        self.cycle
    }

    pub fn peek_palette(&self, index: usize) -> u8 {
        self.palette[index & 0x1F]
    }

    // Level of the NMI output: high while VBlank is set and `$2000` bit 7
    // enables it. The CPU edge-detects this.
    pub fn nmi_line(&self) -> bool {
        (self.status & STATUS_VBLANK) != 0 && (self.ctrl & CTRL_NMI_ENABLE) != 0
    }

    pub fn cpu_read_register(&mut self, addr: u16, mapper: &mut Mapper) -> u8 {
        let value = match addr {
            0x2002 => {
                // One dot before VBlank: the flag is never seen and no NMI fires.
                if self.scanline == VBLANK_SCANLINE && self.cycle == 1 {
                    self.vblank_suppress = true;
                }
                let value = (self.status & 0xE0) | (self.open_bus & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.write_toggle = false;
                value
            }
            0x2004 => {
                let value = self.oam[self.oam_addr as usize];
                if self.rendering_enabled() && self.scanline <= 240 {
                    self.open_bus = value;
                    return match self.cycle {
                        0..64 => 0xFF,
                        64..=256 => 0x00,
                        257..320 => 0xFF,
                        _ => self.secondary_oam[0],
                    };
                }
                value
            }
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                let result = if ppu_addr >= 0x3F00 {
                    self.read_buffer = self.ppu_read(ppu_addr - 0x1000, mapper);
                    self.ppu_read(ppu_addr, mapper)
                } else {
                    let buffered = self.read_buffer;
                    self.read_buffer = self.ppu_read(ppu_addr, mapper);
                    buffered
                };
                self.increment_vram_addr_cpu_access();
                result
            }
            _ => self.open_bus,
        };
        self.open_bus = value;
        value
    }

    pub fn cpu_write_register(&mut self, addr: u16, value: u8, mapper: &mut Mapper) {
        self.open_bus = value;
        match addr {
            0x2000 => {
                self.ctrl = value;
                self.t = (self.t & !0x0C00) | (((value as u16) & 0x03) << 10);
            }
            0x2001 => self.mask = value,
            0x2003 => self.oam_addr = value,
            0x2004 => {
                // Attribute bytes have no bits 2-4.
                let value = if (self.oam_addr & 0x03) == 0x02 {
                    value & 0xE3
                } else {
                    value
                };
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            0x2005 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t = (self.t & !0x001F) | ((value as u16) >> 3);
                } else {
                    self.t = (self.t & !0x03E0) | (((value as u16) >> 3) << 5);
                    self.t = (self.t & !0x7000) | (((value as u16) & 0x07) << 12);
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2006 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value as u16) & 0x3F) << 8);
                } else {
                    self.t = (self.t & 0x7F00) | value as u16;
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                self.ppu_write(ppu_addr, value, mapper);
                self.increment_vram_addr_cpu_access();
            }
            _ => {}
        }
    }

    // One byte of OAM DMA, routed through `$2004` so the attribute mask
    // and address increment apply.
    pub fn write_oam_dma_byte(&mut self, value: u8, mapper: &mut Mapper) {
        self.cpu_write_register(0x2004, value, mapper);
    }

    // Runs one dot. Returns true when the CPU is due a cycle.
    pub fn tick(&mut self, mapper: &mut Mapper) -> bool {
        let pre_render = self.scanline == self.pre_render_line();
        let visible_line = self.scanline < FRAME_HEIGHT as u16;
        let rendering_enabled = self.rendering_enabled();
        let cycle = self.cycle;

        if (visible_line || pre_render) && rendering_enabled {
            self.run_background_pipeline(mapper);

            if cycle == 65 {
                self.oam_start = self.oam_addr;
            }
            if cycle == 260 {
                self.evaluate_sprites(mapper);
            }
            // Dots 257-320 of rendering lines only; an idle PPU leaves OAMADDR alone.
            if (257..=320).contains(&cycle) {
                self.oam_addr = 0;
            }
            if pre_render && (280..=304).contains(&cycle) {
                self.copy_vertical_bits();
            }
        }

        if pre_render && cycle == 1 {
            self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
            self.vblank_suppress = false;
        } else if self.scanline == VBLANK_SCANLINE && cycle == 1 {
            if self.vblank_suppress {
                log::trace!("VBlank suppressed by $2002 read");
            } else {
                self.status |= STATUS_VBLANK;
            }
            self.vblank_suppress = false;
        }

        if visible_line && (1..=256).contains(&cycle) {
            self.render_pixel((cycle - 1) as usize);
        }

        let cpu_due = self.step_divider();
        self.advance_dot();
        cpu_due
    }

    fn pre_render_line(&self) -> u16 {
        self.tv.scanline_count() - 1
    }

    fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    fn step_divider(&mut self) -> bool {
        let period = self.tv.cpu_divider()[self.divider_slot];
        self.divider = (self.divider + 1) % period;
        if self.divider != 0 {
            return false;
        }
        self.divider_slot = (self.divider_slot + 1) % 5;
        true
    }

    fn advance_dot(&mut self) {
        if self.cycle < LAST_CYCLE {
            self.cycle += 1;
            return;
        }

        self.cycle = 0;
        self.scanline += 1;
        if self.scanline < self.tv.scanline_count() {
            return;
        }

        self.scanline = 0;
        self.frame_count += 1;
        std::mem::swap(&mut self.front_buffer, &mut self.back_buffer);

        // NTSC drops dot 0 of line 0 on odd frames while rendering.
        if self.tv.has_dot_skip() && self.rendering_enabled() && (self.frame_count & 1) == 1 {
            self.cycle = 1;
        }
    }

    fn run_background_pipeline(&mut self, mapper: &mut Mapper) {
        let cycle = self.cycle;

        if (2..=257).contains(&cycle) || (322..=337).contains(&cycle) {
            self.shift_background_registers();
            if ((cycle - 1) & 0x07) == 0 {
                self.load_background_shifters();
            }
        }

        if (1..=256).contains(&cycle) || (321..=336).contains(&cycle) {
            match (cycle - 1) & 0x07 {
                0 => self.next_tile_id = self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper),
                2 => {
                    let addr = 0x23C0
                        | (self.v & 0x0C00)
                        | ((self.v >> 4) & 0x0038)
                        | ((self.v >> 2) & 0x0007);
                    let attr = self.ppu_read(addr, mapper);
                    let shift = ((self.v >> 4) & 0x04) | (self.v & 0x02);
                    self.next_tile_attr = (attr >> shift) & 0x03;
                }
                4 => {
                    let addr = self.background_pattern_addr();
                    self.next_tile_lsb = self.ppu_read(addr, mapper);
                }
                6 => {
                    let addr = self.background_pattern_addr() + 8;
                    self.next_tile_msb = self.ppu_read(addr, mapper);
                }
                7 => {
                    self.increment_coarse_x();
                    if cycle == 256 {
                        self.increment_y();
                    }
                }
                _ => {}
            }
        } else if cycle == 257 {
            self.copy_horizontal_bits();
        } else if cycle == 338 || cycle == LAST_CYCLE {
            self.next_tile_id = self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper);
        }
    }

    fn background_pattern_addr(&self) -> u16 {
        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        };
        table + (self.next_tile_id as u16) * 16 + ((self.v >> 12) & 0x07)
    }

    fn render_pixel(&mut self, x: usize) {
        let (bg_pixel, bg_palette) = self.background_sample(x);
        let bg_opaque = bg_pixel != 0;

        let mut color = if (self.mask & MASK_SHOW_BG) == 0 {
            self.backdrop_color()
        } else if bg_opaque {
            self.palette[((bg_palette << 2) | bg_pixel) as usize]
        } else {
            self.palette[0]
        };

        if let Some((pixel, attributes)) = self.sprite_sample(x) {
            if (attributes & SPRITE_BEHIND_BG) == 0 || !bg_opaque {
                color = self.palette[0x10 | (((attributes & 0x03) << 2) | pixel) as usize];
            }
        }

        if bg_opaque && x < 255 && self.sprite0_pixel(x) != 0 {
            if (self.status & STATUS_SPRITE_ZERO_HIT) == 0 {
                log::trace!("sprite 0 hit at {},{}", x, self.scanline);
            }
            self.status |= STATUS_SPRITE_ZERO_HIT;
        }

        if (self.mask & MASK_GREYSCALE) != 0 {
            color &= 0x30;
        }

        let index = self.scanline as usize * FRAME_WIDTH + x;
        self.back_buffer[index] = (color & 0x3F) as u16 | self.emphasis_bits();
    }

    // With rendering off the PPU outputs the palette entry `v` points at,
    // which some programs use to show colours outside entry 0.
    fn backdrop_color(&self) -> u8 {
        if !self.rendering_enabled() && (0x3F01..=0x3FFE).contains(&(self.v & 0x3FFF)) {
            self.palette[self.palette_index(self.v & 0x3FFF)]
        } else {
            self.palette[0]
        }
    }

    fn emphasis_bits(&self) -> u16 {
        let bits = ((self.mask & MASK_EMPHASIS) as u16) << 1;
        if !self.tv.swaps_red_green_emphasis() {
            return bits;
        }
        let red = bits & 0x040;
        let green = bits & 0x080;
        (bits & 0x100) | (red << 1) | (green >> 1)
    }

    fn background_sample(&self, x: usize) -> (u8, u8) {
        if (self.mask & MASK_SHOW_BG) == 0 {
            return (0, 0);
        }
        if x < 8 && (self.mask & MASK_SHOW_BG_LEFT) == 0 {
            return (0, 0);
        }

        let bit = 0x8000u16 >> self.fine_x;

        let p0 = ((self.bg_shift_pattern_lo & bit) != 0) as u8;
        let p1 = ((self.bg_shift_pattern_hi & bit) != 0) as u8;
        let a0 = ((self.bg_shift_attr_lo & bit) != 0) as u8;
        let a1 = ((self.bg_shift_attr_hi & bit) != 0) as u8;

        ((p1 << 1) | p0, (a1 << 1) | a0)
    }

    fn sprites_visible_at(&self, x: usize) -> bool {
        (self.mask & MASK_SHOW_SPRITES) != 0 && (x >= 8 || (self.mask & MASK_SHOW_SPRITE_LEFT) != 0)
    }

    fn sprite_pixel(&self, slot: usize, x: usize) -> u8 {
        let offset = x as i32 - self.sprite_x[slot] as i32;
        if !(0..8).contains(&offset) {
            return 0;
        }
        let lo = (self.sprite_patterns_lo[slot] >> offset) & 0x01;
        let hi = (self.sprite_patterns_hi[slot] >> offset) & 0x01;
        (hi << 1) | lo
    }

    // Lowest-slot opaque sprite covering `x`, with its attribute byte.
    fn sprite_sample(&self, x: usize) -> Option<(u8, u8)> {
        if !self.sprites_visible_at(x) {
            return None;
        }
        (0..self.sprite_count).find_map(|slot| {
            let pixel = self.sprite_pixel(slot, x);
            (pixel != 0).then(|| (pixel, self.sprite_attributes[slot]))
        })
    }

    fn sprite0_pixel(&self, x: usize) -> u8 {
        if !self.sprites_visible_at(x) {
            return 0;
        }
        self.sprite_zero_slot
            .map_or(0, |slot| self.sprite_pixel(slot, x))
    }

    fn shift_background_registers(&mut self) {
        self.bg_shift_pattern_lo <<= 1;
        self.bg_shift_pattern_hi <<= 1;
        self.bg_shift_attr_lo <<= 1;
        self.bg_shift_attr_hi <<= 1;
    }

    fn load_background_shifters(&mut self) {
        self.bg_shift_pattern_lo = (self.bg_shift_pattern_lo & 0xFF00) | self.next_tile_lsb as u16;
        self.bg_shift_pattern_hi = (self.bg_shift_pattern_hi & 0xFF00) | self.next_tile_msb as u16;

        let attr_lo = if (self.next_tile_attr & 0x01) != 0 {
            0xFF
        } else {
            0x00
        };
        let attr_hi = if (self.next_tile_attr & 0x02) != 0 {
            0xFF
        } else {
            0x00
        };

        self.bg_shift_attr_lo = (self.bg_shift_attr_lo & 0xFF00) | attr_lo;
        self.bg_shift_attr_hi = (self.bg_shift_attr_hi & 0xFF00) | attr_hi;
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v += 1;
        }
    }

    fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v += 0x1000;
            return;
        }

        self.v &= !0x7000;
        let mut y = (self.v & 0x03E0) >> 5;
        if y == 29 {
            y = 0;
            self.v ^= 0x0800;
        } else if y == 31 {
            // Rows 30 and 31 live in attribute memory; wrapping from there
            // does not switch nametables.
            y = 0;
        } else {
            y += 1;
        }

        self.v = (self.v & !0x03E0) | (y << 5);
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & !0x041F) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & !0x7BE0) | (self.t & 0x7BE0);
    }

    // Selects up to eight sprites for the next line and fetches their
    // pattern rows. Unused slots still fetch tile `$FF` so mappers that
    // watch the pattern bus see the same traffic as on hardware.
    fn evaluate_sprites(&mut self, mapper: &mut Mapper) {
        let height: i32 = if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 {
            16
        } else {
            8
        };
        // Evaluation on the pre-render line feeds line 0, which no sprite
        // can reach: OAM Y is stored one less than the first line drawn.
        let line: i32 = if self.scanline == self.pre_render_line() {
            -1
        } else {
            self.scanline as i32
        };

        self.secondary_oam = [0xFF; 32];
        self.sprite_count = 0;
        self.sprite_zero_slot = None;

        let mut index = self.oam_start as usize;
        while index < self.oam.len() {
            let row = line - self.oam[index] as i32;
            if (0..height).contains(&row) {
                if self.sprite_count == 8 {
                    self.status |= STATUS_SPRITE_OVERFLOW;
                    log::trace!("sprite overflow on scanline {}", self.scanline);
                    break;
                }
                if index == 0 {
                    self.sprite_zero_slot = Some(self.sprite_count);
                }
                let slot = self.sprite_count * 4;
                for byte in 0..4 {
                    self.secondary_oam[slot + byte] = self.oam[(index + byte) & 0xFF];
                }
                self.sprite_count += 1;
            }
            index += 4;
        }

        for slot in 0..8 {
            if slot >= self.sprite_count {
                let addr = self.sprite_pattern_addr(0xFF, 0, height);
                self.ppu_read(addr, mapper);
                self.ppu_read(addr + 8, mapper);
                self.sprite_patterns_lo[slot] = 0;
                self.sprite_patterns_hi[slot] = 0;
                continue;
            }

            let entry = &self.secondary_oam[slot * 4..slot * 4 + 4];
            let (y, tile, attributes, x) = (entry[0], entry[1], entry[2], entry[3]);

            let mut row = (line - y as i32) as u16;
            if (attributes & SPRITE_FLIP_V) != 0 {
                row = height as u16 - 1 - row;
            }

            let addr = self.sprite_pattern_addr(tile, row, height);
            let mut low = self.ppu_read(addr, mapper);
            let mut high = self.ppu_read(addr + 8, mapper);
            if (attributes & SPRITE_FLIP_H) == 0 {
                low = low.reverse_bits();
                high = high.reverse_bits();
            }

            self.sprite_patterns_lo[slot] = low;
            self.sprite_patterns_hi[slot] = high;
            self.sprite_attributes[slot] = attributes;
            self.sprite_x[slot] = x;
        }
    }

    fn sprite_pattern_addr(&self, tile: u8, row: u16, height: i32) -> u16 {
        if height == 16 {
            let table = ((tile & 0x01) as u16) * 0x1000;
            let base = table + ((tile & 0xFE) as u16) * 16;
            if row > 7 { base + 16 + (row - 8) } else { base + row }
        } else {
            let table = if (self.ctrl & CTRL_SPRITE_TABLE) != 0 {
                0x1000
            } else {
                0x0000
            };
            table + (tile as u16) * 16 + row
        }
    }

    fn increment_vram_addr_cpu_access(&mut self) {
        let pre_render = self.scanline == self.pre_render_line();
        let render_line = self.scanline < FRAME_HEIGHT as u16 || pre_render;
        if render_line && self.rendering_enabled() {
            // Mid-render accesses bump both scroll counters instead.
            self.increment_coarse_x();
            self.increment_y();
            return;
        }

        let step = if (self.ctrl & CTRL_VRAM_INC_32) != 0 {
            32
        } else {
            1
        };
        self.v = self.v.wrapping_add(step) & 0x7FFF;
    }

    fn ppu_read(&mut self, addr: u16, mapper: &mut Mapper) -> u8 {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_read(addr),
            0x2000..=0x3EFF => self.vram[mirrored_vram_index(addr, mapper.mirroring())],
            _ => self.palette[self.palette_index(addr)],
        }
    }

    fn ppu_write(&mut self, addr: u16, value: u8, mapper: &mut Mapper) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_write(addr, value),
            0x2000..=0x3EFF => self.vram[mirrored_vram_index(addr, mapper.mirroring())] = value,
            _ => {
                let index = self.palette_index(addr);
                self.palette[index] = value & 0x3F;
            }
        }
    }

    fn palette_index(&self, addr: u16) -> usize {
        let mut index = (addr & 0x1F) as usize;
        if index >= 16 && (index & 0x03) == 0 {
            index -= 16;
        }
        index
    }
}

fn mirrored_vram_index(addr: u16, mirroring: Mirroring) -> usize {
    let index = (addr & 0x0FFF) as usize;
    let table = index / 0x400;
    let offset = index % 0x400;

    let mapped_table = match mirroring {
        Mirroring::Horizontal => table / 2,
        Mirroring::Vertical => table & 1,
        Mirroring::OneScreenLower => 0,
        Mirroring::OneScreenUpper => 1,
        Mirroring::FourScreen => table,
    };

    mapped_table * 0x400 + offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::mapper::tests::make_cart;

    fn nrom_with_chr(chr: Vec<u8>) -> Mapper {
        Mapper::new(make_cart(0, vec![0; 0x4000], chr, false)).unwrap()
    }

    fn blank_mapper() -> Mapper {
        Mapper::new(make_cart(0, vec![0; 0x4000], vec![0; 0x2000], true)).unwrap()
    }

    fn run_until(ppu: &mut Ppu, mapper: &mut Mapper, scanline: u16, cycle: u16) {
        while ppu.scanline != scanline || ppu.cycle != cycle {
            ppu.tick(mapper);
        }
    }

    #[test]
    fn coarse_x_wraps_into_next_nametable() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        ppu.v = 0x001F;
        ppu.increment_coarse_x();
        assert_eq!(ppu.v, 0x0400);

        ppu.v = 0x041F;
        ppu.increment_coarse_x();
        assert_eq!(ppu.v, 0x0000);
    }

    #[test]
    fn fine_y_carries_into_coarse_y_and_nametable() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        ppu.v = 0x1000;
        ppu.increment_y();
        assert_eq!(ppu.v, 0x2000);

        ppu.v = 0x7000 | (29 << 5);
        ppu.increment_y();
        assert_eq!(ppu.v, 0x0800);

        ppu.v = 0x7000 | (31 << 5) | 0x0800;
        ppu.increment_y();
        assert_eq!(ppu.v, 0x0800);
    }

    #[test]
    fn scroll_and_address_writes_share_the_toggle() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();

        ppu.cpu_write_register(0x2000, 0x03, &mut mapper);
        ppu.cpu_write_register(0x2005, 0x7D, &mut mapper);
        assert_eq!(ppu.fine_x, 0x05);
        ppu.cpu_write_register(0x2005, 0x5E, &mut mapper);
        assert_eq!(ppu.t, 0x0C00 | 0x000F | (0x0B << 5) | (0x06 << 12));

        ppu.cpu_write_register(0x2006, 0x3F, &mut mapper);
        ppu.cpu_read_register(0x2002, &mut mapper);
        ppu.cpu_write_register(0x2006, 0x21, &mut mapper);
        assert!(ppu.write_toggle);
        ppu.cpu_write_register(0x2006, 0x08, &mut mapper);
        assert_eq!(ppu.v, 0x2108);
    }

    #[test]
    fn status_read_clears_vblank_and_keeps_open_bus_low_bits() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.status = STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT;
        ppu.open_bus = 0x1F;
        ppu.write_toggle = true;

        assert_eq!(ppu.cpu_read_register(0x2002, &mut mapper), 0xDF);
        assert_eq!(ppu.status, STATUS_SPRITE_ZERO_HIT);
        assert!(!ppu.write_toggle);
        assert_eq!(ppu.cpu_read_register(0x2002, &mut mapper) & 0x80, 0);
    }

    #[test]
    fn vram_reads_are_buffered_but_palette_reads_are_not() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();

        for (addr, value) in [(0x2000u16, 0x11u8), (0x2001, 0x22)] {
            ppu.cpu_write_register(0x2006, (addr >> 8) as u8, &mut mapper);
            ppu.cpu_write_register(0x2006, addr as u8, &mut mapper);
            ppu.cpu_write_register(0x2007, value, &mut mapper);
        }

        ppu.cpu_write_register(0x2006, 0x20, &mut mapper);
        ppu.cpu_write_register(0x2006, 0x00, &mut mapper);
        let stale = ppu.cpu_read_register(0x2007, &mut mapper);
        assert_ne!(stale, 0x11);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0x11);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0x22);

        // $2F00 under horizontal mirroring lands in the second physical table.
        ppu.vram[0x0700] = 0x5C;
        ppu.cpu_write_register(0x2006, 0x3F, &mut mapper);
        ppu.cpu_write_register(0x2006, 0x00, &mut mapper);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), POWER_UP_PALETTE[0]);
        assert_eq!(ppu.read_buffer, 0x5C);
    }

    #[test]
    fn increment_32_and_15_bit_wrap() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.cpu_write_register(0x2000, CTRL_VRAM_INC_32, &mut mapper);
        ppu.v = 0x2000;
        ppu.cpu_write_register(0x2007, 0x00, &mut mapper);
        assert_eq!(ppu.v, 0x2020);

        ppu.v = 0x7FF0;
        ppu.cpu_write_register(0x2007, 0x00, &mut mapper);
        assert_eq!(ppu.v, 0x0010);
    }

    #[test]
    fn palette_writes_mirror_backdrop_entries_and_drop_high_bits() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.v = 0x3F10;
        ppu.cpu_write_register(0x2007, 0xFF, &mut mapper);
        assert_eq!(ppu.peek_palette(0x00), 0x3F);
        ppu.v = 0x3F35;
        ppu.cpu_write_register(0x2007, 0x21, &mut mapper);
        assert_eq!(ppu.peek_palette(0x15), 0x21);
    }

    #[test]
    fn oam_attribute_writes_drop_unimplemented_bits() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.cpu_write_register(0x2003, 0x00, &mut mapper);
        for value in [0x10, 0x20, 0xFF, 0x30] {
            ppu.cpu_write_register(0x2004, value, &mut mapper);
        }
        assert_eq!(&ppu.oam[0..4], &[0x10, 0x20, 0xE3, 0x30]);
        assert_eq!(ppu.oam_addr, 4);

        ppu.cpu_write_register(0x2003, 0x02, &mut mapper);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut mapper), 0xE3);
    }

    #[test]
    fn nametable_mirroring_modes() {
        assert_eq!(mirrored_vram_index(0x2400, Mirroring::Horizontal), 0x000);
        assert_eq!(mirrored_vram_index(0x2800, Mirroring::Horizontal), 0x400);
        assert_eq!(mirrored_vram_index(0x2800, Mirroring::Vertical), 0x000);
        assert_eq!(mirrored_vram_index(0x2C05, Mirroring::Vertical), 0x405);
        assert_eq!(mirrored_vram_index(0x2C00, Mirroring::OneScreenUpper), 0x400);
        assert_eq!(mirrored_vram_index(0x2C00, Mirroring::FourScreen), 0xC00);
        assert_eq!(mirrored_vram_index(0x3000, Mirroring::Vertical), 0x000);
    }

    #[test]
    fn vblank_raises_nmi_line_only_when_enabled() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        run_until(&mut ppu, &mut mapper, 241, 2);
        assert!(ppu.status & STATUS_VBLANK != 0);
        assert!(!ppu.nmi_line());

        ppu.cpu_write_register(0x2000, CTRL_NMI_ENABLE, &mut mapper);
        assert!(ppu.nmi_line());

        run_until(&mut ppu, &mut mapper, 261, 2);
        assert!(!ppu.nmi_line());
        assert_eq!(ppu.status & STATUS_VBLANK, 0);
    }

    #[test]
    fn status_read_one_dot_early_suppresses_vblank() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.cpu_write_register(0x2000, CTRL_NMI_ENABLE, &mut mapper);
        run_until(&mut ppu, &mut mapper, 241, 1);
        assert_eq!(ppu.cpu_read_register(0x2002, &mut mapper) & 0x80, 0);
        ppu.tick(&mut mapper);
        assert!(!ppu.nmi_line());
        assert_eq!(ppu.status & STATUS_VBLANK, 0);
    }

    #[test]
    fn ntsc_divider_yields_29780_cpu_cycles_per_idle_frame() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        let mut cpu_cycles = 0;
        while ppu.frame_count() == 0 {
            cpu_cycles += ppu.tick(&mut mapper) as u32;
        }
        assert_eq!(cpu_cycles, 29780);
    }

    #[test]
    fn pal_divider_runs_sixteen_dots_per_five_cpu_cycles() {
        let mut ppu = Ppu::new(TvSystem::Pal);
        let mut mapper = blank_mapper();
        let due: Vec<bool> = (0..16).map(|_| ppu.tick(&mut mapper)).collect();
        let cpu_cycles = due.iter().filter(|&&d| d).count();
        assert_eq!(cpu_cycles, 5);
        assert!(!due[2] && due[3]);
    }

    #[test]
    fn odd_rendering_frames_skip_one_dot() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.mask = MASK_SHOW_BG;

        let mut dots = 0u32;
        while ppu.frame_count() == 0 {
            ppu.tick(&mut mapper);
            dots += 1;
        }
        assert_eq!(dots, 262 * 341);
        assert_eq!(ppu.cycle(), 1);

        dots = 0;
        while ppu.frame_count() == 1 {
            ppu.tick(&mut mapper);
            dots += 1;
        }
        assert_eq!(dots, 262 * 341 - 1);
        assert_eq!(ppu.cycle(), 0);
    }

    #[test]
    fn sprite_evaluation_keeps_eight_and_flags_the_ninth() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.mask = MASK_SHOW_SPRITES;
        ppu.oam.fill(0xFF);
        for sprite in 0..9 {
            ppu.oam[sprite * 4] = 40;
            ppu.oam[sprite * 4 + 3] = sprite as u8 * 8;
        }

        run_until(&mut ppu, &mut mapper, 40, 261);
        assert_eq!(ppu.sprite_count, 8);
        assert_eq!(ppu.sprite_zero_slot, Some(0));
        assert_ne!(ppu.status & STATUS_SPRITE_OVERFLOW, 0);
        assert_eq!(ppu.secondary_oam[7 * 4 + 3], 56);
    }

    #[test]
    fn pre_render_evaluation_selects_nothing_for_line_zero() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.mask = MASK_SHOW_SPRITES;
        ppu.oam.fill(0xFF);
        ppu.oam[0..4].copy_from_slice(&[0xFE, 0x01, 0x00, 0x00]);

        run_until(&mut ppu, &mut mapper, 261, 261);
        assert_eq!(ppu.sprite_count, 0);
        assert_eq!(ppu.secondary_oam, [0xFF; 32]);
    }

    #[test]
    fn eight_by_sixteen_sprites_use_tile_bit_zero_as_table() {
        let ppu = Ppu::new(TvSystem::Ntsc);
        assert_eq!(ppu.sprite_pattern_addr(0x03, 0, 16), 0x1000 + 0x02 * 16);
        assert_eq!(ppu.sprite_pattern_addr(0x03, 9, 16), 0x1000 + 0x03 * 16 + 1);
        assert_eq!(ppu.sprite_pattern_addr(0x03, 2, 8), 0x03 * 16 + 2);
    }

    // CHR with tile 1 solid colour 1 and tile 2 solid colour 3.
    fn solid_tiles() -> Vec<u8> {
        let mut chr = vec![0u8; 0x2000];
        chr[16..24].fill(0xFF);
        chr[32..48].fill(0xFF);
        chr
    }

    #[test]
    fn sprite_zero_hit_needs_opaque_background() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = nrom_with_chr(solid_tiles());
        // Background of tile 1 everywhere, sprite 0 is tile 2 at (100, 51).
        ppu.vram[..0x3C0].fill(0x01);
        ppu.oam.fill(0xFF);
        ppu.oam[0..4].copy_from_slice(&[50, 0x02, 0x00, 100]);
        ppu.mask = MASK_SHOW_BG | MASK_SHOW_SPRITES | MASK_SHOW_BG_LEFT | MASK_SHOW_SPRITE_LEFT;

        run_until(&mut ppu, &mut mapper, 51, 100);
        assert_eq!(ppu.status & STATUS_SPRITE_ZERO_HIT, 0);
        ppu.tick(&mut mapper);
        ppu.tick(&mut mapper);
        assert_ne!(ppu.status & STATUS_SPRITE_ZERO_HIT, 0);

        run_until(&mut ppu, &mut mapper, 261, 2);
        assert_eq!(ppu.status & STATUS_SPRITE_ZERO_HIT, 0);
    }

    #[test]
    fn sprite_zero_hit_ignores_transparent_background() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = nrom_with_chr(solid_tiles());
        ppu.oam.fill(0xFF);
        ppu.oam[0..4].copy_from_slice(&[50, 0x02, 0x00, 100]);
        ppu.mask = MASK_SHOW_BG | MASK_SHOW_SPRITES;

        run_until(&mut ppu, &mut mapper, 60, 0);
        assert_eq!(ppu.status & STATUS_SPRITE_ZERO_HIT, 0);
    }

    #[test]
    fn frame_pixels_combine_palette_greyscale_and_emphasis() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.palette[0] = 0x16;
        ppu.mask = MASK_GREYSCALE | 0x20;

        while ppu.frame_count() == 0 {
            ppu.tick(&mut mapper);
        }
        assert_eq!(ppu.frame_buffer()[0], 0x10 | 0x040);
        assert_eq!(ppu.frame_buffer()[FRAME_WIDTH * FRAME_HEIGHT - 1], 0x050);
    }

    #[test]
    fn pal_swaps_red_and_green_emphasis() {
        let mut ppu = Ppu::new(TvSystem::Pal);
        ppu.mask = 0x20;
        assert_eq!(ppu.emphasis_bits(), 0x080);
        ppu.mask = 0x40;
        assert_eq!(ppu.emphasis_bits(), 0x040);
        ppu.mask = 0x80;
        assert_eq!(ppu.emphasis_bits(), 0x100);
    }

    #[test]
    fn backdrop_follows_v_into_palette_when_rendering_is_off() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        ppu.v = 0x3F0B;
        assert_eq!(ppu.backdrop_color(), POWER_UP_PALETTE[0x0B]);
        ppu.v = 0x2000;
        assert_eq!(ppu.backdrop_color(), POWER_UP_PALETTE[0]);
        ppu.v = 0x3FFE;
        assert_eq!(ppu.backdrop_color(), POWER_UP_PALETTE[0x1E]);
        // $3FFF sits outside the window and keeps the plain backdrop.
        ppu.v = 0x3FFF;
        assert_eq!(ppu.backdrop_color(), POWER_UP_PALETTE[0]);
        ppu.v = 0x3F0B;
        ppu.mask = MASK_SHOW_BG;
        assert_eq!(ppu.backdrop_color(), POWER_UP_PALETTE[0]);
    }

    #[test]
    fn background_tiles_render_with_left_clip() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = nrom_with_chr(solid_tiles());
        ppu.vram[..0x3C0].fill(0x01);
        ppu.palette[0] = 0x0F;
        ppu.palette[1] = 0x21;
        ppu.mask = MASK_SHOW_BG;

        // Frame 0 primes the scroll registers; frame 1 has a full picture.
        while ppu.frame_count() < 2 {
            ppu.tick(&mut mapper);
        }
        let row = &ppu.frame_buffer()[FRAME_WIDTH * 10..FRAME_WIDTH * 11];
        assert!(row[..8].iter().all(|&p| p == 0x0F));
        assert!(row[8..].iter().all(|&p| p == 0x21));
    }

    fn second_frame(ppu: &mut Ppu, mapper: &mut Mapper) -> Vec<u16> {
        while ppu.frame_count() < 2 {
            ppu.tick(mapper);
        }
        ppu.frame_buffer().to_vec()
    }

    fn pixel(frame: &[u16], x: usize, y: usize) -> u16 {
        frame[y * FRAME_WIDTH + x]
    }

    #[test]
    fn sprite_flips_mirror_the_pattern() {
        // Tile 3 has a single opaque pixel in its top-left corner.
        let mut chr = vec![0u8; 0x2000];
        chr[3 * 16] = 0x80;
        let mut mapper = nrom_with_chr(chr);
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        ppu.palette[0] = 0x0F;
        ppu.palette[0x11] = 0x21;
        ppu.oam.fill(0xFF);
        ppu.oam[0..12].copy_from_slice(&[
            50, 0x03, 0x00, 20, // plain
            50, 0x03, SPRITE_FLIP_H, 40, // horizontal flip
            50, 0x03, SPRITE_FLIP_V, 60, // vertical flip
        ]);
        ppu.mask = MASK_SHOW_SPRITES | MASK_SHOW_SPRITE_LEFT;

        let frame = second_frame(&mut ppu, &mut mapper);
        assert_eq!(pixel(&frame, 20, 51), 0x21);
        assert_eq!(pixel(&frame, 21, 51), 0x0F);

        assert_eq!(pixel(&frame, 40, 51), 0x0F);
        assert_eq!(pixel(&frame, 47, 51), 0x21);

        assert_eq!(pixel(&frame, 60, 51), 0x0F);
        assert_eq!(pixel(&frame, 60, 58), 0x21);
    }

    #[test]
    fn lowest_oam_index_wins_among_opaque_sprites() {
        let mut mapper = nrom_with_chr(solid_tiles());
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        ppu.palette[0x15] = 0x16;
        ppu.palette[0x1B] = 0x2A;
        ppu.oam.fill(0xFF);
        ppu.oam[0..8].copy_from_slice(&[
            50, 0x01, 0x01, 100, // colour 1, palette 1
            50, 0x02, 0x02, 104, // colour 3, palette 2
        ]);
        ppu.mask = MASK_SHOW_SPRITES;

        let frame = second_frame(&mut ppu, &mut mapper);
        assert_eq!(pixel(&frame, 100, 51), 0x16);
        assert_eq!(pixel(&frame, 107, 51), 0x16);
        assert_eq!(pixel(&frame, 108, 51), 0x2A);
        assert_eq!(pixel(&frame, 111, 51), 0x2A);
    }

    #[test]
    fn behind_background_sprite_only_shows_through_transparent_pixels() {
        let mut mapper = nrom_with_chr(solid_tiles());
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        // Row 6 (lines 48-55): opaque tiles in the left half only.
        ppu.vram[6 * 32..6 * 32 + 16].fill(0x01);
        ppu.palette[0] = 0x0F;
        ppu.palette[1] = 0x21;
        ppu.palette[0x13] = 0x05;
        ppu.oam.fill(0xFF);
        ppu.oam[0..8].copy_from_slice(&[
            50, 0x02, SPRITE_BEHIND_BG, 40,
            50, 0x02, SPRITE_BEHIND_BG, 200,
        ]);
        ppu.mask = MASK_SHOW_BG | MASK_SHOW_SPRITES | MASK_SHOW_BG_LEFT | MASK_SHOW_SPRITE_LEFT;

        let frame = second_frame(&mut ppu, &mut mapper);
        assert_eq!(pixel(&frame, 40, 51), 0x21);
        assert_eq!(pixel(&frame, 200, 51), 0x05);
        assert_eq!(pixel(&frame, 210, 51), 0x0F);
    }

    #[test]
    fn oam_data_reads_during_rendering_follow_the_evaluation_phase() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.oam.fill(0xFF);
        ppu.oam[0..4].copy_from_slice(&[10, 0x42, 0x00, 0x80]);
        ppu.oam[0x10] = 0x5A;
        ppu.mask = MASK_SHOW_BG;

        run_until(&mut ppu, &mut mapper, 10, 30);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut mapper), 0xFF);
        run_until(&mut ppu, &mut mapper, 10, 100);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut mapper), 0x00);
        run_until(&mut ppu, &mut mapper, 10, 300);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut mapper), 0xFF);
        run_until(&mut ppu, &mut mapper, 10, 330);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut mapper), 10);

        // Outside rendering the port returns OAM itself.
        run_until(&mut ppu, &mut mapper, 245, 0);
        ppu.cpu_write_register(0x2003, 0x10, &mut mapper);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut mapper), 0x5A);
    }

    #[test]
    fn data_port_access_while_rendering_bumps_scroll_counters() {
        let mut ppu = Ppu::new(TvSystem::Ntsc);
        let mut mapper = blank_mapper();
        ppu.mask = MASK_SHOW_BG;
        run_until(&mut ppu, &mut mapper, 10, 100);

        // Fine Y 2, coarse Y 3, coarse X 5.
        ppu.v = (2 << 12) | (3 << 5) | 5;
        ppu.cpu_write_register(0x2007, 0x00, &mut mapper);
        assert_eq!(ppu.v, (3 << 12) | (3 << 5) | 6);

        ppu.v = (7 << 12) | (3 << 5) | 31;
        ppu.cpu_read_register(0x2007, &mut mapper);
        assert_eq!(ppu.v, 0x0400 | (4 << 5));

        // During VBlank the normal +1 step applies.
        run_until(&mut ppu, &mut mapper, 245, 0);
        ppu.v = (2 << 12) | (3 << 5) | 5;
        ppu.cpu_write_register(0x2007, 0x00, &mut mapper);
        assert_eq!(ppu.v, (2 << 12) | (3 << 5) | 6);
    }
}
