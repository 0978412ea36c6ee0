use super::controller::Controller;
use super::mapper::Mapper;
use super::ppu::Ppu;

const RAM_SIZE: usize = 2048;

// CPU address space: internal RAM, PPU registers, the I/O page and the
// cartridge, plus the OAM DMA request the CPU polls after each instruction.
pub struct Bus {
    ram: [u8; RAM_SIZE],
    pub(crate) ppu: Ppu,
    pub(crate) mapper: Mapper,
    controller: Box<dyn Controller + Send>,
    dma_pending: bool,
}

impl Bus {
    pub fn new(ppu: Ppu, mapper: Mapper, controller: Box<dyn Controller + Send>) -> Self {
        let mut bus = Self {
            ram: [0; RAM_SIZE],
            ppu,
            mapper,
            controller,
            dma_pending: false,
        };
        bus.fill_power_up_ram();
        bus
    }

    pub fn reset(&mut self) {
        self.fill_power_up_ram();
        self.dma_pending = false;
        self.ppu.reset();
    }

    fn fill_power_up_ram(&mut self) {
        self.ram.fill(0xFF);
        for (addr, value) in [(0x0008, 0xF7), (0x0009, 0xEF), (0x000A, 0xDF), (0x000F, 0xBF)] {
            self.ram[addr] = value;
        }
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x2000..=0x3FFF => {
                let reg = 0x2000 + (addr & 0x0007);
                self.ppu.cpu_read_register(reg, &mut self.mapper)
            }
            0x4016 => self.controller.strobe(),
            0x4000..=0x4018 => 0x40,
            _ => self.mapper.cpu_read(addr),
        }
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF] = value,
            0x2000..=0x3FFF => {
                let reg = 0x2000 + (addr & 0x0007);
                self.ppu.cpu_write_register(reg, value, &mut self.mapper);
            }
            0x4014 => self.oam_dma(value),
            0x4016 => self.controller.output(),
            0x4000..=0x4018 => {}
            _ => self.mapper.cpu_write(addr, value),
        }
    }

    pub fn read_u16(&mut self, addr: u16) -> u16 {
        let lo = self.read(addr) as u16;
        let hi = self.read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    // `JMP ($xxFF)` fetches the high byte from `$xx00`.
    pub fn read_u16_page_wrapped(&mut self, addr: u16) -> u16 {
        let lo = self.read(addr) as u16;
        let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
        let hi = self.read(hi_addr) as u16;
        (hi << 8) | lo
    }

    // Advances the PPU one dot; true when the CPU should run a cycle.
    pub fn clock_ppu(&mut self) -> bool {
        self.ppu.tick(&mut self.mapper)
    }

    pub fn nmi_line(&self) -> bool {
        self.ppu.nmi_line()
    }

    // Consumes a DMA request raised by a `$4014` write.
    pub fn take_dma_request(&mut self) -> bool {
        std::mem::take(&mut self.dma_pending)
    }

    pub fn peek_ram(&self, addr: u16) -> u8 {
        self.ram[(addr as usize) & 0x07FF]
    }

    fn oam_dma(&mut self, page: u8) {
        let base = (page as u16) << 8;
        for offset in 0..=0xFFu16 {
            let value = self.read(base | offset);
            self.ppu.write_oam_dma_byte(value, &mut self.mapper);
        }
        self.dma_pending = true;
        log::debug!("OAM DMA from page ${page:02X}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::config::TvSystem;
    use crate::nes::mapper::tests::make_cart;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        strobes: usize,
        outputs: usize,
    }

    struct RecordingController(Arc<Mutex<Log>>);

    impl Controller for RecordingController {
        fn strobe(&mut self) -> u8 {
            self.0.lock().unwrap().strobes += 1;
            0x41
        }

        fn output(&mut self) {
            self.0.lock().unwrap().outputs += 1;
        }
    }

    fn test_bus(prg: Vec<u8>) -> (Bus, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let mapper = Mapper::new(make_cart(0, prg, vec![0; 0x2000], true)).unwrap();
        let bus = Bus::new(
            Ppu::new(TvSystem::Ntsc),
            mapper,
            Box::new(RecordingController(log.clone())),
        );
        (bus, log)
    }

    #[test]
    fn power_up_ram_pattern() {
        let (bus, _) = test_bus(vec![0; 0x4000]);
        assert_eq!(bus.peek_ram(0x0000), 0xFF);
        assert_eq!(bus.peek_ram(0x0008), 0xF7);
        assert_eq!(bus.peek_ram(0x0009), 0xEF);
        assert_eq!(bus.peek_ram(0x000A), 0xDF);
        assert_eq!(bus.peek_ram(0x000F), 0xBF);
        assert_eq!(bus.peek_ram(0x07FF), 0xFF);
    }

    #[test]
    fn ram_mirrors_every_2k() {
        let (mut bus, _) = test_bus(vec![0; 0x4000]);
        bus.write(0x0801, 0x5A);
        assert_eq!(bus.read(0x0001), 0x5A);
        assert_eq!(bus.read(0x1801), 0x5A);
    }

    #[test]
    fn ppu_registers_mirror_every_8_bytes() {
        let (mut bus, _) = test_bus(vec![0; 0x4000]);
        bus.write(0x3FFE, 0x3F);
        bus.write(0x2006, 0x02);
        bus.write(0x2FFF, 0x2A);
        assert_eq!(bus.ppu.peek_palette(0x02), 0x2A);
    }

    #[test]
    fn controller_port_routes_to_collaborator() {
        let (mut bus, log) = test_bus(vec![0; 0x4000]);
        bus.write(0x4016, 0x01);
        bus.write(0x4016, 0x00);
        assert_eq!(bus.read(0x4016), 0x41);
        assert_eq!(bus.read(0x4017), 0x40);
        assert_eq!(bus.read(0x4000), 0x40);

        let log = log.lock().unwrap();
        assert_eq!(log.outputs, 2);
        assert_eq!(log.strobes, 1);
    }

    #[test]
    fn cartridge_space_starts_above_io_page() {
        let mut prg = vec![0u8; 0x4000];
        prg[0x3FFC] = 0x34;
        prg[0x3FFD] = 0x12;
        let (mut bus, _) = test_bus(prg);
        bus.write(0x6000, 0x99);
        assert_eq!(bus.read(0x6000), 0x99);
        assert_eq!(bus.read_u16(0xFFFC), 0x1234);
        assert_eq!(bus.read(0x4019), 0x40);
    }

    #[test]
    fn page_wrapped_pointer_read() {
        let (mut bus, _) = test_bus(vec![0; 0x4000]);
        bus.write(0x02FF, 0x34);
        bus.write(0x0200, 0x12);
        bus.write(0x0300, 0x56);
        assert_eq!(bus.read_u16_page_wrapped(0x02FF), 0x1234);
        assert_eq!(bus.read_u16(0x02FF), 0x5634);
    }

    #[test]
    fn oam_dma_copies_page_and_raises_request_once() {
        let (mut bus, _) = test_bus(vec![0; 0x4000]);
        for i in 0..=0xFFu16 {
            bus.write(0x0300 + i, i as u8);
        }
        bus.write(0x2003, 0x00);
        bus.write(0x4014, 0x03);

        assert!(bus.take_dma_request());
        assert!(!bus.take_dma_request());

        bus.write(0x2003, 0x02);
        assert_eq!(bus.read(0x2004), 0x02 & 0xE3);
        bus.write(0x2003, 0x05);
        assert_eq!(bus.read(0x2004), 0x05);
    }
}
