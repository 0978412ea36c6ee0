use anyhow::{Context, Result, bail};
use std::{fs, path::Path};

use super::mapper::Mirroring;

pub const PRG_UNIT: usize = 16 * 1024;
pub const CHR_UNIT: usize = 8 * 1024;
const TRAINER_SIZE: usize = 512;

pub const SUPPORTED_MAPPERS: [u8; 4] = [0, 1, 2, 9];

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u8,
    pub mirroring: Mirroring,
    pub has_battery_backed_ram: bool,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
    pub pal_hint: bool,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            bail!("ROM is too small to contain an iNES header");
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];

        // Old dumps often carry a signature in bytes 7..16; only trust the
        // upper mapper nibble when the tail of the header is clean.
        let header_tail_clean = bytes[12..16].iter().all(|b| *b == 0);
        let mapper_id = if header_tail_clean {
            (flags6 >> 4) | (flags7 & 0xF0)
        } else {
            log::warn!("iNES header has junk in bytes 12-15, ignoring flags 7");
            flags6 >> 4
        };

        if !SUPPORTED_MAPPERS.contains(&mapper_id) {
            bail!(
                "unsupported mapper {mapper_id} ({}); supported mappers are 0, 1, 2 and 9",
                mapper_name(mapper_id)
            );
        }

        let mirroring = if (flags6 & 0x08) != 0 {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };

        let prg_rom_size = (bytes[4] as usize).max(1) * PRG_UNIT;
        let chr_rom_size = bytes[5] as usize * CHR_UNIT;

        let mut cursor = 16usize;
        if (flags6 & 0x04) != 0 {
            cursor += TRAINER_SIZE;
        }

        let prg_rom = take_padded(bytes, cursor, prg_rom_size, "PRG");
        cursor += prg_rom_size;

        let (chr_data, chr_is_ram) = if chr_rom_size == 0 {
            (vec![0; CHR_UNIT], true)
        } else {
            (take_padded(bytes, cursor, chr_rom_size, "CHR"), false)
        };

        Ok(Self {
            mapper_id,
            mirroring,
            has_battery_backed_ram: (flags6 & 0x02) != 0,
            prg_rom,
            chr_data,
            chr_is_ram,
            pal_hint: header_tail_clean && (bytes[9] & 0x01) != 0,
        })
    }

    pub fn mapper_name(&self) -> &'static str {
        mapper_name(self.mapper_id)
    }
}

pub fn mapper_name(mapper_id: u8) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UNROM",
        9 => "MMC2",
        _ => "Unsupported",
    }
}

// Copies `len` bytes starting at `start`, zero-filling whatever the image
// does not actually contain.
fn take_padded(bytes: &[u8], start: usize, len: usize, what: &str) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let available = bytes.len().saturating_sub(start).min(len);
    if available < len {
        log::warn!(
            "ROM truncated: expected {len} {what} bytes, found {available}; padding with zeros"
        );
    }
    if available > 0 {
        out[..available].copy_from_slice(&bytes[start..start + available]);
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ines_image(mapper: u8, flags6_low: u8, prg: &[u8], chr: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 16];
        image[0..4].copy_from_slice(b"NES\x1A");
        image[4] = (prg.len() / PRG_UNIT) as u8;
        image[5] = (chr.len() / CHR_UNIT) as u8;
        image[6] = (mapper << 4) | (flags6_low & 0x0F);
        image[7] = mapper & 0xF0;
        image.extend_from_slice(prg);
        image.extend_from_slice(chr);
        image
    }

    #[test]
    fn parses_header_fields() {
        let prg = vec![0xEA; 2 * PRG_UNIT];
        let chr = vec![0x11; CHR_UNIT];
        let cart = Cartridge::from_bytes(&ines_image(1, 0x03, &prg, &chr)).unwrap();

        assert_eq!(cart.mapper_id, 1);
        assert_eq!(cart.mirroring, Mirroring::Vertical);
        assert!(cart.has_battery_backed_ram);
        assert_eq!(cart.prg_rom.len(), 2 * PRG_UNIT);
        assert_eq!(cart.chr_data.len(), CHR_UNIT);
        assert!(!cart.chr_is_ram);
        assert_eq!(cart.mapper_name(), "MMC1");
    }

    #[test]
    fn zero_chr_units_means_chr_ram() {
        let prg = vec![0; PRG_UNIT];
        let cart = Cartridge::from_bytes(&ines_image(2, 0x00, &prg, &[])).unwrap();
        assert!(cart.chr_is_ram);
        assert_eq!(cart.chr_data.len(), CHR_UNIT);
        assert_eq!(cart.mirroring, Mirroring::Horizontal);
    }

    #[test]
    fn four_screen_flag_overrides_mirroring() {
        let prg = vec![0; PRG_UNIT];
        let cart = Cartridge::from_bytes(&ines_image(0, 0x09, &prg, &[])).unwrap();
        assert_eq!(cart.mirroring, Mirroring::FourScreen);
    }

    #[test]
    fn rejects_unsupported_mapper() {
        let prg = vec![0; PRG_UNIT];
        let err = Cartridge::from_bytes(&ines_image(4, 0, &prg, &[])).unwrap_err();
        assert!(err.to_string().contains("unsupported mapper 4"));
    }

    #[test]
    fn rejects_bad_magic_and_short_images() {
        assert!(Cartridge::from_bytes(b"NES").is_err());
        let mut image = ines_image(0, 0, &vec![0; PRG_UNIT], &[]);
        image[3] = 0;
        assert!(Cartridge::from_bytes(&image).is_err());
    }

    #[test]
    fn truncated_payload_is_zero_filled() {
        let mut image = ines_image(0, 0, &vec![0x5A; PRG_UNIT], &[]);
        image[4] = 2;
        let cart = Cartridge::from_bytes(&image).unwrap();
        assert_eq!(cart.prg_rom.len(), 2 * PRG_UNIT);
        assert_eq!(cart.prg_rom[PRG_UNIT - 1], 0x5A);
        assert_eq!(cart.prg_rom[PRG_UNIT], 0x00);
    }

    #[test]
    fn trainer_is_skipped() {
        let mut image = ines_image(0, 0x04, &[], &[]);
        image[4] = 1;
        image.extend(std::iter::repeat_n(0xFF, TRAINER_SIZE));
        image.extend(std::iter::repeat_n(0x42, PRG_UNIT));
        let cart = Cartridge::from_bytes(&image).unwrap();
        assert_eq!(cart.prg_rom[0], 0x42);
    }
}
