use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TvSystem {
    #[default]
    Ntsc,
    Pal,
}

impl TvSystem {
    pub fn scanline_count(self) -> u16 {
        match self {
            TvSystem::Ntsc => 262,
            TvSystem::Pal => 312,
        }
    }

    // PPU dots per CPU cycle, consumed round-robin. PAL averages 3.2.
    pub fn cpu_divider(self) -> [u8; 5] {
        match self {
            TvSystem::Ntsc => [3, 3, 3, 3, 3],
            TvSystem::Pal => [4, 3, 3, 3, 3],
        }
    }

    pub fn has_dot_skip(self) -> bool {
        self == TvSystem::Ntsc
    }

    pub fn swaps_red_green_emphasis(self) -> bool {
        self == TvSystem::Pal
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tv_system: TvSystem,
    // Coalesce the cycles of a jump-to-self loop instead of re-executing it.
    pub idle_loop_skip: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tv_system: TvSystem::Ntsc,
            idle_loop_skip: true,
        }
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid emulator config JSON")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("in {}", path.display()))
    }
}
