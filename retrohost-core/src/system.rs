//! Per-system hosting profiles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::checksum::{ChecksumRecalculator, MegadriveChecksum};
use crate::error::HostError;
use crate::memory::Endian;

/// Hosting policy for one emulated system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemProfile {
    MasterSystem,
    Megadrive,
    #[serde(rename = "NES")]
    Nes,
    #[serde(rename = "SNES")]
    Snes,
    #[serde(rename = "ZXSpectrum")]
    ZxSpectrum,
}

impl SystemProfile {
    pub const ALL: [SystemProfile; 5] = [
        Self::MasterSystem,
        Self::Megadrive,
        Self::Nes,
        Self::Snes,
        Self::ZxSpectrum,
    ];

    /// Name stored in project settings.
    pub fn name(self) -> &'static str {
        match self {
            Self::MasterSystem => "MasterSystem",
            Self::Megadrive => "Megadrive",
            Self::Nes => "NES",
            Self::Snes => "SNES",
            Self::ZxSpectrum => "ZXSpectrum",
        }
    }

    /// File stem of the libretro core, without platform extension.
    pub fn core_name(self) -> &'static str {
        match self {
            Self::MasterSystem => "smsplus_libretro",
            Self::Megadrive => "genesis_plus_gx_libretro",
            Self::Nes => "fceumm_libretro",
            Self::Snes => "snes9x_libretro",
            Self::ZxSpectrum => "fuse_libretro",
        }
    }

    pub fn endian(self) -> Endian {
        match self {
            Self::Megadrive => Endian::Big,
            _ => Endian::Little,
        }
    }

    /// Whether ROM edits only take effect after the core reloads the image.
    ///
    /// Cartridge cores copy the image at load time; the Spectrum core runs
    /// from a tape that has already been read into RAM.
    pub fn requires_reload(self) -> bool {
        !matches!(self, Self::ZxSpectrum)
    }

    /// Whether importing a game needs frames run before the first snapshot.
    pub fn requires_autoload(self) -> bool {
        matches!(self, Self::ZxSpectrum)
    }

    /// Image file extensions the core accepts, lowercase.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::MasterSystem => &["sms"],
            Self::Megadrive => &["md", "gen", "smd", "bin"],
            Self::Nes => &["nes"],
            Self::Snes => &["sfc", "smc"],
            Self::ZxSpectrum => &["tap", "tzx", "z80", "sna"],
        }
    }

    /// Checksum fix-up run on every reset, if the system has one.
    pub fn checksum(self) -> Option<Box<dyn ChecksumRecalculator>> {
        match self {
            Self::Megadrive => Some(Box::new(MegadriveChecksum)),
            _ => None,
        }
    }
}

impl fmt::Display for SystemProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SystemProfile {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(wanted))
            .or(match wanted.to_ascii_lowercase().as_str() {
                "sms" => Some(Self::MasterSystem),
                "genesis" | "md" => Some(Self::Megadrive),
                "spectrum" | "zx" => Some(Self::ZxSpectrum),
                _ => None,
            })
            .ok_or_else(|| HostError::Project(format!("unknown system: {}", wanted)))
    }
}
