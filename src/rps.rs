use serde::{Deserialize, Serialize};

/* Radio parameter set: spreading factor + bandwidth packed into one word.
   Used everywhere a DR index has been resolved against a DR table. */

pub const SF_MIN: u8 = 5;
pub const SF_MAX: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Bw {
    BW125 = 0,
    BW250 = 1,
    BW500 = 2,
}

impl Bw {
    pub fn hz(self) -> u32 {
        match self {
            Bw::BW125 => 125_000,
            Bw::BW250 => 250_000,
            Bw::BW500 => 500_000,
        }
    }

    pub fn from_hz(hz: u32) -> Option<Bw> {
        match hz {
            125_000 => Some(Bw::BW125),
            250_000 => Some(Bw::BW250),
            500_000 => Some(Bw::BW500),
            _ => None,
        }
    }
}

impl std::fmt::Display for Bw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BW{}", self.hz() / 1000)
    }
}

/* Layout: bits 0..3 = SF (5..12, 0xE=FSK), bits 4..5 = BW code, bit 6 = dnonly */
const RPS_SF_FSK: u16 = 0xE;
const RPS_DNONLY: u16 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rps(u16);

pub const RPS_ILLEGAL: Rps = Rps(0xFFFF);
pub const RPS_FSK: Rps = Rps(RPS_SF_FSK);

impl Rps {
    pub fn lora(sf: u8, bw: Bw) -> Rps {
        assert!((SF_MIN..=SF_MAX).contains(&sf));
        Rps(sf as u16 | ((bw as u16) << 4))
    }

    pub fn is_illegal(self) -> bool {
        self == RPS_ILLEGAL
    }

    pub fn is_fsk(self) -> bool {
        !self.is_illegal() && (self.0 & 0xF) == RPS_SF_FSK
    }

    pub fn is_lora(self) -> bool {
        !self.is_illegal() && !self.is_fsk()
    }

    pub fn sf(self) -> u8 {
        (self.0 & 0xF) as u8
    }

    pub fn bw(self) -> Bw {
        match (self.0 >> 4) & 0x3 {
            0 => Bw::BW125,
            1 => Bw::BW250,
            _ => Bw::BW500,
        }
    }

    pub fn dnonly(self) -> bool {
        !self.is_illegal() && (self.0 & RPS_DNONLY) != 0
    }

    pub fn with_dnonly(self) -> Rps {
        if self.is_illegal() {
            self
        } else {
            Rps(self.0 | RPS_DNONLY)
        }
    }

    /* Equality with the dnonly marker masked out - two channels agree on
       modulation even if only one is restricted to downlink. */
    pub fn same_modulation(self, other: Rps) -> bool {
        if self.is_illegal() || other.is_illegal() {
            return false;
        }
        (self.0 & !RPS_DNONLY) == (other.0 & !RPS_DNONLY)
    }
}

impl std::fmt::Display for Rps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_illegal() {
            write!(f, "RPS_ILLEGAL")
        } else if self.is_fsk() {
            write!(f, "FSK")
        } else {
            write!(f, "SF{}/{}", self.sf(), self.bw())
        }
    }
}
