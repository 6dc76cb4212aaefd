use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/* Regulatory parameters per LoRaWAN region. The LNS refines these with a
   concrete channel plan and DR tables in router_config; what lives here is
   the part the LNS cannot override: frequency limits, EIRP ceiling,
   duty-cycle structure, CCA obligation, dwell time. */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum RegionId {
    EU868,
    US915,
    AU915,
    AS923_1,
    AS923_2,
    AS923_3,
    AS923_4,
    KR920,
    IN865,
    IL915,
    CN470,
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", region(*self).name)
    }
}

/* One duty-cycle band: [lo,hi) in Hz, airtime share 1/divisor. */
#[derive(Debug, Clone, Copy)]
pub struct DcBand {
    pub lo: u32,
    pub hi: u32,
    pub divisor: u32,
}

#[derive(Debug, Clone)]
pub struct Region {
    pub id: RegionId,
    pub name: &'static str,
    pub freq_min: u32,
    pub freq_max: u32,
    pub max_eirp: f64, /* dBm */
    pub cca: bool,
    /* TX gain LUT entries above 26 dBm are not used (AU915, AS923 group) */
    pub limit_lut_to_26: bool,
    pub duty_cycle: bool,
    /* EU868 accounts per band; AS923/IN865 account per channel with a
       single divisor. Empty bands + per_channel_divisor=0 means no DC. */
    pub dc_bands: &'static [DcBand],
    pub per_channel_divisor: u32,
    pub max_dwell_us: u32, /* 0 = unlimited */
    pub lbt_rssi_target: i8,
    pub lbt_scan_time_us: u32,
}

/* EU868 bands K..Q per ETSI EN 300 220 */
static EU868_BANDS: [DcBand; 6] = [
    DcBand { lo: 863_000_000, hi: 865_000_000, divisor: 1000 }, /* K 0.1% */
    DcBand { lo: 865_000_000, hi: 868_000_000, divisor: 100 },  /* L 1%   */
    DcBand { lo: 868_000_000, hi: 868_600_000, divisor: 100 },  /* M 1%   */
    DcBand { lo: 868_700_000, hi: 869_200_000, divisor: 1000 }, /* N 0.1% */
    DcBand { lo: 869_400_000, hi: 869_650_000, divisor: 10 },   /* P 10%  */
    DcBand { lo: 869_700_000, hi: 870_000_000, divisor: 100 },  /* Q 1%   */
];

static REGIONS: [Region; 11] = [
    Region {
        id: RegionId::EU868,
        name: "EU868",
        freq_min: 863_000_000,
        freq_max: 870_000_000,
        max_eirp: 16.0,
        cca: false,
        limit_lut_to_26: false,
        duty_cycle: true,
        dc_bands: &EU868_BANDS,
        per_channel_divisor: 0,
        max_dwell_us: 0,
        lbt_rssi_target: 0,
        lbt_scan_time_us: 0,
    },
    Region {
        id: RegionId::US915,
        name: "US915",
        freq_min: 902_000_000,
        freq_max: 928_000_000,
        max_eirp: 30.0,
        cca: false,
        limit_lut_to_26: false,
        duty_cycle: false,
        dc_bands: &[],
        per_channel_divisor: 0,
        max_dwell_us: 400_000,
        lbt_rssi_target: 0,
        lbt_scan_time_us: 0,
    },
    Region {
        id: RegionId::AU915,
        name: "AU915",
        freq_min: 915_000_000,
        freq_max: 928_000_000,
        max_eirp: 30.0,
        cca: false,
        limit_lut_to_26: true,
        duty_cycle: false,
        dc_bands: &[],
        per_channel_divisor: 0,
        max_dwell_us: 400_000,
        lbt_rssi_target: 0,
        lbt_scan_time_us: 0,
    },
    Region {
        id: RegionId::AS923_1,
        name: "AS923-1",
        freq_min: 915_000_000,
        freq_max: 928_000_000,
        max_eirp: 16.0,
        cca: true,
        limit_lut_to_26: true,
        duty_cycle: true,
        dc_bands: &[],
        per_channel_divisor: 10,
        max_dwell_us: 400_000,
        lbt_rssi_target: -80,
        lbt_scan_time_us: 5000,
    },
    Region {
        id: RegionId::AS923_2,
        name: "AS923-2",
        freq_min: 920_000_000,
        freq_max: 923_000_000,
        max_eirp: 16.0,
        cca: true,
        limit_lut_to_26: true,
        duty_cycle: true,
        dc_bands: &[],
        per_channel_divisor: 10,
        max_dwell_us: 400_000,
        lbt_rssi_target: -80,
        lbt_scan_time_us: 5000,
    },
    Region {
        id: RegionId::AS923_3,
        name: "AS923-3",
        freq_min: 915_000_000,
        freq_max: 921_000_000,
        max_eirp: 16.0,
        cca: true,
        limit_lut_to_26: true,
        duty_cycle: true,
        dc_bands: &[],
        per_channel_divisor: 10,
        max_dwell_us: 400_000,
        lbt_rssi_target: -80,
        lbt_scan_time_us: 5000,
    },
    Region {
        id: RegionId::AS923_4,
        name: "AS923-4",
        freq_min: 917_000_000,
        freq_max: 920_000_000,
        max_eirp: 16.0,
        cca: true,
        limit_lut_to_26: true,
        duty_cycle: true,
        dc_bands: &[],
        per_channel_divisor: 10,
        max_dwell_us: 400_000,
        lbt_rssi_target: -80,
        lbt_scan_time_us: 5000,
    },
    Region {
        id: RegionId::KR920,
        name: "KR920",
        freq_min: 920_900_000,
        freq_max: 923_300_000,
        max_eirp: 23.0,
        cca: true,
        limit_lut_to_26: false,
        duty_cycle: false,
        dc_bands: &[],
        per_channel_divisor: 0,
        max_dwell_us: 0,
        lbt_rssi_target: -67,
        lbt_scan_time_us: 5000,
    },
    Region {
        id: RegionId::IN865,
        name: "IN865",
        freq_min: 865_000_000,
        freq_max: 867_000_000,
        max_eirp: 30.0,
        cca: false,
        limit_lut_to_26: false,
        duty_cycle: true,
        dc_bands: &[],
        per_channel_divisor: 10,
        max_dwell_us: 0,
        lbt_rssi_target: 0,
        lbt_scan_time_us: 0,
    },
    Region {
        id: RegionId::IL915,
        name: "IL915",
        freq_min: 915_000_000,
        freq_max: 917_000_000,
        max_eirp: 14.0,
        cca: false,
        limit_lut_to_26: false,
        duty_cycle: false,
        dc_bands: &[],
        per_channel_divisor: 0,
        max_dwell_us: 0,
        lbt_rssi_target: 0,
        lbt_scan_time_us: 0,
    },
    Region {
        id: RegionId::CN470,
        name: "CN470",
        freq_min: 470_000_000,
        freq_max: 510_000_000,
        max_eirp: 19.15,
        cca: false,
        limit_lut_to_26: false,
        duty_cycle: false,
        dc_bands: &[],
        per_channel_divisor: 0,
        max_dwell_us: 0,
        lbt_rssi_target: 0,
        lbt_scan_time_us: 0,
    },
];

pub fn region(id: RegionId) -> &'static Region {
    REGIONS.iter().find(|r| r.id == id).unwrap()
}

/* router_config "region" field, with the legacy aliases old LNS versions
   still send. */
pub fn lookup(name: &str) -> Result<&'static Region> {
    let id = match name {
        "EU868" | "EU863" => RegionId::EU868,
        "US915" | "US902" => RegionId::US915,
        "AU915" | "AU923" => RegionId::AU915,
        "AS923" | "AS923-1" | "AS923JP" => RegionId::AS923_1,
        "AS923-2" => RegionId::AS923_2,
        "AS923-3" => RegionId::AS923_3,
        "AS923-4" => RegionId::AS923_4,
        "KR920" => RegionId::KR920,
        "IN865" => RegionId::IN865,
        "IL915" => RegionId::IL915,
        "CN470" => RegionId::CN470,
        _ => return Err(anyhow!("unknown region '{}'", name)),
    };
    Ok(region(id))
}

impl Region {
    pub fn band_of(&self, freq: u32) -> Option<&'static DcBand> {
        self.dc_bands.iter().find(|b| freq >= b.lo && freq < b.hi)
    }

    pub fn in_range(&self, freq: u32) -> bool {
        freq >= self.freq_min && freq <= self.freq_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve() {
        assert_eq!(lookup("AS923").unwrap().id, RegionId::AS923_1);
        assert_eq!(lookup("US902").unwrap().id, RegionId::US915);
        assert_eq!(lookup("EU863").unwrap().id, RegionId::EU868);
        assert!(lookup("XX123").is_err());
    }

    #[test]
    fn eu868_band_k() {
        let r = lookup("EU868").unwrap();
        let band = r.band_of(863_500_000).unwrap();
        assert_eq!(band.divisor, 1000);
        /* 869.525 MHz (RX2) sits in the 10% band */
        assert_eq!(r.band_of(869_525_000).unwrap().divisor, 10);
        /* gap between N and P */
        assert!(r.band_of(869_300_000).is_none());
    }

    #[test]
    fn cca_regions() {
        for name in ["AS923-1", "AS923-2", "AS923-3", "AS923-4", "KR920"] {
            assert!(lookup(name).unwrap().cca, "{} must mandate CCA", name);
        }
        assert!(!lookup("EU868").unwrap().cca);
        assert_eq!(lookup("AS923-1").unwrap().lbt_rssi_target, -80);
        assert_eq!(lookup("KR920").unwrap().lbt_rssi_target, -67);
    }

    #[test]
    fn dwell_regions() {
        assert_eq!(lookup("US915").unwrap().max_dwell_us, 400_000);
        assert_eq!(lookup("EU868").unwrap().max_dwell_us, 0);
    }

    #[test]
    fn lut_26dbm_regions() {
        for name in ["AU915", "AS923-1", "AS923-2", "AS923-3", "AS923-4"] {
            assert!(lookup(name).unwrap().limit_lut_to_26, "{}", name);
        }
        for name in ["EU868", "US915", "KR920", "IN865"] {
            assert!(!lookup(name).unwrap().limit_lut_to_26, "{}", name);
        }
    }
}
