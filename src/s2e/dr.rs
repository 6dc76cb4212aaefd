use anyhow::{anyhow, Result};

use crate::rps::{Bw, Rps, RPS_FSK, RPS_ILLEGAL, SF_MAX, SF_MIN};

pub const DR_CNT: usize = 16;

pub type DrTable = [Rps; DR_CNT];

pub const EMPTY_TABLE: DrTable = [RPS_ILLEGAL; DR_CNT];

/* One entry of the router_config "DRs"/"DRs_up"/"DRs_dn" arrays:
   [sf, bw_khz, dnonly]. sf==0 encodes FSK, anything unresolvable (RFU,
   LR-FHSS) collapses to RPS_ILLEGAL. */
pub fn parse_dr_entry(e: &[i64]) -> Rps {
    if e.len() < 2 {
        return RPS_ILLEGAL;
    }
    let dnonly = e.len() > 2 && e[2] != 0;
    let rps = if e[0] == 0 {
        RPS_FSK
    } else if (SF_MIN as i64..=SF_MAX as i64).contains(&e[0]) {
        match Bw::from_hz(e[1] as u32 * 1000) {
            Some(bw) => Rps::lora(e[0] as u8, bw),
            None => return RPS_ILLEGAL,
        }
    } else {
        return RPS_ILLEGAL;
    };
    if dnonly {
        rps.with_dnonly()
    } else {
        rps
    }
}

pub fn parse_dr_table(entries: &[Vec<i64>]) -> Result<DrTable> {
    if entries.len() > DR_CNT {
        return Err(anyhow!("DR table has {} entries, max {}", entries.len(), DR_CNT));
    }
    let mut table = EMPTY_TABLE;
    for (i, e) in entries.iter().enumerate() {
        table[i] = parse_dr_entry(e);
    }
    Ok(table)
}

/* Uplink/downlink DR resolution. With RP002-1.0.5 asymmetric tables the
   legacy table stays empty and every lookup must name its direction;
   the legacy accessor exists only for symmetric sessions. */
#[derive(Debug, Clone)]
pub struct DrDefs {
    asymmetric: bool,
    defs: DrTable,
    defs_up: DrTable,
    defs_dn: DrTable,
}

impl DrDefs {
    pub fn symmetric(defs: DrTable) -> Self {
        Self {
            asymmetric: false,
            defs,
            defs_up: EMPTY_TABLE,
            defs_dn: EMPTY_TABLE,
        }
    }

    pub fn asymmetric(defs_up: DrTable, defs_dn: DrTable) -> Self {
        Self {
            asymmetric: true,
            defs: EMPTY_TABLE,
            defs_up,
            defs_dn,
        }
    }

    pub fn is_asymmetric(&self) -> bool {
        self.asymmetric
    }

    pub fn dr2rps(&self, dr: u8) -> Rps {
        if dr as usize >= DR_CNT {
            return RPS_ILLEGAL;
        }
        self.defs[dr as usize]
    }

    pub fn dr2rps_up(&self, dr: u8) -> Rps {
        if dr as usize >= DR_CNT {
            return RPS_ILLEGAL;
        }
        if self.asymmetric {
            self.defs_up[dr as usize]
        } else {
            self.defs[dr as usize]
        }
    }

    pub fn dr2rps_dn(&self, dr: u8) -> Rps {
        if dr as usize >= DR_CNT {
            return RPS_ILLEGAL;
        }
        if self.asymmetric {
            self.defs_dn[dr as usize]
        } else {
            self.defs[dr as usize]
        }
    }

    /* reverse lookup against the uplink table, dnonly entries excluded */
    pub fn rps2dr_up(&self, rps: Rps) -> Option<u8> {
        (0..DR_CNT as u8).find(|&dr| {
            let t = self.dr2rps_up(dr);
            !t.dnonly() && t.same_modulation(rps)
        })
    }

    /* Channel plan predicates. These classify *uplink* channels, so they
       must consult the uplink table; the legacy table is empty in
       asymmetric mode and would silently disable every RF chain. */

    pub fn any_125khz(&self, min_dr: u8, max_dr: u8) -> Option<(Rps, Rps)> {
        let mut min_rps = None;
        let mut max_rps = None;
        for dr in min_dr..=max_dr.min(DR_CNT as u8 - 1) {
            let rps = self.dr2rps_up(dr);
            if rps.is_lora() && rps.bw() == Bw::BW125 {
                if min_rps.is_none() {
                    min_rps = Some(rps);
                }
                max_rps = Some(rps);
            }
        }
        Some((min_rps?, max_rps?))
    }

    pub fn fast_lora(&self, min_dr: u8, max_dr: u8) -> Option<Rps> {
        for dr in min_dr..=max_dr.min(DR_CNT as u8 - 1) {
            let rps = self.dr2rps_up(dr);
            if rps.is_lora() && (rps.bw() == Bw::BW250 || rps.bw() == Bw::BW500) {
                return Some(rps);
            }
        }
        None
    }

    pub fn has_fsk(&self, min_dr: u8, max_dr: u8) -> bool {
        (min_dr..=max_dr.min(DR_CNT as u8 - 1)).any(|dr| self.dr2rps_up(dr).is_fsk())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /* US915 legacy symmetric table: DR0-4 uplink, DR8-13 downlink */
    fn symmetric_us915() -> DrDefs {
        let mut t = EMPTY_TABLE;
        t[0] = Rps::lora(10, Bw::BW125);
        t[1] = Rps::lora(9, Bw::BW125);
        t[2] = Rps::lora(8, Bw::BW125);
        t[3] = Rps::lora(7, Bw::BW125);
        t[4] = Rps::lora(8, Bw::BW500);
        t[8] = Rps::lora(12, Bw::BW500);
        t[9] = Rps::lora(11, Bw::BW500);
        t[10] = Rps::lora(10, Bw::BW500);
        t[11] = Rps::lora(9, Bw::BW500);
        t[12] = Rps::lora(8, Bw::BW500);
        t[13] = Rps::lora(7, Bw::BW500);
        DrDefs::symmetric(t)
    }

    /* US915 RP002-1.0.5: distinct uplink/downlink tables */
    fn asymmetric_us915() -> DrDefs {
        let mut up = EMPTY_TABLE;
        up[0] = Rps::lora(10, Bw::BW125);
        up[1] = Rps::lora(9, Bw::BW125);
        up[2] = Rps::lora(8, Bw::BW125);
        up[3] = Rps::lora(7, Bw::BW125);
        up[4] = Rps::lora(8, Bw::BW500);
        /* DR5-6 LR-FHSS unsupported */
        up[7] = Rps::lora(6, Bw::BW125);
        up[8] = Rps::lora(5, Bw::BW125);
        let mut dn = EMPTY_TABLE;
        dn[0] = Rps::lora(5, Bw::BW500);
        dn[8] = Rps::lora(12, Bw::BW500);
        dn[9] = Rps::lora(11, Bw::BW500);
        dn[10] = Rps::lora(10, Bw::BW500);
        dn[11] = Rps::lora(9, Bw::BW500);
        dn[12] = Rps::lora(8, Bw::BW500);
        dn[13] = Rps::lora(7, Bw::BW500);
        dn[14] = Rps::lora(6, Bw::BW500);
        DrDefs::asymmetric(up, dn)
    }

    #[test]
    fn dr2rps_up_uses_right_table() {
        let sym = symmetric_us915();
        assert_eq!(sym.dr2rps_up(0), Rps::lora(10, Bw::BW125));
        assert_eq!(sym.dr2rps_up(4), Rps::lora(8, Bw::BW500));
        assert_eq!(sym.dr2rps_up(5), RPS_ILLEGAL);

        let asym = asymmetric_us915();
        assert_eq!(asym.dr2rps_up(0), Rps::lora(10, Bw::BW125));
        assert_eq!(asym.dr2rps_up(7), Rps::lora(6, Bw::BW125));
        assert_eq!(asym.dr2rps_up(8), Rps::lora(5, Bw::BW125));
        /* legacy accessor sees nothing in asymmetric mode */
        assert_eq!(asym.dr2rps(0), RPS_ILLEGAL);
        assert_eq!(asym.dr2rps(3), RPS_ILLEGAL);
    }

    #[test]
    fn dr2rps_dn_differs_from_up() {
        let asym = asymmetric_us915();
        assert_eq!(asym.dr2rps_dn(0), Rps::lora(5, Bw::BW500));
        assert_eq!(asym.dr2rps_dn(8), Rps::lora(12, Bw::BW500));
        assert_eq!(asym.dr2rps_dn(13), Rps::lora(7, Bw::BW500));
        assert_eq!(asym.dr2rps_dn(14), Rps::lora(6, Bw::BW500));
        assert_ne!(asym.dr2rps_up(0), asym.dr2rps_dn(0));
        assert_ne!(asym.dr2rps_up(8), asym.dr2rps_dn(8));
    }

    #[test]
    fn plan_predicates_consult_uplink_table() {
        /* with DR0-8 in play the asymmetric uplink table holds 125 kHz
           entries even though the legacy table is empty */
        let asym = asymmetric_us915();
        let (min_rps, max_rps) = asym.any_125khz(0, 8).unwrap();
        assert_eq!(min_rps, Rps::lora(10, Bw::BW125));
        assert_eq!(max_rps, Rps::lora(5, Bw::BW125));
        assert_eq!(asym.fast_lora(0, 8), Some(Rps::lora(8, Bw::BW500)));
        assert!(!asym.has_fsk(0, 15));

        let sym = symmetric_us915();
        assert!(sym.any_125khz(0, 5).is_some());
        assert_eq!(sym.fast_lora(0, 5), Some(Rps::lora(8, Bw::BW500)));
    }

    #[test]
    fn fsk_detection_in_asymmetric_uplink() {
        let mut up = EMPTY_TABLE;
        up[9] = RPS_FSK;
        let defs = DrDefs::asymmetric(up, EMPTY_TABLE);
        assert!(defs.has_fsk(0, 15));
        assert!(!defs.has_fsk(0, 8));
    }

    #[test]
    fn parse_entries() {
        assert_eq!(parse_dr_entry(&[12, 125, 0]), Rps::lora(12, Bw::BW125));
        assert_eq!(parse_dr_entry(&[7, 250, 0]), Rps::lora(7, Bw::BW250));
        assert_eq!(parse_dr_entry(&[0, 0, 0]), RPS_FSK);
        assert_eq!(parse_dr_entry(&[-1, 0, 0]), RPS_ILLEGAL);
        assert_eq!(parse_dr_entry(&[13, 125, 0]), RPS_ILLEGAL);
        assert!(parse_dr_entry(&[8, 500, 1]).dnonly());
    }

    #[test]
    fn reverse_lookup_skips_dnonly() {
        let mut t = EMPTY_TABLE;
        t[3] = Rps::lora(7, Bw::BW125);
        t[5] = Rps::lora(7, Bw::BW125).with_dnonly();
        let defs = DrDefs::symmetric(t);
        assert_eq!(defs.rps2dr_up(Rps::lora(7, Bw::BW125)), Some(3));
        assert_eq!(defs.rps2dr_up(Rps::lora(9, Bw::BW125)), None);
    }
}
