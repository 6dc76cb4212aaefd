use anyhow::{anyhow, Result};
use tracing::{debug, info};

use crate::hal::{
    LgwConfig, DR_FSK_STD, IF_CHAIN_FAST_LORA, IF_CHAIN_FSK, LGW_MULTI_NB, LGW_RFE_MAX_HZ,
    LGW_RF_CHAIN_NB,
};
use crate::rps::Rps;

/* Channel plan as the session engine hands it down: classified channels,
   not raw DR indices. Slot layout mirrors the concentrator: up to 8
   multi-SF 125 kHz channels, one fast LoRa channel, one FSK channel. */

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChDef {
    pub freq: u32,
    pub min_rps: Rps, /* slowest DR on this channel (highest SF) */
    pub max_rps: Rps,
}

#[derive(Debug, Clone, Default)]
pub struct ChPlan {
    pub multi: Vec<ChDef>,          /* 125 kHz multi-SF channels */
    pub fast: Option<(u32, Rps)>,   /* 250/500 kHz single-SF channel */
    pub fsk: Option<u32>,
}

impl ChPlan {
    pub fn is_empty(&self) -> bool {
        self.multi.is_empty() && self.fast.is_none() && self.fsk.is_none()
    }

    /* every distinct frequency, for deriving LBT channels */
    pub fn frequencies(&self) -> Vec<u32> {
        let mut fs: Vec<u32> = self.multi.iter().map(|c| c.freq).collect();
        if let Some((f, _)) = self.fast {
            fs.push(f);
        }
        if let Some(f) = self.fsk {
            fs.push(f);
        }
        fs.sort_unstable();
        fs.dedup();
        fs
    }
}

/* Bind each channel to an RF front-end and an IF chain. The RF centers
   are chosen so that every channel sits within +-400 kHz of its radio;
   two radios cover two disjoint 800 kHz windows. Fails naming the
   channel that does not fit. */
pub fn challoc(plan: &ChPlan, base: &LgwConfig) -> Result<LgwConfig> {
    if plan.multi.len() > LGW_MULTI_NB {
        return Err(anyhow!(
            "channel plan has {} multi-SF channels, hardware supports {}",
            plan.multi.len(),
            LGW_MULTI_NB
        ));
    }

    let mut freqs: Vec<u32> = plan.frequencies();
    if freqs.is_empty() {
        return Err(anyhow!("empty channel plan"));
    }
    freqs.sort_unstable();

    /* Greedy left-to-right grouping into <=2 windows of 2*RFE width */
    let width = 2 * LGW_RFE_MAX_HZ as u32;
    let mut rf_freq = [0u32; LGW_RF_CHAIN_NB];
    let mut rf_used = 0usize;
    let mut lo = freqs[0];
    let mut hi = freqs[0];
    for &f in &freqs[1..] {
        if f - lo <= width {
            hi = f;
            continue;
        }
        if rf_used + 1 >= LGW_RF_CHAIN_NB {
            return Err(anyhow!(
                "channel {} Hz does not fit the RF chain budget (span from {} exceeds {} Hz)",
                f,
                lo,
                width
            ));
        }
        rf_freq[rf_used] = (lo + hi) / 2;
        rf_used += 1;
        lo = f;
        hi = f;
    }
    rf_freq[rf_used] = (lo + hi) / 2;
    rf_used += 1;

    let rf_of = |freq: u32| -> Result<u8> {
        for (i, &c) in rf_freq[..rf_used].iter().enumerate() {
            if (freq as i64 - c as i64).abs() <= LGW_RFE_MAX_HZ as i64 {
                return Ok(i as u8);
            }
        }
        Err(anyhow!("channel {} Hz not covered by any RF chain", freq))
    };

    let mut conf = base.clone();
    for i in 0..LGW_RF_CHAIN_NB {
        conf.rf_chain[i].enable = i < rf_used;
        if i < rf_used {
            conf.rf_chain[i].freq_hz = rf_freq[i];
        }
    }
    conf.if_chain = Default::default();

    for (slot, ch) in plan.multi.iter().enumerate() {
        let rf = rf_of(ch.freq)?;
        let ifc = &mut conf.if_chain[slot];
        ifc.enable = true;
        ifc.rf_chain = rf;
        ifc.freq_hz = ch.freq as i32 - rf_freq[rf as usize] as i32;
        ifc.bandwidth = Some(crate::rps::Bw::BW125);
        ifc.datarate = 0; /* multi-SF correlators take the whole SF range */
        debug!(
            " [mSF]   {}: {} rf={} if={:+}",
            slot, ch.freq, rf, ifc.freq_hz
        );
    }

    if let Some((freq, rps)) = plan.fast {
        let rf = rf_of(freq)?;
        let ifc = &mut conf.if_chain[IF_CHAIN_FAST_LORA];
        ifc.enable = true;
        ifc.rf_chain = rf;
        ifc.freq_hz = freq as i32 - rf_freq[rf as usize] as i32;
        ifc.bandwidth = Some(rps.bw());
        ifc.datarate = rps.sf() as u32;
        debug!(" [STD]   8: {} rf={} SF{} {}", freq, rf, rps.sf(), rps.bw());
    }

    if let Some(freq) = plan.fsk {
        let rf = rf_of(freq)?;
        let ifc = &mut conf.if_chain[IF_CHAIN_FSK];
        ifc.enable = true;
        ifc.rf_chain = rf;
        ifc.freq_hz = freq as i32 - rf_freq[rf as usize] as i32;
        ifc.bandwidth = None;
        ifc.datarate = DR_FSK_STD;
        debug!(" [FSK]   9: {} rf={}", freq, rf);
    }

    info!(
        "challoc: {} multi-SF, fast={}, fsk={}, RF0={} RF1={}",
        plan.multi.len(),
        plan.fast.is_some(),
        plan.fsk.is_some(),
        rf_freq[0],
        if rf_used > 1 { rf_freq[1] } else { 0 }
    );
    Ok(conf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rps::{Bw, Rps};

    fn mk_plan(freqs: &[u32]) -> ChPlan {
        ChPlan {
            multi: freqs
                .iter()
                .map(|&f| ChDef {
                    freq: f,
                    min_rps: Rps::lora(12, Bw::BW125),
                    max_rps: Rps::lora(7, Bw::BW125),
                })
                .collect(),
            fast: None,
            fsk: None,
        }
    }

    #[test]
    fn eu868_default_plan_fits_one_radio() {
        let plan = mk_plan(&[868_100_000, 868_300_000, 868_500_000]);
        let conf = challoc(&plan, &Default::default()).unwrap();
        assert!(conf.rf_chain[0].enable);
        assert!(!conf.rf_chain[1].enable);
        for i in 0..3 {
            assert!(conf.if_chain[i].enable);
            assert!(conf.if_chain[i].freq_hz.abs() <= LGW_RFE_MAX_HZ);
        }
        assert!(!conf.if_chain[3].enable);
    }

    #[test]
    fn us915_8ch_plus_fast_lora() {
        let freqs: Vec<u32> = (0..8).map(|i| 902_300_000 + i * 200_000).collect();
        let mut plan = mk_plan(&freqs);
        plan.fast = Some((903_000_000, Rps::lora(8, Bw::BW500)));
        let conf = challoc(&plan, &Default::default()).unwrap();
        for i in 0..8 {
            assert!(conf.if_chain[i].enable, "multi-SF chain {} disabled", i);
            assert_eq!(conf.if_chain[i].bandwidth, Some(Bw::BW125));
        }
        let fast = &conf.if_chain[IF_CHAIN_FAST_LORA];
        assert!(fast.enable);
        assert_eq!(fast.bandwidth, Some(Bw::BW500));
        assert_eq!(fast.datarate, 8);
    }

    #[test]
    fn two_radios_for_wide_plans() {
        let plan = mk_plan(&[
            868_100_000,
            868_300_000,
            868_500_000,
            869_525_000, /* > 800 kHz away */
        ]);
        let conf = challoc(&plan, &Default::default()).unwrap();
        assert!(conf.rf_chain[0].enable);
        assert!(conf.rf_chain[1].enable);
        /* the wide channel landed on the second radio */
        assert_eq!(conf.if_chain[3].rf_chain, 1);
    }

    #[test]
    fn overflowing_plan_names_channel() {
        let plan = mk_plan(&[868_100_000, 869_525_000, 902_300_000]);
        let err = challoc(&plan, &Default::default()).unwrap_err();
        assert!(err.to_string().contains("902300000"), "{}", err);
    }

    #[test]
    fn fsk_slot() {
        let mut plan = mk_plan(&[868_100_000]);
        plan.fsk = Some(868_800_000);
        let conf = challoc(&plan, &Default::default()).unwrap();
        let fsk = &conf.if_chain[IF_CHAIN_FSK];
        assert!(fsk.enable);
        assert_eq!(fsk.datarate, DR_FSK_STD);
    }
}
