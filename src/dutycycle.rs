use tracing::debug;

use crate::region::Region;

/* Duty-cycle accounting. EU868 tracks one clock per regulatory band,
   AS923/IN865 track one clock per transmit frequency. Each transmission
   blocks its band/channel until tx_start + airtime * divisor, which
   bounds the occupancy of any window at 1/divisor. */

#[derive(Debug, Clone)]
enum Ledger {
    Off,
    PerBand { next_free: Vec<i64> }, /* indexed like region.dc_bands */
    PerChannel {
        divisor: u32,
        next_free: Vec<(u32, i64)>, /* (freq, ustime) */
    },
}

#[derive(Debug, Clone)]
pub struct DutyCycle {
    ledger: Ledger,
    region: &'static Region,
}

impl DutyCycle {
    pub fn new(region: &'static Region, enabled: bool) -> Self {
        let ledger = if !enabled || !region.duty_cycle {
            Ledger::Off
        } else if !region.dc_bands.is_empty() {
            Ledger::PerBand {
                next_free: vec![0; region.dc_bands.len()],
            }
        } else {
            Ledger::PerChannel {
                divisor: region.per_channel_divisor,
                next_free: Vec::new(),
            }
        };
        Self { ledger, region }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.ledger, Ledger::Off)
    }

    /* would a transmission starting at txtime be compliant? */
    pub fn check(&self, freq: u32, txtime: i64) -> bool {
        match &self.ledger {
            Ledger::Off => true,
            Ledger::PerBand { next_free } => match self.band_index(freq) {
                Some(i) => txtime >= next_free[i],
                /* outside every band: the power check already rejects
                   out-of-range frequencies, do not double-account */
                None => true,
            },
            Ledger::PerChannel { next_free, .. } => next_free
                .iter()
                .find(|(f, _)| *f == freq)
                .map_or(true, |&(_, t)| txtime >= t),
        }
    }

    pub fn commit(&mut self, freq: u32, txtime: i64, airtime_us: u32) {
        match &mut self.ledger {
            Ledger::Off => {}
            Ledger::PerBand { next_free } => {
                let Some(i) = self.region.dc_bands.iter().position(|b| freq >= b.lo && freq < b.hi)
                else {
                    return;
                };
                let div = self.region.dc_bands[i].divisor;
                next_free[i] = txtime + airtime_us as i64 * div as i64;
                debug!(
                    "DC band {} blocked for {} ms",
                    i,
                    airtime_us as i64 * div as i64 / 1000
                );
            }
            Ledger::PerChannel { divisor, next_free } => {
                let until = txtime + airtime_us as i64 * *divisor as i64;
                match next_free.iter_mut().find(|(f, _)| *f == freq) {
                    Some(slot) => slot.1 = until,
                    None => next_free.push((freq, until)),
                }
            }
        }
    }

    fn band_index(&self, freq: u32) -> Option<usize> {
        self.region
            .dc_bands
            .iter()
            .position(|b| freq >= b.lo && freq < b.hi)
    }
}
