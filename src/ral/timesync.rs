use anyhow::Result;
use tracing::{debug, info, warn};

use crate::error::Error;

/* Time domains:
     xtime   - concentrator counter, 32 bit, extended to 48 bits by wrap
               counting and tagged with a session id in the high bits
     ustime  - host monotonic microseconds
     utc     - host wall clock microseconds
     gpstime - microseconds since the GPS epoch, via PPS + NMEA

   The session tag makes xtimes from a restarted concentrator
   non-comparable with stale ones instead of silently wrong. */

pub const XTIME_SESS_SHIFT: u32 = 48;
const XTIME_MASK: i64 = (1 << XTIME_SESS_SHIFT) - 1;

pub fn xtime_compose(session: u16, micros: i64) -> i64 {
    ((session as i64) << XTIME_SESS_SHIFT) | (micros & XTIME_MASK)
}

pub fn xtime_session(xtime: i64) -> u16 {
    (xtime >> XTIME_SESS_SHIFT) as u16
}

pub fn xtime_micros(xtime: i64) -> i64 {
    xtime & XTIME_MASK
}

/* PPS supervision thresholds */
pub const PPS_CHECK_INTERVAL_US: i64 = 128_000;
const QUICK_RETRIES: u32 = 3;
const DRIFT_REJECTS_WIDEN: u32 = 2 * QUICK_RETRIES;
const DRIFT_REJECTS_FATAL: u32 = 5 * QUICK_RETRIES;
const DRIFT_TOLERANCE_PPM: f64 = 60.0;
const DRIFT_WIDEN_FACTOR: f64 = 2.0;
const DRIFT_EMA_WEIGHT: f64 = 0.125;
pub const PPS_LOSS_TIMEOUT_US: i64 = 90_000_000;
pub const GPS_RESET_RETRY_US: i64 = 5_000_000;
pub const MAX_GPS_RESETS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpsEvent {
    Synced,
    NoChange,
    Rejected,
    WidenedTolerance,
    Fatal,
}

#[derive(Debug)]
pub struct TimeSync {
    session: u16,
    wraps: u32,
    last_count: u32,
    have_count: bool,
    /* host anchor from the last counter poll, for unsynced conversions */
    anchor_xtime: i64,
    anchor_utc: i64,
    /* PPS state */
    pps_xtime: i64, /* 0 = no latch seen this session */
    pps_utc: i64,
    last_pps_utc: i64,
    drift_ppm: f64,
    drift_samples: u32,
    tolerance_ppm: f64,
    widened: bool,
    consecutive_rejects: u32,
    /* GPS absolute time of the last accepted PPS edge, if known */
    pps_gps: Option<i64>,
}

impl TimeSync {
    pub fn new(session: u16) -> Self {
        Self {
            session,
            wraps: 0,
            last_count: 0,
            have_count: false,
            anchor_xtime: 0,
            anchor_utc: 0,
            pps_xtime: 0,
            pps_utc: 0,
            last_pps_utc: 0,
            drift_ppm: 0.0,
            drift_samples: 0,
            tolerance_ppm: DRIFT_TOLERANCE_PPM,
            widened: false,
            consecutive_rejects: 0,
            pps_gps: None,
        }
    }

    pub fn session(&self) -> u16 {
        self.session
    }

    /* Concentrator restarted underneath us: all previous xtimes are
       garbage, start a fresh domain. */
    pub fn restart_session(&mut self, session: u16) {
        warn!("concentrator session change {} -> {}, clearing time sync state", self.session, session);
        *self = TimeSync::new(session);
    }

    /* Advance the wrap state from a fresh counter read. Must be called
       often enough that the 32 bit counter cannot wrap twice in
       between (>1 h). */
    pub fn update(&mut self, count_us: u32, utc: i64) -> i64 {
        if self.have_count && count_us < self.last_count {
            self.wraps = self.wraps.wrapping_add(1);
            debug!("xtime wrap #{}", self.wraps);
        }
        self.last_count = count_us;
        self.have_count = true;
        let xt = self.compose(self.wraps, count_us);
        self.anchor_xtime = xt;
        self.anchor_utc = utc;
        xt
    }

    /* Expand a counter value sampled slightly in the past (a packet
       timestamp, the PPS latch). If the reference counter is behind the
       sample, the counter wrapped since the sample was taken. */
    pub fn expand(&self, count_us: u32) -> i64 {
        let wraps = if self.last_count >= count_us || self.wraps == 0 {
            self.wraps
        } else {
            self.wraps - 1
        };
        self.compose(wraps, count_us)
    }

    fn compose(&self, wraps: u32, count_us: u32) -> i64 {
        xtime_compose(self.session, ((wraps as i64) << 32) | count_us as i64)
    }

    /* Feed the latched PPS counter. Returns what the supervisor should
       do; all thresholds count consecutive rejects. */
    pub fn on_pps_latch(&mut self, latched_count: u32, utc: i64) -> PpsEvent {
        let xt = self.expand(latched_count);
        if self.pps_xtime == 0 {
            /* first edge this session: anchor only */
            self.pps_xtime = xt;
            self.pps_utc = utc;
            self.last_pps_utc = utc;
            return PpsEvent::Synced;
        }
        let delta = xtime_micros(xt) - xtime_micros(self.pps_xtime);
        if delta == 0 {
            return PpsEvent::NoChange;
        }
        /* whole seconds elapsed since the previous accepted edge */
        let secs = ((delta + 500_000) / 1_000_000).max(1);
        let drift = (delta - secs * 1_000_000) as f64 / secs as f64;

        if self.drift_samples > 0 && (drift - self.drift_ppm).abs() > self.tolerance_ppm {
            self.consecutive_rejects += 1;
            warn!(
                "rejected PPS sample: drift {:.1} ppm vs EMA {:.1} ppm (tol {:.0}, {} consecutive)",
                drift, self.drift_ppm, self.tolerance_ppm, self.consecutive_rejects
            );
            if self.consecutive_rejects > DRIFT_REJECTS_FATAL {
                return PpsEvent::Fatal;
            }
            if self.consecutive_rejects > DRIFT_REJECTS_WIDEN && !self.widened {
                self.widened = true;
                self.tolerance_ppm *= DRIFT_WIDEN_FACTOR;
                warn!("widening PPS drift tolerance to {:.0} ppm", self.tolerance_ppm);
                return PpsEvent::WidenedTolerance;
            }
            return PpsEvent::Rejected;
        }

        self.consecutive_rejects = 0;
        self.drift_ppm = if self.drift_samples == 0 {
            drift
        } else {
            self.drift_ppm + DRIFT_EMA_WEIGHT * (drift - self.drift_ppm)
        };
        self.drift_samples += 1;
        /* roll the GPS anchor forward with the edge */
        if let Some(g) = self.pps_gps {
            self.pps_gps = Some(g + delta);
        }
        self.pps_xtime = xt;
        self.pps_utc = utc;
        self.last_pps_utc = utc;
        PpsEvent::Synced
    }

    pub fn pps_synced(&self) -> bool {
        self.pps_xtime != 0
    }

    pub fn last_pps_utc(&self) -> i64 {
        self.last_pps_utc
    }

    pub fn drift_ppm(&self) -> f64 {
        self.drift_ppm
    }

    /* Absolute GPS time of the last accepted PPS edge, from NMEA or an
       LNS timesync transfer. */
    pub fn set_gps_anchor(&mut self, gpstime_at_pps: i64) {
        if self.pps_gps.is_none() {
            info!("GPS time anchored: {} us since GPS epoch", gpstime_at_pps);
        }
        self.pps_gps = Some(gpstime_at_pps);
    }

    pub fn clear_gps_anchor(&mut self) {
        self.pps_gps = None;
    }

    /* GPS time learned at an arbitrary xtime (an LNS timesync transfer):
       backdate to the last PPS edge before anchoring */
    pub fn anchor_gps_at(&mut self, xtime: i64, gpstime: i64) -> Result<()> {
        self.check_session(xtime)?;
        if self.pps_synced() {
            let at_pps = gpstime - (xtime_micros(xtime) - xtime_micros(self.pps_xtime));
            self.set_gps_anchor(at_pps);
        }
        Ok(())
    }

    fn check_session(&self, xtime: i64) -> Result<()> {
        if xtime_session(xtime) != self.session {
            return Err(Error::XtimeSessionMismatch.into());
        }
        Ok(())
    }

    pub fn xtime_to_utc(&self, xtime: i64) -> Result<i64> {
        self.check_session(xtime)?;
        if self.pps_synced() {
            Ok(self.pps_utc + (xtime_micros(xtime) - xtime_micros(self.pps_xtime)))
        } else {
            Ok(self.anchor_utc + (xtime_micros(xtime) - xtime_micros(self.anchor_xtime)))
        }
    }

    pub fn utc_to_xtime(&self, utc: i64) -> Result<i64> {
        let (ref_xt, ref_utc) = if self.pps_synced() {
            (self.pps_xtime, self.pps_utc)
        } else {
            (self.anchor_xtime, self.anchor_utc)
        };
        Ok(xtime_compose(
            self.session,
            xtime_micros(ref_xt) + (utc - ref_utc),
        ))
    }

    pub fn xtime_to_gps(&self, xtime: i64) -> Result<Option<i64>> {
        self.check_session(xtime)?;
        match self.pps_gps {
            Some(g) if self.pps_synced() => {
                Ok(Some(g + (xtime_micros(xtime) - xtime_micros(self.pps_xtime))))
            }
            _ => Ok(None),
        }
    }

    pub fn gps_to_xtime(&self, gpstime: i64) -> Option<i64> {
        let g = self.pps_gps?;
        if !self.pps_synced() {
            return None;
        }
        Some(xtime_compose(
            self.session,
            xtime_micros(self.pps_xtime) + (gpstime - g),
        ))
    }
}
