pub mod challoc;
pub mod timesync;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::hal::{LgwConfig, LgwHal, LgwPktTx, Modulation, TxStatus};
use crate::rps::{Bw, Rps, RPS_FSK};
use challoc::ChPlan;
use timesync::{PpsEvent, TimeSync, GPS_RESET_RETRY_US, MAX_GPS_RESETS, PPS_CHECK_INTERVAL_US, PPS_LOSS_TIMEOUT_US};

/* The RAL owns the concentrator exclusively. Everything above reaches
   the radio through this layer: frames come out as RxJobs with expanded
   timestamps, downlinks go in as HAL packets, and the PPS supervisor
   lives in the polling loop. */

/* duplicate window: mirror receptions of one preamble on two modems */
const MIRROR_WINDOW_US: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct RxJob {
    pub payload: Vec<u8>,
    pub freq: u32,
    pub rps: Rps,
    pub rctx: i64, /* RF chain the frame came in on; downlinks answer on it */
    pub xtime: i64,
    pub rssi: f32,
    pub snr: f32,
    pub fts: i32, /* nanoseconds since PPS, -1 when unavailable */
    pub gpstime: i64, /* 0 when the GPS mapping is not established */
    pub rxtime: f64,  /* host UTC, seconds */
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpsAction {
    None,
    Fatal,
}

pub struct Ral {
    hal: Box<dyn LgwHal>,
    ts: TimeSync,
    started: bool,
    gps_wanted: bool,
    last_pps_check: i64,  /* utc us */
    last_valid_pps: i64,  /* utc us */
    gps_resets: u32,
    last_reset_attempt: i64,
}

impl Ral {
    pub fn new(hal: Box<dyn LgwHal>) -> Self {
        Self {
            hal,
            ts: TimeSync::new(0),
            started: false,
            gps_wanted: true,
            last_pps_check: 0,
            last_valid_pps: 0,
            gps_resets: 0,
            last_reset_attempt: 0,
        }
    }

    /* Apply a channel plan: allocate chains, restart the concentrator,
       open a fresh time-sync session. Failure here kills the LNS
       session, not the process. */
    pub fn config(&mut self, plan: &ChPlan, base: &LgwConfig, gps_enable: bool, utc: i64) -> Result<()> {
        let conf = match challoc::challoc(plan, base) {
            Ok(c) => c,
            Err(e) => {
                error!(e=%e, "channel allocation failed");
                return Err(Error::RalError.into());
            }
        };
        if self.started {
            self.hal.lgw_stop()?;
            self.started = false;
        }
        self.hal.lgw_start(&conf)?;
        self.started = true;
        self.gps_wanted = gps_enable;
        self.hal.lgw_gps_enable(gps_enable)?;
        let sess = self.hal.lgw_session_id()?;
        self.ts = TimeSync::new(sess);
        let cnt = self.hal.lgw_get_instcnt()?;
        self.ts.update(cnt, utc);
        self.last_valid_pps = utc;
        self.last_pps_check = 0;
        self.gps_resets = 0;
        info!("RAL configured: session={} gps={}", sess, gps_enable);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.started {
            if let Err(e) = self.hal.lgw_stop() {
                warn!(e=?e, "failed to stop concentrator");
            }
            self.started = false;
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn timesync(&self) -> &TimeSync {
        &self.ts
    }

    pub fn timesync_mut(&mut self) -> &mut TimeSync {
        &mut self.ts
    }

    pub fn set_gps_anchor(&mut self, gpstime_at_pps: i64) {
        self.ts.set_gps_anchor(gpstime_at_pps);
    }

    pub fn now_xtime(&mut self, utc: i64) -> Result<i64> {
        self.check_session()?;
        let cnt = self.hal.lgw_get_instcnt()?;
        Ok(self.ts.update(cnt, utc))
    }

    /* A restarted slave produces a new session id; stale xtimes must
       stop comparing instead of comparing wrong. */
    fn check_session(&mut self) -> Result<()> {
        let sess = self.hal.lgw_session_id()?;
        if sess != self.ts.session() {
            self.ts.restart_session(sess);
            self.last_valid_pps = 0;
        }
        Ok(())
    }

    /* Fetch frames, expand timestamps, collapse mirror receptions. */
    pub fn rx_poll(&mut self, utc: i64) -> Result<Vec<RxJob>> {
        if !self.started {
            return Ok(Vec::new());
        }
        self.check_session()?;
        let pkts = self.hal.lgw_receive()?;
        let cnt = self.hal.lgw_get_instcnt()?;
        self.ts.update(cnt, utc);

        let mut jobs: Vec<RxJob> = Vec::with_capacity(pkts.len());
        for pkt in &pkts {
            if !pkt.crc_ok {
                debug!("dropping frame with bad CRC on {}", pkt.freq_hz);
                continue;
            }
            let rps = match pkt.modulation {
                Modulation::LORA if (5..=12).contains(&pkt.datarate) => {
                    Rps::lora(pkt.datarate as u8, pkt.bandwidth)
                }
                Modulation::LORA => {
                    warn!("unparseable LoRa modulation SF{} - frame dropped", pkt.datarate);
                    continue;
                }
                Modulation::FSK => RPS_FSK,
                Modulation::UNDEFINED => continue,
            };
            let xtime = self.ts.expand(pkt.count_us);
            let fts = if pkt.ftime_received { pkt.ftime as i32 } else { -1 };

            /* mirror reception: same payload on another modem within the
               window - keep one, preserve the fine timestamp */
            if let Some(prev) = jobs.iter_mut().find(|j| {
                j.payload == pkt.payload()
                    && pkt.count_us.wrapping_sub(timesync::xtime_micros(j.xtime) as u32)
                        < MIRROR_WINDOW_US
            }) {
                if prev.fts < 0 && fts >= 0 {
                    prev.fts = fts;
                }
                if pkt.snr > prev.snr {
                    prev.freq = pkt.freq_hz;
                    prev.rssi = pkt.rssi;
                    prev.snr = pkt.snr;
                    prev.rctx = pkt.rf_chain as i64;
                }
                continue;
            }

            let gpstime = self.ts.xtime_to_gps(xtime)?.unwrap_or(0);
            jobs.push(RxJob {
                payload: pkt.payload().to_vec(),
                freq: pkt.freq_hz,
                rps,
                rctx: pkt.rf_chain as i64,
                xtime,
                rssi: pkt.rssi,
                snr: pkt.snr,
                fts,
                gpstime,
                rxtime: utc as f64 / 1e6,
            });
        }
        Ok(jobs)
    }

    /* PPS supervision, to be driven from the reactor. Queries the
       latched counter at most every 128 ms; handles loss recovery by
       power-cycling the GPS path; reports unrecoverable states. */
    pub fn pps_tick(&mut self, utc: i64) -> Result<PpsAction> {
        if !self.started || !self.gps_wanted {
            return Ok(PpsAction::None);
        }
        if utc - self.last_pps_check < PPS_CHECK_INTERVAL_US {
            return Ok(PpsAction::None);
        }
        self.last_pps_check = utc;
        self.check_session()?;

        let trig = self.hal.lgw_get_trigcnt()?;
        /* a zero latch on a fresh session means the register was never
           armed; only real edges feed the drift monitor */
        if trig != 0 || self.ts.pps_synced() {
            match self.ts.on_pps_latch(trig, utc) {
                PpsEvent::Synced => {
                    self.last_valid_pps = utc;
                    self.gps_resets = 0;
                }
                PpsEvent::NoChange | PpsEvent::Rejected | PpsEvent::WidenedTolerance => {}
                PpsEvent::Fatal => {
                    error!("persistent excessive PPS drift - giving up");
                    return Ok(PpsAction::Fatal);
                }
            }
        }

        if self.last_valid_pps == 0 {
            self.last_valid_pps = utc;
        }
        if utc - self.last_valid_pps >= PPS_LOSS_TIMEOUT_US
            && utc - self.last_reset_attempt >= GPS_RESET_RETRY_US
        {
            if self.gps_resets >= MAX_GPS_RESETS {
                error!("no PPS after {} GPS resets - giving up", self.gps_resets);
                return Ok(PpsAction::Fatal);
            }
            warn!(
                "no valid PPS for {} s - resetting GPS path (attempt {})",
                (utc - self.last_valid_pps) / 1_000_000,
                self.gps_resets + 1
            );
            self.hal.lgw_gps_enable(false)?;
            self.hal.lgw_gps_enable(true)?;
            self.gps_resets += 1;
            self.last_reset_attempt = utc;
        }
        Ok(PpsAction::None)
    }

    pub fn send(&mut self, pkt: &LgwPktTx) -> Result<()> {
        if !self.started {
            error!("send refused: concentrator not started");
            return Err(Error::RalError.into());
        }
        self.hal.lgw_send(pkt)
    }

    pub fn tx_status(&mut self, rf_chain: u8) -> Result<TxStatus> {
        self.hal.lgw_tx_status(rf_chain)
    }

    pub fn abort_tx(&mut self, rf_chain: u8) -> Result<()> {
        self.hal.lgw_abort_tx(rf_chain)
    }

    /* clear channel assessment: true = channel free */
    pub fn cca(&mut self, freq: u32, bw: Bw, scan_time_us: u32, rssi_target: i8) -> Result<bool> {
        let rssi = self.hal.lgw_rssi_scan(freq, bw, scan_time_us)?;
        let free = rssi < rssi_target as f32;
        if !free {
            info!("CCA busy: {} Hz at {:.1} dBm (target {})", freq, rssi, rssi_target);
        }
        Ok(free)
    }
}
