use std::cmp::Ordering;
use std::collections::BinaryHeap;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::airtime::frame_airtime_us;
use crate::dutycycle::DutyCycle;
use crate::hal::{LgwPktTx, Modulation, TxMode, TxStatus};
use crate::ral::timesync::{xtime_micros, xtime_session};
use crate::ral::Ral;
use crate::region::Region;
use crate::rps::Bw;
use crate::s2e::dr::DrDefs;
use crate::s2e::msg::{from_hex, DnMsg, Eui64};

/* Downlink pipeline: a time-ordered queue of pending transmissions,
   admission against the regulatory gates, and completion tracking
   against the HAL. Effective transmit time orders the queue; priority
   and arrival order break ties. */

/* HAL handoff latency budget */
pub const TX_SLACK_US: i64 = 20_000;
/* guard after a transmission before the chain is considered free */
const TX_GUARD_US: i64 = 5_000;
/* queue bound; oldest low-priority job is dropped on overflow */
const MAX_QUEUED_JOBS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevClass {
    A,
    B,
    C,
}

impl DevClass {
    pub fn from_wire(dc: u8) -> Option<DevClass> {
        match dc {
            0 => Some(DevClass::A),
            1 => Some(DevClass::B),
            2 => Some(DevClass::C),
            _ => None,
        }
    }
}

/* one transmission opportunity: a concrete time, datarate, frequency */
#[derive(Debug, Clone, Copy)]
pub struct TxWindow {
    pub xtime: i64, /* 0 = as soon as possible (class C) */
    pub dr: u8,
    pub freq: u32,
}

#[derive(Debug, Clone)]
pub struct TxJob {
    pub diid: i64,
    pub deveui: Eui64,
    pub dclass: DevClass,
    pub pdu: Vec<u8>,
    pub priority: u8,
    pub rctx: i64,
    pub windows: Vec<TxWindow>,
    pub next_window: usize,
    seq: u64,
}

impl TxJob {
    /* Build a job from a dnmsg/dnsched element. Timing semantics by
       class: A anchors on the uplink xtime plus RxDelay (RX1) and one
       second more (RX2); B anchors on gpstime; C goes out asap. */
    pub fn from_dnmsg(dn: &DnMsg, gps_xtime: Option<i64>) -> Result<TxJob, &'static str> {
        let pdu = from_hex(&dn.pdu).map_err(|_| "bad pdu")?;
        if pdu.is_empty() || pdu.len() > 255 {
            return Err("bad pdu");
        }
        let dclass = DevClass::from_wire(dn.dclass).ok_or("bad device class")?;
        let mut windows = Vec::new();
        match dclass {
            DevClass::A => {
                if dn.xtime == 0 {
                    return Err("class A downlink without xtime");
                }
                let delay = (dn.rxdelay.max(1)) as i64 * 1_000_000;
                if let (Some(dr), Some(freq)) = (dn.rx1dr, dn.rx1freq) {
                    windows.push(TxWindow { xtime: dn.xtime + delay, dr, freq });
                }
                if let (Some(dr), Some(freq)) = (dn.rx2dr, dn.rx2freq) {
                    windows.push(TxWindow {
                        xtime: dn.xtime + delay + 1_000_000,
                        dr,
                        freq,
                    });
                }
                if windows.is_empty() {
                    return Err("class A downlink without RX window");
                }
            }
            DevClass::B => {
                let (Some(dr), Some(freq)) = (dn.dr.or(dn.rx2dr), dn.freq.or(dn.rx2freq)) else {
                    return Err("class B downlink without DR/Freq");
                };
                let Some(xtime) = gps_xtime else {
                    return Err("class B downlink without GPS time mapping");
                };
                windows.push(TxWindow { xtime, dr, freq });
            }
            DevClass::C => {
                let (Some(dr), Some(freq)) = (dn.dr.or(dn.rx2dr), dn.freq.or(dn.rx2freq)) else {
                    return Err("class C downlink without DR/Freq");
                };
                /* xtime present: honor it (RX1 on a class C device) */
                windows.push(TxWindow {
                    xtime: if dn.xtime != 0 {
                        dn.xtime + (dn.rxdelay.max(1)) as i64 * 1_000_000
                    } else {
                        0
                    },
                    dr,
                    freq,
                });
            }
        }
        Ok(TxJob {
            diid: dn.diid,
            deveui: dn.deveui,
            dclass,
            pdu,
            priority: dn.priority,
            rctx: dn.rctx,
            windows,
            next_window: 0,
            seq: 0,
        })
    }

    fn effective_xtime(&self) -> i64 {
        self.windows[self.next_window].xtime
    }
}

/* heap entry: earliest effective time wins, then priority, then FIFO */
struct QEntry(TxJob);

impl PartialEq for QEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for QEntry {}
impl PartialOrd for QEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .effective_xtime()
            .cmp(&self.0.effective_xtime())
            .then(self.0.priority.cmp(&other.0.priority))
            .then(other.0.seq.cmp(&self.0.seq))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome {
    Sent {
        diid: i64,
        deveui: Eui64,
        rctx: i64,
        xtime: i64,
    },
    Failed {
        diid: i64,
        deveui: Eui64,
        reason: &'static str,
    },
}

/* listen-before-talk parameters for the active session */
#[derive(Debug, Clone, Default)]
pub struct LbtConf {
    pub rssi_target: i8,
    pub channels: Vec<(u32, Bw, u32)>, /* freq, bandwidth, scan time us */
}

/* regulatory inputs the session context resolves once per router_config */
#[derive(Debug, Clone)]
pub struct TxParams {
    pub region: &'static Region,
    pub max_eirp: f64,
    pub antenna_gain: f64,
    pub lbt: Option<LbtConf>,
    pub nodwell: bool,
    pub full_duplex: bool,
}

impl TxParams {
    pub fn tx_power_dbm(&self) -> i8 {
        let mut pow = self.max_eirp.min(self.region.max_eirp);
        if self.region.limit_lut_to_26 {
            /* gain LUT entries above 26 dBm are off limits here */
            pow = pow.min(26.0);
        }
        (pow - self.antenna_gain).round() as i8
    }
}

struct InFlight {
    job: TxJob,
    rf_chain: u8,
    xtime: i64,
    end_xtime: i64,
    seen_active: bool,
}

pub struct TxPipeline {
    queue: BinaryHeap<QEntry>,
    inflight: Vec<InFlight>, /* at most one per RF chain */
    seq: u64,
}

impl TxPipeline {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            inflight: Vec::new(),
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.inflight.is_empty()
    }

    pub fn enqueue(&mut self, mut job: TxJob) {
        job.seq = self.seq;
        self.seq += 1;
        self.queue.push(QEntry(job));
        if self.queue.len() > MAX_QUEUED_JOBS {
            /* drop the oldest lowest-priority entry */
            let mut all: Vec<QEntry> = std::mem::take(&mut self.queue).into_vec();
            if let Some(idx) = all
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.0.priority, e.0.seq))
                .map(|(i, _)| i)
            {
                let victim = all.swap_remove(idx);
                warn!("TX queue overflow - dropping diid={}", victim.0.diid);
            }
            self.queue = all.into();
        }
    }

    /* the LNS may rescind a pending downlink by id */
    pub fn drop_by_diid(&mut self, diid: i64) -> bool {
        let before = self.queue.len();
        let kept: Vec<QEntry> = std::mem::take(&mut self.queue)
            .into_vec()
            .into_iter()
            .filter(|e| e.0.diid != diid)
            .collect();
        self.queue = kept.into();
        self.queue.len() != before
    }

    /* session teardown: pending downlinks are void */
    pub fn clear(&mut self) {
        self.queue.clear();
        self.inflight.clear();
    }

    /* One reactor turn: finish in-flight transmissions, then admit and
       submit everything that is due. */
    pub fn tick(
        &mut self,
        ral: &mut Ral,
        dc: &mut DutyCycle,
        dr_defs: &DrDefs,
        params: &TxParams,
        utc: i64,
    ) -> Result<Vec<TxOutcome>> {
        let mut out = Vec::new();
        let now = ral.now_xtime(utc)?;

        /* completion polling */
        let mut still = Vec::new();
        for mut fl in self.inflight.drain(..) {
            let status = ral.tx_status(fl.rf_chain)?;
            match status {
                TxStatus::Emitting | TxStatus::Scheduled => {
                    fl.seen_active = true;
                    still.push(fl);
                }
                TxStatus::Free if fl.seen_active || xtime_micros(now) > xtime_micros(fl.end_xtime) => {
                    info!("dntxed diid={} at xtime=0x{:X}", fl.job.diid, fl.xtime);
                    out.push(TxOutcome::Sent {
                        diid: fl.job.diid,
                        deveui: fl.job.deveui,
                        rctx: fl.job.rctx,
                        xtime: fl.xtime,
                    });
                }
                _ => still.push(fl),
            }
        }
        self.inflight = still;

        /* admission; jobs deferred to the next tick stay out of the
           loop so an asap job blocked on a busy chain cannot spin */
        let mut deferred = Vec::new();
        while let Some(entry) = self.queue.peek() {
            let t = entry.0.effective_xtime();
            if t != 0 && xtime_micros(t) - xtime_micros(now) > TX_SLACK_US {
                break; /* nothing due yet */
            }
            let job = self.queue.pop().unwrap().0;
            match self.admit(job, ral, dc, dr_defs, params, now)? {
                AdmitResult::Done(outcome) => out.push(outcome),
                AdmitResult::Submitted => {}
                AdmitResult::Defer(job) => deferred.push(job),
            }
        }
        for job in deferred {
            self.queue.push(QEntry(job));
        }
        Ok(out)
    }

    /* Run the admission gates in order; the first failing gate decides. */
    fn admit(
        &mut self,
        job: TxJob,
        ral: &mut Ral,
        dc: &mut DutyCycle,
        dr_defs: &DrDefs,
        params: &TxParams,
        now: i64,
    ) -> Result<AdmitResult> {
        let win = job.windows[job.next_window];
        let txtime = if win.xtime == 0 { now + TX_SLACK_US } else { win.xtime };

        let fail = |job: &TxJob, reason: &'static str| {
            warn!("downlink diid={} rejected: {}", job.diid, reason);
            AdmitResult::Done(TxOutcome::Failed {
                diid: job.diid,
                deveui: job.deveui,
                reason,
            })
        };

        /* a stale xtime from a previous radio session can never be
           scheduled */
        if win.xtime != 0 && xtime_session(win.xtime) != xtime_session(now) {
            return Ok(fail(&job, "xtime from dead session"));
        }

        /* too late for this window? */
        if win.xtime != 0 && xtime_micros(now) - xtime_micros(txtime) > TX_SLACK_US {
            return Ok(self.next_window_or(job, "late"));
        }

        let rps = dr_defs.dr2rps_dn(win.dr);
        if !rps.is_lora() && !rps.is_fsk() {
            return Ok(fail(&job, "undefined downlink DR"));
        }
        let airtime = frame_airtime_us(rps, job.pdu.len() as u8)?;

        /* 1. half-duplex gate: one transmission per chain; a class C
           job may use the second antenna concurrently */
        let rf_chain = (job.rctx & 0x1) as u8;
        if self.inflight.iter().any(|fl| fl.rf_chain == rf_chain)
            || ral.tx_status(rf_chain)? != TxStatus::Free
        {
            if win.xtime == 0 {
                /* asap job: retry next tick */
                return Ok(AdmitResult::Defer(job));
            }
            return Ok(self.next_window_or(job, "txunit busy"));
        }

        /* 2. duty cycle */
        let txtime_utc = ral.timesync().xtime_to_utc(txtime)?;
        if !dc.check(win.freq, txtime_utc) {
            return Ok(self.next_window_or(job, "dutycycle"));
        }

        /* 3. CCA / LBT */
        if params.region.cca {
            if let Some(lbt) = &params.lbt {
                let (bw, scan) = lbt
                    .channels
                    .iter()
                    .find(|(f, _, _)| *f == win.freq)
                    .map(|&(_, b, s)| (b, s))
                    .unwrap_or((Bw::BW125, params.region.lbt_scan_time_us));
                if !ral.cca(win.freq, bw, scan, lbt.rssi_target)? {
                    return Ok(fail(&job, "cca"));
                }
            }
        }

        /* 4. TX dwell time */
        if params.region.max_dwell_us != 0
            && !params.nodwell
            && airtime > params.region.max_dwell_us
        {
            return Ok(fail(&job, "dwell"));
        }

        /* 5. power ceiling */
        let rf_power = params.tx_power_dbm();

        let mut pkt = LgwPktTx {
            freq_hz: win.freq,
            tx_mode: if win.xtime == 0 { TxMode::Immediate } else { TxMode::Timestamped },
            count_us: xtime_micros(txtime) as u32,
            rf_chain,
            rf_power,
            ..Default::default()
        };
        if rps.is_fsk() {
            pkt.modulation = Modulation::FSK;
            pkt.datarate = crate::hal::DR_FSK_STD;
        } else {
            pkt.modulation = Modulation::LORA;
            pkt.bandwidth = rps.bw();
            pkt.datarate = rps.sf() as u32;
        }
        pkt.set_payload(&job.pdu);

        if let Err(e) = ral.send(&pkt) {
            warn!(e=%e, "HAL rejected downlink diid={}", job.diid);
            return Ok(fail(&job, "hal"));
        }
        dc.commit(win.freq, txtime_utc, airtime);
        debug!(
            "submitted diid={} freq={} {} at count_us={}",
            job.diid, win.freq, rps, pkt.count_us
        );
        self.inflight.push(InFlight {
            rf_chain,
            xtime: txtime,
            end_xtime: txtime + airtime as i64 + TX_GUARD_US,
            seen_active: false,
            job,
        });
        Ok(AdmitResult::Submitted)
    }

    /* class A gets a second chance in RX2; everything else fails */
    fn next_window_or(&mut self, mut job: TxJob, reason: &'static str) -> AdmitResult {
        if job.next_window + 1 < job.windows.len() {
            job.next_window += 1;
            debug!("diid={} falls back to window {} ({})", job.diid, job.next_window, reason);
            AdmitResult::Defer(job)
        } else {
            warn!("downlink diid={} rejected: {}", job.diid, reason);
            AdmitResult::Done(TxOutcome::Failed {
                diid: job.diid,
                deveui: job.deveui,
                reason,
            })
        }
    }
}

enum AdmitResult {
    Done(TxOutcome),
    Submitted,
    Defer(TxJob),
}
