use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use super::{LgwConfig, LgwHal, LgwPktRx, LgwPktTx, Modulation, TxStatus, LGW_RF_CHAIN_NB};
use crate::airtime::frame_airtime_us;
use crate::error::Error;
use crate::rps::{Bw, Rps};

/* Concentrator simulation backing the test suites. Time is virtual and
   driven by the test: xticks start near 1<<28 so counter values never
   resemble host microseconds, same trick the radio simulations use to
   cover more test ground. */

const XTICKS_START: u64 = 0x10000000;

pub struct SimState {
    started: bool,
    pub conf: LgwConfig,
    now_us: u64, /* virtual host time */
    time_offset: u64,
    pub rx_queue: VecDeque<LgwPktRx>,
    pub tx_log: Vec<LgwPktTx>,
    txbeg: [u64; LGW_RF_CHAIN_NB], /* xticks */
    txend: [u64; LGW_RF_CHAIN_NB],
    pub pps_enabled: bool,
    pub pps_stuck: bool, /* stop advancing the PPS latch (antenna fault) */
    pps_latch: u64,      /* xticks at last simulated PPS edge */
    pub rssi_busy: Vec<(u32, f32)>, /* per-frequency carrier levels for CCA */
    pub session_id: u16,
    pub gps_toggles: u32,
}

impl SimState {
    pub fn advance(&mut self, us: u64) {
        self.now_us += us;
        if self.pps_enabled && !self.pps_stuck {
            /* latch at each full virtual second */
            let t = self.xticks();
            self.pps_latch = t - t % 1_000_000;
        }
    }

    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    fn xticks(&self) -> u64 {
        self.now_us - self.time_offset
    }

    /* queue an uplink as if the channelizer demodulated it */
    pub fn inject_rx(&mut self, freq_hz: u32, rps: Rps, payload: &[u8], rssi: f32, snr: f32) {
        let mut pkt = LgwPktRx::new();
        pkt.freq_hz = freq_hz;
        pkt.count_us = self.xticks() as u32;
        pkt.modulation = if rps.is_fsk() {
            Modulation::FSK
        } else {
            Modulation::LORA
        };
        if rps.is_lora() {
            pkt.bandwidth = rps.bw();
            pkt.datarate = rps.sf() as u32;
        } else {
            pkt.datarate = super::DR_FSK_STD;
        }
        pkt.rssi = rssi;
        pkt.snr = snr;
        let n = payload.len().min(pkt.payload.len());
        pkt.payload[..n].copy_from_slice(&payload[..n]);
        pkt.size = n as u16;
        self.rx_queue.push_back(pkt);
    }
}

pub struct SimHal {
    state: Rc<RefCell<SimState>>,
}

pub type SimHandle = Rc<RefCell<SimState>>;

impl SimHal {
    pub fn new() -> (SimHal, SimHandle) {
        let state = Rc::new(RefCell::new(SimState {
            started: false,
            conf: Default::default(),
            now_us: XTICKS_START + 0x1000,
            time_offset: 0x1000,
            rx_queue: VecDeque::new(),
            tx_log: Vec::new(),
            txbeg: [0; LGW_RF_CHAIN_NB],
            txend: [0; LGW_RF_CHAIN_NB],
            pps_enabled: false,
            pps_stuck: false,
            pps_latch: 0,
            rssi_busy: Vec::new(),
            session_id: 1,
            gps_toggles: 0,
        }));
        (SimHal { state: state.clone() }, state)
    }
}

impl LgwHal for SimHal {
    fn lgw_start(&mut self, conf: &LgwConfig) -> Result<()> {
        let mut st = self.state.borrow_mut();
        if st.started {
            return Err(anyhow!("LGWSIM already started"));
        }
        st.conf = conf.clone();
        st.started = true;
        info!("LGWSIM: started, clksrc={}", conf.board.clksrc);
        Ok(())
    }

    fn lgw_stop(&mut self) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.started = false;
        st.txbeg = [0; LGW_RF_CHAIN_NB];
        st.txend = [0; LGW_RF_CHAIN_NB];
        Ok(())
    }

    fn lgw_receive(&mut self) -> Result<Vec<LgwPktRx>> {
        let mut st = self.state.borrow_mut();
        if !st.started {
            return Err(Error::HalError.into());
        }
        let pkts: Vec<LgwPktRx> = st.rx_queue.drain(..).collect();
        if !pkts.is_empty() {
            debug!("LGWSIM: received {} packets", pkts.len());
        }
        Ok(pkts)
    }

    fn lgw_send(&mut self, pkt: &LgwPktTx) -> Result<()> {
        let mut st = self.state.borrow_mut();
        if !st.started {
            return Err(Error::HalError.into());
        }
        if pkt.rf_chain as usize >= LGW_RF_CHAIN_NB {
            return Err(Error::HalError.into());
        }
        let t = st.xticks();
        /* signed distance from now, exactly as the counter wraps */
        let delta = (pkt.count_us).wrapping_sub(t as u32) as i32;
        let txbeg = (t as i64 + delta as i64) as u64;
        let rps = match pkt.modulation {
            Modulation::LORA => Rps::lora(pkt.datarate as u8, pkt.bandwidth),
            Modulation::FSK => crate::rps::RPS_FSK,
            Modulation::UNDEFINED => return Err(Error::HalError.into()),
        };
        let toa = frame_airtime_us(rps, pkt.size as u8)? as u64;
        let rf = pkt.rf_chain as usize;
        st.txbeg[rf] = txbeg;
        st.txend[rf] = txbeg + toa;
        st.tx_log.push(*pkt);
        debug!(
            "LGWSIM: send freq={} count_us={} toa={}us",
            pkt.freq_hz, pkt.count_us, toa
        );
        Ok(())
    }

    fn lgw_tx_status(&mut self, rf_chain: u8) -> Result<TxStatus> {
        let st = self.state.borrow();
        let rf = rf_chain as usize;
        if rf >= LGW_RF_CHAIN_NB {
            return Err(Error::HalError.into());
        }
        let t = st.xticks();
        Ok(if st.txend[rf] == 0 || t > st.txend[rf] {
            TxStatus::Free
        } else if t >= st.txbeg[rf] {
            TxStatus::Emitting
        } else {
            TxStatus::Scheduled
        })
    }

    fn lgw_abort_tx(&mut self, rf_chain: u8) -> Result<()> {
        let mut st = self.state.borrow_mut();
        let rf = rf_chain as usize;
        if rf >= LGW_RF_CHAIN_NB {
            return Err(Error::HalError.into());
        }
        st.txbeg[rf] = 0;
        st.txend[rf] = 0;
        Ok(())
    }

    fn lgw_get_instcnt(&mut self) -> Result<u32> {
        let st = self.state.borrow();
        if !st.started {
            return Err(Error::HalError.into());
        }
        Ok(st.xticks() as u32)
    }

    fn lgw_get_trigcnt(&mut self) -> Result<u32> {
        let st = self.state.borrow();
        if !st.started {
            return Err(Error::HalError.into());
        }
        Ok(st.pps_latch as u32)
    }

    fn lgw_gps_enable(&mut self, enable: bool) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.pps_enabled = enable;
        if enable {
            st.gps_toggles += 1;
            /* a reset clears a stuck PPS source */
            st.pps_stuck = false;
        }
        Ok(())
    }

    fn lgw_rssi_scan(&mut self, freq_hz: u32, _bw: Bw, _scan_time_us: u32) -> Result<f32> {
        let st = self.state.borrow();
        for (f, rssi) in &st.rssi_busy {
            if *f == freq_hz {
                return Ok(*rssi);
            }
        }
        Ok(-120.0) /* idle channel */
    }

    fn lgw_session_id(&mut self) -> Result<u16> {
        Ok(self.state.borrow().session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_status_follows_virtual_time() {
        let (mut hal, st) = SimHal::new();
        hal.lgw_start(&Default::default()).unwrap();
        let now = hal.lgw_get_instcnt().unwrap();

        let mut pkt = LgwPktTx::default();
        pkt.modulation = Modulation::LORA;
        pkt.bandwidth = Bw::BW125;
        pkt.datarate = 7;
        pkt.count_us = now.wrapping_add(50_000);
        pkt.set_payload(&[0u8; 20]);
        hal.lgw_send(&pkt).unwrap();

        assert_eq!(hal.lgw_tx_status(0).unwrap(), TxStatus::Scheduled);
        st.borrow_mut().advance(60_000);
        assert_eq!(hal.lgw_tx_status(0).unwrap(), TxStatus::Emitting);
        st.borrow_mut().advance(2_000_000);
        assert_eq!(hal.lgw_tx_status(0).unwrap(), TxStatus::Free);
        assert_eq!(st.borrow().tx_log.len(), 1);
    }

    #[test]
    fn pps_latch_advances_by_seconds() {
        let (mut hal, st) = SimHal::new();
        hal.lgw_start(&Default::default()).unwrap();
        hal.lgw_gps_enable(true).unwrap();
        st.borrow_mut().advance(1_500_000);
        let a = hal.lgw_get_trigcnt().unwrap();
        st.borrow_mut().advance(300_000);
        assert_eq!(hal.lgw_get_trigcnt().unwrap(), a);
        st.borrow_mut().advance(300_000);
        let b = hal.lgw_get_trigcnt().unwrap();
        assert_eq!(b.wrapping_sub(a), 1_000_000);
    }

    #[test]
    fn rx_injection_roundtrip() {
        let (mut hal, st) = SimHal::new();
        hal.lgw_start(&Default::default()).unwrap();
        st.borrow_mut()
            .inject_rx(868_100_000, Rps::lora(7, Bw::BW125), &[1, 2, 3], -90.0, 8.5);
        let pkts = hal.lgw_receive().unwrap();
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].payload(), &[1, 2, 3]);
        assert_eq!(pkts[0].freq_hz, 868_100_000);
    }
}
