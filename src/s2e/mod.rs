pub mod dr;
pub mod filter;
pub mod frame;
pub mod msg;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tracing::{debug, error, info, warn};

use crate::conf::RadioConf;
use crate::dutycycle::DutyCycle;
use crate::ral::challoc::{ChDef, ChPlan};
use crate::ral::{PpsAction, Ral, RxJob};
use crate::region::{lookup, region, Region, RegionId};
use crate::tcbin;
use crate::transport::Transport;
use crate::txq::{LbtConf, TxJob, TxOutcome, TxParams, TxPipeline};
use dr::{parse_dr_table, DrDefs};
use filter::Filters;
use frame::Frame;
use msg::*;

pub const PROTOCOL_VERSION: u32 = 2;
const TIMESYNC_INTERVAL_US: i64 = 30_000_000;

/* Feature tokens the LNS may act on. The -conf family announces which
   options router_config may set at runtime. */
pub fn features() -> String {
    let mut f = vec![
        "rmtsh", "gps", "pkt-fwd", "gps-conf", "duty-conf", "pdu-conf", "lbt-conf", "updn-dr",
        tcbin::PROTOCOL_FORMAT,
    ];
    if cfg!(feature = "prod") {
        f.push("prod");
    }
    f.join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduEnc {
    Hex,
    Base64,
}

#[derive(Debug, Clone)]
pub struct StationIdent {
    pub station: String,
    pub firmware: String,
    pub package: String,
    pub model: String,
}

impl Default for StationIdent {
    fn default() -> Self {
        Self {
            station: format!("station-{}", env!("CARGO_PKG_VERSION")),
            firmware: String::new(),
            package: env!("CARGO_PKG_VERSION").into(),
            model: "linux".into(),
        }
    }
}

/* Everything router_config materializes. Built atomically: either the
   whole struct replaces the previous session state or none of it does. */
#[derive(Debug, Clone)]
pub struct SessionConf {
    pub region: &'static Region,
    pub dr_defs: DrDefs,
    pub plan: ChPlan,
    pub filters: Filters,
    pub pdu_only: bool,
    pub pdu_enc: PduEnc,
    pub dc_enabled: bool,
    pub gps_enable: bool,
    pub tx: TxParams,
    pub binary: bool,
    pub sx130x_conf: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    TerminateSession,
    Fatal,
}

/* Hooks for the externally-managed features reachable through the LNS
   session (command execution, remote shell). */
pub trait SysHooks {
    fn runcmd(&mut self, command: &str, arguments: &[String]) {
        warn!("runcmd '{}' ({} args) ignored: no command whitelist installed", command, arguments.len());
    }
    fn rmtsh(&mut self, req: &RmtSh) {
        warn!("rmtsh request (start={} stop={}) ignored: remote shell not wired", req.start, req.stop);
    }
}

pub struct DefaultHooks;
impl SysHooks for DefaultHooks {}

pub struct S2e {
    ident: StationIdent,
    radio: RadioConf,
    router_defaults: serde_json::Value,
    hooks: Box<dyn SysHooks>,
    conf: Option<SessionConf>,
    dc: DutyCycle,
    txq: TxPipeline,
    connected: bool,
    /* MuxTime of the last inbound message + local receive time, used to
       derive RefTime on uplinks so the LNS can measure RTT */
    mux_ref: Option<(f64, i64)>,
    pending_timesync: Option<(i64, i64)>, /* (txtime ustime, xtime at probe) */
    last_timesync: i64,
    uplink_drops: u64,
}

impl S2e {
    pub fn new(ident: StationIdent, radio: RadioConf) -> S2e {
        S2e {
            ident,
            radio,
            router_defaults: serde_json::Value::Null,
            hooks: Box::new(DefaultHooks),
            conf: None,
            dc: DutyCycle::new(region(RegionId::EU868), false),
            txq: TxPipeline::new(),
            connected: false,
            mux_ref: None,
            pending_timesync: None,
            last_timesync: 0,
            uplink_drops: 0,
        }
    }

    pub fn with_hooks(mut self, hooks: Box<dyn SysHooks>) -> S2e {
        self.hooks = hooks;
        self
    }

    /* router_config keys found in station.conf/slave-N.conf, layered
       under whatever the LNS sends */
    pub fn with_router_defaults(mut self, defaults: serde_json::Value) -> S2e {
        self.router_defaults = defaults;
        self
    }

    pub fn session_conf(&self) -> Option<&SessionConf> {
        self.conf.as_ref()
    }

    pub fn uplink_drops(&self) -> u64 {
        self.uplink_drops
    }

    /* ---------------------------------------------------------------- */
    /* lifecycle                                                        */

    pub fn on_connect(&mut self, transport: &mut dyn Transport) -> Result<()> {
        self.connected = true;
        let v = VersionMsg {
            msgtype: "version",
            station: self.ident.station.clone(),
            firmware: self.ident.firmware.clone(),
            package: self.ident.package.clone(),
            model: self.ident.model.clone(),
            protocol: PROTOCOL_VERSION,
            features: features(),
        };
        info!("connected to LNS, sending version: {}", v.station);
        transport.send_text(&serde_json::to_string(&v)?)
    }

    /* pending downlinks die with the session; the radio keeps running
       so a reconnect does not lose uplinks */
    pub fn on_disconnect(&mut self) {
        info!("LNS session closed, dropping session state ({} queued downlinks)", self.txq.len());
        self.connected = false;
        self.conf = None;
        self.txq.clear();
        self.mux_ref = None;
        self.pending_timesync = None;
    }

    /* ---------------------------------------------------------------- */
    /* inbound                                                          */

    pub fn on_text(
        &mut self,
        text: &str,
        ral: &mut Ral,
        transport: &mut dyn Transport,
        utc: i64,
    ) -> Verdict {
        let mut val: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(e=%e, "malformed JSON from LNS - ignored");
                return Verdict::Continue;
            }
        };
        if val.get("msgtype").and_then(|m| m.as_str()) == Some("router_config")
            && !self.router_defaults.is_null()
        {
            val = crate::conf::layer_router_config(&self.router_defaults, &val);
        }
        let m: LnsMsg = match serde_json::from_value(val) {
            Ok(m) => m,
            Err(e) => {
                warn!(e=%e, "unknown or malformed message from LNS - ignored");
                return Verdict::Continue;
            }
        };
        self.dispatch(m, ral, transport, utc)
    }

    pub fn on_binary(
        &mut self,
        data: &[u8],
        ral: &mut Ral,
        transport: &mut dyn Transport,
        utc: i64,
    ) -> Verdict {
        if !self.conf.as_ref().map_or(false, |c| c.binary) {
            warn!("binary frame from LNS outside {} mode - ignored", tcbin::PROTOCOL_FORMAT);
            return Verdict::Continue;
        }
        let m = match tcbin::decode(data) {
            Ok(m) => m,
            Err(e) => {
                warn!(e=%e, "undecodable binary message from LNS - ignored");
                return Verdict::Continue;
            }
        };
        match m {
            tcbin::TcMsg::Dnmsg(dn) => self.dispatch(LnsMsg::Dnmsg(dn), ral, transport, utc),
            tcbin::TcMsg::Dnsched(s) => {
                self.dispatch(LnsMsg::Dnsched { schedule: s }, ral, transport, utc)
            }
            tcbin::TcMsg::TimesyncResp(ts) => {
                self.dispatch(LnsMsg::Timesync(ts), ral, transport, utc)
            }
            other => {
                warn!("unexpected binary message {:?} - ignored", std::mem::discriminant(&other));
                Verdict::Continue
            }
        }
    }

    fn dispatch(
        &mut self,
        m: LnsMsg,
        ral: &mut Ral,
        transport: &mut dyn Transport,
        utc: i64,
    ) -> Verdict {
        match m {
            LnsMsg::RouterConfig(rc) => match self.apply_router_config(rc, ral, utc) {
                Ok(()) => Verdict::Continue,
                Err(e) => {
                    error!(e=%e, "router_config rejected - terminating session");
                    Verdict::TerminateSession
                }
            },
            LnsMsg::Dnmsg(dn) => {
                self.note_muxtime(dn.muxtime, utc);
                self.enqueue_dnmsg(dn, ral, transport);
                Verdict::Continue
            }
            LnsMsg::Dnsched { schedule } => {
                for dn in schedule {
                    self.note_muxtime(dn.muxtime, utc);
                    self.enqueue_dnmsg(dn, ral, transport);
                }
                Verdict::Continue
            }
            LnsMsg::Timesync(ts) => {
                self.note_muxtime(ts.muxtime, utc);
                self.on_timesync(ts, ral, utc);
                Verdict::Continue
            }
            LnsMsg::Runcmd(rc) => {
                self.hooks.runcmd(&rc.command, &rc.arguments);
                Verdict::Continue
            }
            LnsMsg::Rmtsh(sh) => {
                self.hooks.rmtsh(&sh);
                Verdict::Continue
            }
        }
    }

    fn note_muxtime(&mut self, muxtime: Option<f64>, utc: i64) {
        if let Some(m) = muxtime {
            self.mux_ref = Some((m, utc));
        }
    }

    fn reftime(&self, utc: i64) -> f64 {
        match self.mux_ref {
            Some((mux, at)) => mux + (utc - at) as f64 / 1e6,
            None => 0.0,
        }
    }

    fn enqueue_dnmsg(&mut self, dn: DnMsg, ral: &mut Ral, transport: &mut dyn Transport) {
        let gps_xtime = dn
            .gpstime
            .and_then(|g| ral.timesync().gps_to_xtime(g));
        match TxJob::from_dnmsg(&dn, gps_xtime) {
            Ok(job) => {
                debug!("queued downlink diid={} class={:?}", job.diid, job.dclass);
                self.txq.enqueue(job);
            }
            Err(reason) => {
                warn!("downlink diid={} refused: {}", dn.diid, reason);
                self.send_dnfailed(transport, dn.diid, dn.deveui, reason);
            }
        }
    }

    fn on_timesync(&mut self, ts: TimesyncResp, ral: &mut Ral, utc: i64) {
        if let Some(xtime) = ts.xtime {
            /* GPS transfer: an absolute (xtime, gpstime) pair */
            if let Err(e) = ral.timesync_mut().anchor_gps_at(xtime, ts.gpstime) {
                debug!(e=%e, "timesync transfer for a stale session - ignored");
            }
            return;
        }
        if let (Some(echo), Some((sent_at, probe_xtime))) = (ts.txtime, self.pending_timesync.take())
        {
            if echo != sent_at {
                debug!("timesync echo mismatch, discarding");
                return;
            }
            let rtt = utc - sent_at;
            if rtt < 0 || rtt > 2_000_000 {
                debug!("timesync RTT {} us out of bounds", rtt);
                return;
            }
            let est_xtime = probe_xtime + rtt / 2;
            if let Err(e) = ral.timesync_mut().anchor_gps_at(est_xtime, ts.gpstime) {
                debug!(e=%e, "timesync anchor failed");
            } else {
                debug!("timesync: gps anchored via LNS, rtt={} us", rtt);
            }
        }
    }

    /* ---------------------------------------------------------------- */
    /* router_config                                                    */

    fn apply_router_config(&mut self, rc: RouterConfig, ral: &mut Ral, utc: i64) -> Result<()> {
        let region = lookup(
            rc.region
                .as_deref()
                .ok_or_else(|| anyhow!("router_config without region"))?,
        )?;

        let (freq_min, freq_max) = rc
            .freq_range
            .unwrap_or((region.freq_min, region.freq_max));
        if freq_min >= freq_max {
            return Err(anyhow!("freq_range [{},{}] inverted", freq_min, freq_max));
        }

        /* DR tables: asymmetric wins, and half an asymmetric pair is a
           configuration error, not a fallback */
        let dr_defs = match (&rc.drs_up, &rc.drs_dn) {
            (Some(up), Some(dn)) => {
                if rc.drs.is_some() {
                    debug!("DRs_up/DRs_dn present - legacy DRs ignored");
                }
                DrDefs::asymmetric(parse_dr_table(up)?, parse_dr_table(dn)?)
            }
            (None, None) => DrDefs::symmetric(parse_dr_table(
                rc.drs.as_ref().ok_or_else(|| anyhow!("router_config without DR table"))?,
            )?),
            _ => return Err(anyhow!("DRs_up and DRs_dn must both be present")),
        };

        /* classify upchannels into concentrator slots */
        let upchannels = rc
            .upchannels
            .as_ref()
            .ok_or_else(|| anyhow!("router_config without upchannels"))?;
        let mut plan = ChPlan::default();
        for (i, ch) in upchannels.iter().enumerate() {
            if ch.len() < 3 {
                return Err(anyhow!("upchannel {} malformed: {:?}", i, ch));
            }
            let (freq, min_dr, max_dr) = (ch[0] as u32, ch[1] as u8, ch[2] as u8);
            if freq < freq_min || freq > freq_max {
                return Err(anyhow!("upchannel {} Hz outside [{},{}]", freq, freq_min, freq_max));
            }
            if min_dr > max_dr {
                return Err(anyhow!("upchannel {}: minDR {} > maxDR {}", freq, min_dr, max_dr));
            }
            if dr_defs.dr2rps_up(max_dr).is_illegal() && dr_defs.any_125khz(min_dr, max_dr).is_none()
            {
                return Err(anyhow!("upchannel {}: maxDR {} undefined in uplink DR table", freq, max_dr));
            }
            if let Some((min_rps, max_rps)) = dr_defs.any_125khz(min_dr, max_dr) {
                plan.multi.push(ChDef { freq, min_rps, max_rps });
            }
            if let Some(rps) = dr_defs.fast_lora(min_dr, max_dr) {
                if plan.fast.is_none() {
                    plan.fast = Some((freq, rps));
                }
            }
            if dr_defs.has_fsk(min_dr, max_dr) && plan.fsk.is_none() {
                plan.fsk = Some(freq);
            }
        }
        if plan.is_empty() {
            return Err(anyhow!("upchannels resolve to no usable channel"));
        }

        let mut filters = Filters::default();
        if let Some(ranges) = &rc.joineui {
            filters.set_joineui_ranges(ranges.iter().map(|(a, b)| (a.0, b.0)).collect())?;
        }
        if let Some(netids) = &rc.netid {
            filters.set_netids(netids);
        }

        /* test overrides are void on production builds */
        let (nocca, nodc, nodwell) = if cfg!(feature = "prod") {
            if rc.nocca || rc.nodc || rc.nodwell {
                info!("nocca/nodc/nodwell ignored on prod build");
            }
            (false, false, false)
        } else {
            (rc.nocca, rc.nodc, rc.nodwell)
        };

        let lbt = if region.cca && !nocca {
            let rssi_target = rc.lbt_rssi_target.unwrap_or(region.lbt_rssi_target);
            let scan = rc.lbt_scan_time_us.unwrap_or(region.lbt_scan_time_us);
            let channels: Vec<(u32, crate::rps::Bw, u32)> = match &rc.lbt_channels {
                Some(chs) => chs
                    .iter()
                    .map(|c| {
                        let bw = crate::rps::Bw::from_hz(c.bandwidth).unwrap_or(crate::rps::Bw::BW125);
                        (c.freq_hz, bw, c.scan_time_us.unwrap_or(scan))
                    })
                    .collect(),
                None => {
                    /* derive from the uplink plan: one entry per distinct
                       frequency at 250 kHz or below */
                    let mut chs: Vec<(u32, crate::rps::Bw, u32)> = plan
                        .multi
                        .iter()
                        .map(|c| (c.freq, crate::rps::Bw::BW125, scan))
                        .collect();
                    if let Some((f, rps)) = plan.fast {
                        if rps.bw() != crate::rps::Bw::BW500 {
                            chs.push((f, rps.bw(), scan));
                        }
                    }
                    if let Some(f) = plan.fsk {
                        chs.push((f, crate::rps::Bw::BW125, scan));
                    }
                    chs.sort_unstable_by_key(|c| c.0);
                    chs.dedup_by_key(|c| c.0);
                    chs
                }
            };
            info!(
                "LBT enabled: {} channels, rssi_target={} dBm, scan={} us",
                channels.len(),
                rssi_target,
                scan
            );
            Some(LbtConf { rssi_target, channels })
        } else {
            None
        };

        let pdu_enc = match rc.pdu_encoding.as_deref() {
            None | Some("hex") => PduEnc::Hex,
            Some("base64") | Some("b64") => PduEnc::Base64,
            Some(other) => return Err(anyhow!("unknown pdu_encoding '{}'", other)),
        };

        let binary = match rc.protocol_format.as_deref() {
            Some(f) if f == tcbin::PROTOCOL_FORMAT => true,
            Some(other) => {
                warn!("unknown protocol_format '{}' - staying on JSON", other);
                false
            }
            None => false,
        };

        let tx = TxParams {
            region,
            max_eirp: rc.max_eirp.unwrap_or(region.max_eirp).min(region.max_eirp),
            antenna_gain: self.radio.antenna_gain,
            lbt,
            nodwell,
            full_duplex: self.radio.board.full_duplex,
        };

        let dc_enabled = rc.duty_cycle_enabled && !nodc;

        /* hardware first: if the radio cannot carry the plan the session
           dies and nothing of the old state is touched */
        let base = self.radio.to_lgw_config(rc.sx130x_conf.as_ref())?;
        ral.config(&plan, &base, rc.gps_enable, utc)?;

        self.dc = DutyCycle::new(region, dc_enabled);
        self.txq.clear();
        info!(
            "router_config applied: region={} {} DRs, {} upchannels, pdu_only={}, dc={}, binary={}",
            region.name,
            if dr_defs.is_asymmetric() { "asymmetric" } else { "symmetric" },
            upchannels.len(),
            rc.pdu_only,
            dc_enabled,
            binary
        );
        self.conf = Some(SessionConf {
            region,
            dr_defs,
            plan,
            filters,
            pdu_only: rc.pdu_only,
            pdu_enc,
            dc_enabled,
            gps_enable: rc.gps_enable,
            tx,
            binary,
            sx130x_conf: rc.sx130x_conf,
        });
        Ok(())
    }

    /* ---------------------------------------------------------------- */
    /* uplink emission                                                  */

    pub fn on_rx_jobs(&mut self, jobs: Vec<RxJob>, transport: &mut dyn Transport, utc: i64) {
        for job in jobs {
            if let Err(e) = self.emit_uplink(&job, transport, utc) {
                warn!(e=%e, "failed to forward uplink");
            }
        }
    }

    fn emit_uplink(&mut self, job: &RxJob, transport: &mut dyn Transport, utc: i64) -> Result<()> {
        let Some(conf) = &self.conf else {
            return Ok(()); /* no session, frame evaporates */
        };
        let Some(dr) = conf.dr_defs.rps2dr_up(job.rps) else {
            self.uplink_drops += 1;
            debug!("rx {} not mapped by uplink DR table - dropped", job.rps);
            return Ok(());
        };
        let upinfo = UpInfo {
            rctx: job.rctx,
            xtime: job.xtime,
            gpstime: job.gpstime,
            fts: job.fts,
            rssi: job.rssi,
            snr: job.snr,
            rxtime: job.rxtime,
        };
        let reftime = self.reftime(utc);

        if conf.pdu_only {
            /* no parsing, no filtering: the frame goes up verbatim */
            let enc = match conf.pdu_enc {
                PduEnc::Hex => to_hex(&job.payload),
                PduEnc::Base64 => B64.encode(&job.payload),
            };
            if conf.binary {
                let m = tcbin::TcMsg::UpdfPdu {
                    pdu: job.payload.clone(),
                    reftime,
                    up: Self::binmeta(dr, job, &upinfo),
                };
                return transport.send_binary(&tcbin::encode(&m));
            }
            let m = PduMsg {
                msgtype: "updf",
                pdu: enc,
                reftime,
                dr,
                freq: job.freq,
                upinfo,
            };
            return transport.send_text(&serde_json::to_string(&m)?);
        }

        let Some(frame) = frame::parse_uplink(&job.payload) else {
            self.uplink_drops += 1;
            return Ok(());
        };
        match frame {
            Frame::Jreq {
                mhdr,
                joineui,
                deveui,
                devnonce,
                mic,
            } => {
                if !conf.filters.joineui_ok(joineui) {
                    debug!("join request {} filtered", Eui64(joineui));
                    self.uplink_drops += 1;
                    return Ok(());
                }
                if conf.binary {
                    let m = tcbin::TcMsg::Jreq {
                        mhdr,
                        joineui,
                        deveui,
                        devnonce,
                        mic,
                        reftime,
                        up: Self::binmeta(dr, job, &upinfo),
                    };
                    return transport.send_binary(&tcbin::encode(&m));
                }
                let m = JreqMsg {
                    msgtype: "jreq",
                    mhdr,
                    joineui: Eui64(joineui),
                    deveui: Eui64(deveui),
                    devnonce,
                    mic,
                    reftime,
                    dr,
                    freq: job.freq,
                    upinfo,
                };
                transport.send_text(&serde_json::to_string(&m)?)
            }
            /* rejoins bypass every filter and travel as raw PDU */
            Frame::Rejoin { mhdr, mic } => {
                if conf.binary {
                    let m = tcbin::TcMsg::Rejoin {
                        mhdr,
                        pdu: job.payload.clone(),
                        mic,
                        reftime,
                        up: Self::binmeta(dr, job, &upinfo),
                    };
                    return transport.send_binary(&tcbin::encode(&m));
                }
                let m = RejoinMsg {
                    msgtype: "rejoin",
                    mhdr,
                    pdu: to_hex(&job.payload),
                    mic,
                    reftime,
                    dr,
                    freq: job.freq,
                    upinfo,
                };
                transport.send_text(&serde_json::to_string(&m)?)
            }
            Frame::Updf {
                mhdr,
                devaddr,
                fctrl,
                fcnt,
                fopts,
                fport,
                payload,
                mic,
            } => {
                if !conf.filters.netid_ok(devaddr) {
                    debug!("data frame DevAddr={:08X} on filtered NetID", devaddr);
                    self.uplink_drops += 1;
                    return Ok(());
                }
                if conf.binary {
                    let m = tcbin::TcMsg::Updf {
                        mhdr,
                        devaddr: devaddr as i32,
                        fctrl,
                        fcnt,
                        fopts,
                        fport,
                        payload,
                        mic,
                        reftime,
                        up: Self::binmeta(dr, job, &upinfo),
                    };
                    return transport.send_binary(&tcbin::encode(&m));
                }
                let m = UpdfMsg {
                    msgtype: "updf",
                    mhdr,
                    devaddr: devaddr as i32,
                    fctrl,
                    fcnt,
                    fopts: to_hex(&fopts),
                    fport,
                    frmpayload: to_hex(&payload),
                    mic,
                    reftime,
                    dr,
                    freq: job.freq,
                    upinfo,
                };
                transport.send_text(&serde_json::to_string(&m)?)
            }
            Frame::Propdf => {
                if conf.binary {
                    let m = tcbin::TcMsg::Propdf {
                        payload: job.payload.clone(),
                        reftime,
                        up: Self::binmeta(dr, job, &upinfo),
                    };
                    return transport.send_binary(&tcbin::encode(&m));
                }
                let m = PropdfMsg {
                    msgtype: "propdf",
                    frmpayload: to_hex(&job.payload),
                    reftime,
                    dr,
                    freq: job.freq,
                    upinfo,
                };
                transport.send_text(&serde_json::to_string(&m)?)
            }
        }
    }

    fn binmeta(dr: u8, job: &RxJob, up: &UpInfo) -> tcbin::UpMeta {
        tcbin::UpMeta {
            dr,
            freq: job.freq,
            rctx: up.rctx,
            xtime: up.xtime,
            gpstime: up.gpstime,
            rssi: up.rssi,
            snr: up.snr,
            fts: up.fts,
            rxtime: up.rxtime,
        }
    }

    /* ---------------------------------------------------------------- */
    /* periodic work                                                    */

    pub fn tick(
        &mut self,
        ral: &mut Ral,
        transport: &mut dyn Transport,
        utc: i64,
    ) -> Result<Verdict> {
        match ral.pps_tick(utc)? {
            PpsAction::None => {}
            PpsAction::Fatal => return Ok(Verdict::Fatal),
        }
        let Some(conf) = &self.conf else {
            return Ok(Verdict::Continue);
        };
        let (dr_defs, tx_params, binary) = (conf.dr_defs.clone(), conf.tx.clone(), conf.binary);

        let outcomes = self
            .txq
            .tick(ral, &mut self.dc, &dr_defs, &tx_params, utc)?;
        for oc in outcomes {
            match oc {
                TxOutcome::Sent { diid, deveui, rctx, xtime } => {
                    let txtime = ral.timesync().xtime_to_utc(xtime).unwrap_or(0) as f64 / 1e6;
                    let gpstime = ral
                        .timesync()
                        .xtime_to_gps(xtime)
                        .ok()
                        .flatten()
                        .unwrap_or(0);
                    if binary {
                        let m = tcbin::TcMsg::Dntxed {
                            diid,
                            deveui: deveui.0,
                            rctx,
                            xtime,
                            txtime,
                            gpstime,
                        };
                        transport.send_binary(&tcbin::encode(&m))?;
                    } else {
                        let m = DntxedMsg {
                            msgtype: "dntxed",
                            diid,
                            deveui,
                            rctx,
                            xtime,
                            txtime,
                            gpstime,
                        };
                        transport.send_text(&serde_json::to_string(&m)?)?;
                    }
                }
                TxOutcome::Failed { diid, deveui, reason } => {
                    self.send_dnfailed(transport, diid, deveui, reason);
                }
            }
        }

        /* periodic timesync probe towards the LNS, interval jittered */
        if self.connected && utc - self.last_timesync >= TIMESYNC_INTERVAL_US {
            use rand::Rng;
            self.last_timesync = utc + rand::thread_rng().gen_range(0..5_000_000);
            let probe_xtime = ral.now_xtime(utc)?;
            self.pending_timesync = Some((utc, probe_xtime));
            let m = TimesyncReq {
                msgtype: "timesync",
                txtime: utc,
            };
            if binary {
                transport.send_binary(&tcbin::encode(&tcbin::TcMsg::TimesyncReq { txtime: utc }))?;
            } else {
                transport.send_text(&serde_json::to_string(&m)?)?;
            }
        }
        Ok(Verdict::Continue)
    }

    fn send_dnfailed(
        &self,
        transport: &mut dyn Transport,
        diid: i64,
        deveui: Eui64,
        reason: &str,
    ) {
        let binary = self.conf.as_ref().map_or(false, |c| c.binary);
        let r = if binary {
            transport.send_binary(&tcbin::encode(&tcbin::TcMsg::Dnfailed {
                diid,
                deveui: deveui.0,
                reason: reason.to_owned(),
            }))
        } else {
            serde_json::to_string(&DnfailedMsg {
                msgtype: "dntxed",
                diid,
                deveui,
                txfailed: reason.to_owned(),
            })
            .map_err(Into::into)
            .and_then(|s| transport.send_text(&s))
        };
        if let Err(e) = r {
            warn!(e=%e, "could not report downlink failure diid={}", diid);
        }
    }
}
