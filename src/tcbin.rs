use anyhow::Result;

use crate::error::Error;
use crate::s2e::msg::{to_hex, DnMsg, Eui64, TimesyncResp};

/* Binary data-plane codec, negotiated through router_config's
   protocol_format once the station advertised it. Framing is
   tag-length-value: one leading message-type byte, then fields as
   [tag:u8][len:u16 LE][value]. Numbers are fixed-width little endian.
   Discovery and router_config stay JSON; only the high-rate messages
   move to binary (60-80% smaller than their JSON rendition). */

pub const PROTOCOL_FORMAT: &str = "tcbin";

/* message types */
const MSG_UPDF: u8 = 1;
const MSG_JREQ: u8 = 2;
const MSG_PROPDF: u8 = 3;
const MSG_DNTXED: u8 = 4;
const MSG_TIMESYNC: u8 = 5;
const MSG_DNMSG: u8 = 6;
const MSG_DNSCHED: u8 = 7;
const MSG_TIMESYNC_RESP: u8 = 8;
const MSG_REJOIN: u8 = 9;
const MSG_UPDF_PDU: u8 = 10;
const MSG_DNFAILED: u8 = 11;

/* field tags, shared namespace */
const TAG_MHDR: u8 = 1;
const TAG_DEVADDR: u8 = 2;
const TAG_FCTRL: u8 = 3;
const TAG_FCNT: u8 = 4;
const TAG_FOPTS: u8 = 5;
const TAG_FPORT: u8 = 6;
const TAG_FRMPAYLOAD: u8 = 7;
const TAG_MIC: u8 = 8;
const TAG_DR: u8 = 9;
const TAG_FREQ: u8 = 10;
const TAG_RCTX: u8 = 11;
const TAG_XTIME: u8 = 12;
const TAG_GPSTIME: u8 = 13;
const TAG_RSSI: u8 = 14;
const TAG_SNR: u8 = 15;
const TAG_FTS: u8 = 16;
const TAG_RXTIME: u8 = 17;
const TAG_REFTIME: u8 = 18;
const TAG_JOINEUI: u8 = 19;
const TAG_DEVEUI: u8 = 20;
const TAG_DEVNONCE: u8 = 21;
const TAG_PDU: u8 = 22;
const TAG_DIID: u8 = 23;
const TAG_TXTIME: u8 = 24;
const TAG_DCLASS: u8 = 25;
const TAG_RXDELAY: u8 = 26;
const TAG_RX1DR: u8 = 27;
const TAG_RX1FREQ: u8 = 28;
const TAG_RX2DR: u8 = 29;
const TAG_RX2FREQ: u8 = 30;
const TAG_PRIORITY: u8 = 31;
const TAG_MUXTIME: u8 = 32;
const TAG_TXFAILED: u8 = 33;

/* radio metadata common to every uplink */
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UpMeta {
    pub dr: u8,
    pub freq: u32,
    pub rctx: i64,
    pub xtime: i64,
    pub gpstime: i64,
    pub rssi: f32,
    pub snr: f32,
    pub fts: i32,
    pub rxtime: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TcMsg {
    Updf {
        mhdr: u8,
        devaddr: i32,
        fctrl: u8,
        fcnt: u16,
        fopts: Vec<u8>,
        fport: i32,
        payload: Vec<u8>,
        mic: i32,
        reftime: f64,
        up: UpMeta,
    },
    UpdfPdu {
        pdu: Vec<u8>,
        reftime: f64,
        up: UpMeta,
    },
    Jreq {
        mhdr: u8,
        joineui: u64,
        deveui: u64,
        devnonce: u16,
        mic: i32,
        reftime: f64,
        up: UpMeta,
    },
    Rejoin {
        mhdr: u8,
        pdu: Vec<u8>,
        mic: i32,
        reftime: f64,
        up: UpMeta,
    },
    Propdf {
        payload: Vec<u8>,
        reftime: f64,
        up: UpMeta,
    },
    Dntxed {
        diid: i64,
        deveui: u64,
        rctx: i64,
        xtime: i64,
        txtime: f64,
        gpstime: i64,
    },
    Dnfailed {
        diid: i64,
        deveui: u64,
        reason: String,
    },
    TimesyncReq {
        txtime: i64,
    },
    /* decoded into the JSON-side structures so the downlink path stays
       single */
    Dnmsg(DnMsg),
    Dnsched(Vec<DnMsg>),
    TimesyncResp(TimesyncResp),
}

/* ------------------------------------------------------------------ */
/* writer                                                             */

struct W {
    buf: Vec<u8>,
}

impl W {
    fn new(msgtype: u8) -> W {
        W { buf: vec![msgtype] }
    }

    fn field(&mut self, tag: u8, value: &[u8]) {
        self.buf.push(tag);
        self.buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(value);
    }

    fn u8(&mut self, tag: u8, v: u8) {
        self.field(tag, &[v]);
    }
    fn u16(&mut self, tag: u8, v: u16) {
        self.field(tag, &v.to_le_bytes());
    }
    fn u32(&mut self, tag: u8, v: u32) {
        self.field(tag, &v.to_le_bytes());
    }
    fn i32(&mut self, tag: u8, v: i32) {
        self.field(tag, &v.to_le_bytes());
    }
    fn u64(&mut self, tag: u8, v: u64) {
        self.field(tag, &v.to_le_bytes());
    }
    fn i64(&mut self, tag: u8, v: i64) {
        self.field(tag, &v.to_le_bytes());
    }
    fn f32(&mut self, tag: u8, v: f32) {
        self.field(tag, &v.to_le_bytes());
    }
    fn f64(&mut self, tag: u8, v: f64) {
        self.field(tag, &v.to_le_bytes());
    }
    fn str(&mut self, tag: u8, v: &str) {
        self.field(tag, v.as_bytes());
    }

    fn upmeta(&mut self, up: &UpMeta) {
        self.u8(TAG_DR, up.dr);
        self.u32(TAG_FREQ, up.freq);
        self.i64(TAG_RCTX, up.rctx);
        self.i64(TAG_XTIME, up.xtime);
        self.i64(TAG_GPSTIME, up.gpstime);
        self.f32(TAG_RSSI, up.rssi);
        self.f32(TAG_SNR, up.snr);
        self.i32(TAG_FTS, up.fts);
        self.f64(TAG_RXTIME, up.rxtime);
    }
}

/* ------------------------------------------------------------------ */
/* reader                                                             */

struct R<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> R<'a> {
    fn next(&mut self) -> Result<Option<(u8, &'a [u8])>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        if self.pos + 3 > self.data.len() {
            return Err(codec_err("truncated TLV header".into()));
        }
        let tag = self.data[self.pos];
        let len = u16::from_le_bytes([self.data[self.pos + 1], self.data[self.pos + 2]]) as usize;
        let start = self.pos + 3;
        if start + len > self.data.len() {
            return Err(codec_err(format!("truncated TLV value (tag {})", tag)));
        }
        self.pos = start + len;
        Ok(Some((tag, &self.data[start..start + len])))
    }
}

/* every malformed input resolves to the same error kind, with the
   detail kept as context for the log line */
fn codec_err(msg: String) -> anyhow::Error {
    anyhow::Error::new(Error::CodecError).context(msg)
}

fn want<const N: usize>(v: &[u8], tag: u8) -> Result<[u8; N]> {
    v.try_into()
        .map_err(|_| codec_err(format!("field {} has length {}, expected {}", tag, v.len(), N)))
}

fn u8f(v: &[u8], tag: u8) -> Result<u8> {
    Ok(want::<1>(v, tag)?[0])
}

pub fn encode(msg: &TcMsg) -> Vec<u8> {
    match msg {
        TcMsg::Updf {
            mhdr,
            devaddr,
            fctrl,
            fcnt,
            fopts,
            fport,
            payload,
            mic,
            reftime,
            up,
        } => {
            let mut w = W::new(MSG_UPDF);
            w.u8(TAG_MHDR, *mhdr);
            w.i32(TAG_DEVADDR, *devaddr);
            w.u8(TAG_FCTRL, *fctrl);
            w.u16(TAG_FCNT, *fcnt);
            w.field(TAG_FOPTS, fopts);
            w.i32(TAG_FPORT, *fport);
            w.field(TAG_FRMPAYLOAD, payload);
            w.i32(TAG_MIC, *mic);
            w.f64(TAG_REFTIME, *reftime);
            w.upmeta(up);
            w.buf
        }
        TcMsg::UpdfPdu { pdu, reftime, up } => {
            let mut w = W::new(MSG_UPDF_PDU);
            w.field(TAG_PDU, pdu);
            w.f64(TAG_REFTIME, *reftime);
            w.upmeta(up);
            w.buf
        }
        TcMsg::Jreq {
            mhdr,
            joineui,
            deveui,
            devnonce,
            mic,
            reftime,
            up,
        } => {
            let mut w = W::new(MSG_JREQ);
            w.u8(TAG_MHDR, *mhdr);
            w.u64(TAG_JOINEUI, *joineui);
            w.u64(TAG_DEVEUI, *deveui);
            w.u16(TAG_DEVNONCE, *devnonce);
            w.i32(TAG_MIC, *mic);
            w.f64(TAG_REFTIME, *reftime);
            w.upmeta(up);
            w.buf
        }
        TcMsg::Rejoin {
            mhdr,
            pdu,
            mic,
            reftime,
            up,
        } => {
            let mut w = W::new(MSG_REJOIN);
            w.u8(TAG_MHDR, *mhdr);
            w.field(TAG_PDU, pdu);
            w.i32(TAG_MIC, *mic);
            w.f64(TAG_REFTIME, *reftime);
            w.upmeta(up);
            w.buf
        }
        TcMsg::Propdf {
            payload,
            reftime,
            up,
        } => {
            let mut w = W::new(MSG_PROPDF);
            w.field(TAG_FRMPAYLOAD, payload);
            w.f64(TAG_REFTIME, *reftime);
            w.upmeta(up);
            w.buf
        }
        TcMsg::Dntxed {
            diid,
            deveui,
            rctx,
            xtime,
            txtime,
            gpstime,
        } => {
            let mut w = W::new(MSG_DNTXED);
            w.i64(TAG_DIID, *diid);
            w.u64(TAG_DEVEUI, *deveui);
            w.i64(TAG_RCTX, *rctx);
            w.i64(TAG_XTIME, *xtime);
            w.f64(TAG_TXTIME, *txtime);
            w.i64(TAG_GPSTIME, *gpstime);
            w.buf
        }
        TcMsg::Dnfailed { diid, deveui, reason } => {
            let mut w = W::new(MSG_DNFAILED);
            w.i64(TAG_DIID, *diid);
            w.u64(TAG_DEVEUI, *deveui);
            w.str(TAG_TXFAILED, reason);
            w.buf
        }
        TcMsg::TimesyncReq { txtime } => {
            let mut w = W::new(MSG_TIMESYNC);
            w.i64(TAG_TXTIME, *txtime);
            w.buf
        }
        TcMsg::Dnmsg(dn) => {
            let mut w = W::new(MSG_DNMSG);
            enc_dnmsg(&mut w, dn);
            w.buf
        }
        TcMsg::Dnsched(dns) => {
            /* each element length-prefixed as a nested TLV blob */
            let mut w = W::new(MSG_DNSCHED);
            for dn in dns {
                let mut inner = W::new(MSG_DNMSG);
                enc_dnmsg(&mut inner, dn);
                w.field(TAG_PDU, &inner.buf);
            }
            w.buf
        }
        TcMsg::TimesyncResp(ts) => {
            let mut w = W::new(MSG_TIMESYNC_RESP);
            if let Some(t) = ts.txtime {
                w.i64(TAG_TXTIME, t);
            }
            w.i64(TAG_GPSTIME, ts.gpstime);
            if let Some(x) = ts.xtime {
                w.i64(TAG_XTIME, x);
            }
            if let Some(m) = ts.muxtime {
                w.f64(TAG_MUXTIME, m);
            }
            w.buf
        }
    }
}

fn enc_dnmsg(w: &mut W, dn: &DnMsg) {
    w.u64(TAG_DEVEUI, dn.deveui.0);
    w.u8(TAG_DCLASS, dn.dclass);
    w.i64(TAG_DIID, dn.diid);
    w.field(TAG_PDU, &crate::s2e::msg::from_hex(&dn.pdu).unwrap_or_default());
    w.u8(TAG_RXDELAY, dn.rxdelay);
    if let Some(v) = dn.rx1dr {
        w.u8(TAG_RX1DR, v);
    }
    if let Some(v) = dn.rx1freq {
        w.u32(TAG_RX1FREQ, v);
    }
    if let Some(v) = dn.rx2dr {
        w.u8(TAG_RX2DR, v);
    }
    if let Some(v) = dn.rx2freq {
        w.u32(TAG_RX2FREQ, v);
    }
    if let Some(v) = dn.dr {
        w.u8(TAG_DR, v);
    }
    if let Some(v) = dn.freq {
        w.u32(TAG_FREQ, v);
    }
    w.u8(TAG_PRIORITY, dn.priority);
    w.i64(TAG_XTIME, dn.xtime);
    w.i64(TAG_RCTX, dn.rctx);
    if let Some(v) = dn.gpstime {
        w.i64(TAG_GPSTIME, v);
    }
    if let Some(v) = dn.muxtime {
        w.f64(TAG_MUXTIME, v);
    }
}

pub fn decode(data: &[u8]) -> Result<TcMsg> {
    if data.is_empty() {
        return Err(codec_err("empty binary message".into()));
    }
    let msgtype = data[0];
    let mut r = R { data, pos: 1 };
    match msgtype {
        MSG_UPDF => {
            let mut m = (0u8, 0i32, 0u8, 0u16, Vec::new(), -1i32, Vec::new(), 0i32, 0f64, UpMeta::default());
            while let Some((tag, v)) = r.next()? {
                match tag {
                    TAG_MHDR => m.0 = u8f(v, tag)?,
                    TAG_DEVADDR => m.1 = i32::from_le_bytes(want(v, tag)?),
                    TAG_FCTRL => m.2 = u8f(v, tag)?,
                    TAG_FCNT => m.3 = u16::from_le_bytes(want(v, tag)?),
                    TAG_FOPTS => m.4 = v.to_vec(),
                    TAG_FPORT => m.5 = i32::from_le_bytes(want(v, tag)?),
                    TAG_FRMPAYLOAD => m.6 = v.to_vec(),
                    TAG_MIC => m.7 = i32::from_le_bytes(want(v, tag)?),
                    TAG_REFTIME => m.8 = f64::from_le_bytes(want(v, tag)?),
                    _ => dec_upmeta(tag, v, &mut m.9)?,
                }
            }
            Ok(TcMsg::Updf {
                mhdr: m.0,
                devaddr: m.1,
                fctrl: m.2,
                fcnt: m.3,
                fopts: m.4,
                fport: m.5,
                payload: m.6,
                mic: m.7,
                reftime: m.8,
                up: m.9,
            })
        }
        MSG_UPDF_PDU => {
            let (mut pdu, mut reftime, mut up) = (Vec::new(), 0f64, UpMeta::default());
            while let Some((tag, v)) = r.next()? {
                match tag {
                    TAG_PDU => pdu = v.to_vec(),
                    TAG_REFTIME => reftime = f64::from_le_bytes(want(v, tag)?),
                    _ => dec_upmeta(tag, v, &mut up)?,
                }
            }
            Ok(TcMsg::UpdfPdu { pdu, reftime, up })
        }
        MSG_JREQ => {
            let mut m = (0u8, 0u64, 0u64, 0u16, 0i32, 0f64, UpMeta::default());
            while let Some((tag, v)) = r.next()? {
                match tag {
                    TAG_MHDR => m.0 = u8f(v, tag)?,
                    TAG_JOINEUI => m.1 = u64::from_le_bytes(want(v, tag)?),
                    TAG_DEVEUI => m.2 = u64::from_le_bytes(want(v, tag)?),
                    TAG_DEVNONCE => m.3 = u16::from_le_bytes(want(v, tag)?),
                    TAG_MIC => m.4 = i32::from_le_bytes(want(v, tag)?),
                    TAG_REFTIME => m.5 = f64::from_le_bytes(want(v, tag)?),
                    _ => dec_upmeta(tag, v, &mut m.6)?,
                }
            }
            Ok(TcMsg::Jreq {
                mhdr: m.0,
                joineui: m.1,
                deveui: m.2,
                devnonce: m.3,
                mic: m.4,
                reftime: m.5,
                up: m.6,
            })
        }
        MSG_REJOIN => {
            let mut m = (0u8, Vec::new(), 0i32, 0f64, UpMeta::default());
            while let Some((tag, v)) = r.next()? {
                match tag {
                    TAG_MHDR => m.0 = u8f(v, tag)?,
                    TAG_PDU => m.1 = v.to_vec(),
                    TAG_MIC => m.2 = i32::from_le_bytes(want(v, tag)?),
                    TAG_REFTIME => m.3 = f64::from_le_bytes(want(v, tag)?),
                    _ => dec_upmeta(tag, v, &mut m.4)?,
                }
            }
            Ok(TcMsg::Rejoin {
                mhdr: m.0,
                pdu: m.1,
                mic: m.2,
                reftime: m.3,
                up: m.4,
            })
        }
        MSG_PROPDF => {
            let (mut payload, mut reftime, mut up) = (Vec::new(), 0f64, UpMeta::default());
            while let Some((tag, v)) = r.next()? {
                match tag {
                    TAG_FRMPAYLOAD => payload = v.to_vec(),
                    TAG_REFTIME => reftime = f64::from_le_bytes(want(v, tag)?),
                    _ => dec_upmeta(tag, v, &mut up)?,
                }
            }
            Ok(TcMsg::Propdf { payload, reftime, up })
        }
        MSG_DNTXED => {
            let mut m = (0i64, 0u64, 0i64, 0i64, 0f64, 0i64);
            while let Some((tag, v)) = r.next()? {
                match tag {
                    TAG_DIID => m.0 = i64::from_le_bytes(want(v, tag)?),
                    TAG_DEVEUI => m.1 = u64::from_le_bytes(want(v, tag)?),
                    TAG_RCTX => m.2 = i64::from_le_bytes(want(v, tag)?),
                    TAG_XTIME => m.3 = i64::from_le_bytes(want(v, tag)?),
                    TAG_TXTIME => m.4 = f64::from_le_bytes(want(v, tag)?),
                    TAG_GPSTIME => m.5 = i64::from_le_bytes(want(v, tag)?),
                    _ => {}
                }
            }
            Ok(TcMsg::Dntxed {
                diid: m.0,
                deveui: m.1,
                rctx: m.2,
                xtime: m.3,
                txtime: m.4,
                gpstime: m.5,
            })
        }
        MSG_DNFAILED => {
            let mut m = (0i64, 0u64, String::new());
            while let Some((tag, v)) = r.next()? {
                match tag {
                    TAG_DIID => m.0 = i64::from_le_bytes(want(v, tag)?),
                    TAG_DEVEUI => m.1 = u64::from_le_bytes(want(v, tag)?),
                    TAG_TXFAILED => m.2 = String::from_utf8_lossy(v).into_owned(),
                    _ => {}
                }
            }
            Ok(TcMsg::Dnfailed {
                diid: m.0,
                deveui: m.1,
                reason: m.2,
            })
        }
        MSG_TIMESYNC => {
            let mut txtime = 0i64;
            while let Some((tag, v)) = r.next()? {
                if tag == TAG_TXTIME {
                    txtime = i64::from_le_bytes(want(v, tag)?);
                }
            }
            Ok(TcMsg::TimesyncReq { txtime })
        }
        MSG_DNMSG => Ok(TcMsg::Dnmsg(dec_dnmsg(&mut r)?)),
        MSG_DNSCHED => {
            let mut dns = Vec::new();
            while let Some((tag, v)) = r.next()? {
                if tag == TAG_PDU {
                    if v.is_empty() || v[0] != MSG_DNMSG {
                        return Err(codec_err("bad dnsched element".into()));
                    }
                    let mut inner = R { data: v, pos: 1 };
                    dns.push(dec_dnmsg(&mut inner)?);
                }
            }
            Ok(TcMsg::Dnsched(dns))
        }
        MSG_TIMESYNC_RESP => {
            let mut ts = TimesyncResp {
                txtime: None,
                gpstime: 0,
                xtime: None,
                muxtime: None,
            };
            while let Some((tag, v)) = r.next()? {
                match tag {
                    TAG_TXTIME => ts.txtime = Some(i64::from_le_bytes(want(v, tag)?)),
                    TAG_GPSTIME => ts.gpstime = i64::from_le_bytes(want(v, tag)?),
                    TAG_XTIME => ts.xtime = Some(i64::from_le_bytes(want(v, tag)?)),
                    TAG_MUXTIME => ts.muxtime = Some(f64::from_le_bytes(want(v, tag)?)),
                    _ => {}
                }
            }
            Ok(TcMsg::TimesyncResp(ts))
        }
        t => Err(codec_err(format!("unknown binary message type {}", t))),
    }
}

fn dec_upmeta(tag: u8, v: &[u8], up: &mut UpMeta) -> Result<()> {
    match tag {
        TAG_DR => up.dr = u8f(v, tag)?,
        TAG_FREQ => up.freq = u32::from_le_bytes(want(v, tag)?),
        TAG_RCTX => up.rctx = i64::from_le_bytes(want(v, tag)?),
        TAG_XTIME => up.xtime = i64::from_le_bytes(want(v, tag)?),
        TAG_GPSTIME => up.gpstime = i64::from_le_bytes(want(v, tag)?),
        TAG_RSSI => up.rssi = f32::from_le_bytes(want(v, tag)?),
        TAG_SNR => up.snr = f32::from_le_bytes(want(v, tag)?),
        TAG_FTS => up.fts = i32::from_le_bytes(want(v, tag)?),
        TAG_RXTIME => up.rxtime = f64::from_le_bytes(want(v, tag)?),
        _ => {} /* forward compatible: unknown fields skipped */
    }
    Ok(())
}

fn dec_dnmsg(r: &mut R) -> Result<DnMsg> {
    let mut dn = DnMsg {
        deveui: Eui64(0),
        dclass: 0,
        diid: 0,
        pdu: String::new(),
        rxdelay: 0,
        rx1dr: None,
        rx1freq: None,
        rx2dr: None,
        rx2freq: None,
        dr: None,
        freq: None,
        priority: 0,
        xtime: 0,
        rctx: 0,
        gpstime: None,
        muxtime: None,
    };
    while let Some((tag, v)) = r.next()? {
        match tag {
            TAG_DEVEUI => dn.deveui = Eui64(u64::from_le_bytes(want(v, tag)?)),
            TAG_DCLASS => dn.dclass = u8f(v, tag)?,
            TAG_DIID => dn.diid = i64::from_le_bytes(want(v, tag)?),
            TAG_PDU => dn.pdu = to_hex(v),
            TAG_RXDELAY => dn.rxdelay = u8f(v, tag)?,
            TAG_RX1DR => dn.rx1dr = Some(u8f(v, tag)?),
            TAG_RX1FREQ => dn.rx1freq = Some(u32::from_le_bytes(want(v, tag)?)),
            TAG_RX2DR => dn.rx2dr = Some(u8f(v, tag)?),
            TAG_RX2FREQ => dn.rx2freq = Some(u32::from_le_bytes(want(v, tag)?)),
            TAG_DR => dn.dr = Some(u8f(v, tag)?),
            TAG_FREQ => dn.freq = Some(u32::from_le_bytes(want(v, tag)?)),
            TAG_PRIORITY => dn.priority = u8f(v, tag)?,
            TAG_XTIME => dn.xtime = i64::from_le_bytes(want(v, tag)?),
            TAG_RCTX => dn.rctx = i64::from_le_bytes(want(v, tag)?),
            TAG_GPSTIME => dn.gpstime = Some(i64::from_le_bytes(want(v, tag)?)),
            TAG_MUXTIME => dn.muxtime = Some(f64::from_le_bytes(want(v, tag)?)),
            _ => {}
        }
    }
    Ok(dn)
}
