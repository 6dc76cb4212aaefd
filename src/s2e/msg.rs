use anyhow::{anyhow, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/* LNS wire protocol, JSON rendition. Station to LNS messages serialize
   with a fixed field order; LNS to station messages dispatch on the
   "msgtype" tag. */

/* ------------------------------------------------------------------ */
/* EUIs and hex                                                       */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Eui64(pub u64);

impl std::fmt::Display for Eui64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl std::str::FromStr for Eui64 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let clean: String = s.chars().filter(|c| *c != '-' && *c != ':').collect();
        if clean.len() != 16 {
            return Err(anyhow!("bad EUI '{}'", s));
        }
        Ok(Eui64(u64::from_str_radix(&clean, 16)?))
    }
}

impl Serialize for Eui64 {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Eui64 {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        /* the LNS writes EUIs as strings, older ones as plain integers */
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }
        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(Eui64(n)),
            Raw::Str(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

pub fn to_hex(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{:02X}", b));
    }
    s
}

pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(anyhow!("odd length hex string"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| anyhow!("bad hex: {}", e)))
        .collect()
}

/* ------------------------------------------------------------------ */
/* Station -> LNS                                                     */

#[derive(Debug, Clone, Serialize)]
pub struct VersionMsg {
    pub msgtype: &'static str, /* "version" */
    pub station: String,
    pub firmware: String,
    pub package: String,
    pub model: String,
    pub protocol: u32,
    pub features: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct UpInfo {
    pub rctx: i64,
    pub xtime: i64,
    pub gpstime: i64,
    pub fts: i32, /* -1 when no fine timestamp was taken */
    pub rssi: f32,
    pub snr: f32,
    pub rxtime: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdfMsg {
    pub msgtype: &'static str, /* "updf" */
    #[serde(rename = "MHdr")]
    pub mhdr: u8,
    #[serde(rename = "DevAddr")]
    pub devaddr: i32,
    #[serde(rename = "FCtrl")]
    pub fctrl: u8,
    #[serde(rename = "FCnt")]
    pub fcnt: u16,
    #[serde(rename = "FOpts")]
    pub fopts: String,
    #[serde(rename = "FPort")]
    pub fport: i32,
    #[serde(rename = "FRMPayload")]
    pub frmpayload: String,
    #[serde(rename = "MIC")]
    pub mic: i32,
    #[serde(rename = "RefTime")]
    pub reftime: f64,
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    pub upinfo: UpInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct JreqMsg {
    pub msgtype: &'static str, /* "jreq" */
    #[serde(rename = "MHdr")]
    pub mhdr: u8,
    #[serde(rename = "JoinEui")]
    pub joineui: Eui64,
    #[serde(rename = "DevEui")]
    pub deveui: Eui64,
    #[serde(rename = "DevNonce")]
    pub devnonce: u16,
    #[serde(rename = "MIC")]
    pub mic: i32,
    #[serde(rename = "RefTime")]
    pub reftime: f64,
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    pub upinfo: UpInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejoinMsg {
    pub msgtype: &'static str, /* "rejoin" */
    #[serde(rename = "MHdr")]
    pub mhdr: u8,
    pub pdu: String,
    #[serde(rename = "MIC")]
    pub mic: i32,
    #[serde(rename = "RefTime")]
    pub reftime: f64,
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    pub upinfo: UpInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropdfMsg {
    pub msgtype: &'static str, /* "propdf" */
    #[serde(rename = "FRMPayload")]
    pub frmpayload: String,
    #[serde(rename = "RefTime")]
    pub reftime: f64,
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    pub upinfo: UpInfo,
}

/* raw-PDU uplink: no header fields at all, just the frame bytes in the
   session's encoding */
#[derive(Debug, Clone, Serialize)]
pub struct PduMsg {
    pub msgtype: &'static str, /* "updf" */
    pub pdu: String,
    #[serde(rename = "RefTime")]
    pub reftime: f64,
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    pub upinfo: UpInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct DntxedMsg {
    pub msgtype: &'static str, /* "dntxed" */
    pub diid: i64,
    #[serde(rename = "DevEui")]
    pub deveui: Eui64,
    pub rctx: i64,
    pub xtime: i64,
    pub txtime: f64,
    pub gpstime: i64,
}

/* downlinks that never made it to the antenna */
#[derive(Debug, Clone, Serialize)]
pub struct DnfailedMsg {
    pub msgtype: &'static str, /* "dntxed" */
    pub diid: i64,
    #[serde(rename = "DevEui")]
    pub deveui: Eui64,
    pub txfailed: String, /* "cca" | "dutycycle" | "dwell" | "late" | "hal" */
}

#[derive(Debug, Clone, Serialize)]
pub struct TimesyncReq {
    pub msgtype: &'static str, /* "timesync" */
    pub txtime: i64,           /* station ustime at send */
}

/* ------------------------------------------------------------------ */
/* LNS -> Station                                                     */

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RouterConfig {
    pub region: Option<String>,
    pub hwspec: Option<String>,
    pub freq_range: Option<(u32, u32)>,
    pub max_eirp: Option<f64>,
    #[serde(rename = "DRs")]
    pub drs: Option<Vec<Vec<i64>>>,
    #[serde(rename = "DRs_up")]
    pub drs_up: Option<Vec<Vec<i64>>>,
    #[serde(rename = "DRs_dn")]
    pub drs_dn: Option<Vec<Vec<i64>>>,
    pub upchannels: Option<Vec<Vec<i64>>>,
    /* opaque HAL settings, handed to the radio layer untouched */
    #[serde(rename = "sx130x_conf", alias = "sx1301_conf", alias = "sx1302_conf", alias = "radio_conf")]
    pub sx130x_conf: Option<serde_json::Value>,
    #[serde(default)]
    pub nocca: bool,
    #[serde(default)]
    pub nodc: bool,
    #[serde(default)]
    pub nodwell: bool,
    #[serde(default = "default_true")]
    pub duty_cycle_enabled: bool,
    #[serde(default = "default_true")]
    pub gps_enable: bool,
    #[serde(default)]
    pub pdu_only: bool,
    pub pdu_encoding: Option<String>,
    #[serde(default)]
    pub lbt_enabled: bool,
    pub lbt_channels: Option<Vec<LbtChannelConf>>,
    pub lbt_rssi_target: Option<i8>,
    pub lbt_scan_time_us: Option<u32>,
    #[serde(rename = "JoinEui")]
    pub joineui: Option<Vec<(Eui64, Eui64)>>,
    #[serde(rename = "NetID")]
    pub netid: Option<Vec<u32>>,
    pub protocol_format: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LbtChannelConf {
    #[serde(rename = "freq_hz", alias = "freq")]
    pub freq_hz: u32,
    #[serde(default)]
    pub bandwidth: u32,
    pub scan_time_us: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DnMsg {
    #[serde(rename = "DevEui", default)]
    pub deveui: Eui64,
    #[serde(rename = "dC", default = "class_a")]
    pub dclass: u8, /* 0=A 1=B 2=C */
    pub diid: i64,
    pub pdu: String,
    #[serde(rename = "RxDelay", default)]
    pub rxdelay: u8,
    #[serde(rename = "RX1DR")]
    pub rx1dr: Option<u8>,
    #[serde(rename = "RX1Freq")]
    pub rx1freq: Option<u32>,
    #[serde(rename = "RX2DR")]
    pub rx2dr: Option<u8>,
    #[serde(rename = "RX2Freq")]
    pub rx2freq: Option<u32>,
    /* class B/C direct datarate/frequency */
    #[serde(rename = "DR")]
    pub dr: Option<u8>,
    #[serde(rename = "Freq")]
    pub freq: Option<u32>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub xtime: i64,
    #[serde(default)]
    pub rctx: i64,
    pub gpstime: Option<i64>,
    #[serde(rename = "MuxTime")]
    pub muxtime: Option<f64>,
}

fn class_a() -> u8 {
    0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TimesyncResp {
    pub txtime: Option<i64>, /* echo of our probe */
    pub gpstime: i64,
    pub xtime: Option<i64>, /* GPS transfer from another station */
    #[serde(rename = "MuxTime")]
    pub muxtime: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunCmd {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RmtSh {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub term: String,
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub stop: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "msgtype")]
pub enum LnsMsg {
    #[serde(rename = "router_config")]
    RouterConfig(RouterConfig),
    #[serde(rename = "dnmsg")]
    Dnmsg(DnMsg),
    #[serde(rename = "dnsched")]
    Dnsched {
        #[serde(default)]
        schedule: Vec<DnMsg>,
    },
    #[serde(rename = "timesync")]
    Timesync(TimesyncResp),
    #[serde(rename = "runcmd")]
    Runcmd(RunCmd),
    #[serde(rename = "rmtsh")]
    Rmtsh(RmtSh),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eui_formatting() {
        let eui = Eui64(0xEFCDAB8967452301);
        assert_eq!(eui.to_string(), "EF-CD-AB-89-67-45-23-01");
        assert_eq!("EF-CD-AB-89-67-45-23-01".parse::<Eui64>().unwrap(), eui);
        assert_eq!("efcdab8967452301".parse::<Eui64>().unwrap(), eui);
        assert!("EF-CD".parse::<Eui64>().is_err());
    }

    #[test]
    fn hex_roundtrip() {
        assert_eq!(to_hex(&[0xC0, 0x01, 0xFF]), "C001FF");
        assert_eq!(from_hex("C001FF").unwrap(), vec![0xC0, 0x01, 0xFF]);
        assert!(from_hex("C0F").is_err());
        assert!(from_hex("ZZ").is_err());
    }

    #[test]
    fn jreq_serializes_with_stable_names() {
        let msg = JreqMsg {
            msgtype: "jreq",
            mhdr: 0,
            joineui: Eui64(0xEFCDAB8967452301),
            deveui: Eui64(0xEFFDEBF9E7F5E3F1),
            devnonce: 61936,
            mic: -1549622880,
            reftime: 0.0,
            dr: 5,
            freq: 868_100_000,
            upinfo: UpInfo {
                rctx: 0,
                xtime: 0x33000001000,
                gpstime: 0,
                fts: -1,
                rssi: -90.0,
                snr: 9.0,
                rxtime: 0.0,
            },
        };
        let j = serde_json::to_value(&msg).unwrap();
        assert_eq!(j["msgtype"], "jreq");
        assert_eq!(j["JoinEui"], "EF-CD-AB-89-67-45-23-01");
        assert_eq!(j["DevEui"], "EF-FD-EB-F9-E7-F5-E3-F1");
        assert_eq!(j["DevNonce"], 61936);
        assert_eq!(j["MIC"], -1549622880);
        assert_eq!(j["upinfo"]["fts"], -1);
    }

    #[test]
    fn router_config_parses() {
        let j = serde_json::json!({
            "msgtype": "router_config",
            "region": "EU868",
            "hwspec": "sx1301/1",
            "freq_range": [863000000u32, 870000000u32],
            "max_eirp": 16.0,
            "DRs": [[12,125,0],[11,125,0],[10,125,0],[9,125,0],[8,125,0],[7,125,0],[7,250,0],[0,0,0]],
            "upchannels": [[868100000, 0, 5],[868300000,0,5],[868500000,0,5]],
            "JoinEui": [["00-00-00-00-00-00-10-00", "00-00-00-00-00-00-1F-FF"]],
            "NetID": [1],
            "nocca": true
        });
        let msg: LnsMsg = serde_json::from_value(j).unwrap();
        match msg {
            LnsMsg::RouterConfig(rc) => {
                assert_eq!(rc.region.as_deref(), Some("EU868"));
                assert_eq!(rc.freq_range, Some((863_000_000, 870_000_000)));
                assert_eq!(rc.drs.as_ref().unwrap().len(), 8);
                assert_eq!(rc.upchannels.as_ref().unwrap().len(), 3);
                assert_eq!(rc.joineui.as_ref().unwrap()[0].0, Eui64(0x1000));
                assert!(rc.nocca);
                assert!(rc.duty_cycle_enabled);
                assert!(rc.gps_enable);
            }
            m => panic!("unexpected {:?}", m),
        }
    }

    #[test]
    fn dnmsg_parses() {
        let j = serde_json::json!({
            "msgtype": "dnmsg",
            "DevEui": "00-11-22-33-44-55-66-77",
            "dC": 0,
            "diid": 4711,
            "pdu": "60AABBCCDD",
            "RxDelay": 1,
            "RX1DR": 5,
            "RX1Freq": 868100000u32,
            "RX2DR": 0,
            "RX2Freq": 869525000u32,
            "priority": 1,
            "xtime": 0x33000123456i64,
            "rctx": 0,
            "MuxTime": 1234.5
        });
        let msg: LnsMsg = serde_json::from_value(j).unwrap();
        match msg {
            LnsMsg::Dnmsg(dn) => {
                assert_eq!(dn.diid, 4711);
                assert_eq!(dn.rx1dr, Some(5));
                assert_eq!(dn.rx2freq, Some(869_525_000));
                assert_eq!(dn.muxtime, Some(1234.5));
                assert_eq!(from_hex(&dn.pdu).unwrap()[0], 0x60);
            }
            m => panic!("unexpected {:?}", m),
        }
    }

    #[test]
    fn unknown_msgtype_is_error_not_panic() {
        let r: std::result::Result<LnsMsg, _> =
            serde_json::from_str(r#"{"msgtype":"frobnicate"}"#);
        assert!(r.is_err());
    }
}
