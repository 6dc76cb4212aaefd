use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Error;
use crate::hal::{LgwConfBoard, LgwConfig, LGW_RF_CHAIN_NB};
use crate::s2e::StationIdent;

/* Configuration files. station.conf holds the station identity, the
   radio board settings and optional defaults for every router_config
   field; slave-N.conf overlays it for multi-radio setups; whatever the
   LNS sends overlays both. */

pub const STATION_CONF: &str = "station.conf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AntennaType {
    Omni,
    Sector,
    #[default]
    Undef,
}

impl std::fmt::Display for AntennaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AntennaType::Omni => write!(f, "omni"),
            AntennaType::Sector => write!(f, "sector"),
            AntennaType::Undef => write!(f, "undef"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RadioConf {
    #[serde(flatten)]
    pub board: LgwConfBoard,
    #[serde(alias = "antenna_conf")]
    pub antenna_type: AntennaType, /* carried for diagnostics */
    pub antenna_gain: f64,  /* dBi, subtracted from the EIRP ceiling */
    pub txpow_adjust: f64,  /* board-level TX power correction, dB */
    pub rssi_offset: f32,
    pub pps: bool, /* latch PPS edges on this board */
}

impl RadioConf {
    /* Base HAL configuration; the channel allocator fills chains in.
       An overlay (router_config sx130x_conf) wins over the file. */
    pub fn to_lgw_config(&self, overlay: Option<&Value>) -> Result<LgwConfig> {
        let board = match overlay {
            Some(v) => {
                let mut base = serde_json::to_value(&self.board)?;
                merge_json(&mut base, v);
                serde_json::from_value(base).context("bad sx130x_conf overlay")?
            }
            None => self.board.clone(),
        };
        debug!(
            "antenna: {} gain={} dBi, txpow_adjust={} dB",
            self.antenna_type, self.antenna_gain, self.txpow_adjust
        );
        let mut conf = LgwConfig {
            board,
            txpow_adjust: self.txpow_adjust,
            ..Default::default()
        };
        for i in 0..LGW_RF_CHAIN_NB {
            conf.rf_chain[i].rssi_offset = self.rssi_offset;
        }
        /* TX goes through the first chain unless the overlay says more */
        conf.rf_chain[0].tx_enable = true;
        Ok(conf)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct IdentSection {
    routerid: Option<String>,
    station: Option<String>,
    firmware: Option<String>,
    package: Option<String>,
    model: Option<String>,
    log_file: Option<PathBuf>,
    log_level: Option<String>,
    tc_uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StationConf {
    pub ident: StationIdent,
    pub routerid: Option<String>,
    pub radio: RadioConf,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub tc_uri: Option<String>,
    /* top-level keys mirroring router_config, layered under whatever
       the LNS sends */
    pub router_defaults: Value,
}

impl Default for StationConf {
    fn default() -> Self {
        Self {
            ident: StationIdent::default(),
            routerid: None,
            radio: RadioConf::default(),
            log_file: None,
            log_level: "info".into(),
            tc_uri: None,
            router_defaults: Value::Null,
        }
    }
}

/* Overlay src onto dst: objects merge recursively, everything else is
   replaced. */
pub fn merge_json(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(k) {
                    Some(slot) => merge_json(slot, v),
                    None => {
                        d.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

pub fn load(home: &Path, slave_idx: Option<u32>) -> Result<StationConf> {
    let mut root = read_json(&home.join(STATION_CONF))?;
    if let Some(idx) = slave_idx {
        let name = format!("slave-{}.conf", idx);
        let path = home.join(&name);
        if path.exists() {
            let overlay = read_json(&path)?;
            merge_json(&mut root, &overlay);
            info!("applied {}", name);
        } else {
            debug!("no {} - using station.conf as is", name);
        }
    }
    parse(root)
}

fn read_json(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("bad JSON in {}", path.display()))
        .context(Error::ConfError)
}

fn parse(mut root: Value) -> Result<StationConf> {
    let obj = root
        .as_object_mut()
        .ok_or_else(|| anyhow!("station.conf is not a JSON object"))
        .context(Error::ConfError)?;

    let ident_sec: IdentSection = match obj.remove("station_conf") {
        Some(v) => serde_json::from_value(v)
            .context("bad station_conf section")
            .context(Error::ConfError)?,
        None => IdentSection::default(),
    };
    let radio: RadioConf = match obj
        .remove("radio_conf")
        .or_else(|| obj.remove("SX130x_conf"))
        .or_else(|| obj.remove("SX1302_conf"))
        .or_else(|| obj.remove("SX1301_conf"))
    {
        Some(v) => serde_json::from_value(v)
            .context("bad radio_conf section")
            .context(Error::ConfError)?,
        None => RadioConf::default(),
    };

    let defaults = StationIdent::default();
    let ident = StationIdent {
        station: ident_sec.station.unwrap_or(defaults.station),
        firmware: ident_sec.firmware.unwrap_or(defaults.firmware),
        package: ident_sec.package.unwrap_or(defaults.package),
        model: ident_sec.model.unwrap_or(defaults.model),
    };

    Ok(StationConf {
        ident,
        routerid: ident_sec.routerid,
        radio,
        log_file: ident_sec.log_file,
        log_level: ident_sec.log_level.unwrap_or_else(|| "info".into()),
        tc_uri: ident_sec.tc_uri,
        router_defaults: root,
    })
}

/* Layer file-level router_config defaults under an LNS message. */
pub fn layer_router_config(defaults: &Value, lns: &Value) -> Value {
    if !defaults.is_object() {
        return lns.clone();
    }
    let mut merged = defaults.clone();
    merge_json(&mut merged, lns);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overlays_win() {
        let mut base = json!({"a": 1, "nest": {"x": 1, "y": 2}, "keep": true});
        merge_json(&mut base, &json!({"a": 2, "nest": {"y": 3, "z": 4}}));
        assert_eq!(base, json!({"a": 2, "nest": {"x": 1, "y": 3, "z": 4}, "keep": true}));
    }

    #[test]
    fn parse_full_conf() {
        let conf = parse(json!({
            "station_conf": {
                "routerid": "::1",
                "station": "2.0.6",
                "model": "corecell",
                "log_level": "debug",
                "tc_uri": "wss://lns.example:6043"
            },
            "radio_conf": {
                "lorawan_public": true,
                "clksrc": 0,
                "device": "/dev/spidev0.0",
                "antenna_type": "sector",
                "antenna_gain": 2.5,
                "pps": true
            },
            "region": "EU868",
            "nocca": true
        }))
        .unwrap();
        assert_eq!(conf.ident.model, "corecell");
        assert_eq!(conf.routerid.as_deref(), Some("::1"));
        assert_eq!(conf.radio.antenna_type, AntennaType::Sector);
        assert_eq!(conf.radio.antenna_gain, 2.5);
        assert_eq!(conf.radio.board.device, "/dev/spidev0.0");
        assert_eq!(conf.log_level, "debug");
        /* router_config mirror keys survive as defaults */
        assert_eq!(conf.router_defaults["region"], "EU868");
        assert_eq!(conf.router_defaults["nocca"], true);
    }

    #[test]
    fn layering_order() {
        let defaults = json!({"region": "EU868", "max_eirp": 14.0});
        let lns = json!({"msgtype": "router_config", "max_eirp": 16.0});
        let merged = layer_router_config(&defaults, &lns);
        assert_eq!(merged["region"], "EU868"); /* from file */
        assert_eq!(merged["max_eirp"], 16.0); /* LNS wins */
    }

    #[test]
    fn lgw_config_overlay() {
        let radio: RadioConf = serde_json::from_value(json!({
            "clksrc": 1, "device": "/dev/a", "rssi_offset": -200.0
        }))
        .unwrap();
        let conf = radio
            .to_lgw_config(Some(&json!({"device": "/dev/b", "full_duplex": true})))
            .unwrap();
        assert_eq!(conf.board.device, "/dev/b");
        assert!(conf.board.full_duplex);
        assert_eq!(conf.board.clksrc, 1);
        assert_eq!(conf.rf_chain[0].rssi_offset, -200.0);
        assert!(conf.rf_chain[0].tx_enable);
    }
}
