use serde_json::{json, Value};

use lora_station::conf::StationConf;
use lora_station::hal::sim::{SimHal, SimHandle};
use lora_station::rps::{Bw, Rps};
use lora_station::station::Station;
use lora_station::transport::{channel_pair, ChannelPeer, TransportEvent};

/* Full-stack scenarios: simulated concentrator below, scripted LNS
   above, the real reactor in between. */

fn mk_station() -> (Station, SimHandle, ChannelPeer) {
    let (hal, sim) = SimHal::new();
    let (transport, peer) = channel_pair();
    let conf = StationConf::default();
    let station = Station::new(&conf, Box::new(hal), Box::new(transport));
    (station, sim, peer)
}

fn pump(station: &mut Station, sim: &SimHandle, steps: usize, advance_us: u64) {
    for _ in 0..steps {
        let utc = sim.borrow().now_us() as i64;
        station.step(utc);
        sim.borrow_mut().advance(advance_us);
    }
}

fn json_msgs(peer: &mut ChannelPeer) -> Vec<Value> {
    peer.recv_all()
        .into_iter()
        .filter_map(|ev| match ev {
            TransportEvent::Text(t) => serde_json::from_str(&t).ok(),
            _ => None,
        })
        .collect()
}

fn eu868_config() -> Value {
    json!({
        "msgtype": "router_config",
        "region": "EU868",
        "hwspec": "sx1301/1",
        "freq_range": [863000000u32, 870000000u32],
        "DRs": [[12,125,0],[11,125,0],[10,125,0],[9,125,0],[8,125,0],[7,125,0],
                [7,250,0],[0,0,0],[-1,0,0],[-1,0,0],[-1,0,0],[-1,0,0],
                [-1,0,0],[-1,0,0],[-1,0,0],[-1,0,0]],
        "upchannels": [[868100000u32,0,5],[868300000u32,0,5],[868500000u32,0,5]]
    })
}

fn connect_and_configure(
    station: &mut Station,
    sim: &SimHandle,
    peer: &mut ChannelPeer,
    config: Value,
) -> Vec<Value> {
    peer.connect();
    pump(station, sim, 2, 1000);
    let version: Vec<Value> = json_msgs(peer);
    peer.send_json(&config);
    pump(station, sim, 3, 1000);
    version
}

const JREQ_PHY: [u8; 23] = [
    0x00, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0xF1, 0xE3, 0xF5, 0xE7, 0xF9, 0xEB,
    0xFD, 0xEF, 0xF0, 0xF1, 0xA0, 0xA1, 0xA2, 0xA3,
];

const REJOIN_PHY: [u8; 19] = [
    0xC0, 0x00, 0x01, 0x02, 0x03, 0xF1, 0xE3, 0xF5, 0xE7, 0xF9, 0xEB, 0xFD, 0xEF, 0x10, 0x20,
    0xA0, 0xA1, 0xA2, 0xA3,
];

#[test]
fn version_message_on_connect() {
    let (mut station, sim, mut peer) = mk_station();
    peer.connect();
    pump(&mut station, &sim, 2, 1000);
    let msgs = json_msgs(&mut peer);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0]["msgtype"], "version");
    assert_eq!(msgs[0]["protocol"], 2);
    let features = msgs[0]["features"].as_str().unwrap();
    for tok in ["gps-conf", "duty-conf", "pdu-conf", "lbt-conf", "updn-dr"] {
        assert!(features.contains(tok), "missing feature token {}", tok);
    }
}

#[test]
fn join_request_forwarding() {
    let (mut station, sim, mut peer) = mk_station();
    connect_and_configure(&mut station, &sim, &mut peer, eu868_config());

    sim.borrow_mut()
        .inject_rx(868_100_000, Rps::lora(7, Bw::BW125), &JREQ_PHY, -91.0, 8.0);
    pump(&mut station, &sim, 2, 1000);

    let msgs = json_msgs(&mut peer);
    let jreq = msgs.iter().find(|m| m["msgtype"] == "jreq").expect("no jreq");
    assert_eq!(jreq["JoinEui"], "EF-CD-AB-89-67-45-23-01");
    assert_eq!(jreq["DevEui"], "EF-FD-EB-F9-E7-F5-E3-F1");
    assert_eq!(jreq["DevNonce"], 61936);
    assert_eq!(jreq["MIC"], -1549622880);
    assert_eq!(jreq["DR"], 5); /* SF7/BW125 */
    assert_eq!(jreq["Freq"], 868_100_000);
    assert_eq!(jreq["upinfo"]["fts"], -1);
    assert!(jreq["upinfo"]["xtime"].as_i64().unwrap() > 0);
}

#[test]
fn joineui_filter_drops_jreq_but_not_rejoin() {
    let (mut station, sim, mut peer) = mk_station();
    let mut cfg = eu868_config();
    /* range that does NOT contain the JoinEUI above */
    cfg["JoinEui"] = json!([["00-00-00-00-00-00-00-01", "00-00-00-00-00-00-FF-FF"]]);
    connect_and_configure(&mut station, &sim, &mut peer, cfg);

    sim.borrow_mut()
        .inject_rx(868_100_000, Rps::lora(7, Bw::BW125), &JREQ_PHY, -91.0, 8.0);
    sim.borrow_mut()
        .inject_rx(868_300_000, Rps::lora(9, Bw::BW125), &REJOIN_PHY, -99.0, 2.0);
    pump(&mut station, &sim, 2, 1000);

    let msgs = json_msgs(&mut peer);
    assert!(msgs.iter().all(|m| m["msgtype"] != "jreq"), "jreq not filtered");
    let rejoin = msgs.iter().find(|m| m["msgtype"] == "rejoin").expect("rejoin filtered");
    assert_eq!(rejoin["MHdr"], 192);
    assert_eq!(rejoin["MIC"], -1549622880);
    assert_eq!(
        rejoin["pdu"],
        "C0000102 03F1E3F5 E7F9EBFD EF1020A0 A1A2A3".replace(' ', "")
    );
}

#[test]
fn netid_filter_drops_data_frames() {
    let (mut station, sim, mut peer) = mk_station();
    let mut cfg = eu868_config();
    cfg["NetID"] = json!([1]);
    connect_and_configure(&mut station, &sim, &mut peer, cfg);

    /* DevAddr with NwkID 2 (top 7 bits) */
    let devaddr: u32 = 2 << 25 | 0x1234;
    let mut updf = vec![0x40];
    updf.extend_from_slice(&devaddr.to_le_bytes());
    updf.extend_from_slice(&[0x00, 0x07, 0x00, 0x01, 0xAA, 0x11, 0x22, 0x33, 0x44]);
    sim.borrow_mut()
        .inject_rx(868_100_000, Rps::lora(8, Bw::BW125), &updf, -80.0, 6.0);
    pump(&mut station, &sim, 2, 1000);
    assert!(json_msgs(&mut peer).iter().all(|m| m["msgtype"] != "updf"));

    /* NwkID 1 passes */
    let devaddr: u32 = 1 << 25 | 0x1234;
    let mut updf = vec![0x40];
    updf.extend_from_slice(&devaddr.to_le_bytes());
    updf.extend_from_slice(&[0x00, 0x07, 0x00, 0x01, 0xAA, 0x11, 0x22, 0x33, 0x44]);
    sim.borrow_mut()
        .inject_rx(868_100_000, Rps::lora(8, Bw::BW125), &updf, -80.0, 6.0);
    pump(&mut station, &sim, 2, 1000);
    let msgs = json_msgs(&mut peer);
    let m = msgs.iter().find(|m| m["msgtype"] == "updf").expect("updf dropped");
    assert_eq!(m["FPort"], 1);
    assert_eq!(m["FCnt"], 7);
    assert_eq!(m["DR"], 4); /* SF8 */
}

#[test]
fn us915_asymmetric_plan_and_downlink() {
    let (mut station, sim, mut peer) = mk_station();
    let mut drs_up = vec![
        json!([10, 125, 0]),
        json!([9, 125, 0]),
        json!([8, 125, 0]),
        json!([7, 125, 0]),
        json!([8, 500, 0]),
        json!([-1, 0, 0]),
        json!([-1, 0, 0]),
        json!([6, 125, 0]),
        json!([5, 125, 0]),
    ];
    drs_up.resize(16, json!([-1, 0, 0]));
    let mut drs_dn = vec![json!([5, 500, 0])];
    drs_dn.resize(8, json!([-1, 0, 0]));
    drs_dn.extend([
        json!([12, 500, 1]),
        json!([11, 500, 1]),
        json!([10, 500, 1]),
        json!([9, 500, 1]),
        json!([8, 500, 1]),
        json!([7, 500, 1]),
        json!([6, 500, 1]),
        json!([-1, 0, 0]),
    ]);
    let upchannels: Vec<Value> = (0..8)
        .map(|i| json!([902_300_000u32 + i * 200_000, 0, 8]))
        .collect();
    let cfg = json!({
        "msgtype": "router_config",
        "region": "US915",
        "DRs_up": drs_up,
        "DRs_dn": drs_dn,
        "upchannels": upchannels
    });
    connect_and_configure(&mut station, &sim, &mut peer, cfg);

    /* all 8 multi-SF chains at 125 kHz plus the fast-LoRa slot at 500 */
    {
        let sim_ref = sim.borrow();
        let conf = &sim_ref.conf;
        for i in 0..8 {
            assert!(conf.if_chain[i].enable, "multi-SF chain {} disabled", i);
            assert_eq!(conf.if_chain[i].bandwidth, Some(Bw::BW125));
        }
        assert!(conf.if_chain[8].enable, "fast LoRa chain disabled");
        assert_eq!(conf.if_chain[8].bandwidth, Some(Bw::BW500));
        assert_eq!(conf.if_chain[8].datarate, 8); /* SF8 */
        assert!(!conf.if_chain[9].enable); /* no FSK in US915 */
    }

    /* class C downlink on DR13: asymmetric table says SF7/BW500 */
    peer.send_json(&json!({
        "msgtype": "dnmsg",
        "DevEui": "00-11-22-33-44-55-66-77",
        "dC": 2,
        "diid": 77,
        "pdu": "60DEADBEEF",
        "DR": 13,
        "Freq": 923_300_000u32,
        "priority": 1
    }));
    pump(&mut station, &sim, 60, 20_000);

    let tx = {
        let sim_ref = sim.borrow();
        assert_eq!(sim_ref.tx_log.len(), 1, "downlink not transmitted");
        sim_ref.tx_log[0]
    };
    assert_eq!(tx.datarate, 7); /* SF7 */
    assert_eq!(tx.bandwidth, Bw::BW500);
    assert_eq!(tx.freq_hz, 923_300_000);
    assert_eq!(&tx.payload[..5], &[0x60, 0xDE, 0xAD, 0xBE, 0xEF]);

    let msgs = json_msgs(&mut peer);
    let dntxed = msgs.iter().find(|m| m["msgtype"] == "dntxed").expect("no dntxed");
    assert_eq!(dntxed["diid"], 77);
    assert!(dntxed.get("txfailed").is_none());
}

#[test]
fn as923_lbt_derived_and_busy_channel_fails() {
    let (mut station, sim, mut peer) = mk_station();
    let cfg = json!({
        "msgtype": "router_config",
        "region": "AS923-1",
        "DRs": [[12,125,0],[11,125,0],[10,125,0],[9,125,0],[8,125,0],[7,125,0],
                [7,250,0],[-1,0,0],[-1,0,0],[-1,0,0],[-1,0,0],[-1,0,0],
                [-1,0,0],[-1,0,0],[-1,0,0],[-1,0,0]],
        "upchannels": [[923200000u32,0,5],[923400000u32,0,5]]
    });
    connect_and_configure(&mut station, &sim, &mut peer, cfg);

    /* LBT parameters derived from the uplink plan */
    {
        let sc = station.s2e.session_conf().expect("no session");
        let lbt = sc.tx.lbt.as_ref().expect("LBT not enabled");
        assert_eq!(lbt.rssi_target, -80);
        let freqs: Vec<u32> = lbt.channels.iter().map(|c| c.0).collect();
        assert_eq!(freqs, vec![923_200_000, 923_400_000]);
        assert!(lbt.channels.iter().all(|c| c.2 == 5000));
    }

    /* carrier at -70 dBm beats the -80 target: TX must fail over CCA */
    sim.borrow_mut().rssi_busy.push((923_200_000, -70.0));
    peer.send_json(&json!({
        "msgtype": "dnmsg",
        "DevEui": "00-11-22-33-44-55-66-77",
        "dC": 2,
        "diid": 31,
        "pdu": "60AA",
        "DR": 5,
        "Freq": 923_200_000u32
    }));
    pump(&mut station, &sim, 10, 20_000);
    let msgs = json_msgs(&mut peer);
    let failed = msgs
        .iter()
        .find(|m| m["msgtype"] == "dntxed" && m.get("txfailed").is_some())
        .expect("no failure dntxed");
    assert_eq!(failed["diid"], 31);
    assert_eq!(failed["txfailed"], "cca");
    assert_eq!(sim.borrow().tx_log.len(), 0);
}

#[test]
fn au915_tx_power_capped_at_26dbm() {
    let (mut station, sim, mut peer) = mk_station();
    let cfg = json!({
        "msgtype": "router_config",
        "region": "AU915",
        "max_eirp": 30.0,
        "DRs": [[12,125,0],[11,125,0],[10,125,0],[9,125,0],[8,125,0],[7,125,0],
                [8,500,0],[-1,0,0],[-1,0,0],[-1,0,0],[-1,0,0],[-1,0,0],
                [-1,0,0],[-1,0,0],[-1,0,0],[-1,0,0]],
        "upchannels": [[915200000u32,0,5],[915400000u32,0,5]]
    });
    connect_and_configure(&mut station, &sim, &mut peer, cfg);

    /* the LNS grants 30 dBm EIRP but the gain LUT stops at 26 dBm */
    peer.send_json(&json!({
        "msgtype": "dnmsg",
        "DevEui": "00-11-22-33-44-55-66-77",
        "dC": 2,
        "diid": 51,
        "pdu": "60BEEF",
        "DR": 5,
        "Freq": 915_200_000u32
    }));
    pump(&mut station, &sim, 60, 20_000);

    let sim_ref = sim.borrow();
    assert_eq!(sim_ref.tx_log.len(), 1, "downlink not transmitted");
    assert_eq!(sim_ref.tx_log[0].rf_power, 26);
}

#[test]
fn pdu_only_mode_base64_and_downlink_bytes() {
    let (mut station, sim, mut peer) = mk_station();
    let mut cfg = eu868_config();
    cfg["pdu_only"] = json!(true);
    cfg["pdu_encoding"] = json!("b64");
    /* filter that would block everything: must not apply in pdu mode */
    cfg["JoinEui"] = json!([["00-00-00-00-00-00-00-01", "00-00-00-00-00-00-00-02"]]);
    connect_and_configure(&mut station, &sim, &mut peer, cfg);

    sim.borrow_mut()
        .inject_rx(868_100_000, Rps::lora(7, Bw::BW125), &JREQ_PHY, -91.0, 8.0);
    pump(&mut station, &sim, 2, 1000);
    let msgs = json_msgs(&mut peer);
    let updf = msgs.iter().find(|m| m["msgtype"] == "updf").expect("no pdu uplink");
    assert!(updf.get("MHdr").is_none(), "pdu-only must not parse fields");
    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(updf["pdu"].as_str().unwrap())
        .unwrap();
    assert_eq!(decoded, JREQ_PHY.to_vec());

    /* downlink: the LNS pdu bytes are exactly what reaches the radio */
    peer.send_json(&json!({
        "msgtype": "dnmsg",
        "DevEui": "00-11-22-33-44-55-66-77",
        "dC": 2,
        "diid": 5,
        "pdu": "60010203040506",
        "DR": 5,
        "Freq": 868_100_000u32
    }));
    pump(&mut station, &sim, 60, 20_000);
    let sim_ref = sim.borrow();
    assert_eq!(sim_ref.tx_log.len(), 1);
    assert_eq!(
        sim_ref.tx_log[0].payload(),
        &[0x60, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]
    );
}

#[test]
fn bad_router_config_terminates_session() {
    let (mut station, sim, mut peer) = mk_station();
    let cfg = json!({
        "msgtype": "router_config",
        "region": "XX999",
        "DRs": [[12,125,0]],
        "upchannels": [[868100000u32,0,0]]
    });
    connect_and_configure(&mut station, &sim, &mut peer, cfg);
    assert!(station.s2e.session_conf().is_none());

    /* asymmetric pair incomplete: also fatal for the session */
    peer.connect();
    pump(&mut station, &sim, 2, 1000);
    let mut cfg = eu868_config();
    cfg["DRs_up"] = json!([[12,125,0]]);
    peer.send_json(&cfg);
    pump(&mut station, &sim, 3, 1000);
    assert!(station.s2e.session_conf().is_none());
}

#[test]
fn malformed_messages_do_not_kill_session() {
    let (mut station, sim, mut peer) = mk_station();
    connect_and_configure(&mut station, &sim, &mut peer, eu868_config());
    assert!(station.s2e.session_conf().is_some());

    peer.to_station
        .send(TransportEvent::Text("{not json at all".into()))
        .unwrap();
    peer.send_json(&json!({"msgtype": "frobnicate", "x": 1}));
    pump(&mut station, &sim, 3, 1000);
    assert!(station.s2e.session_conf().is_some(), "session died on junk input");

    /* still forwards traffic */
    sim.borrow_mut()
        .inject_rx(868_100_000, Rps::lora(7, Bw::BW125), &JREQ_PHY, -91.0, 8.0);
    pump(&mut station, &sim, 2, 1000);
    assert!(json_msgs(&mut peer).iter().any(|m| m["msgtype"] == "jreq"));
}

#[test]
fn timesync_probe_is_sent() {
    let (mut station, sim, mut peer) = mk_station();
    connect_and_configure(&mut station, &sim, &mut peer, eu868_config());
    json_msgs(&mut peer); /* drain */
    pump(&mut station, &sim, 40, 1_000_000); /* > 30 s */
    let msgs = json_msgs(&mut peer);
    let ts = msgs.iter().find(|m| m["msgtype"] == "timesync").expect("no timesync probe");
    assert!(ts["txtime"].as_i64().unwrap() > 0);
}

#[test]
fn disconnect_cancels_pending_downlinks() {
    let (mut station, sim, mut peer) = mk_station();
    connect_and_configure(&mut station, &sim, &mut peer, eu868_config());

    /* learn a live xtime from an uplink, then schedule a class A
       downlink 5 s out and hang up before it fires */
    sim.borrow_mut()
        .inject_rx(868_100_000, Rps::lora(7, Bw::BW125), &JREQ_PHY, -91.0, 8.0);
    pump(&mut station, &sim, 2, 1000);
    let msgs = json_msgs(&mut peer);
    let jreq = msgs.iter().find(|m| m["msgtype"] == "jreq").expect("no jreq");
    let xtime = jreq["upinfo"]["xtime"].as_i64().unwrap();

    peer.send_json(&json!({
        "msgtype": "dnmsg",
        "DevEui": "00-11-22-33-44-55-66-77",
        "dC": 0,
        "diid": 9,
        "pdu": "60AA",
        "RxDelay": 5,
        "RX1DR": 5,
        "RX1Freq": 868_100_000u32,
        "xtime": xtime,
        "rctx": 0
    }));
    pump(&mut station, &sim, 2, 1000);
    peer.disconnect();
    pump(&mut station, &sim, 400, 20_000); /* sail past the RX1 window */
    assert_eq!(sim.borrow().tx_log.len(), 0, "downlink survived disconnect");
}
