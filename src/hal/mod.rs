pub mod sim;

use crate::rps::Bw;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/* Contract between the station and a SX130x-family concentrator library.
   The station never touches registers; everything below the trait is the
   vendor HAL's business (SPI/USB transport, AGC/ARB firmware, calibration). */

/* radio-specific parameters */
pub const LGW_RF_CHAIN_NB: usize = 2; /* number of RF chains */

/* concentrator chipset-specific parameters */
pub const LGW_IF_CHAIN_NB: usize = 10; /* number of IF+modem RX chains */
pub const LGW_MULTI_NB: usize = 8;     /* number of LoRa 'multi SF' chains */

/* IF chain slots: 0..7 multi-SF LoRa, 8 fast LoRa (250/500 kHz), 9 FSK */
pub const IF_CHAIN_FAST_LORA: usize = LGW_IF_CHAIN_NB - 2;
pub const IF_CHAIN_FSK: usize = LGW_IF_CHAIN_NB - 1;

/* half bandwidth of the RF front-end; IF offsets must stay inside */
pub const LGW_RFE_MAX_HZ: i32 = 400_000;

pub const DR_UNDEFINED: u32 = 0;
pub const DR_FSK_STD: u32 = 50_000; /* FSK datarate in bps */

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Modulation {
    UNDEFINED = 0,
    LORA = 0x10,
    FSK = 0x20,
}

impl std::fmt::Display for Modulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modulation::UNDEFINED => write!(f, "Undefined"),
            Modulation::LORA => write!(f, "LoRa"),
            Modulation::FSK => write!(f, "FSK"),
        }
    }
}

/* status code for TX_STATUS */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxStatus {
    Unknown = 0,
    Off = 1,       /* TX modem disabled, it will ignore commands */
    Free = 2,      /* TX modem is free, ready to receive a command */
    Scheduled = 3, /* TX modem is loaded, ready to send the packet after an event and/or delay */
    Emitting = 4,  /* TX modem is emitting */
}

/* values available for the 'tx_mode' parameter */
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum TxMode {
    Immediate = 0,
    Timestamped = 1,
    OnGps = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LgwConfRxrf {
    pub enable: bool, /* enable or disable that RF chain */
    #[serde(rename = "freq")]
    pub freq_hz: u32, /* center frequency of the radio in Hz */
    #[serde(default)]
    pub rssi_offset: f32, /* Board-specific RSSI correction factor */
    #[serde(default)]
    pub tx_enable: bool, /* enable or disable TX on that RF chain */
}

impl Default for LgwConfRxrf {
    fn default() -> Self {
        Self {
            enable: false,
            freq_hz: 0,
            rssi_offset: 0.0,
            tx_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LgwConfRxIf {
    pub enable: bool, /* enable or disable that IF chain */
    #[serde(rename = "radio")]
    pub rf_chain: u8, /* to which RF chain is that IF chain associated */
    #[serde(rename = "if")]
    pub freq_hz: i32, /* center freq of the IF chain, relative to RF chain frequency */
    #[serde(default)]
    pub bandwidth: Option<Bw>, /* RX bandwidth, None for default */
    #[serde(default)]
    pub datarate: u32, /* RX datarate, 0 for default (SF for LoRa, bps for FSK) */
}

impl Default for LgwConfRxIf {
    fn default() -> Self {
        Self {
            enable: false,
            rf_chain: 0,
            freq_hz: 0,
            bandwidth: None,
            datarate: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LgwConfBoard {
    pub lorawan_public: bool, /* Enable ONLY for *public* networks using the LoRa MAC protocol */
    pub clksrc: u8,           /* Index of RF chain which provides clock to concentrator */
    #[serde(default)]
    pub full_duplex: bool, /* Indicates if the gateway operates in full duplex mode or not */
    #[serde(default)]
    pub device: String, /* Path to access the COM device to connect to the concentrator */
}

impl Default for LgwConfBoard {
    fn default() -> Self {
        Self {
            lorawan_public: true,
            clksrc: 0,
            full_duplex: false,
            device: String::new(),
        }
    }
}

/* Complete RX/TX setup handed to the HAL in one shot. Assembled by the
   channel allocator from the LNS channel plan plus station.conf radio
   settings. */
#[derive(Debug, Clone, Default)]
pub struct LgwConfig {
    pub board: LgwConfBoard,
    pub rf_chain: [LgwConfRxrf; LGW_RF_CHAIN_NB],
    pub if_chain: [LgwConfRxIf; LGW_IF_CHAIN_NB],
    pub txpow_adjust: f64, /* board TX power correction, dB */
}

#[derive(Debug, Clone)]
pub struct LgwPktRx {
    pub freq_hz: u32,  /* central frequency of the IF chain */
    pub if_chain: u8,  /* by which IF chain was packet received */
    pub count_us: u32, /* internal concentrator counter for timestamping, 1 microsecond resolution */
    pub rf_chain: u8,  /* through which RF chain the packet was received */
    pub modulation: Modulation,
    pub bandwidth: Bw,
    pub datarate: u32, /* RX datarate of the packet (SF for LoRa) */
    pub rssi: f32,     /* average RSSI of the signal in dB */
    pub snr: f32,      /* average packet SNR, in dB (LoRa only) */
    pub crc_ok: bool,
    pub size: u16, /* payload size in bytes */
    pub payload: [u8; 256],
    pub ftime_received: bool, /* a fine timestamp has been received */
    pub ftime: u32,           /* packet fine timestamp (nanoseconds since last PPS) */
}

impl LgwPktRx {
    pub fn new() -> Self {
        Self {
            freq_hz: 0,
            if_chain: 0,
            count_us: 0,
            rf_chain: 0,
            modulation: Modulation::UNDEFINED,
            bandwidth: Bw::BW125,
            datarate: 0,
            rssi: 0.0,
            snr: 0.0,
            crc_ok: true,
            size: 0,
            payload: [0; 256],
            ftime_received: false,
            ftime: 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.size as usize]
    }
}

impl Default for LgwPktRx {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LgwPktTx {
    pub freq_hz: u32,    /* center frequency of TX */
    pub tx_mode: TxMode, /* select on what event/time the TX is triggered */
    pub count_us: u32,   /* timestamp or delay in microseconds for TX trigger */
    pub rf_chain: u8,    /* through which RF chain will the packet be sent */
    pub rf_power: i8,    /* TX power, in dBm */
    pub modulation: Modulation,
    pub bandwidth: Bw,
    pub datarate: u32,    /* TX datarate (baudrate for FSK, SF for LoRa) */
    pub invert_pol: bool, /* invert signal polarity, for orthogonal downlinks (LoRa only) */
    pub preamble: u16,    /* set the preamble length, 0 for default */
    pub no_crc: bool,     /* if true, do not send a CRC in the packet */
    pub no_header: bool,  /* if true, enable implicit header mode (LoRa), fixed length (FSK) */
    pub size: u16,
    pub payload: [u8; 256],
}

impl Default for LgwPktTx {
    fn default() -> Self {
        Self {
            freq_hz: 0,
            tx_mode: TxMode::Immediate,
            count_us: 0,
            rf_chain: 0,
            rf_power: 0,
            modulation: Modulation::UNDEFINED,
            bandwidth: Bw::BW125,
            datarate: DR_UNDEFINED,
            invert_pol: true,
            preamble: 0,
            no_crc: true, /* LoRaWAN downlinks carry no payload CRC */
            no_header: false,
            size: 0,
            payload: [0; 256],
        }
    }
}

impl LgwPktTx {
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.size as usize]
    }

    pub fn set_payload(&mut self, data: &[u8]) {
        let n = data.len().min(self.payload.len());
        self.payload[..n].copy_from_slice(&data[..n]);
        self.size = n as u16;
    }
}

pub trait LgwHal {
    fn lgw_start(&mut self, conf: &LgwConfig) -> Result<()>;
    fn lgw_stop(&mut self) -> Result<()>;
    fn lgw_receive(&mut self) -> Result<Vec<LgwPktRx>>;
    fn lgw_send(&mut self, pkt: &LgwPktTx) -> Result<()>;
    fn lgw_tx_status(&mut self, rf_chain: u8) -> Result<TxStatus>;
    fn lgw_abort_tx(&mut self, rf_chain: u8) -> Result<()>;
    /* free-running microsecond counter */
    fn lgw_get_instcnt(&mut self) -> Result<u32>;
    /* counter latched at the last PPS edge */
    fn lgw_get_trigcnt(&mut self) -> Result<u32>;
    fn lgw_gps_enable(&mut self, enable: bool) -> Result<()>;
    /* carrier sense: mean RSSI over scan_time_us at freq, dBm */
    fn lgw_rssi_scan(&mut self, freq_hz: u32, bw: Bw, scan_time_us: u32) -> Result<f32>;
    /* identifies one power-on of the concentrator; changes when a slave
       process restarts underneath the station */
    fn lgw_session_id(&mut self) -> Result<u16>;
}
