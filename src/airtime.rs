use crate::rps::{Bw, Rps};
use anyhow::{anyhow, Result};
use tracing::trace;

/* LoRa time-on-air, closed form per the SX126x/SX130x datasheets.
   Feeds the duty-cycle ledger and TX admission, so it must stay in
   microseconds end to end. */

pub const LORAWAN_PREAMBLE_SYMBOLS: u16 = 8;
const CR_4_5: u8 = 1;

pub fn symbol_time_us(rps: Rps) -> u32 {
    /* 2^SF / BW, in microseconds */
    ((1u32 << rps.sf()) * 1_000_000) / rps.bw().hz()
}

/* Low data rate optimization kicks in when a symbol exceeds 16 ms
   (SF11/SF12 at 125 kHz). */
fn low_datarate_optimize(rps: Rps) -> bool {
    symbol_time_us(rps) >= 16_000
}

pub fn lora_airtime_us(
    rps: Rps,
    n_symbol_preamble: u16,
    no_header: bool,
    no_crc: bool,
    size: u8,
) -> Result<u32> {
    if !rps.is_lora() {
        return Err(anyhow!("airtime requires a LoRa rps, got {}", rps));
    }
    let sf = rps.sf() as u32;
    let bw_pow: u32 = match rps.bw() {
        Bw::BW125 => 1,
        Bw::BW250 => 2,
        Bw::BW500 => 4,
    };

    /* Duration of 1 symbol */
    let t_symbol_us = (1u32 << sf) * 8 / bw_pow; /* 2^SF / BW , in microseconds */

    let h: u32 = if !no_header { 1 } else { 0 };
    let de: u32 = if low_datarate_optimize(rps) { 1 } else { 0 };
    let n_bit_crc: u32 = if !no_crc { 16 } else { 0 };

    /* Number of symbols in the payload */
    let num = 8 * size as i32 + n_bit_crc as i32 - 4 * sf as i32
        + if sf >= 7 { 8 } else { 0 }
        + 20 * h as i32;
    let den = (4 * (sf - 2 * de)) as f64;
    let n_symbol_payload =
        ((num as f64).max(0.0) / den).ceil() as u32 * (CR_4_5 as u32 + 4);

    /* number of symbols in packet */
    let n_symbol = n_symbol_preamble as f64
        + if sf >= 7 { 4.25 } else { 6.25 }
        + 8.0
        + n_symbol_payload as f64;

    let toa_us = (n_symbol * t_symbol_us as f64) as u32;

    trace!(
        "LoRa packet ToA: {} us (n_symbol:{}, t_symbol_us:{})",
        toa_us,
        n_symbol,
        t_symbol_us
    );
    Ok(toa_us)
}

/* Airtime of a standard LoRaWAN frame: 8 preamble symbols, explicit
   header, CRC on uplink-style frames. */
pub fn frame_airtime_us(rps: Rps, size: u8) -> Result<u32> {
    if rps.is_fsk() {
        /* FSK at 50 kbps: preamble(5) + syncword(3) + len(1) + payload + crc(2) */
        let bits = (5 + 3 + 1 + size as u32 + 2) * 8;
        return Ok(bits * 1_000_000 / 50_000);
    }
    lora_airtime_us(rps, LORAWAN_PREAMBLE_SYMBOLS, false, false, size)
}
