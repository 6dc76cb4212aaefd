use tracing::debug;

/* LoRaWAN PHY header parsing. Only the framing the LNS protocol needs:
   MAC semantics (counters, keys, join handling) stay on the server. */

pub const MHDR_FTYPE: u8 = 0xE0;
pub const MHDR_RFU: u8 = 0x1C;
pub const MHDR_MAJOR: u8 = 0x03;
pub const MAJOR_V1: u8 = 0x00;

pub const FRMTYPE_JREQ: u8 = 0x00;
pub const FRMTYPE_JACC: u8 = 0x20;
pub const FRMTYPE_DAUP: u8 = 0x40; /* data (unconfirmed) up */
pub const FRMTYPE_DADN: u8 = 0x60; /* data (unconfirmed) dn */
pub const FRMTYPE_DCUP: u8 = 0x80; /* data confirmed up */
pub const FRMTYPE_DCDN: u8 = 0xA0; /* data confirmed dn */
pub const FRMTYPE_REJN: u8 = 0xC0; /* rejoin for roaming */
pub const FRMTYPE_PROP: u8 = 0xE0;

/* little endian readers - LoRaWAN integer fields are LSB first */
pub fn rlsbf2(b: &[u8]) -> u16 {
    b[0] as u16 | (b[1] as u16) << 8
}

pub fn rlsbf4(b: &[u8]) -> u32 {
    b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16 | (b[3] as u32) << 24
}

pub fn rlsbf8(b: &[u8]) -> u64 {
    rlsbf4(b) as u64 | (rlsbf4(&b[4..]) as u64) << 32
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Jreq {
        mhdr: u8,
        joineui: u64,
        deveui: u64,
        devnonce: u16,
        mic: i32,
    },
    /* rejoin subtypes are not parsed; the raw PDU travels to the LNS */
    Rejoin {
        mhdr: u8,
        mic: i32,
    },
    Updf {
        mhdr: u8,
        devaddr: u32,
        fctrl: u8,
        fcnt: u16,
        fopts: Vec<u8>,
        fport: i32, /* -1 when absent */
        payload: Vec<u8>,
        mic: i32,
    },
    /* entire PHYPayload forwarded as-is */
    Propdf,
}

/* Returns None for frames that are not for us (downlink types, bad
   major version, length violations). Dropping is not an error - the
   air is full of other people's traffic. */
pub fn parse_uplink(frame: &[u8]) -> Option<Frame> {
    if frame.is_empty() {
        return None;
    }
    let mhdr = frame[0];
    let ftype = mhdr & MHDR_FTYPE;

    if ftype == FRMTYPE_PROP {
        return Some(Frame::Propdf);
    }
    if (mhdr & (MHDR_RFU | MHDR_MAJOR)) != MAJOR_V1 {
        debug!("Dropped frame with unsupported major version: MHdr=0x{:02X}", mhdr);
        return None;
    }
    match ftype {
        FRMTYPE_JACC | FRMTYPE_DADN | FRMTYPE_DCDN => {
            /* downlink traffic mirrored back by the antenna */
            None
        }
        FRMTYPE_JREQ => {
            /* MHDR(1) + JoinEUI(8) + DevEUI(8) + DevNonce(2) + MIC(4) */
            if frame.len() != 23 {
                debug!("Dropped join request with bad length: {}", frame.len());
                return None;
            }
            Some(Frame::Jreq {
                mhdr,
                joineui: rlsbf8(&frame[1..]),
                deveui: rlsbf8(&frame[9..]),
                devnonce: rlsbf2(&frame[17..]),
                mic: rlsbf4(&frame[frame.len() - 4..]) as i32,
            })
        }
        FRMTYPE_REJN => {
            /* type 0/2: 19 bytes, type 1: 24 bytes - anything in between
               is tolerated, beyond is garbage */
            if !(19..=24).contains(&frame.len()) {
                debug!("Dropped rejoin request with bad length: {}", frame.len());
                return None;
            }
            Some(Frame::Rejoin {
                mhdr,
                mic: rlsbf4(&frame[frame.len() - 4..]) as i32,
            })
        }
        FRMTYPE_DAUP | FRMTYPE_DCUP => {
            /* MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + FOpts(0..15)
               + [FPort(1) + FRMPayload] + MIC(4) */
            if frame.len() < 12 {
                debug!("Dropped data frame with bad length: {}", frame.len());
                return None;
            }
            let fctrl = frame[5];
            let foptslen = (fctrl & 0x0F) as usize;
            if frame.len() < 8 + foptslen + 4 {
                debug!("Dropped data frame: FOpts spill over MIC");
                return None;
            }
            let portoff = 8 + foptslen;
            let micoff = frame.len() - 4;
            let (fport, payload) = if portoff < micoff {
                (
                    frame[portoff] as i32,
                    frame[portoff + 1..micoff].to_vec(),
                )
            } else {
                (-1, Vec::new())
            };
            Some(Frame::Updf {
                mhdr,
                devaddr: rlsbf4(&frame[1..]),
                fctrl,
                fcnt: rlsbf2(&frame[6..]),
                fopts: frame[8..8 + foptslen].to_vec(),
                fport,
                payload,
                mic: rlsbf4(&frame[micoff..]) as i32,
            })
        }
        _ => None,
    }
}
