use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

use anyhow::{anyhow, Result};

/* The LNS link as the core sees it: a bidirectional message stream with
   connect/disconnect edges. The actual WebSocket/TLS machinery lives
   outside and feeds this interface; tests feed it directly. */

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Text(String),
    Binary(Vec<u8>),
}

pub trait Transport {
    fn poll(&mut self) -> Option<TransportEvent>;
    fn send_text(&mut self, msg: &str) -> Result<()>;
    fn send_binary(&mut self, data: &[u8]) -> Result<()>;
}

/* In-process transport: one end goes to the station, the peer end
   plays LNS. */
pub struct ChannelTransport {
    events: Receiver<TransportEvent>,
    out: Sender<TransportEvent>,
    connected: bool,
}

pub struct ChannelPeer {
    pub to_station: Sender<TransportEvent>,
    from_station: Receiver<TransportEvent>,
    drained: VecDeque<TransportEvent>,
}

pub fn channel_pair() -> (ChannelTransport, ChannelPeer) {
    let (tx_in, rx_in) = channel();
    let (tx_out, rx_out) = channel();
    (
        ChannelTransport {
            events: rx_in,
            out: tx_out,
            connected: false,
        },
        ChannelPeer {
            to_station: tx_in,
            from_station: rx_out,
            drained: VecDeque::new(),
        },
    )
}

impl Transport for ChannelTransport {
    fn poll(&mut self) -> Option<TransportEvent> {
        match self.events.try_recv() {
            Ok(ev) => {
                match ev {
                    TransportEvent::Connected => self.connected = true,
                    TransportEvent::Disconnected => self.connected = false,
                    _ => {}
                }
                Some(ev)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                if self.connected {
                    self.connected = false;
                    Some(TransportEvent::Disconnected)
                } else {
                    None
                }
            }
        }
    }

    fn send_text(&mut self, msg: &str) -> Result<()> {
        if !self.connected {
            return Err(anyhow!("transport not connected"));
        }
        self.out
            .send(TransportEvent::Text(msg.to_owned()))
            .map_err(|_| anyhow!("peer gone"))
    }

    fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(anyhow!("transport not connected"));
        }
        self.out
            .send(TransportEvent::Binary(data.to_vec()))
            .map_err(|_| anyhow!("peer gone"))
    }
}

impl ChannelPeer {
    pub fn connect(&self) {
        let _ = self.to_station.send(TransportEvent::Connected);
    }

    pub fn disconnect(&self) {
        let _ = self.to_station.send(TransportEvent::Disconnected);
    }

    pub fn send_json(&self, v: &serde_json::Value) {
        let _ = self.to_station.send(TransportEvent::Text(v.to_string()));
    }

    pub fn recv_all(&mut self) -> Vec<TransportEvent> {
        while let Ok(ev) = self.from_station.try_recv() {
            self.drained.push_back(ev);
        }
        self.drained.drain(..).collect()
    }
}

/* Line-oriented transport over stdin/stdout, the shape the regression
   harnesses speak: one JSON message per line, binary frames as
   "b64:<payload>" lines. */
pub struct StdioTransport {
    lines: Receiver<Option<String>>,
    connected: bool,
    sent_connect: bool,
}

impl StdioTransport {
    pub fn new() -> StdioTransport {
        let (tx, rx) = channel();
        std::thread::spawn(move || {
            use std::io::BufRead;
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(l) => {
                        if tx.send(Some(l)).is_err() {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = tx.send(None); /* EOF = disconnect */
        });
        StdioTransport {
            lines: rx,
            connected: false,
            sent_connect: false,
        }
    }
}

impl Transport for StdioTransport {
    fn poll(&mut self) -> Option<TransportEvent> {
        if !self.sent_connect {
            self.sent_connect = true;
            self.connected = true;
            return Some(TransportEvent::Connected);
        }
        match self.lines.try_recv() {
            Ok(Some(line)) => {
                if let Some(b64) = line.strip_prefix("b64:") {
                    use base64::Engine;
                    match base64::engine::general_purpose::STANDARD.decode(b64.trim()) {
                        Ok(data) => Some(TransportEvent::Binary(data)),
                        Err(_) => None,
                    }
                } else if line.trim().is_empty() {
                    None
                } else {
                    Some(TransportEvent::Text(line))
                }
            }
            Ok(None) => {
                if self.connected {
                    self.connected = false;
                    Some(TransportEvent::Disconnected)
                } else {
                    None
                }
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }

    fn send_text(&mut self, msg: &str) -> Result<()> {
        use std::io::Write;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", msg)?;
        out.flush()?;
        Ok(())
    }

    fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        use base64::Engine;
        self.send_text(&format!(
            "b64:{}",
            base64::engine::general_purpose::STANDARD.encode(data)
        ))
    }
}
