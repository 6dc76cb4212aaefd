use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{error, info, warn};

use crate::conf::StationConf;
use crate::hal::LgwHal;
use crate::ral::Ral;
use crate::s2e::{S2e, Verdict};
use crate::transport::{Transport, TransportEvent};

/* The reactor. Single threaded and cooperative: one turn drains the
   transport, polls the radio, runs the TX pipeline and the PPS
   supervisor. Every callback runs to completion; nothing blocks. */

const IDLE_SLEEP: Duration = Duration::from_millis(2);
const MAX_EVENTS_PER_TURN: usize = 64;
const MAX_HAL_ERRORS: u32 = 10;

pub fn utc_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

pub fn ustime_us() -> i64 {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Idle,
    Busy,
    Fatal,
}

pub struct Station {
    pub s2e: S2e,
    pub ral: Ral,
    pub transport: Box<dyn Transport>,
    hal_errors: u32,
}

impl Station {
    pub fn new(conf: &StationConf, hal: Box<dyn LgwHal>, transport: Box<dyn Transport>) -> Station {
        let s2e = S2e::new(conf.ident.clone(), conf.radio.clone())
            .with_router_defaults(conf.router_defaults.clone());
        Station {
            s2e,
            ral: Ral::new(hal),
            transport,
            hal_errors: 0,
        }
    }

    pub fn step(&mut self, utc: i64) -> StepOutcome {
        let mut busy = false;

        for _ in 0..MAX_EVENTS_PER_TURN {
            let Some(ev) = self.transport.poll() else {
                break;
            };
            busy = true;
            let verdict = match ev {
                TransportEvent::Connected => {
                    if let Err(e) = self.s2e.on_connect(self.transport.as_mut()) {
                        warn!(e=%e, "failed to send version message");
                    }
                    Verdict::Continue
                }
                TransportEvent::Disconnected => {
                    self.s2e.on_disconnect();
                    Verdict::Continue
                }
                TransportEvent::Text(text) => {
                    self.s2e
                        .on_text(&text, &mut self.ral, self.transport.as_mut(), utc)
                }
                TransportEvent::Binary(data) => {
                    self.s2e
                        .on_binary(&data, &mut self.ral, self.transport.as_mut(), utc)
                }
            };
            match verdict {
                Verdict::Continue => {}
                Verdict::TerminateSession => self.s2e.on_disconnect(),
                Verdict::Fatal => return StepOutcome::Fatal,
            }
        }

        if self.ral.started() {
            match self.ral.rx_poll(utc) {
                Ok(jobs) => {
                    self.hal_errors = 0;
                    if !jobs.is_empty() {
                        busy = true;
                        self.s2e.on_rx_jobs(jobs, self.transport.as_mut(), utc);
                    }
                }
                Err(e) => {
                    self.hal_errors += 1;
                    error!(e=%e, "concentrator receive failed ({} in a row)", self.hal_errors);
                    if self.hal_errors >= MAX_HAL_ERRORS {
                        return StepOutcome::Fatal;
                    }
                }
            }

            match self.s2e.tick(&mut self.ral, self.transport.as_mut(), utc) {
                Ok(Verdict::Continue) => {}
                Ok(Verdict::TerminateSession) => self.s2e.on_disconnect(),
                Ok(Verdict::Fatal) => return StepOutcome::Fatal,
                Err(e) => {
                    warn!(e=%e, "reactor tick failed");
                }
            }
        }

        if busy {
            StepOutcome::Busy
        } else {
            StepOutcome::Idle
        }
    }

    /* Blocking loop for the binary; tests drive step() directly. */
    pub fn run(&mut self, term: &AtomicBool) -> Result<i32> {
        info!("station reactor running");
        loop {
            if term.load(Ordering::Relaxed) {
                info!("shutdown requested");
                self.shutdown();
                return Ok(0);
            }
            match self.step(utc_us()) {
                StepOutcome::Fatal => {
                    error!("unrecoverable radio/time fault - exiting for supervisor restart");
                    self.shutdown();
                    return Ok(2);
                }
                StepOutcome::Idle => std::thread::sleep(IDLE_SLEEP),
                StepOutcome::Busy => {}
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.s2e.on_disconnect();
        self.ral.stop();
    }
}
