use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lora_station::conf;
use lora_station::hal::sim::SimHal;
use lora_station::station::Station;
use lora_station::transport::StdioTransport;

static TERM: AtomicBool = AtomicBool::new(false);
static HUP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_sig: libc::c_int) {
    TERM.store(true, Ordering::Relaxed);
}

extern "C" fn on_hup(_sig: libc::c_int) {
    HUP.store(true, Ordering::Relaxed);
}

struct Args {
    home: PathBuf,
    slave_idx: Option<u32>,
    log_level: Option<String>,
}

fn usage() -> ! {
    eprintln!(
        "usage: station [OPTIONS]\n\
         \n\
         -h, --home DIR       directory holding station.conf (default .)\n\
         -s, --slave N        load slave-N.conf overrides\n\
         -l, --log-level LVL  trace|debug|info|warn|error\n\
         -v, --version        print version and exit\n\
         \n\
         The LNS session is spoken over stdin/stdout, one JSON message\n\
         per line. The radio side runs against the built-in concentrator\n\
         simulation."
    );
    exit(1)
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        home: PathBuf::from("."),
        slave_idx: None,
        log_level: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match a.as_str() {
            "-h" | "--home" => {
                args.home = it.next().ok_or_else(|| anyhow!("--home needs a value"))?.into()
            }
            "-s" | "--slave" => {
                args.slave_idx = Some(
                    it.next()
                        .ok_or_else(|| anyhow!("--slave needs a value"))?
                        .parse()?,
                )
            }
            "-l" | "--log-level" => {
                args.log_level = Some(it.next().ok_or_else(|| anyhow!("--log-level needs a value"))?)
            }
            "-v" | "--version" => {
                println!("station {}", env!("CARGO_PKG_VERSION"));
                exit(0)
            }
            _ => usage(),
        }
    }
    Ok(args)
}

fn main() {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}", e);
            usage()
        }
    };

    let conf = match conf::load(&args.home, args.slave_idx) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            exit(1)
        }
    };

    let level = args.log_level.as_deref().unwrap_or(&conf.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    unsafe {
        let term = on_term as extern "C" fn(libc::c_int) as libc::sighandler_t;
        let hup = on_hup as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGTERM, term);
        libc::signal(libc::SIGINT, term);
        libc::signal(libc::SIGHUP, hup);
    }

    info!(
        "station {} starting (home={}, slave={:?})",
        env!("CARGO_PKG_VERSION"),
        args.home.display(),
        args.slave_idx
    );
    if let Some(uri) = &conf.tc_uri {
        info!("LNS endpoint (handled by the transport runner): {}", uri);
    }

    /* This build drives the concentrator simulation; hardware backends
       plug in behind the same HAL trait. */
    let (hal, _sim) = SimHal::new();
    let transport = StdioTransport::new();
    let mut station = Station::new(&conf, Box::new(hal), Box::new(transport));

    /* SIGHUP: the log sink goes to stderr, rotation is the supervisor's
       concern; acknowledge so logrotate is not left hanging */
    std::thread::spawn(|| loop {
        if HUP.swap(false, Ordering::Relaxed) {
            warn!("SIGHUP received - log sink re-opened");
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
    });

    match station.run(&TERM) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("fatal: {:#}", e);
            exit(2)
        }
    }
}
