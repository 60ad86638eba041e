//! extctl: external controller for the process simulator.
//!
//! Prompts for a test well (unless `--well` is given), then runs the
//! control loop until interrupted.
//!
//! # Usage
//!
//! ```sh
//! extctl --well 1
//! extctl --peer 127.0.0.1:65000 --port 65007 --deadline-ms 5000
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop the transport, which ends the loop

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;

use extctl::config::HarnessConfig;
use extctl::engine::{ControlLoop, ResetNotice, Snapshot, Telemetry};
use extctl::law::ProportionalChoke;
use extctl::net::{Endpoint, PeerLink, TransportError, UdpHandler};
use extctl::profile::{ProfileError, WellProfile};
use extctl::topology::{CpuConfig, pin_current_thread};

#[derive(Debug, thiserror::Error)]
enum HarnessError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error("no well selected: {0}")]
    Input(#[source] io::Error),
    #[error("failed to start transport: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

struct Options {
    config: HarnessConfig,
    well: Option<WellProfile>,
}

/// Prints snapshots in the block format operators watch for.
struct ConsoleTelemetry;

impl Telemetry for ConsoleTelemetry {
    fn on_snapshot(&mut self, s: &Snapshot) {
        println!("######################");
        println!("t    : {}", s.t_sim);
        println!("p_c  : {}", s.p_c);
        println!("p_c_r: {}", s.p_c_r);
    }

    fn on_reset(&mut self, n: &ResetNotice) {
        println!(
            "Over {:.1} seconds since last interaction. Initiating new control test (index 0).",
            n.waited.as_secs_f64()
        );
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("extctl: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), HarnessError> {
    let args: Vec<String> = std::env::args().collect();
    let Options { mut config, well } = parse_args(&args)?;

    extctl::init_tracing();

    let profile = match well {
        Some(p) => p,
        None => select_well()?,
    };
    println!("Selected well: {profile}");

    let placement = config.cpu.resolve();
    config.transport.rx_core = placement.rx_core;

    let handler = Arc::new(UdpHandler::new(config.transport.clone()));
    let inbound = handler.start()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        flag::register(*sig, Arc::clone(&shutdown)).map_err(HarnessError::Signal)?;
    }
    spawn_signal_watcher(Arc::clone(&shutdown), Arc::clone(&handler));

    if let Some(core) = placement.engine_core {
        pin_current_thread(core);
    }

    eprintln!(
        "extctl: listening on {} and sending to {} (Ctrl+C to stop)",
        config.transport.bind_addr, config.peer
    );

    let link = PeerLink::new(Arc::clone(&handler), config.peer);
    let mut control = ControlLoop::new(
        config.control,
        profile,
        ProportionalChoke::default(),
        link,
        inbound,
    )
    .with_telemetry(ConsoleTelemetry);
    let stats = control.run();

    handler.stop();
    eprintln!(
        "extctl: stopped after {} replies, {} resets, {} send failures",
        stats.replies, stats.resets, stats.send_failures
    );
    Ok(())
}

/// Stops the transport once a termination signal sets `shutdown`; the
/// control loop then sees its inbound channel disconnect.
fn spawn_signal_watcher(shutdown: Arc<AtomicBool>, handler: Arc<UdpHandler>) {
    thread::Builder::new()
        .name("signal-watch".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(100));
            }
            eprintln!("\nextctl: received shutdown signal");
            handler.stop();
        })
        .expect("failed to spawn signal watcher thread");
}

/// Interactive well selection.
fn select_well() -> Result<WellProfile, HarnessError> {
    println!("\n--- Select Test Well ---");
    for (i, p) in WellProfile::ALL.iter().enumerate() {
        println!("[{}] {p}", i + 1);
    }
    println!("------------------------");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("Enter number for test well: ");
        io::stdout().flush().map_err(HarnessError::Input)?;

        line.clear();
        let n = stdin.lock().read_line(&mut line).map_err(HarnessError::Input)?;
        if n == 0 {
            return Err(HarnessError::Input(io::ErrorKind::UnexpectedEof.into()));
        }
        match line.trim().parse::<usize>() {
            Ok(sel) => match WellProfile::from_selection(sel) {
                Ok(p) => return Ok(p),
                Err(e) => println!("{e}"),
            },
            Err(_) => println!("Invalid input. Please enter a number."),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, HarnessError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| HarnessError::Usage(format!("missing value for {flag}")))
}

fn invalid(flag: &str, v: &str, e: impl std::fmt::Display) -> HarnessError {
    HarnessError::Usage(format!("invalid value {v:?} for {flag}: {e}"))
}

fn parse_args(args: &[String]) -> Result<Options, HarnessError> {
    let mut config = HarnessConfig::default();
    let mut well = None;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--peer" | "-p" => {
                i += 1;
                let v = value(args, i, flag)?;
                config.peer = v.parse::<Endpoint>().map_err(|e| invalid(flag, v, e))?;
            }
            "--port" | "-l" => {
                i += 1;
                let v = value(args, i, flag)?;
                let port = v.parse::<u16>().map_err(|e| invalid(flag, v, e))?;
                config.transport.bind_addr = Endpoint::any(port);
            }
            "--well" | "-w" => {
                i += 1;
                well = Some(value(args, i, flag)?.parse::<WellProfile>()?);
            }
            "--deadline-ms" | "-d" => {
                i += 1;
                let v = value(args, i, flag)?;
                let ms = v.parse::<u64>().map_err(|e| invalid(flag, v, e))?;
                if ms == 0 {
                    return Err(invalid(flag, v, "must be > 0"));
                }
                config.control = config
                    .control
                    .with_reply_deadline(Duration::from_millis(ms));
            }
            "--snapshot-every" => {
                i += 1;
                let v = value(args, i, flag)?;
                let every = v.parse::<u64>().map_err(|e| invalid(flag, v, e))?;
                config.control = config.control.with_snapshot_every(every);
            }
            "--pin" => {
                i += 1;
                let v = value(args, i, flag)?;
                config.cpu = parse_pin(v).map_err(|e| invalid(flag, v, e))?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(HarnessError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok(Options { config, well })
}

/// `auto`, `off`, or `RX,ENGINE` core ids (either may be `-`).
fn parse_pin(v: &str) -> Result<CpuConfig, String> {
    match v {
        "auto" => Ok(CpuConfig::Auto),
        "off" => Ok(CpuConfig::Disabled),
        _ => {
            let (rx, engine) = v
                .split_once(',')
                .ok_or_else(|| "expected auto, off or RX,ENGINE".to_owned())?;
            let core = |s: &str| -> Result<Option<usize>, String> {
                match s.trim() {
                    "-" => Ok(None),
                    n => n.parse::<usize>().map(Some).map_err(|e| format!("{e}")),
                }
            };
            Ok(CpuConfig::Manual {
                rx_core: core(rx)?,
                engine_core: core(engine)?,
            })
        }
    }
}

fn print_usage() {
    eprintln!(
        r#"extctl - external controller for hardware-in-the-loop simulator tests

USAGE:
    extctl [OPTIONS]

OPTIONS:
    -p, --peer <ADDR>          Simulator IP:PORT, or PORT on localhost
                               (default: 127.0.0.1:65000)
    -l, --port <PORT>          Local port for measurements (default: 65007)
    -w, --well <WELL>          Test well: 1-3 or a name such as "BM01 Land"
                               (prompted for when omitted)
    -d, --deadline-ms <MS>     Reply deadline before a session reset (default: 5000)
        --snapshot-every <N>   Print a snapshot every N simulator steps, 0 = never
                               (default: 1000)
        --pin <auto|off|RX,ENGINE>
                               Pin the receive worker and control loop to cores
                               (default: off)
    -h, --help                 Print this help message

WELLS:
    [1] BM01 Land
    [2] BM02 Deepwater MPD
    [3] BM03 Deepwater CML

EXAMPLE:
    extctl --well 1
    extctl --well bm02 --peer 127.0.0.1:65000 --port 65007 --pin 0,1
"#
    );
}
