//! Demo host: runs the telemetry agent against a simulated ECU.
//!
//! Drives the same cooperative super-loop a vehicle deployment would, but
//! with an in-process ECU serving a demo DID table and a scripted GPS fix,
//! so the whole pipeline can be watched from a desk.

use std::path::Path;
use std::time::Instant;

use clap::{App, Arg};
use colored::Colorize;

use evtel::agent::{GpsFix, TelemetryAgent};
use evtel::can::EcuAddress;
use evtel::config::{self, AgentConfig};
use evtel::sim::SimEcu;
use evtel::storage::{JsonLogger, LogSink};

const TICK_MS: u64 = 100;

const DEMO_CONFIG: &str = "\
[common]
save-json-log = on

[telemetry]
user-token = demo-token
send-interval = 1
; unit, tx id, request hex, rx id, start, end, length, bit, scale, offset
signal-soc = %, 7E4, 22 91 01, 7EC, 1, 0, 1, -1, 0.5, 0
signal-voltage = V, 7E4, 22 91 02, 7EC, 1, 2, 0, -1, 0.1, 0
signal-current = A, 7E4, 22 91 02, 7EC, 3, 4, 0, -1, 0.1, -3276.8
signal-batt_temp = C, 7E4, 22 91 04, 7EC, 1, 1, 1, -1, 1, -40
signal-soh = %, 7E4, 22 91 05, 7EC, 1, 1, 1, -1, 0.5, 0
signal-kwh_charged = kWh, 7E4, 22 91 10, 7EC, 11, 12, 0, -1, 0.01, 0
signal-odometer = km, 7E4, 22 F1 91, 7EC, 1, 3, 0, -1, 1, 0
";

/// Echoes every record to the terminal while forwarding it to the session
/// log, if one could be opened.
struct TeeSink {
    logger: Option<JsonLogger>,
}

impl LogSink for TeeSink {
    fn write_line(&mut self, line: &str) {
        println!("{line}");
        if let Some(logger) = self.logger.as_mut() {
            logger.write_line(line);
        }
    }

    fn flush(&mut self) {
        if let Some(logger) = self.logger.as_mut() {
            logger.flush();
        }
    }
}

fn demo_ecu() -> SimEcu {
    let addr = EcuAddress::standard(0x7E4, 0x7EC);
    let mut ecu = SimEcu::new();
    // 61.0 % SoC
    ecu.add_did(addr, 0x9101, &[0x7A]);
    // 350.0 V / -26.4 A: a healthy AC charge
    ecu.add_did(addr, 0x9102, &[0x0D, 0xAC, 0x7E, 0xF8]);
    // 20 degC pack temperature
    ecu.add_did(addr, 0x9104, &[0x3C]);
    // 97.0 % SoH
    ecu.add_did(addr, 0x9105, &[0xC2]);
    // 16-byte charge statistics blob, 12.34 kWh at bytes 11-12
    let mut stats = [0u8; 16];
    stats[10] = 0x04;
    stats[11] = 0xD2;
    ecu.add_did(addr, 0x9110, &stats);
    // 61890 km odometer
    ecu.add_did(addr, 0xF191, &[0x00, 0xF1, 0xC2]);
    ecu
}

fn main() {
    let matches = App::new("evtel-sim")
        .version("0.1.0")
        .about("EV telemetry agent demo against a simulated ECU")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("INI configuration file (defaults to a built-in demo profile)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("session")
                .short("s")
                .long("session")
                .value_name("ID")
                .help("Session id used to name the JSON log")
                .takes_value(true)
                .default_value("1"),
        )
        .arg(
            Arg::with_name("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .help("Directory for the JSON log")
                .takes_value(true)
                .default_value("."),
        )
        .arg(
            Arg::with_name("seconds")
                .short("n")
                .long("seconds")
                .value_name("N")
                .help("How long to run the super-loop")
                .takes_value(true)
                .default_value("10"),
        )
        .arg(
            Arg::with_name("check")
                .long("check")
                .help("Parse the configuration, dump it as JSON, and exit"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable frame-level debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config: AgentConfig = match matches.value_of("config") {
        Some(path) => match config::load_path(Path::new(path)) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{} {err}", "config error:".red().bold());
                std::process::exit(1);
            }
        },
        None => config::parse_str(DEMO_CONFIG),
    };

    if matches.is_present("check") {
        match serde_json::to_string_pretty(&config) {
            Ok(dump) => println!("{dump}"),
            Err(err) => eprintln!("{} {err}", "dump error:".red().bold()),
        }
        return;
    }

    let session: u32 = matches.value_of("session").unwrap_or("1").parse().unwrap_or(1);
    let seconds: u64 = matches.value_of("seconds").unwrap_or("10").parse().unwrap_or(10);
    let log_dir = Path::new(matches.value_of("log-dir").unwrap_or("."));

    println!("{}", "EV telemetry simulator".bold());
    println!("   signals configured: {}", config.signals.len());
    println!("   poll interval:      {}s", config.send_interval_sec.max(1));

    let logger = match JsonLogger::create(log_dir, session) {
        Ok(logger) => {
            println!("   json log:           {}", logger.path().display());
            Some(logger)
        }
        Err(err) => {
            eprintln!(
                "{} {err} (records print to stdout only)",
                "log open failed:".yellow().bold()
            );
            None
        }
    };

    let mut agent = TelemetryAgent::new(demo_ecu(), config);
    agent.set_storage_ready(TeeSink { logger });

    // Cruising fix: 10 kt over ground, heading east.
    let fix = GpsFix {
        lat: 52.0907,
        lng: 5.1214,
        speed: 10.0,
        heading: 90,
        alt: 12.0,
    };

    let start = Instant::now();
    while start.elapsed().as_secs() < seconds {
        let now_ms = start.elapsed().as_millis() as u32;
        agent.update_gps(Some(&fix));
        agent.update_utc();
        agent.poll_uds(now_ms);
        agent.log_json(now_ms);
        std::thread::sleep(std::time::Duration::from_millis(TICK_MS));
    }

    println!("{}", "done".green().bold());
}
