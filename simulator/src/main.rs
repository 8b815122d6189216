//! Replay synthetic TCP conversations through a DelayBox and report per-flow outcomes.

use clap::{value_parser, Arg, Command};
use delaybox::config::DelayBoxConfig;
use simulator::{simulate, Options};
use std::{process::ExitCode, time::Duration};
use tracing::{error, Level};

fn main() -> ExitCode {
    // Parse arguments
    let matches = Command::new("delaybox-simulator")
        .about("Replay synthetic TCP conversations through a DelayBox")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .required(true)
                .value_parser(value_parser!(String))
                .help("Path to a YAML file with DelayBox rules"),
        )
        .arg(
            Arg::new("flows")
                .long("flows")
                .default_value("10")
                .value_parser(value_parser!(usize))
                .help("Number of conversations (assigned to rules round-robin)"),
        )
        .arg(
            Arg::new("packets")
                .long("packets")
                .default_value("20")
                .value_parser(value_parser!(usize))
                .help("Segments sent by each side of a conversation"),
        )
        .arg(
            Arg::new("size")
                .long("size")
                .default_value("1460")
                .value_parser(value_parser!(usize))
                .help("Payload bytes per segment"),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .default_value("10")
                .value_parser(value_parser!(u64))
                .help("Milliseconds between segments from one side"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("0")
                .value_parser(value_parser!(u64))
                .help("Seed for the deterministic runtime"),
        )
        .arg(
            Arg::new("queue-packets")
                .long("queue-packets")
                .default_value("100")
                .value_parser(value_parser!(usize))
                .help("Transmit-queue limit of each device, in packets"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(String))
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .get_matches();

    // Create logger
    let level = matches
        .get_one::<String>("log-level")
        .unwrap()
        .parse::<Level>()
        .expect("Invalid log level");
    tracing_subscriber::fmt().with_max_level(level).init();

    // Load rules
    let path = matches.get_one::<String>("config").unwrap();
    let config = match DelayBoxConfig::from_file(path) {
        Ok(config) => config,
        Err(err) => {
            error!(?err, path, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    let options = Options {
        flows: *matches.get_one::<usize>("flows").unwrap(),
        packets: *matches.get_one::<usize>("packets").unwrap(),
        size: *matches.get_one::<usize>("size").unwrap(),
        interval: Duration::from_millis(*matches.get_one::<u64>("interval-ms").unwrap()),
        seed: *matches.get_one::<u64>("seed").unwrap(),
        queue_packets: *matches.get_one::<usize>("queue-packets").unwrap(),
    };

    // Run simulation
    let report = match simulate(&config, &options) {
        Ok(report) => report,
        Err(err) => {
            error!(?err, "simulation aborted");
            return ExitCode::FAILURE;
        }
    };
    for direction in &report.directions {
        println!("{direction}");
    }
    println!(
        "elapsed={:?} queue_stops={}",
        report.elapsed, report.stops
    );
    println!();
    print!("{}", report.metrics);
    ExitCode::SUCCESS
}
