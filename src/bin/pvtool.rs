use std::{process::ExitCode, time::Duration};

use clap::{Parser, Subcommand};
use pvtable::{
    PvError, PvTable, PvTableBuilder, Reading,
    pvdata::{PvField, PvStructure, ScalarValue, nt_enum, nt_scalar, nt_scalar_array},
    transports::MemoryTransport,
};
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

/// Serve PVs from memory and drive them through a PV table
#[derive(Parser)]
struct Options {
    /// Host a PV. A number gives a double, `1,2,3` an array, `Off|On` an enum, and
    /// anything else a string.
    #[clap(long = "pv", value_name = "NAME=VALUE", value_parser = parse_hosted)]
    pvs: Vec<(String, String)>,
    /// Seconds to wait for channels and replies
    #[clap(long, default_value_t = 2.0)]
    timeout: f32,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read PVs, all hosted PVs if none are named
    Get {
        names: Vec<String>,
        /// Number of readings to take
        #[clap(short, long, default_value_t = 1)]
        count: usize,
    },
    /// Write a value, then read it back
    Put { name: String, value: String },
    /// Watch PVs while the hosted numeric values ramp
    Monitor {
        names: Vec<String>,
        /// Number of polls before stopping
        #[clap(short, long, default_value_t = 10)]
        events: usize,
        /// Milliseconds between ramp steps
        #[clap(long, default_value_t = 200)]
        period: u64,
    },
    /// Show what is known about PVs
    Info { names: Vec<String> },
}

fn parse_hosted(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{arg}'")),
    }
}

fn hosted_value(text: &str) -> PvStructure {
    if text.contains('|') {
        let choices: Vec<&str> = text.split('|').collect();
        return nt_enum(0, &choices);
    }
    if text.contains(',') {
        let parts: Vec<&str> = text.split(',').map(str::trim).collect();
        return match parts
            .iter()
            .map(|p| p.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
        {
            Ok(numbers) => nt_scalar_array(numbers),
            Err(_) => nt_scalar_array(
                parts
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<String>>(),
            ),
        };
    }
    match text.parse::<f64>() {
        Ok(number) => nt_scalar(number),
        Err(_) => nt_scalar(text),
    }
}

fn reading_from_arg(text: &str) -> Reading {
    if text.contains(',') {
        Reading::text(text.split(',').map(|p| p.trim().to_string()).collect())
    } else {
        text.into()
    }
}

fn print_entry(table: &PvTable<MemoryTransport>, index: usize, reading: Option<&Reading>) {
    let Ok(entry) = table.entry(index) else {
        return;
    };
    match reading {
        Some(reading) if table.units(index).is_empty() => println!("{} {reading}", entry.name()),
        Some(reading) => println!("{} {reading} {}", entry.name(), table.units(index)),
        None => println!("{} <not connected>", entry.name()),
    }
}

/// Step every hosted double by one, forever
async fn ramp(transport: MemoryTransport, names: Vec<String>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        for name in &names {
            let Some(PvField::Scalar(ScalarValue::Double(v))) =
                transport.value(name).and_then(|s| s.get_path("value").cloned())
            else {
                continue;
            };
            if let Err(e) = transport.set_value(name, ScalarValue::Double(v + 1.0)) {
                warn!("Could not ramp {name}: {e}");
            }
        }
    }
}

async fn run(opts: Options) -> Result<(), PvError> {
    let mut transport = MemoryTransport::new();
    for (name, value) in &opts.pvs {
        if let Err(e) = transport.add_pv(name, hosted_value(value)) {
            warn!("{e}");
        }
    }
    let timeout = Duration::from_secs_f32(opts.timeout.max(0.1));
    let mut table = PvTableBuilder::new()
        .connect_timeout(timeout)
        .io_timeout(timeout)
        .build(transport.clone());
    let hosted: Vec<String> = opts.pvs.iter().map(|(n, _)| n.clone()).collect();
    let or_hosted = |names: &Vec<String>| {
        if names.is_empty() {
            hosted.clone()
        } else {
            names.clone()
        }
    };

    match &opts.command {
        Command::Get { names, count } => {
            table.add_names(or_hosted(names))?;
            let report = table.connect().await;
            debug!("Connected {} entries", report.connected);
            for _ in 0..*count {
                table.get().await?;
            }
            for index in 0..table.len() {
                let entry = table.entry(index)?;
                if entry.history().is_empty() {
                    print_entry(&table, index, None);
                }
                for reading in entry.history() {
                    print_entry(&table, index, Some(reading));
                }
            }
        }
        Command::Put { name, value } => {
            let index = table.add_name(name)?;
            table.connect().await;
            table.stage_put(index, reading_from_arg(value))?;
            table.put().await?;
            table.get().await?;
            print_entry(&table, index, table.entry(index)?.latest());
        }
        Command::Monitor {
            names,
            events,
            period,
        } => {
            table.add_names(or_hosted(names))?;
            table.connect().await;
            let started = table.start_monitor()?;
            info!("Monitoring {started} PVs");
            let period = Duration::from_millis(*period);
            let ramping = tokio::spawn(ramp(transport.clone(), hosted.clone(), period));
            for _ in 0..*events {
                tokio::time::sleep(period).await;
                if table.poll()? == 0 {
                    continue;
                }
                for (index, reading) in table.monitor_readings().into_iter().enumerate() {
                    print_entry(&table, index, reading);
                }
            }
            ramping.abort();
            table.stop_monitor();
        }
        Command::Info { names } => {
            table.add_names(or_hosted(names))?;
            table.connect().await;
            table.get().await?;
            for index in 0..table.len() {
                print!("{}", table.info(index));
            }
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    let filter = EnvFilter::default()
        .add_directive(
            match opts.verbose {
                0 => LevelFilter::INFO,
                1 => LevelFilter::DEBUG,
                2.. => LevelFilter::TRACE,
            }
            .into(),
        )
        .add_directive("tokio=off".parse().unwrap());
    tracing_subscriber::fmt()
        .with_level(true)
        .with_env_filter(filter)
        .init();

    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            for error in e.errors() {
                eprintln!("Error: {error}");
            }
            ExitCode::FAILURE
        }
    }
}
