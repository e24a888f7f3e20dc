//! The machine binary: loads the cluster configuration, brings up one
//! machine of the grid, and runs until interrupted.

use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "meridian-server")]
struct Opt {
    /// Cluster configuration file (JSON)
    #[structopt(short = "c", long = "config")]
    config: std::path::PathBuf,

    /// Machine id to run
    #[structopt(short = "m", long = "machine")]
    machine: u32,

    /// Logging level
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbosity: u8,
}

fn main() {
    let opt = Opt::from_args();
    let machine = opt.machine;
    let level = match opt.verbosity {
    | 0 => log::LevelFilter::Warn,
    | 1 => log::LevelFilter::Info,
    | 2 => log::LevelFilter::Debug,
    | _ => log::LevelFilter::Trace,
    };

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}]: {}",
                machine,
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Off)
        .level_for("meridian", level)
        .level_for("meridian_server", level)
        .chain(std::io::stdout())
        .apply()
        .unwrap();

    let raw = std::fs::read_to_string(&opt.config)
        .expect("[STARTUP ERROR]: could not read configuration file");
    let config: meridian::Config = meridian::Config::from_json(&raw)
        .expect("[STARTUP ERROR]: could not parse configuration file");
    assert!(
        machine < config.num_machines(),
        "[STARTUP ERROR]: machine id {} out of range",
        machine,
    );

    let runtime = tokio::runtime::Runtime::new().expect("[STARTUP ERROR]: failed to start runtime");
    runtime.block_on(async move {
        let _handle = meridian::start(std::sync::Arc::new(config), meridian::MachineId(machine)).await;
        tokio::signal::ctrl_c().await.ok();
        log::info!("shutting down");
    });
}
