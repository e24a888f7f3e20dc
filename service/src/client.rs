//! The CLI client: submits transactions from JSON files, queries module
//! statistics, and flushes server metrics.
//!
//! Transaction files carry `write_set` and `read_set` arrays of keys, a
//! `code` array of `[procedure, args...]` lists, and optionally a
//! `new_master` region for remaster transactions.

use structopt::StructOpt;

use meridian::execution::parse_code;
use meridian::transaction::{KeyMode, Transaction};
use meridian::{ApiRequest, ApiResponse, ModuleId};

#[derive(StructOpt)]
#[structopt(name = "meridian-client")]
struct Opt {
    /// Hostname of the server to connect to
    #[structopt(long = "host", default_value = "localhost")]
    host: String,

    /// Client port of the server to connect to
    #[structopt(short = "p", long = "port", default_value = "2021")]
    port: u16,

    /// Logging level
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbosity: u8,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Send the transaction in the given JSON file
    #[structopt(name = "txn")]
    Txn {
        file: std::path::PathBuf,

        /// Send the transaction this many times
        #[structopt(long = "repeat", default_value = "1")]
        repeat: u64,

        /// Don't wait for replies
        #[structopt(long = "no-wait")]
        no_wait: bool,
    },

    /// Query a module's statistics
    #[structopt(name = "stats")]
    Stats {
        /// One of: server, forwarder, sequencer, orderer, scheduler
        module: String,
        level: Option<u32>,
    },

    /// Flush server metrics under the given prefix
    #[structopt(name = "metrics")]
    Metrics {
        prefix: Option<String>,
    },
}

fn main() {
    let opt = Opt::from_args();
    let level = match opt.verbosity {
    | 0 => log::LevelFilter::Warn,
    | 1 => log::LevelFilter::Info,
    | _ => log::LevelFilter::Debug,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}]: {}", record.level(), message))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .unwrap();

    let runtime = tokio::runtime::Runtime::new().expect("[INTERNAL ERROR]: failed to start runtime");
    std::process::exit(runtime.block_on(run(opt)));
}

async fn run(opt: Opt) -> i32 {
    let address = format!("{}:{}", opt.host, opt.port);
    log::info!("connecting to {}", address);
    let stream = tokio::net::TcpStream::connect(&address)
        .await
        .expect("[INTERNAL ERROR]: could not connect to server");
    let (mut rx, mut tx) = meridian::socket::split::<ApiResponse, ApiRequest>(stream);

    match opt.command {
    | Command::Txn { file, repeat, no_wait } => {
        let txn = match read_txn(&file) {
        | Ok(txn) => txn,
        | Err(error) => {
            log::error!("{}", error);
            return 1;
        }
        };
        for _ in 0..repeat {
            tx.send(&ApiRequest::Txn { txn: Box::new(txn.clone()) })
                .await
                .expect("[INTERNAL ERROR]: send failed");
        }
        if no_wait {
            return 0;
        }
        for _ in 0..repeat {
            match rx.recv().await {
            | Some(ApiResponse::Txn { txn }) => print_txn(&txn),
            | _ => panic!("[INTERNAL ERROR]: malformed response"),
            }
        }
        0
    }
    | Command::Stats { module, level } => {
        let module = match module.parse::<ModuleId>() {
        | Ok(module) => module,
        | Err(()) => {
            log::error!("invalid module: {}", module);
            return 1;
        }
        };
        tx.send(&ApiRequest::Stats { module, level: level.unwrap_or(0) })
            .await
            .expect("[INTERNAL ERROR]: send failed");
        match rx.recv().await {
        | Some(ApiResponse::Stats { json }) => {
            let value: serde_json::Value =
                serde_json::from_str(&json).expect("[INTERNAL ERROR]: malformed response");
            println!("{}", serde_json::to_string_pretty(&value).unwrap());
            0
        }
        | _ => panic!("[INTERNAL ERROR]: malformed response"),
        }
    }
    | Command::Metrics { prefix } => {
        let prefix = prefix.unwrap_or_else(|| ".".to_string());
        tx.send(&ApiRequest::Metrics { prefix })
            .await
            .expect("[INTERNAL ERROR]: send failed");
        match rx.recv().await {
        | Some(ApiResponse::Metrics) => {
            log::info!("metrics flushed");
            0
        }
        | _ => panic!("[INTERNAL ERROR]: malformed response"),
        }
    }
    }
}

/// Build a transaction from its JSON description.
fn read_txn(path: &std::path::Path) -> Result<Transaction, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("could not open {:?}: {}", path, e))?;
    let json: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| format!("could not parse {:?}: {}", path, e))?;

    let mut keys = Vec::new();
    for (field, mode) in [("write_set", KeyMode::Write), ("read_set", KeyMode::Read)] {
        if let Some(set) = json.get(field) {
            let set = set.as_array().ok_or_else(|| format!("{} must be an array", field))?;
            for key in set {
                let key = key.as_str().ok_or_else(|| format!("{} entries must be strings", field))?;
                keys.push((key.as_bytes().to_vec(), mode));
            }
        }
    }

    if let Some(new_master) = json.get("new_master") {
        let region = new_master.as_u64().ok_or("new_master must be a region id")? as u32;
        let keys = keys.into_iter().map(|(k, _)| k).collect();
        return Ok(Transaction::new_remaster(keys, region));
    }

    let mut code = Vec::new();
    if let Some(procs) = json.get("code") {
        let procs = procs.as_array().ok_or("code must be an array")?;
        for proc in procs {
            let proc = proc.as_array().ok_or("each procedure must be an array")?;
            let args: Vec<String> = proc
                .iter()
                .map(|a| a.as_str().map(str::to_string).ok_or("procedure arguments must be strings"))
                .collect::<Result<_, _>>()?;
            code.push(args);
        }
    }
    let code = parse_code(&code)?;

    let mut txn = Transaction::new(keys, code);
    if let Some(timestamp) = json.get("timestamp").and_then(|t| t.as_i64()) {
        txn.timestamp = timestamp;
    }
    Ok(txn)
}

fn print_txn(txn: &Transaction) {
    println!("Transaction {}: {:?}", txn.id, txn.status);
    if !txn.abort_reason.is_empty() {
        println!("Abort reason: {}", txn.abort_reason);
    }
    for (key, value) in &txn.reads {
        println!(
            "read  {} = {:?}",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(value),
        );
    }
    for (key, value) in &txn.writes {
        println!(
            "write {} = {:?}",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(value),
        );
    }
    if !txn.internal.events.is_empty() {
        println!("{:<26}{:>8}{:>22}", "Tracing event", "Machine", "Time");
        for event in &txn.internal.events {
            println!("{:<26}{:>8}{:>22}", format!("{:?}", event.event), event.machine.0, event.time);
        }
    }
}
