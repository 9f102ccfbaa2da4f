// src/main.rs — labschedctl entrypoint
//
// `serve` runs the daemon (scheduler core + background driver + HTTP
// transport); the remaining subcommands are thin clients for operators
// talking to a running daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use labsched::driver::Driver;
use labsched::{Config, Scheduler};

#[derive(Parser)]
#[command(
    name = "labschedctl",
    version = "0.3.0",
    about = "labschedctl — control interface for the labsched orchestrator",
    long_about = "labschedctl runs and controls the labsched daemon, which schedules and \
                  dispatches automated laboratory workflows across instruments."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon address for the client subcommands
    #[arg(long, global = true, default_value = "http://127.0.0.1:5004")]
    server: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon
    Serve {
        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Storage directory override
        #[arg(long)]
        storage: Option<PathBuf>,
        /// Listen port override
        #[arg(long)]
        port: Option<u16>,
    },
    /// Submit a task from a JSON file
    Submit { file: PathBuf },
    /// Print the scheduled queue
    Inspect,
    /// Show which queue holds a task and its responses
    Status { task_id: String },
    /// Cancel a task
    Cancel {
        task_id: String,
        /// Also remove the task from the active queue
        #[arg(long)]
        active: bool,
        /// Clear the channel-occupancy slot holding the task's material
        #[arg(long)]
        drop_material: bool,
    },
    /// Resubmit a replacement under an existing task id
    Resubmit {
        task_id: String,
        /// JSON file with the replacement task
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Pause dispatch (completion polling continues)
    Pause,
    /// Resume dispatch
    Resume,
    /// Clear the scheduled and active queues; history is kept
    Reset,
    /// Reset plus clearing the device registry
    Restart,
    /// Stop the daemon
    Shutdown {
        /// Wait for both queues to drain first
        #[arg(long)]
        wait: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            storage,
            port,
        } => serve(config, storage, port),
        Commands::Submit { file } => {
            let raw = match std::fs::read_to_string(&file) {
                Ok(raw) => raw,
                Err(e) => {
                    eprintln!("[labsched] cannot read {}: {e}", file.display());
                    std::process::exit(1);
                }
            };
            let body: Value = match serde_json::from_str(&raw) {
                Ok(body) => body,
                Err(e) => {
                    eprintln!("[labsched] {} is not valid JSON: {e}", file.display());
                    std::process::exit(1);
                }
            };
            post(&cli.server, "/put", Some(body));
        }
        Commands::Inspect => get(&cli.server, "/queue_inspect"),
        Commands::Status { task_id } => {
            get(&cli.server, &format!("/get_task_status?task_id={task_id}"))
        }
        Commands::Cancel {
            task_id,
            active,
            drop_material,
        } => post(
            &cli.server,
            "/cancel",
            Some(json!({
                "task_id": task_id,
                "include_active_queue": active,
                "drop_material": drop_material,
            })),
        ),
        Commands::Resubmit { task_id, file } => {
            let task = file.map(|file| {
                let raw = std::fs::read_to_string(&file).unwrap_or_else(|e| {
                    eprintln!("[labsched] cannot read {}: {e}", file.display());
                    std::process::exit(1);
                });
                serde_json::from_str::<Value>(&raw).unwrap_or_else(|e| {
                    eprintln!("[labsched] {} is not valid JSON: {e}", file.display());
                    std::process::exit(1);
                })
            });
            post(
                &cli.server,
                "/resubmit",
                Some(json!({ "task_id": task_id, "task": task })),
            );
        }
        Commands::Pause => post(&cli.server, "/pause", None),
        Commands::Resume => post(&cli.server, "/resume", None),
        Commands::Reset => post(&cli.server, "/reset", None),
        Commands::Restart => post(&cli.server, "/restart", None),
        Commands::Shutdown { wait } => post(
            &cli.server,
            "/shutdown",
            Some(json!({ "wait_for_queue_to_empty": wait })),
        ),
    }
}

fn serve(config: Option<PathBuf>, storage: Option<PathBuf>, port: Option<u16>) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match Config::load(config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[labsched] config error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(storage) = storage {
        config.storage_path = storage;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let scheduler = match Scheduler::new(&config.storage_path, config.device_timeout()) {
        Ok(scheduler) => Arc::new(scheduler),
        Err(e) => {
            eprintln!("[labsched] cannot open storage: {e}");
            std::process::exit(1);
        }
    };

    let mut driver = Driver::spawn(
        scheduler.clone(),
        config.sleep_short(),
        config.sleep_long(),
    );

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let result = runtime.block_on(labsched::server::serve(scheduler, &config));
    driver.stop();

    if let Err(e) = result {
        eprintln!("[labsched] server error: {e}");
        std::process::exit(1);
    }
}

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(3600))
        .build()
        .expect("http client construction")
}

fn post(server: &str, path: &str, body: Option<Value>) {
    let url = format!("{server}{path}");
    let request = client().post(&url).json(&body.unwrap_or(json!({})));
    match request.send() {
        Ok(response) => print_response(response),
        Err(e) => {
            eprintln!("[labsched] request to {url} failed: {e}");
            std::process::exit(1);
        }
    }
}

fn get(server: &str, path: &str) {
    let url = format!("{server}{path}");
    match client().get(&url).send() {
        Ok(response) => print_response(response),
        Err(e) => {
            eprintln!("[labsched] request to {url} failed: {e}");
            std::process::exit(1);
        }
    }
}

fn print_response(response: reqwest::blocking::Response) {
    match response.json::<Value>() {
        Ok(body) => println!(
            "{}",
            serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string())
        ),
        Err(_) => println!("[labsched] empty response"),
    }
}
