//! kernel-relay CLI entry point.
//!
//! Talks to a running Jupyter server: lists sessions, kernels and kernel
//! specs, runs code on a kernel, and interrupts or restarts kernels.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use kernel_relay::cell::Cell;
use kernel_relay::output::Output;
use kernel_relay::render::strip_ansi;
use kernel_relay::rest::ServerClient;
use kernel_relay::settings::{load_settings, RelaySettings};
use kernel_relay::{KernelClient, KernelConnectionConfig};
use log::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "kernel-relay")]
#[command(about = "Talk to Jupyter kernels through a Jupyter server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Jupyter server URL (default from settings, then http://localhost:8888)
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// API token (overrides settings and JUPYTER_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List open sessions
    Sessions {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List running kernels
    Kernels {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List available kernel specs
    Kernelspecs {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Execute code and print its outputs
    Run {
        /// Code to execute
        #[arg(long, conflicts_with = "file")]
        code: Option<String>,

        /// File whose contents to execute
        #[arg(long)]
        file: Option<PathBuf>,

        /// Existing kernel to run on (default: start a temporary session)
        #[arg(long)]
        kernel: Option<String>,

        /// Kernel spec for the temporary session
        #[arg(long)]
        kernel_name: Option<String>,

        /// Print the executed cell as nbformat JSON
        #[arg(long)]
        json: bool,
    },

    /// Interrupt a kernel
    Interrupt { kernel_id: String },

    /// Restart a kernel
    Restart { kernel_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = load_settings();
    if let Some(url) = cli.server_url {
        settings.server_url = url;
    }
    if cli.token.is_some() {
        settings.token = cli.token;
    }
    let server = ServerClient::from_settings(&settings)?;

    match cli.command {
        Commands::Sessions { json } => list_sessions(&server, json).await,
        Commands::Kernels { json } => list_kernels(&server, json).await,
        Commands::Kernelspecs { json } => list_kernelspecs(&server, json).await,
        Commands::Run {
            code,
            file,
            kernel,
            kernel_name,
            json,
        } => {
            let code = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => bail!("pass --code or --file"),
            };
            if let Some(name) = kernel_name {
                settings.kernel_name = name;
            }
            run(&server, &settings, &code, kernel, json).await
        }
        Commands::Interrupt { kernel_id } => {
            server.interrupt_kernel(&kernel_id).await?;
            println!("Interrupted kernel {}", kernel_id);
            Ok(())
        }
        Commands::Restart { kernel_id } => {
            let kernel = server.restart_kernel(&kernel_id).await?;
            println!("Restarted kernel {} ({})", kernel.id, kernel.name);
            Ok(())
        }
    }
}

async fn list_sessions(server: &ServerClient, json: bool) -> anyhow::Result<()> {
    let sessions = server.list_sessions().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions");
    }
    for session in sessions {
        let kernel = session
            .kernel
            .map(|k| format!("{} ({})", k.id, k.name))
            .unwrap_or_else(|| "-".to_string());
        println!("{}  {}  kernel: {}", session.id, session.path, kernel);
    }
    Ok(())
}

async fn list_kernels(server: &ServerClient, json: bool) -> anyhow::Result<()> {
    let kernels = server.list_kernels().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&kernels)?);
        return Ok(());
    }
    if kernels.is_empty() {
        println!("No running kernels");
    }
    for kernel in kernels {
        println!(
            "{}  {}  {}",
            kernel.id,
            kernel.name,
            kernel.execution_state.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

async fn list_kernelspecs(server: &ServerClient, json: bool) -> anyhow::Result<()> {
    let specs = server.list_kernelspecs().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(());
    }
    let mut names: Vec<_> = specs.kernelspecs.keys().collect();
    names.sort();
    for name in names {
        let entry = &specs.kernelspecs[name];
        let marker = if *name == specs.default { "*" } else { " " };
        println!("{} {}  {}", marker, name, entry.spec.display_name);
    }
    Ok(())
}

async fn run(
    server: &ServerClient,
    settings: &RelaySettings,
    code: &str,
    kernel: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let (kernel_id, temp_session) = match kernel {
        Some(id) => (id, None),
        None => {
            let path = format!("kernel-relay-{}.ipynb", Uuid::new_v4());
            let session = server
                .create_session(&path, &path, "notebook", &settings.kernel_name)
                .await?;
            let kernel = session
                .kernel
                .clone()
                .context("server created a session without a kernel")?;
            info!("Started session {} with kernel {}", session.id, kernel.id);
            (kernel.id, Some(session.id))
        }
    };

    let session_id = Uuid::new_v4().to_string();
    let url = server.kernel_channels_url(&kernel_id, &session_id)?;
    let config = KernelConnectionConfig::from_settings(url, settings).with_session_id(session_id);
    let (handle, _events) = KernelClient::connect(config);

    let result = async {
        handle.wait_connected(Duration::from_secs(30)).await?;
        let mut cell = Cell::code(code);
        let reply = cell.run(&handle).await?;
        anyhow::Ok((cell, reply))
    }
    .await;

    let _ = handle.close();
    if let Some(session_id) = temp_session {
        if let Err(e) = server.delete_session(&session_id).await {
            warn!("Failed to delete session {}: {}", session_id, e);
        }
    }

    let (cell, reply) = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&cell.to_nbformat())?);
    } else {
        print_outputs(cell.outputs.outputs());
    }

    if reply.content["status"] != "ok" {
        bail!("execution finished with status {}", reply.content["status"]);
    }
    Ok(())
}

fn print_outputs(outputs: &[Output]) {
    for output in outputs {
        match output {
            Output::Stream { name, text } if name == "stderr" => eprint!("{}", text),
            Output::Stream { text, .. } => print!("{}", text),
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => {
                match data.get("text/plain").and_then(|v| v.as_str()) {
                    Some(text) => println!("{}", text),
                    None => println!("[{}]", data.keys().cloned().collect::<Vec<_>>().join(", ")),
                }
            }
            Output::Error {
                ename,
                evalue,
                traceback,
            } => {
                if traceback.is_empty() {
                    eprintln!("{}: {}", ename, evalue);
                } else {
                    eprintln!("{}", strip_ansi(&traceback.join("\n")));
                }
            }
        }
    }
}
