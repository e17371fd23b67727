use anyhow::{Context, Result, anyhow};
use clap::Parser;
use colored::Colorize;
use relay_server::protocol::{Command, CommandCode, pack};
use relay_server::transport::{self, Connection, TransportConfig};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "relay-cli")]
#[command(about = "Relay CLI - control a relay node over its control port", long_about = None)]
struct Args {
    /// Control listener host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Control listener port
    #[arg(short = 'p', long, default_value = "9596")]
    port: u16,

    /// Reply timeout in milliseconds
    #[arg(long, default_value = "6000")]
    timeout_ms: u64,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

struct ControlClient {
    conn: Arc<Connection>,
    shutdown: CancellationToken,
}

impl ControlClient {
    async fn connect(host: &str, port: u16, timeout_ms: u64) -> Result<Self> {
        let config = TransportConfig {
            waiter_timeout_ms: timeout_ms,
            ..TransportConfig::default()
        };
        let shutdown = CancellationToken::new();
        let addr = format!("{}:{}", host, port);
        let conn = transport::connect(&addr, config, Vec::new(), &shutdown)
            .await
            .with_context(|| format!("connecting to {}", addr))?;
        Ok(Self { conn, shutdown })
    }

    async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let start = Instant::now();

        let response = match command.to_uppercase().as_str() {
            "STOP" => self.cmd_stop().await?,
            "RELOAD" => self.cmd_reload(args).await?,
            "MEMBERS" | "SHOW-MEMBERS" => self.cmd_members().await?,
            "PING" => self.cmd_ping().await?,
            "HELP" => help_text(),
            _ => return Err(anyhow!("Unknown command: {}", command)),
        };

        let elapsed = start.elapsed();
        Ok(format!(
            "{}\n{}",
            response,
            format!("({:.2?})", elapsed).dimmed()
        ))
    }

    async fn request(&self, code: CommandCode, body: &[u8]) -> Result<Command> {
        let reply = self.conn.request(pack(code, body)).await?;
        let reply = Command::decode(&reply)?;
        if reply.code == CommandCode::Error {
            return Err(anyhow!("{}", reply.body_str()));
        }
        Ok(reply)
    }

    async fn cmd_stop(&self) -> Result<String> {
        self.request(CommandCode::Stop, b"").await?;
        Ok("OK, node is stopping".green().to_string())
    }

    async fn cmd_reload(&self, args: &[String]) -> Result<String> {
        let target = args.first().map(String::as_str).unwrap_or("all");
        self.request(CommandCode::Reload, target.as_bytes()).await?;
        Ok(format!("OK, reloaded {}", target).green().to_string())
    }

    async fn cmd_members(&self) -> Result<String> {
        let reply = self.request(CommandCode::ShowMembers, b"").await?;
        Ok(reply.body_str().replace("\r\n", "\n").trim_end().to_string())
    }

    async fn cmd_ping(&self) -> Result<String> {
        self.request(CommandCode::Tick, b"").await?;
        Ok("PONG".green().to_string())
    }

    fn close(&self) {
        self.conn.close();
        self.shutdown.cancel();
    }
}

fn help_text() -> String {
    format!(
        r#"{}

{}
  STOP                       Shut the node down
  RELOAD [service|all]       Reload configuration and downstream services
  MEMBERS                    Show cluster members and their roles
  PING                       Check the control connection
  HELP                       Show this help message
  QUIT                       Exit the CLI
"#,
        "Relay CLI - Available Commands".bold().cyan(),
        "Node Commands:".bold(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let args = Args::parse();
    let client = ControlClient::connect(&args.host, args.port, args.timeout_ms).await?;

    let result = if !args.command.is_empty() {
        // Command mode: execute single command and exit
        let cmd = &args.command[0];
        let cmd_args: Vec<String> = args.command[1..].to_vec();
        client.execute_command(cmd, &cmd_args).await.map(|output| {
            info!("{}", output);
        })
    } else {
        run_interactive(&client, &args.host, args.port).await
    };

    client.close();
    if let Err(e) = result {
        error!(error = %e, "{}", format!("Error: {}", e).red());
        std::process::exit(1);
    }
    Ok(())
}

async fn run_interactive(client: &ControlClient, host: &str, port: u16) -> Result<()> {
    info!(
        "{}",
        format!("Relay CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!("Connected to {}:{}", host, port);
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;

    loop {
        let prompt = format!("{}> ", format!("relay {}:{}", host, port).green());

        match rl.readline(&prompt) {
            Ok(line) => {
                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                if parts.is_empty() {
                    continue;
                }
                rl.add_history_entry(&line)?;

                let cmd = &parts[0];
                if cmd.eq_ignore_ascii_case("QUIT") || cmd.eq_ignore_ascii_case("EXIT") {
                    info!("Goodbye!");
                    break;
                }

                match client.execute_command(cmd, &parts[1..]).await {
                    Ok(output) => info!("{}", output),
                    Err(e) => error!(error = %e, "{}", format!("Error: {}", e).red()),
                }

                if cmd.eq_ignore_ascii_case("STOP") {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
