use clap::{Parser, Subcommand};

const HELP_EPILOG: &str = r#"Server options can also be provided via environment variables:
  CONFIG_PATH (default: ./config.yaml)
  DB_PATH     (default: data/app.db)
  PORT        (default: 5151 or config.listen_port)

The `sweep` command runs one daily-expiry sweep over every family and
exits; point a cron job or systemd timer at it.
"#;

#[derive(Debug, Parser)]
#[command(
    name = "famtask-server",
    version,
    about = "Family task & allowance server",
    long_about = None,
    after_long_help = HELP_EPILOG,
)]
pub struct Cli {
    /// Optional subcommand. Without one, runs the server.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daily task-expiry sweep once and exit
    Sweep,
}
