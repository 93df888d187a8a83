use clap::{Parser, Subcommand};

/// Property back-office task scheduler.
#[derive(Debug, Parser)]
#[command(name = "propdesk", version, about)]
pub struct Cli {
    /// Config file (default: $PROPDESK_CONFIG, then ~/.propdesk/propdesk.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Seed the default tasks; existing ones keep their schedule and history.
    Bootstrap,
    /// List all tasks.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one task in full.
    Inspect {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Run one task now, whatever its status or frequency.
    Run { id: String },
    /// Run every task that is due now.
    RunDue,
    /// Let sweeps pick the task up again.
    Activate { id: String },
    /// Keep sweeps away from the task; it can still be run by hand.
    Deactivate { id: String },
    /// Change how often the task runs (MANUAL, HOURLY, DAILY, WEEKLY, MONTHLY, YEARLY).
    SetFrequency { id: String, frequency: String },
    /// Delete a task.
    Delete { id: String },
    /// Sweep every `scheduler.tick_secs` until interrupted.
    Serve,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::parse_from(["propdesk", "--config", "/tmp/p.toml", "inspect", "abc", "--json"]);
        assert_eq!(cli.config.as_deref(), Some("/tmp/p.toml"));
        assert!(matches!(cli.command, Command::Inspect { ref id, json: true } if id == "abc"));

        let cli = Cli::parse_from(["propdesk", "set-frequency", "abc", "monthly"]);
        assert!(matches!(cli.command, Command::SetFrequency { ref frequency, .. } if frequency == "monthly"));

        let cli = Cli::parse_from(["propdesk", "run-due"]);
        assert!(matches!(cli.command, Command::RunDue));
    }

    #[test]
    fn verify_command_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
