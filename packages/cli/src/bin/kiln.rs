use clap::{Parser, Subcommand};
use colored::*;
use std::process;

mod cli;

use cli::messages::MessagesCommands;
use cli::projects::ProjectsCommands;
use cli::{Identity, PlanArg};
use kiln_cli::{connect_dispatcher, init_logging, Stores};
use kiln_config::Config;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln - prompt-to-app code generation in disposable sandboxes")]
#[command(version)]
struct Cli {
    /// User the commands act on behalf of
    #[arg(long, global = true, default_value = "local")]
    user: String,

    /// Credit plan of the user
    #[arg(long, global = true, value_enum, default_value = "free")]
    plan: PlanArg,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and inspect projects
    #[command(subcommand)]
    Projects(ProjectsCommands),
    /// Send follow-up prompts and read conversations
    #[command(subcommand)]
    Messages(MessagesCommands),
    /// Show remaining credits in the current window
    Usage,
    /// Finish runs interrupted by a previous shutdown
    Resume,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = handle_command(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    if let Some(dir) = kiln_config::kiln_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    let stores = Stores::open(&config.database_url).await?;
    let identity = Identity {
        user_id: cli.user,
        plan: cli.plan.into(),
    };

    match cli.command {
        Commands::Projects(command) => {
            cli::projects::handle_projects_command(command, &identity, &config, &stores).await
        }
        Commands::Messages(command) => {
            cli::messages::handle_messages_command(command, &identity, &config, &stores).await
        }
        Commands::Usage => cli::show_usage(&identity, &stores).await,
        Commands::Resume => {
            let dispatcher = connect_dispatcher(&config, &stores)?;
            let tickets = dispatcher.resume_pending().await?;
            if tickets.is_empty() {
                println!("{}", "No unfinished runs".dimmed());
                return Ok(());
            }
            println!("Resuming {} run(s)...", tickets.len().to_string().cyan());
            for ticket in tickets {
                cli::wait_for_run(ticket).await?;
            }
            Ok(())
        }
    }
}
