pub mod messages;
pub mod projects;

use anyhow::{anyhow, Result};
use colored::*;
use kiln_agent::{RunOutcome, RunTicket};
use kiln_cli::Stores;
use kiln_storage::Plan;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum PlanArg {
    Free,
    Pro,
}

impl From<PlanArg> for Plan {
    fn from(plan: PlanArg) -> Self {
        match plan {
            PlanArg::Free => Plan::Free,
            PlanArg::Pro => Plan::Pro,
        }
    }
}

pub struct Identity {
    pub user_id: String,
    pub plan: Plan,
}

/// Block until the run finishes and print what it committed
pub async fn wait_for_run(ticket: RunTicket) -> Result<()> {
    println!("{} {}", "Run".dimmed(), ticket.run.id.dimmed());
    let outcome = ticket
        .handle
        .await
        .map_err(|e| anyhow!("run task panicked: {}", e))??;
    print_outcome(&outcome);
    Ok(())
}

pub fn print_outcome(outcome: &RunOutcome) {
    if outcome.is_error {
        println!("{} {}", "✗".red().bold(), outcome.message.content.red());
        return;
    }

    println!("{} {}", "✓".green().bold(), outcome.title.bold());
    println!("{}", outcome.message.content);
    if let Some(url) = &outcome.url {
        println!("{} {}", "Preview:".bold(), url.cyan());
    }
    if !outcome.files.is_empty() {
        println!("{}", "Files:".bold());
        for path in outcome.files.keys() {
            println!("  {}", path);
        }
    }
}

pub async fn show_usage(identity: &Identity, stores: &Stores) -> Result<()> {
    let status = stores.usage.status(&identity.user_id, identity.plan).await?;

    println!(
        "{} {} of {} credit(s) remaining",
        "Usage:".bold(),
        status.remaining.to_string().cyan(),
        identity.plan.points()
    );
    match status.resets_at {
        Some(resets_at) => println!("Resets at {}", format_date(&resets_at)),
        None => println!("{}", "No credits used in the current window".dimmed()),
    }
    Ok(())
}

pub fn format_date(date: &chrono::DateTime<chrono::Utc>) -> String {
    date.format("%Y-%m-%d %H:%M").to_string()
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let cut: String = single_line.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}
