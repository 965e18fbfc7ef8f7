use anyhow::Result;
use clap::Subcommand;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use kiln_cli::{connect_dispatcher, Stores};
use kiln_config::Config;

use super::{format_date, wait_for_run, Identity};

#[derive(Subcommand)]
pub enum ProjectsCommands {
    /// Start a new project from a prompt and wait for its first generation
    Create {
        /// What to build
        prompt: String,
    },
    /// List your projects
    List,
}

pub async fn handle_projects_command(
    command: ProjectsCommands,
    identity: &Identity,
    config: &Config,
    stores: &Stores,
) -> Result<()> {
    match command {
        ProjectsCommands::Create { prompt } => {
            let dispatcher = connect_dispatcher(config, stores)?;
            let (project, ticket) = dispatcher
                .create_project(&identity.user_id, identity.plan, &prompt)
                .await?;
            println!(
                "{} {} ({})",
                "Created project".blue().bold(),
                project.name.bold(),
                project.id
            );
            wait_for_run(ticket).await
        }
        ProjectsCommands::List => list_projects(identity, stores).await,
    }
}

async fn list_projects(identity: &Identity, stores: &Stores) -> Result<()> {
    let projects = stores.projects.list_projects(&identity.user_id).await?;

    if projects.is_empty() {
        println!("{}", "No projects found".yellow());
        println!(
            "{}",
            "Use 'kiln projects create \"<prompt>\"' to start one".dimmed()
        );
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Name", "Created"]);

    for project in &projects {
        table.add_row(vec![
            project.id.clone(),
            project.name.clone(),
            format_date(&project.created_at),
        ]);
    }

    println!("{}", table);
    println!("Total: {} projects", projects.len().to_string().cyan());
    Ok(())
}
