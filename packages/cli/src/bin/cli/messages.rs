use anyhow::{anyhow, Result};
use clap::Subcommand;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use kiln_cli::{connect_dispatcher, Stores};
use kiln_config::Config;
use kiln_storage::{MessageRole, MessageType};

use super::{format_date, truncate, wait_for_run, Identity};

#[derive(Subcommand)]
pub enum MessagesCommands {
    /// Send a follow-up prompt to a project and wait for the result
    Send {
        /// Project ID
        project_id: String,
        /// What to change
        prompt: String,
    },
    /// Show a project's conversation
    List {
        /// Project ID
        project_id: String,
    },
}

pub async fn handle_messages_command(
    command: MessagesCommands,
    identity: &Identity,
    config: &Config,
    stores: &Stores,
) -> Result<()> {
    match command {
        MessagesCommands::Send { project_id, prompt } => {
            let dispatcher = connect_dispatcher(config, stores)?;
            let ticket = dispatcher
                .send_message(&identity.user_id, identity.plan, &project_id, &prompt)
                .await?;
            wait_for_run(ticket).await
        }
        MessagesCommands::List { project_id } => list_messages(&project_id, identity, stores).await,
    }
}

async fn list_messages(project_id: &str, identity: &Identity, stores: &Stores) -> Result<()> {
    let project = stores.projects.get_project(project_id).await?;
    if project.user_id != identity.user_id {
        return Err(anyhow!("Project with ID '{}' not found", project_id));
    }

    let messages = stores.messages.list_messages(project_id).await?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["When", "Role", "Type", "Content", "Fragment"]);

    for message in &messages {
        let role = match message.role {
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
        };
        let kind = match message.message_type {
            MessageType::Result => "Result",
            MessageType::Error => "Error",
        };
        let fragment = match &message.fragment {
            Some(fragment) => format!(
                "{} ({} files)\n{}",
                fragment.title,
                fragment.files.len(),
                fragment.sandbox_url
            ),
            None => "—".to_string(),
        };

        table.add_row(vec![
            format_date(&message.created_at),
            role.to_string(),
            kind.to_string(),
            truncate(&message.content, 60),
            fragment,
        ]);
    }

    println!("{}", format!("Project {}", project.name).blue().bold());
    println!("{}", table);
    Ok(())
}
