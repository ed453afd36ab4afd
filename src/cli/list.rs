//! List command implementation

use anyhow::Result;

use crate::config::Config;
use crate::store::CentralStore;

pub fn run(config: &Config, service: Option<String>) -> Result<()> {
    let store = CentralStore::open(config.data_dir())?;
    let needle = service.map(|s| s.to_lowercase());
    let conversations = store.load_conversations(|c| {
        needle
            .as_ref()
            .map_or(true, |n| c.service.title.to_lowercase().contains(n))
    })?;

    if conversations.is_empty() {
        println!("No conversations found. Run 'corral chats' first.");
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:<22} {:<16} {:>9} {}",
        "Updated", "ID", "Service", "Counterparty", "Price", "Done"
    );
    println!("{}", "-".repeat(80));

    for conversation in conversations {
        // Compact "MM-DD HH:MM" slice of the RFC3339 timestamp
        let updated = if conversation.updated_at.len() >= 16 {
            format!(
                "{} {}",
                &conversation.updated_at[5..10],
                &conversation.updated_at[11..16]
            )
        } else {
            "-".to_string()
        };

        let service = truncate(&conversation.service.title, 22);
        let counterparty = truncate(&conversation.counterparty.name, 16);
        let price = conversation
            .price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let done = if conversation.messages_complete {
            "yes"
        } else {
            ""
        };

        println!(
            "{:<12} {:<10} {:<22} {:<16} {:>9} {}",
            updated, conversation.id, service, counterparty, price, done
        );
    }

    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    let text = if text.is_empty() { "-" } else { text };
    if text.chars().count() > max {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}
