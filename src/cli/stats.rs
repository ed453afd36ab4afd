//! Stats command implementation

use anyhow::Result;

use crate::config::Config;
use crate::store::CentralStore;

pub fn run(config: &Config) -> Result<()> {
    let store = CentralStore::open(config.data_dir())?;
    let stats = store.stats()?;

    println!("Central store: {}", store.root().display());
    println!("Conversations:      {}", stats.conversations);
    println!("  fully collected:  {}", stats.conversations_complete);
    println!("Messages:           {}", stats.messages);
    println!("Distinct services:  {}", stats.services);
    if let Some(oldest) = &stats.oldest_activity {
        println!("Oldest activity:    {oldest}");
    }
    if let Some(newest) = &stats.newest_activity {
        println!("Newest activity:    {newest}");
    }

    Ok(())
}
