//! `wamp-persist` command line client

mod cli;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use wamp_persist_client::{Event, EventHandler, Options, PersistentSession};

use cli::Action;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli::command().get_matches();

    env_logger::Builder::new()
        .filter_level(cli::log_level(&matches))
        .parse_default_env()
        .init();

    if let Err(e) = dotenvy::dotenv() {
        log::debug!("No .env file loaded: {e}");
    }

    let config = cli::resolve_config(&matches)?;
    log::debug!("Connecting to {} (realm {})", config.url, config.realm);
    let client = PersistentSession::new(config);

    match cli::action(&matches)? {
        Action::Call { procedure, args } => {
            let value = client.rpc(procedure, args).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Action::Subscribe { topic, count } => follow(&client, &topic, count).await?,
    }

    Ok(())
}

async fn follow(client: &PersistentSession, topic: &str, count: Option<usize>) -> Result<()> {
    let (sender, mut events) = mpsc::unbounded_channel::<Event>();
    let handler: EventHandler = Arc::new(move |event: Event| {
        if sender.send(event).is_err() {
            log::debug!("Event arrived after shutdown");
        }
    });

    let sub_id = client.subscribe(topic, handler, Options::new(), None).await?;
    log::info!("Subscribed to {topic} as {sub_id}");

    let mut received = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                received += 1;
                if count.is_some_and(|count| received >= count) {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                log::info!("Interrupted");
                break;
            }
        }
    }

    // a queued unsubscribe would wait for the next session
    if client.is_connected() {
        client.unsubscribe(&sub_id).await?;
    }
    Ok(())
}
