use std::path::PathBuf;

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use serde_json::Value;
use wamp_persist_client::ClientConfig;

pub fn command() -> Command {
    Command::new("wamp-persist")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Call procedures and follow topics on a WAMP router, riding out reconnects")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("TOML client configuration"),
        )
        .arg(
            Arg::new("url")
                .long("url")
                .value_name("URL")
                .help("Router address, tcp://host:port or unix:///path"),
        )
        .arg(
            Arg::new("realm")
                .long("realm")
                .value_name("REALM")
                .help("Realm to join"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::Count)
                .global(true)
                .help("Set verbose output level"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("call")
                .about("Call a procedure and print its result")
                .arg(Arg::new("procedure").required(true))
                .arg(
                    Arg::new("args")
                        .num_args(0..)
                        .help("Positional arguments, each parsed as JSON or taken as a string"),
                ),
        )
        .subcommand(
            Command::new("subscribe")
                .about("Print events published on a topic")
                .arg(Arg::new("topic").required(true))
                .arg(
                    Arg::new("count")
                        .long("count")
                        .short('n')
                        .value_parser(value_parser!(usize))
                        .help("Exit after this many events"),
                ),
        )
}

#[derive(Debug, PartialEq)]
pub enum Action {
    Call { procedure: String, args: Vec<Value> },
    Subscribe { topic: String, count: Option<usize> },
}

pub fn log_level(matches: &ArgMatches) -> log::LevelFilter {
    match matches.get_count("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// File first, then `WAMP_PERSIST_*` variables, then flags.
pub fn resolve_config(matches: &ArgMatches) -> Result<ClientConfig> {
    let url = matches.get_one::<String>("url");

    let mut config = match (matches.get_one::<PathBuf>("config"), url) {
        (Some(path), _) => ClientConfig::load(path)?,
        (None, Some(url)) => {
            let mut config = ClientConfig::new(url.clone());
            config.apply_env_overrides()?;
            config
        }
        (None, None) => ClientConfig::from_env()?,
    };

    if let Some(url) = url {
        config.url.clone_from(url);
    }
    if let Some(realm) = matches.get_one::<String>("realm") {
        config.realm.clone_from(realm);
    }
    config.validate()?;

    Ok(config)
}

pub fn action(matches: &ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some(("call", call)) => Ok(Action::Call {
            procedure: required(call, "procedure")?,
            args: call
                .get_many::<String>("args")
                .into_iter()
                .flatten()
                .map(|raw| parse_arg(raw))
                .collect(),
        }),
        Some(("subscribe", subscribe)) => Ok(Action::Subscribe {
            topic: required(subscribe, "topic")?,
            count: subscribe.get_one::<usize>("count").copied(),
        }),
        other => anyhow::bail!("Unknown command: {:?}", other.map(|(name, _)| name)),
    }
}

fn required(matches: &ArgMatches, id: &str) -> Result<String> {
    matches
        .get_one::<String>(id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Missing <{id}>"))
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}
