//! gql-chat: command-line chat client for an 8base workspace.
//! Reads config, runs one query or mutation over HTTP, or watches the users
//! and messages subscriptions until interrupted.

use gql_chat_client::catalog::{
    MessageEvent, MutationKind, UserEvent, MESSAGES_SUBSCRIPTION, USERS_SUBSCRIPTION,
};
use gql_chat_client::{config, ApiClient, Config, SubscribeOptions, SubscriptionError};
use std::error::Error;
use std::fmt::Display;
use std::path::PathBuf;
use std::process;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: gql-chat [--config <path>] <command>

commands:
  history                       list users and the last 10 messages
  create-user <email>           create a Guest user, print its id
  delete-user <id>              delete a user
  send <author-id> <content>    post a message, print its id
  watch                         print user and message events until Ctrl-C";

enum Command {
    History,
    CreateUser(String),
    DeleteUser(String),
    Send { author_id: String, content: String },
    Watch,
}

fn parse_args(args: Vec<String>) -> Result<(Option<PathBuf>, Command), String> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().ok_or("--config needs a path")?;
            config_path = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }

    let command = match rest.first().map(String::as_str) {
        Some("history") => Command::History,
        Some("create-user") => {
            Command::CreateUser(rest.get(1).cloned().ok_or("create-user needs an email")?)
        }
        Some("delete-user") => {
            Command::DeleteUser(rest.get(1).cloned().ok_or("delete-user needs an id")?)
        }
        Some("send") => {
            let author_id = rest.get(1).cloned().ok_or("send needs an author id")?;
            let content = rest[2..].join(" ");
            if content.trim().is_empty() {
                return Err("send needs message content".into());
            }
            Command::Send { author_id, content }
        }
        Some("watch") => Command::Watch,
        Some(other) => return Err(format!("unknown command: {other}")),
        None => return Err("missing command".into()),
    };
    Ok((config_path, command))
}

/// `--config`, then `GQL_CHAT_CONFIG`, then `~/.gql-chat/config.yaml` if it
/// exists. `EIGHTBASE_*` variables override whatever was loaded.
fn resolve_config(explicit: Option<PathBuf>) -> Result<Config, String> {
    let path = explicit.or_else(|| std::env::var_os("GQL_CHAT_CONFIG").map(PathBuf::from));
    let path = path.or_else(|| config::default_config_path().filter(|p| p.exists()));

    let mut cfg = match path {
        Some(path) => config::load(&path)
            .map_err(|e| format!("failed to load config from {}: {}", path.display(), e))?,
        None => Config::default(),
    };
    cfg.apply_env();
    Ok(cfg)
}

fn fail(message: impl Display) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (config_path, command) = parse_args(std::env::args().skip(1).collect())
        .unwrap_or_else(|e| fail(format!("{e}\n\n{USAGE}")));
    let cfg = resolve_config(config_path).unwrap_or_else(|e| fail(e));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| fail(format!("failed to create runtime: {e}")));

    if let Err(e) = rt.block_on(run(command, &cfg)) {
        fail(e);
    }
}

async fn run(command: Command, cfg: &Config) -> Result<(), Box<dyn Error>> {
    let api = || ApiClient::from_config(cfg);
    match command {
        Command::History => {
            let data = api()?.initial_chat_data().await?;
            println!("Users:");
            for user in &data.users {
                println!("  {} {}", user.id, user.email.as_deref().unwrap_or("-"));
            }
            println!("Messages:");
            for message in &data.messages {
                let author = message
                    .author
                    .as_ref()
                    .and_then(|a| a.email.as_deref())
                    .unwrap_or("unknown");
                println!("  [{}] {}", author, message.content);
            }
        }
        Command::CreateUser(email) => println!("{}", api()?.create_user(&email).await?),
        Command::DeleteUser(id) => {
            let deleted = api()?.delete_user(&id).await?;
            println!("{}", if deleted { "deleted" } else { "not deleted" });
        }
        Command::Send { author_id, content } => {
            println!("{}", api()?.create_message(&author_id, &content).await?)
        }
        Command::Watch => watch(cfg).await?,
    }
    Ok(())
}

async fn watch(cfg: &Config) -> Result<(), Box<dyn Error>> {
    let clients = gql_chat_client::connect(cfg).await?;
    let (failures_tx, mut failures) = mpsc::unbounded_channel();

    let users_failures = failures_tx.clone();
    clients.subscriptions.subscribe(
        &USERS_SUBSCRIPTION,
        SubscribeOptions::new()
            .data(|event| match UserEvent::from_event(&event) {
                Ok(e) => println!(
                    "user {} {} {}",
                    mutation_label(e.mutation),
                    e.node.id,
                    e.node.email.as_deref().unwrap_or("-")
                ),
                Err(_) => println!("{event}"),
            })
            .error(move |err| {
                let _ = users_failures.send(err);
            }),
    );
    clients.subscriptions.subscribe(
        &MESSAGES_SUBSCRIPTION,
        SubscribeOptions::new()
            .data(|event| match MessageEvent::from_event(&event) {
                Ok(e) => {
                    let author = e
                        .node
                        .author
                        .as_ref()
                        .and_then(|a| a.email.as_deref())
                        .unwrap_or("unknown");
                    println!("message [{}] {}", author, e.node.content);
                }
                Err(_) => println!("{event}"),
            })
            .error(move |err| {
                let _ = failures_tx.send(err);
            }),
    );
    eprintln!("watching users and messages (Ctrl-C to stop)");

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        failure = next_fatal(&mut failures) => failure,
    };
    clients.shutdown().await;
    match outcome {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// GraphQL errors are reported and skipped; losing the connection ends the
/// watch. `None` once both subscriptions have ended.
async fn next_fatal(
    failures: &mut mpsc::UnboundedReceiver<SubscriptionError>,
) -> Option<SubscriptionError> {
    while let Some(err) = failures.recv().await {
        match err {
            SubscriptionError::Graphql(_) => eprintln!("Server error: {err}"),
            fatal => return Some(fatal),
        }
    }
    None
}

fn mutation_label(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::Create => "created",
        MutationKind::Update => "updated",
        MutationKind::Delete => "deleted",
    }
}
