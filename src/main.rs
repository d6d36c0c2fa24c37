//! Console driver for the estimation room.
//!
//! Maps one command per line onto the session controller while remote
//! changes are reconciled in the background.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use estimation_room::backend::{Backend, LocalBackend, RestBackend};
use estimation_room::config::Config;
use estimation_room::errors::AppError;
use estimation_room::session::{SessionController, SessionOptions};

const HELP: &str = "commands: create <room> <name> | join <room-id> <name> | vote <label> | reveal | reset | leave | show | link | help | quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting estimation room console");

    let backend: Arc<dyn Backend> = match &config.backend_url {
        Some(url) => {
            tracing::info!("Hosted backend: {}", url);
            if config.api_key.is_none() {
                tracing::warn!("No API key configured (POKER_API_KEY)");
            }
            Arc::new(RestBackend::new(
                url,
                config.api_key.clone(),
                config.heartbeat_interval,
            ))
        }
        None => {
            tracing::info!("Local backend: {:?}", config.db_path);
            Arc::new(LocalBackend::open(&config.db_path).await?)
        }
    };

    let mut session = SessionController::new(backend, SessionOptions::from(&config));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match run_command(&mut session, &config, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("error: {}", e.message()),
                }
            }
            // Only the receive races stdin; reconciling runs to completion.
            event = session.recv_event(), if session.is_subscribed() => {
                let Some(event) = event else {
                    println!("room channel closed; use `show` or rejoin");
                    continue;
                };
                match session.on_remote_event(&event).await {
                    Ok(()) => print_state(&session),
                    Err(e) => println!("error: {}", e.message()),
                }
            }
        }
    }

    if session.state().joined {
        if let Err(e) = session.leave().await {
            tracing::warn!("Leaving on exit failed: {}", e);
        }
    }

    Ok(())
}

/// Run one console command. `Ok(false)` ends the loop.
async fn run_command(
    session: &mut SessionController,
    config: &Config,
    line: &str,
) -> Result<bool, AppError> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(true);
    };
    let rest: Vec<&str> = parts.collect();

    match (command, rest.as_slice()) {
        ("create", [room, name @ ..]) if !name.is_empty() => {
            let room = session.create_room(room, &name.join(" ")).await?;
            println!("created room {} ({})", room.name, room.id);
        }
        ("join", [room_id, name @ ..]) if !name.is_empty() => {
            let room_id = Uuid::parse_str(room_id)
                .map_err(|_| AppError::RoomNotFound(room_id.to_string()))?;
            let room = session.join_room(room_id, &name.join(" ")).await?;
            println!("joined room {}", room.name);
        }
        ("vote", [label]) => session.submit_vote(label).await?,
        ("reveal", []) => session.reveal().await?,
        ("reset", []) => session.reset().await?,
        ("leave", []) => {
            session.leave().await?;
            println!("left room");
        }
        ("show", []) => print_state(session),
        ("link", []) => match session.share_link(&config.share_base_url) {
            Some(link) => println!("{link}"),
            None => return Err(AppError::NotJoined),
        },
        ("quit" | "exit", []) => return Ok(false),
        _ => println!("{HELP}"),
    }

    Ok(true)
}

fn print_state(session: &SessionController) {
    let state = session.state();
    if !state.joined {
        println!("not in a room");
        return;
    }

    println!(
        "room {} [{}] {}",
        state.room_name.as_deref().unwrap_or("?"),
        state.voting_system.as_str(),
        if state.revealed { "revealed" } else { "hidden" }
    );
    for participant in state.participants.ordered() {
        let marker = if Some(participant.id) == state.self_participant_id {
            "*"
        } else {
            " "
        };
        let online = if state.online.contains(&participant.id) {
            ""
        } else {
            " (away)"
        };
        let vote = match (&participant.vote, state.revealed) {
            (Some(vote), true) => vote.as_str(),
            (Some(_), false) => "voted",
            (None, _) => "-",
        };
        println!("{marker} {}{online}: {vote}", participant.name);
    }
    if let Some(average) = state.average {
        println!("average: {average:.1}");
    }
    if let Some(vote) = &state.local_vote {
        println!("your vote: {vote}");
    }
}
