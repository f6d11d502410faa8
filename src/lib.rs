// Declare the modules
pub mod api;
pub mod citations;
pub mod commands;
pub mod config;
pub mod deserializers;
pub mod models;
pub mod persistence;
pub mod state;
pub mod stream;

use crate::api::{ChatApi, HttpChatApi};
use crate::citations::parse_transcript_answer;
use crate::commands::SendOutcome;
use crate::config::ClientConfig;
use crate::models::{Feedback, Role};
use crate::persistence::PersistenceStrategy;
use crate::state::AppState;
use crate::stream::StreamEvent;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

const HELP: &str = "\
Type a question to ask it. Commands:
  /new                     start a new conversation
  /history [more]          list saved conversations, or fetch the next page
  /open N                  open conversation N from /history
  /rename N TITLE          rename conversation N
  /delete N                delete conversation N
  /delete-all              delete every saved conversation
  /clear                   clear the messages of the current conversation
  /like                    toggle thumbs-up on the last answer
  /dislike [REASON ...]    thumbs-down on the last answer, optionally with reasons
  /cite N                  show citation N of the last answer
  /usecases                list the use cases available to you
  /quit                    exit
Press Ctrl-C while an answer streams to stop it.";

#[derive(Parser)]
#[command(name = "ragchat")]
#[command(version)]
#[command(about = "Terminal client for a retrieval-augmented chat service", long_about = None)]
pub struct Cli {
    /// Use case to route questions to; overrides RAGCHAT_USE_CASE
    #[arg(long)]
    pub use_case: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Save a bearer token in the system keyring
    StoreToken {
        /// The token to store
        token: String,
    },
}

/// Entry point of the terminal client.
pub fn run() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env();
    if let Some(use_case) = cli.use_case {
        config = config.with_use_case(use_case);
    }

    if let Some(Commands::StoreToken { token }) = &cli.command {
        config::set_access_token_in_keyring(&config, token)?;
        println!("Token stored. Set RAGCHAT_TOKEN_REF=keyring to use it.");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(repl(config))
}

async fn repl(config: ClientConfig) -> Result<()> {
    log::info!("Connecting to {} (use case: {:?})", config.base_url, config.use_case);
    let user = config.user.clone();
    let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::new(config)?);
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let state = AppState::new(api, Some(events_tx));

    commands::initialize(&state).await;
    let (health, ui) = state
        .read(|s| (s.history_health().clone(), s.settings().ui.clone()))
        .await;
    if let Some(title) = ui.and_then(|ui| ui.chat_title) {
        println!("{}", title);
    }
    println!("Chat history: {}", health.status);
    report_dialog(&state).await;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt().await;
        let Some(line) = lines.next_line().await.context("Failed to read from stdin")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let keep_going = match line.strip_prefix('/') {
            Some(command) => handle_command(&state, command, user.as_deref()).await,
            None => {
                ask(&state, &mut events_rx, line).await;
                true
            }
        };
        report_dialog(&state).await;
        if !keep_going {
            break;
        }
    }

    commands::stop_all(&state);
    Ok(())
}

async fn prompt() {
    let mut stdout = tokio::io::stdout();
    // Prompt only; a failed write shows up on the next println
    let _ = stdout.write_all(b"> ").await;
    let _ = stdout.flush().await;
}

/// Id to continue with, if the current conversation can take a follow-up.
async fn follow_up_id(state: &AppState) -> Option<String> {
    state
        .read(|s| {
            let current = s.current()?;
            PersistenceStrategy::from_health(s.history_health())
                .locate(s, &current.id)
                .map(|c| c.id)
        })
        .await
}

async fn ask(state: &AppState, events: &mut UnboundedReceiver<StreamEvent>, question: &str) {
    let conversation_id = follow_up_id(state).await;
    let send = commands::send_question(state, question, conversation_id.as_deref());
    tokio::pin!(send);

    let mut printer = DeltaPrinter::default();
    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome,
            Some(event) = events.recv() => printer.show(event),
            _ = tokio::signal::ctrl_c() => {
                commands::stop_generation(state, conversation_id.as_deref());
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        printer.show(event);
    }
    println!();

    match outcome {
        SendOutcome::Completed => print_sources(state).await,
        SendOutcome::Aborted => println!("[stopped]"),
        SendOutcome::Failed(_) => {
            let last = state
                .read(|s| s.current().and_then(|c| c.messages.last().cloned()))
                .await;
            if let Some(message) = last.filter(|m| m.role == Role::Error) {
                println!("{}", message.content);
            }
        }
        SendOutcome::ConversationNotFound => println!("That conversation no longer exists."),
        SendOutcome::Busy => println!("Still answering the previous question."),
        SendOutcome::Ignored => {}
    }
}

/// Prints the newly streamed suffix of each delta.
#[derive(Default)]
struct DeltaPrinter {
    response_id: String,
    shown: usize,
}

impl DeltaPrinter {
    fn show(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Delta { response_id, content } => {
                if response_id != self.response_id {
                    self.response_id = response_id;
                    self.shown = 0;
                }
                if let Some(fresh) = content.get(self.shown..) {
                    print!("{}", fresh);
                }
                self.shown = content.len();
            }
            StreamEvent::Tool { .. } => log::debug!("Citations received"),
        }
    }
}

async fn print_sources(state: &AppState) {
    let Some(parsed) = last_answer(state).await.map(|(_, parsed)| parsed) else {
        return;
    };
    if parsed.citations.is_empty() {
        return;
    }
    println!("Sources:");
    for (i, citation) in parsed.citations.iter().enumerate() {
        let name = citation
            .title
            .clone()
            .or_else(|| citation.filepath.clone())
            .unwrap_or_else(|| "Citation".to_string());
        println!("  ^{}^ {}", i + 1, name);
    }
}

async fn last_answer(state: &AppState) -> Option<(String, citations::ParsedAnswer)> {
    state
        .read(|s| {
            let messages = &s.current()?.messages;
            let index = messages.iter().rposition(|m| m.role == Role::Assistant)?;
            let parsed = parse_transcript_answer(messages, index)?;
            Some((messages[index].id.clone(), parsed))
        })
        .await
}

async fn history_id(state: &AppState, arg: &str) -> Option<String> {
    let index = arg.trim().parse::<usize>().ok()?.checked_sub(1)?;
    state
        .read(|s| s.history().get(index).map(|c| c.id.clone()))
        .await
}

async fn handle_command(state: &AppState, command: &str, user: Option<&str>) -> bool {
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();

    match name {
        "quit" | "exit" => return false,
        "help" => println!("{}", HELP),
        "new" => commands::new_chat(state).await,
        "history" => {
            if rest == "more" {
                let offset = state.read(|s| s.history().len()).await;
                commands::load_history(state, offset).await;
            }
            let history = state.read(|s| s.history().to_vec()).await;
            if history.is_empty() {
                println!("No saved conversations.");
            }
            for (i, conversation) in history.iter().enumerate() {
                println!(
                    "{:>3}. {} ({})",
                    i + 1,
                    conversation.title,
                    conversation.date.format("%Y-%m-%d %H:%M")
                );
            }
        }
        "open" => match history_id(state, rest).await {
            Some(id) => {
                commands::select_conversation(state, &id).await;
                let conversation = state.read(|s| s.current().cloned()).await;
                for message in conversation.iter().flat_map(|c| c.messages.iter()) {
                    if message.role != Role::Tool {
                        println!("[{}] {}", message.role, message.content);
                    }
                }
            }
            None => println!("Usage: /open N"),
        },
        "rename" => {
            let (index, title) = rest.split_once(' ').unwrap_or((rest, ""));
            match history_id(state, index).await {
                Some(id) if !title.trim().is_empty() => {
                    commands::rename_conversation(state, &id, title).await;
                }
                _ => println!("Usage: /rename N TITLE"),
            }
        }
        "delete" => match history_id(state, rest).await {
            Some(id) => {
                commands::delete_conversation(state, &id).await;
            }
            None => println!("Usage: /delete N"),
        },
        "delete-all" => {
            commands::delete_all_history(state).await;
        }
        "clear" => {
            if !commands::clear_chat(state).await {
                println!("Nothing to clear.");
            }
        }
        "like" => match last_answer(state).await {
            Some((id, _)) => println!("Feedback: {}", commands::like_answer(state, &id).await),
            None => println!("No answer to rate yet."),
        },
        "dislike" => match last_answer(state).await {
            Some((id, _)) => {
                let reasons: Vec<Feedback> = rest
                    .split_whitespace()
                    .filter_map(|r| r.parse().ok())
                    .collect();
                if reasons.is_empty() {
                    println!("Feedback: {}", commands::dislike_answer(state, &id).await);
                } else if commands::report_negative(state, &id, &reasons).await {
                    println!("Feedback: {}", Feedback::join(&reasons));
                } else {
                    println!("Reasons: {}", negative_reasons());
                }
            }
            None => println!("No answer to rate yet."),
        },
        "cite" => {
            let index = rest.parse::<usize>().ok().and_then(|n| n.checked_sub(1));
            let citation = match (last_answer(state).await, index) {
                (Some((_, parsed)), Some(index)) => parsed.citations.get(index).cloned(),
                _ => None,
            };
            match citation {
                Some(citation) => {
                    let shown = commands::show_citation(state, &citation).await;
                    if let Some(title) = &shown.title {
                        println!("{}", title);
                    }
                    println!("{}", shown.content);
                    if let Some(url) = &shown.url {
                        println!("{}", url);
                    }
                }
                None => println!("Usage: /cite N (see the sources of the last answer)"),
            }
        }
        "usecases" => match user {
            Some(user) => match state.api.use_case_names(user).await {
                Ok(names) => println!("{}", names),
                Err(e) => println!("Could not fetch use cases: {:#}", e),
            },
            None => println!("Set RAGCHAT_USER to list use cases."),
        },
        other => println!("Unknown command /{}. Try /help.", other),
    }
    true
}

fn negative_reasons() -> String {
    let reasons: Vec<Feedback> = Feedback::ALL
        .iter()
        .copied()
        .filter(Feedback::is_negative_reason)
        .collect();
    Feedback::join(&reasons).replace(',', " ")
}

async fn report_dialog(state: &AppState) {
    let Some(dialog) = state.read(|s| s.error_dialog().cloned()).await else {
        return;
    };
    println!("{}: {}", dialog.title, dialog.subtitle);
    commands::dismiss_error(state).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_token_subcommand() {
        let cli = Cli::try_parse_from(["ragchat", "store-token", "secret"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::StoreToken { token }) if token == "secret"));
        assert!(Cli::try_parse_from(["ragchat", "store-token"]).is_err());
    }

    #[test]
    fn test_use_case_flag() {
        let cli = Cli::try_parse_from(["ragchat", "--use-case", "HR"]).unwrap();
        assert_eq!(cli.use_case.as_deref(), Some("HR"));
        assert!(cli.command.is_none());
    }
}
