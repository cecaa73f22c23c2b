//! streamchat interactive client
//!
//! Type a message to send it. Ctrl-C stops a reply that is still streaming,
//! or exits when nothing is in flight. `/help` lists the commands.

use async_trait::async_trait;
use crossterm::style::Stylize;
use crossterm::{cursor, execute, terminal};
use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;
use streamchat::config::{ClientConfig, ClientTarget};
use streamchat::kv::SqliteKv;
use streamchat::store::{ConversationStore, ConversationSummary, StoreEvent};
use streamchat::stream::{
    ChatTransport, ChunkStream, RejectReason, RelayRequest, RelayTransport, StreamConsumer,
    StreamError, TurnOutcome,
};
use streamchat::transcript::{render_terminal, EMPTY_STATE, EMPTY_STATE_HINT, TYPING_INDICATOR};
use streamchat::upstream::WorkflowClient;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Relay or direct wiring, picked at startup
enum Transport {
    Relay(RelayTransport),
    Direct(WorkflowClient),
}

#[async_trait]
impl ChatTransport for Transport {
    async fn open(&self, request: &RelayRequest) -> Result<ChunkStream, StreamError> {
        match self {
            Transport::Relay(relay) => relay.open(request).await,
            Transport::Direct(client) => client.open(request).await,
        }
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    streamchat::telemetry::init_cli();

    let config = ClientConfig::from_env();

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.db_path.display(), "Opening chat storage");
    let kv = SqliteKv::open(&config.db_path)?;
    let store = ConversationStore::load(Arc::new(kv));

    let transport = match config.target {
        ClientTarget::Relay { url } => {
            tracing::info!(url = %url, "Using relay");
            Transport::Relay(RelayTransport::new(url))
        }
        ClientTarget::Direct(upstream) => {
            if upstream.api_key.is_none() {
                tracing::warn!("Direct mode without STREAMCHAT_API_KEY");
            }
            Transport::Direct(WorkflowClient::new(upstream))
        }
    };

    let consumer =
        StreamConsumer::new(store, transport).with_session_policy(config.session_policy);

    let repl = Repl { consumer };
    repl.run().await
}

// ============================================================
// Commands
// ============================================================

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(String),
    New,
    List,
    Select(String),
    Delete,
    Rename(String),
    Clear,
    Show,
    Help,
    Quit,
    Unknown(String),
}

/// `None` for a blank line
fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };

    let (name, arg) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(name, arg)| (name, arg.trim()));

    Some(match name {
        "new" => Command::New,
        "list" | "ls" => Command::List,
        "select" | "open" => Command::Select(arg.to_string()),
        "delete" | "rm" => Command::Delete,
        "rename" => Command::Rename(arg.to_string()),
        "clear" => Command::Clear,
        "show" => Command::Show,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    })
}

/// Resolve a 1-based list position or an id (prefix) to a conversation id
fn resolve_conversation(summaries: &[ConversationSummary], arg: &str) -> Option<String> {
    if arg.is_empty() {
        return None;
    }
    if let Ok(n) = arg.parse::<usize>() {
        return n
            .checked_sub(1)
            .and_then(|i| summaries.get(i))
            .map(|s| s.id.clone());
    }
    summaries
        .iter()
        .find(|s| s.id == arg)
        .or_else(|| summaries.iter().find(|s| s.id.starts_with(arg)))
        .map(|s| s.id.clone())
}

const HELP: &str = "\
Commands:
  /new              start a new conversation
  /list             list conversations
  /select <n|id>    switch to a conversation
  /rename <title>   rename the current conversation
  /delete           delete the current conversation
  /clear            delete every conversation
  /show             redraw the current conversation
  /quit             exit
Anything else is sent as a message. Ctrl-C stops a streaming reply.";

// ============================================================
// Repl
// ============================================================

struct Repl<T: ChatTransport> {
    consumer: StreamConsumer<T>,
}

impl<T: ChatTransport> Repl<T> {
    fn store(&self) -> &ConversationStore {
        self.consumer.store()
    }

    async fn run(&self) -> CliResult<()> {
        self.show_transcript()?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            self.prompt()?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                println!();
                break;
            };

            match parse_command(&line) {
                None => {}
                Some(Command::Quit) => break,
                Some(command) => self.handle(command).await?,
            }
        }
        Ok(())
    }

    fn prompt(&self) -> CliResult<()> {
        let title = self.store().active_conversation()?.map(|c| c.title);
        let mut out = io::stdout();
        match title {
            Some(title) => write!(out, "{} {} ", title.dim(), ">".bold())?,
            None => write!(out, "{} ", ">".bold())?,
        }
        out.flush()?;
        Ok(())
    }

    async fn handle(&self, command: Command) -> CliResult<()> {
        match command {
            Command::Send(text) => self.send_turn(&text).await?,
            Command::New => {
                let id = self.store().create_conversation()?;
                if let Some(conversation) = self.store().conversation(&id)? {
                    println!("{}", format!("Started {}", conversation.title).dim());
                }
            }
            Command::List => self.list()?,
            Command::Select(arg) => {
                let target = resolve_conversation(&self.store().summaries()?, &arg);
                match target {
                    Some(id) if self.store().select_conversation(&id)? => self.show_transcript()?,
                    _ => eprintln!("{}", format!("No conversation matches '{arg}'").red()),
                }
            }
            Command::Delete => match self.store().active_id()? {
                Some(id) => {
                    self.store().delete_conversation(&id)?;
                    println!("{}", "Conversation deleted".dim());
                    self.show_transcript()?;
                }
                None => eprintln!("{}", "No active conversation".red()),
            },
            Command::Rename(title) => {
                if title.trim().is_empty() {
                    eprintln!("{}", "Title cannot be empty".red());
                    return Ok(());
                }
                match self.store().active_id()? {
                    Some(id) => {
                        self.store().rename_conversation(&id, &title)?;
                    }
                    None => eprintln!("{}", "No active conversation".red()),
                }
            }
            Command::Clear => {
                self.store().clear_all()?;
                println!("{}", "Cleared all conversations".dim());
            }
            Command::Show => self.show_transcript()?,
            Command::Help => println!("{HELP}"),
            Command::Unknown(name) => {
                eprintln!("{}", format!("Unknown command /{name}, try /help").red());
            }
            Command::Quit => {}
        }
        Ok(())
    }

    fn list(&self) -> CliResult<()> {
        let summaries = self.store().summaries()?;
        if summaries.is_empty() {
            println!("{}", "No conversations yet".dim());
        }
        for (i, summary) in summaries.iter().enumerate() {
            let marker = if summary.is_active { "*" } else { " " };
            let line = format!(
                "{marker} {:>2}. {}  ({})",
                i + 1,
                summary.title,
                summary.count_label()
            );
            if summary.is_active {
                println!("{}", line.bold());
            } else {
                println!("{line}");
            }
            if let Some(preview) = &summary.preview {
                println!("       {}", preview.as_str().dim());
            }
        }
        Ok(())
    }

    fn show_transcript(&self) -> CliResult<()> {
        match self.store().active_conversation()? {
            None => {
                println!("{}", EMPTY_STATE.bold());
                println!("{}", EMPTY_STATE_HINT.dim());
            }
            Some(conversation) => {
                println!("{}", conversation.title.as_str().bold().underlined());
                for line in render_terminal(
                    &conversation.messages,
                    terminal_width(),
                    self.consumer.is_loading(),
                ) {
                    println!("{line}");
                }
            }
        }
        Ok(())
    }

    /// Send one message and print the reply as it streams in
    async fn send_turn(&self, text: &str) -> CliResult<()> {
        let mut events = self.store().subscribe();
        let stop = self.consumer.stop_handle();

        let mut out = io::stdout();
        writeln!(out, "{}", "Assistant".green().bold())?;
        write!(out, "{}", TYPING_INDICATOR.dim())?;
        out.flush()?;
        let mut printer = ReplyPrinter::new();

        let turn = self.consumer.send(text);
        tokio::pin!(turn);

        let outcome = loop {
            tokio::select! {
                outcome = &mut turn => break outcome,
                _ = tokio::signal::ctrl_c() => {
                    stop.stop();
                }
                event = events.recv() => match event {
                    Ok(StoreEvent::MessageAppended { conversation_id }) => {
                        printer.follow(conversation_id);
                    }
                    Ok(StoreEvent::MessagePatched { conversation_id }) => {
                        if printer.follows(&conversation_id) {
                            printer.refresh(self.store())?;
                        }
                    }
                    // A later patch carries the full text
                    Ok(_) | Err(RecvError::Lagged(_)) | Err(RecvError::Closed) => {}
                },
            }
        };

        printer.refresh(self.store())?;
        printer.finish()?;

        match outcome {
            TurnOutcome::Completed | TurnOutcome::Cancelled => {}
            TurnOutcome::Failed(e) => {
                tracing::debug!(kind = ?e.kind, "Turn failed");
            }
            TurnOutcome::Rejected(RejectReason::Busy) => {
                eprintln!("{}", "Still waiting for the previous reply".red());
            }
            TurnOutcome::Rejected(RejectReason::EmptyInput) => {}
        }
        Ok(())
    }
}

fn terminal_width() -> usize {
    terminal::size().map_or(80, |(cols, _)| usize::from(cols))
}

/// Prints only the part of the reply not yet on screen
struct ReplyPrinter {
    conversation: Option<String>,
    printed: String,
    typing: bool,
}

impl ReplyPrinter {
    fn new() -> Self {
        Self {
            conversation: None,
            printed: String::new(),
            typing: true,
        }
    }

    /// Track the first conversation a message is appended to
    fn follow(&mut self, conversation_id: String) {
        if self.conversation.is_none() {
            self.conversation = Some(conversation_id);
        }
    }

    fn follows(&self, conversation_id: &str) -> bool {
        self.conversation.as_deref() == Some(conversation_id)
    }

    fn refresh(&mut self, store: &ConversationStore) -> CliResult<()> {
        let Some(id) = &self.conversation else {
            return Ok(());
        };
        let text = store
            .conversation(id)?
            .and_then(|c| c.last_message().map(|m| m.text.clone()))
            .unwrap_or_default();
        self.show(&text)?;
        Ok(())
    }

    fn show(&mut self, text: &str) -> io::Result<()> {
        if text.is_empty() || text == self.printed {
            return Ok(());
        }
        let mut out = io::stdout();
        if self.typing {
            execute!(
                out,
                cursor::MoveToColumn(0),
                terminal::Clear(terminal::ClearType::CurrentLine)
            )?;
            self.typing = false;
        }
        match new_suffix(&self.printed, text) {
            Some(rest) => write!(out, "{rest}")?,
            None => write!(out, "\n{text}")?,
        }
        out.flush()?;
        self.printed = text.to_string();
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        let mut out = io::stdout();
        if self.typing {
            execute!(
                out,
                cursor::MoveToColumn(0),
                terminal::Clear(terminal::ClearType::CurrentLine)
            )?;
        } else {
            writeln!(out)?;
        }
        out.flush()
    }
}

/// Text appended since `printed`, or `None` if earlier text changed
fn new_suffix<'a>(printed: &str, text: &'a str) -> Option<&'a str> {
    text.strip_prefix(printed)
}
