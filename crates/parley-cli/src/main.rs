//! parley - line-mode chat client

mod commands;
mod config;
mod ui;

use clap::Parser;
use commands::Command;
use parley_api::ChatClient;
use parley_session::{
    AttachedFile, DraftStore, FileDraftBackend, FileUploadCoordinator, InMemoryConversationList,
    ModelCatalog, SendOptions, SendOutcome, Session,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// parley - chat with a streaming backend from the terminal
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend base URL (default: http://localhost:8000/api)
    #[arg(long)]
    api_url: Option<String>,

    /// Model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Agent to route the message to
    #[arg(short, long)]
    agent: Option<String>,

    /// Let the backend search the web
    #[arg(long)]
    web_search: bool,

    /// Continue an existing conversation by ID
    #[arg(long)]
    conversation: Option<String>,

    /// Send a single message and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Attach a file to the first message (repeatable)
    #[arg(long)]
    attach: Vec<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// List available models
    #[arg(long)]
    models: bool,
}

/// Per-send options the user can change between messages
#[derive(Debug, Clone, Default)]
struct Settings {
    model: Option<String>,
    agent: Option<String>,
    web_search: bool,
}

impl Settings {
    fn options(&self) -> SendOptions {
        let mut options = SendOptions::new().web_search(self.web_search);
        if let Some(model) = &self.model {
            options = options.model(model.clone());
        }
        if let Some(agent) = &self.agent {
            options = options.agent(agent.clone());
        }
        options
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("parley=debug,parley_api=debug,parley_session=debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();

    // CLI takes precedence over the config file
    let api_url = args
        .api_url
        .clone()
        .unwrap_or_else(|| cfg.api_url().to_string());
    let client = Arc::new(ChatClient::new(api_url));

    let mut catalog = ModelCatalog::load(client.as_ref()).await;
    if args.models {
        println!("{}", ui::render_models(&catalog));
        return Ok(());
    }

    let requested_model = args.model.clone().or(cfg.model.clone());
    let model = match requested_model {
        Some(id) if catalog.is_empty() || catalog.select(&id) => Some(id),
        Some(id) => {
            eprintln!("Warning: unknown model '{}', using the default", id);
            catalog.selected().map(|m| m.id.clone())
        }
        None => catalog.selected().map(|m| m.id.clone()),
    };
    let mut settings = Settings {
        model,
        agent: args.agent.clone().or(cfg.agent.clone()),
        web_search: args.web_search || cfg.web_search.unwrap_or(false),
    };

    let drafts = DraftStore::with_debounce(
        Arc::new(FileDraftBackend::new(cfg.drafts_path())),
        cfg.draft_debounce(),
    );
    let uploads = FileUploadCoordinator::new(client.clone(), cfg.uploads.clone());
    let conversations = Arc::new(InMemoryConversationList::new());

    let session = Session::builder(client.clone())
        .drafts(drafts.clone())
        .uploads(uploads.clone())
        .conversations(conversations.clone())
        .on_conversation_assigned(|id| tracing::info!("conversation assigned: /chat/{}", id))
        .build();

    if let Some(ref id) = args.conversation {
        match client.fetch_messages(id).await {
            Ok(messages) => {
                println!("Continuing conversation {} ({} messages)", id, messages.len());
                session.open_conversation(id.clone(), messages);
            }
            Err(e) => {
                eprintln!("Error loading conversation: {}", e);
                std::process::exit(1);
            }
        }
    }

    attach_paths(&uploads, &args.attach).await;

    let result = if let Some(command) = args.command {
        run_command(&session, &command, &settings).await
    } else {
        run_interactive(&session, &client, &conversations, &mut catalog, &mut settings).await
    };

    if drafts.has_pending() {
        tracing::debug!("writing pending drafts before exit");
        drafts.flush();
    }
    result
}

/// Read files from disk and hand them to the upload coordinator
async fn attach_paths(uploads: &FileUploadCoordinator, paths: &[PathBuf]) -> usize {
    let mut files = vec![];
    for path in paths {
        match AttachedFile::from_path(path).await {
            Ok(file) => files.push(file),
            Err(e) => eprintln!("Error reading {}: {}", path.display(), e),
        }
    }
    uploads.add_files(files).len()
}

/// Send one message, printing events as they arrive; Ctrl+C stops the reply
async fn send(session: &Session, input: Option<&str>, settings: &Settings) -> SendOutcome {
    let mut events = session.subscribe();
    let mut printer = ui::Printer::default();

    if let Some(uploads) = session.uploads() {
        if !uploads.is_settled() {
            eprintln!("Waiting for uploads to finish...");
            uploads.wait_settled().await;
        }
    }

    let send = async {
        match input {
            Some(text) => session.send_message(text, settings.options()).await,
            None => session.retry(settings.options()).await,
        }
    };
    tokio::pin!(send);

    let mut listening = true;
    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome,
            event = events.recv(), if listening => match event {
                Ok(event) => printer.print(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} session events", n);
                }
                Err(broadcast::error::RecvError::Closed) => listening = false,
            },
            _ = tokio::signal::ctrl_c() => {
                session.stop();
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        printer.print(&event);
    }
    outcome
}

/// What one prompt read produced
#[derive(Debug, PartialEq, Eq)]
enum Prompt {
    Line(String),
    Eof,
    Interrupted,
}

async fn read_prompt<R>(
    lines: &mut tokio::io::Lines<R>,
    interrupt: impl std::future::Future<Output = ()>,
) -> std::io::Result<Prompt>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    tokio::select! {
        line = lines.next_line() => Ok(line?.map_or(Prompt::Eof, Prompt::Line)),
        _ = interrupt => Ok(Prompt::Interrupted),
    }
}

async fn run_command(session: &Session, command: &str, settings: &Settings) -> anyhow::Result<()> {
    println!("parley> {}", command);
    println!();

    match send(session, Some(command), settings).await {
        SendOutcome::Completed(_) | SendOutcome::Stopped => Ok(()),
        SendOutcome::Ignored => anyhow::bail!("Nothing to send"),
        SendOutcome::Failed { kind, .. } => anyhow::bail!("Reply failed ({:?})", kind),
    }
}

async fn run_interactive(
    session: &Session,
    client: &ChatClient,
    conversations: &InMemoryConversationList,
    catalog: &mut ModelCatalog,
    settings: &mut Settings,
) -> anyhow::Result<()> {
    use std::io::Write;
    use tokio::io::{AsyncBufReadExt, BufReader};

    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!(
            "parley ({}) at {}",
            settings.model.as_deref().unwrap_or("default model"),
            client.base_url()
        );
        eprintln!("Type /help for commands.");
        eprintln!();
    }
    if let Some(draft) = session.load_draft() {
        println!("Draft: {}", draft);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        // Ctrl+C at the prompt exits; during a send it only stops the reply
        let interrupt = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let input = match read_prompt(&mut lines, interrupt).await? {
            Prompt::Line(line) => line,
            Prompt::Eof => break,
            Prompt::Interrupted => {
                println!();
                break;
            }
        };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        let Some(command) = commands::parse_command(input) else {
            session.update_draft(input);
            if let SendOutcome::Ignored = send(session, Some(input), settings).await {
                println!("A reply is still streaming.");
            }
            continue;
        };

        match command {
            Command::Help => println!("{}", commands::help_message()),
            Command::Quit => break,
            Command::New => {
                session.new_conversation();
                println!("Started a new conversation.");
            }
            Command::Open(id) => match client.fetch_messages(&id).await {
                Ok(messages) => {
                    for message in &messages {
                        println!("{}", ui::render_message(message));
                    }
                    session.open_conversation(id, messages);
                    if let Some(draft) = session.load_draft() {
                        println!("Draft: {}", draft);
                    }
                }
                Err(e) => eprintln!("Error loading conversation: {}", e),
            },
            Command::List => println!("{}", ui::render_conversations(&conversations.items())),
            Command::Attach(paths) => {
                if let Some(uploads) = session.uploads() {
                    let paths: Vec<PathBuf> = paths.into_iter().map(PathBuf::from).collect();
                    let added = attach_paths(uploads, &paths).await;
                    println!("Attached {} file(s).", added);
                }
            }
            Command::Files => {
                if let Some(uploads) = session.uploads() {
                    println!("{}", ui::render_files(&uploads.files()));
                }
            }
            Command::Remove(which) => {
                if let Some(uploads) = session.uploads() {
                    let files = uploads.files();
                    let id = match which.parse::<usize>() {
                        Ok(n) if n >= 1 && n <= files.len() => files[n - 1].id.clone(),
                        _ => which,
                    };
                    if uploads.remove_file(&id) {
                        println!("Removed.");
                    } else {
                        println!("No such file: {}", id);
                    }
                }
            }
            Command::Model(None) => {
                if catalog.is_empty() {
                    catalog.refresh(client).await;
                }
                println!("{}", ui::render_models(catalog));
            }
            Command::Model(Some(id)) => {
                if catalog.is_empty() || catalog.select(&id) {
                    println!("Switched to: {}", id);
                    settings.model = Some(id);
                } else {
                    println!("Unknown model: {}. Use /model to list models.", id);
                }
            }
            Command::Agent(None) => {
                println!("Agent: {}", settings.agent.as_deref().unwrap_or("(default)"))
            }
            Command::Agent(Some(agent)) => {
                println!("Agent set to: {}", agent);
                settings.agent = Some(agent);
            }
            Command::Search(value) => {
                settings.web_search = value.unwrap_or(!settings.web_search);
                println!(
                    "Web search {}",
                    if settings.web_search { "on" } else { "off" }
                );
            }
            Command::Draft(None) => match session.load_draft() {
                Some(draft) => println!("Draft: {}", draft),
                None => println!("No draft."),
            },
            Command::Draft(Some(text)) => {
                session.update_draft(&text);
                println!("Draft saved.");
            }
            Command::Retry => {
                if session.last_failed_input().is_none() {
                    println!("Nothing to retry.");
                } else {
                    send(session, None, settings).await;
                }
            }
            Command::Usage(usage) => println!("Usage: {}", usage),
            Command::Unknown(name) => {
                println!("Unknown command: /{}. Type /help for commands.", name)
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_prompt_reads_lines_then_eof() {
        let mut lines = BufReader::new(&b"hello\n/quit\n"[..]).lines();
        assert_eq!(
            read_prompt(&mut lines, std::future::pending()).await.unwrap(),
            Prompt::Line("hello".into())
        );
        assert_eq!(
            read_prompt(&mut lines, std::future::pending()).await.unwrap(),
            Prompt::Line("/quit".into())
        );
        assert_eq!(
            read_prompt(&mut lines, std::future::pending()).await.unwrap(),
            Prompt::Eof
        );
    }

    #[tokio::test]
    async fn test_interrupt_at_prompt_is_reported() {
        // Nothing is ever written, so the read stays pending
        let (_writer, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();
        assert_eq!(
            read_prompt(&mut lines, std::future::ready(())).await.unwrap(),
            Prompt::Interrupted
        );
    }
}
