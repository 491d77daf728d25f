//! Slash commands for interactive mode

/// A parsed slash command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    /// Start a new conversation
    New,
    /// Switch to a stored conversation
    Open(String),
    /// List conversations seen in this run
    List,
    /// Attach files by path
    Attach(Vec<String>),
    /// Show attached files
    Files,
    /// Remove an attached file by its list number or id
    Remove(String),
    /// List models, or switch when a name is given
    Model(Option<String>),
    /// Show or set the agent
    Agent(Option<String>),
    /// Toggle web search, or set it explicitly
    Search(Option<bool>),
    /// Show or save the draft for this conversation
    Draft(Option<String>),
    /// Resend the last failed message
    Retry,
    Quit,
    Unknown(String),
    /// A command that needs an argument was given none
    Usage(&'static str),
}

/// Parse a line starting with `/`; anything else is a message
pub fn parse_command(input: &str) -> Option<Command> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or("").to_lowercase();
    let args = parts.next().map(str::trim).unwrap_or("");
    let arg = (!args.is_empty()).then(|| args.to_string());

    Some(match command.as_str() {
        "help" | "h" | "?" => Command::Help,
        "new" | "n" => Command::New,
        "open" | "o" => match arg {
            Some(id) => Command::Open(id),
            None => Command::Usage("/open <conversation-id>"),
        },
        "list" | "l" => Command::List,
        "attach" | "a" => {
            if args.is_empty() {
                Command::Usage("/attach <path> [path...]")
            } else {
                Command::Attach(args.split_whitespace().map(String::from).collect())
            }
        }
        "files" | "f" => Command::Files,
        "remove" | "rm" => match arg {
            Some(which) => Command::Remove(which),
            None => Command::Usage("/remove <number|id>"),
        },
        "model" | "m" | "models" => Command::Model(arg),
        "agent" => Command::Agent(arg),
        "search" | "s" => match args.to_lowercase().as_str() {
            "" => Command::Search(None),
            "on" | "true" | "yes" => Command::Search(Some(true)),
            "off" | "false" | "no" => Command::Search(Some(false)),
            _ => Command::Usage("/search [on|off]"),
        },
        "draft" | "d" => Command::Draft(arg),
        "retry" | "r" => Command::Retry,
        "quit" | "exit" | "q" => Command::Quit,
        _ => Command::Unknown(command),
    })
}

pub fn help_message() -> &'static str {
    r#"Available commands:
  /help, /h, /?          Show this help message
  /new, /n               Start a new conversation
  /open, /o <id>         Open a stored conversation
  /list, /l              List conversations from this run
  /attach, /a <path...>  Attach files to the next message
  /files, /f             Show attached files
  /remove, /rm <n|id>    Remove an attached file
  /model, /m [id]        List models or switch to one
  /agent [name]          Show or set the agent
  /search, /s [on|off]   Toggle web search
  /draft, /d [text]      Show or save a draft for this conversation
  /retry, /r             Resend the last failed message
  /quit, /q              Exit

Press Ctrl+C while a reply is streaming to stop it."#
}
