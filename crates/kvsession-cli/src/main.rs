use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use kvsession_engine::{InferenceEngine, TokenId};
use kvsession_runtime::{
    ConversationContext, LogTelemetry, ReferenceEngine, RuntimeConfig, SessionError,
    SessionRegistry, StreamChunk,
};
use kvsession_store::{SessionDirectories, SnapshotStore, StoreError};
use tracing_subscriber::EnvFilter;

/// kvsession: resumable conversations over the reference engine
#[derive(Parser)]
#[command(name = "kvsession", version)]
struct Cli {
    /// JSON runtime configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root of the per-user conversation directories.
    #[arg(long, global = true)]
    sessions_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start an interactive chat.
    Chat {
        #[arg(short, long)]
        user: String,

        /// Resume an existing conversation instead of allocating a new one.
        #[arg(long)]
        conversation: Option<String>,

        /// Write one interaction file per turn.
        #[arg(long)]
        save_interactions: bool,

        /// Generated tokens per streamed chunk.
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Manage stored conversations.
    Convo {
        #[command(subcommand)]
        action: ConvoAction,
    },

    /// Print the interaction history of a conversation.
    Replay {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        conversation: String,
    },
}

#[derive(clap::Subcommand)]
enum ConvoAction {
    /// List conversation names.
    List {
        #[arg(short, long)]
        user: String,
    },
    /// Delete a conversation.
    Delete {
        #[arg(short, long)]
        user: String,
        name: String,
    },
    /// Rename a conversation.
    Rename {
        #[arg(short, long)]
        user: String,
        old: String,
        new: String,
    },
    /// Delete every numbered conversation.
    Erase {
        #[arg(short, long)]
        user: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, CliError>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(root) = cli.sessions_root {
        config = config.with_sessions_root(root);
    }

    match cli.command {
        Command::Chat {
            user,
            conversation,
            save_interactions,
            chunk_size,
        } => {
            if let Some(n) = chunk_size {
                config = config.with_chunk_size(n);
            }
            let save = save_interactions || config.save_interactions;
            chat(config, &user, conversation.as_deref(), save)
        }
        Command::Convo { action } => convo(&SessionDirectories::new(&config.sessions_root), action),
        Command::Replay { user, conversation } => {
            let dirs = SessionDirectories::new(&config.sessions_root);
            replay(&dirs, &user, &conversation)
        }
    }
}

fn chat(config: RuntimeConfig, user: &str, conversation: Option<&str>, save: bool) -> Result<()> {
    let mut registry = SessionRegistry::new(config.session_timeout());
    let mut ctx = ConversationContext::new(ReferenceEngine::default(), config)?;
    let session = registry.register(user, save);

    match conversation {
        Some(name) => {
            let restored = ctx.open(user, name, save)?;
            println!(
                "Resumed conversation {name} ({} tokens{})",
                ctx.tokens().len(),
                if restored { ", from checkpoint" } else { "" }
            );
        }
        None => {
            let dir = ctx.connect(user, save)?;
            println!("New conversation at {}", dir.display());
        }
    }
    println!("Commands: /quit /clear /checkpoint /restore <path> /merge <path>");
    println!("          /list /delete <name> /rename <old> <new> /erase");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        if !registry.touch(&session) {
            println!("Session expired after {}s idle.", ctx.config().session_timeout_secs);
            break;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        match line.strip_prefix('/') {
            Some(command) => println!("{}", slash_command(&mut ctx, user, command)),
            None => stream(&mut ctx, line)?,
        }
    }

    registry.remove(&session);
    Ok(())
}

fn stream(ctx: &mut ConversationContext<ReferenceEngine>, prompt: &str) -> Result<()> {
    let mut stdout = io::stdout();
    for chunk in ctx.generate_with(prompt, Box::new(LogTelemetry::new())) {
        match chunk {
            StreamChunk::Text(text) => {
                print!("{text}");
                stdout.flush()?;
            }
            StreamChunk::Error(message) => print!("[error: {message}]"),
            StreamChunk::Done => println!(),
        }
    }
    if let Some(r) = ctx.last_report() {
        println!(
            "({} tokens, {:.1} tok/s, memory {}..{})",
            r.generated_tokens, r.tokens_per_sec, r.start_offset, r.end_offset
        );
    }
    Ok(())
}

/// Run one chat slash command (without the leading `/`) and describe the outcome.
fn slash_command<E: InferenceEngine>(
    ctx: &mut ConversationContext<E>,
    user: &str,
    command: &str,
) -> String {
    let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
    let arg = arg.trim();
    let outcome: std::result::Result<String, SessionError> = match (name, arg) {
        ("clear", _) => {
            ctx.clear();
            Ok("Context cleared.".to_string())
        }
        ("checkpoint", _) => ctx.checkpoint().map(|p| format!("Saved {}", p.display())),
        ("restore", path) if !path.is_empty() => ctx
            .restore(Path::new(path))
            .map(|()| format!("Restored {} tokens", ctx.tokens().len())),
        ("merge", path) if !path.is_empty() => ctx
            .merge(Path::new(path))
            .map(|r| format!("Reused {} positions, re-fed {}", r.occupied_length, r.refed)),
        ("list", _) => ctx
            .directories()
            .list(user)
            .map(|names| names.join(" "))
            .map_err(Into::into),
        ("delete", conversation) if !conversation.is_empty() => ctx
            .directories()
            .delete(user, conversation)
            .map(|()| format!("Deleted {conversation}"))
            .map_err(Into::into),
        ("rename", args) => match args.split_whitespace().collect::<Vec<_>>()[..] {
            [old, new] => ctx
                .directories()
                .rename(user, old, new)
                .map(|_| format!("Renamed {old} to {new}"))
                .map_err(Into::into),
            _ => return "Usage: /rename <old> <new>".to_string(),
        },
        ("erase", _) => ctx
            .directories()
            .erase_all_except_active(user)
            .map(|n| format!("Erased {n} conversations"))
            .map_err(Into::into),
        _ => return format!("Unknown command: /{command}"),
    };
    match outcome {
        Ok(message) => message,
        Err(e) => format!("Failed: {e}"),
    }
}

fn convo(dirs: &SessionDirectories, action: ConvoAction) -> Result<()> {
    match action {
        ConvoAction::List { user } => {
            for name in dirs.list(&user)? {
                println!("{name}");
            }
        }
        ConvoAction::Delete { user, name } => {
            dirs.delete(&user, &name)?;
            println!("Deleted {name}");
        }
        ConvoAction::Rename { user, old, new } => {
            dirs.rename(&user, &old, &new)?;
            println!("Renamed {old} to {new}");
        }
        ConvoAction::Erase { user } => {
            let removed = dirs.erase_all_except_active(&user)?;
            println!("Erased {removed} conversations");
        }
    }
    Ok(())
}

fn replay(dirs: &SessionDirectories, user: &str, conversation: &str) -> Result<()> {
    let dir = dirs.conversation_path(user, conversation)?;
    if !dir.is_dir() {
        return Err(StoreError::ConversationNotFound {
            username: user.to_string(),
            name: conversation.to_string(),
        }
        .into());
    }

    let engine = ReferenceEngine::default();
    let text = |ids: &[TokenId]| engine.decode(ids).unwrap_or_else(|_| format!("{ids:?}"));
    for (i, turn) in SnapshotStore::load_all_interactions(&dir)?.iter().enumerate() {
        println!("#{i} [{}..{}]", turn.start_offset, turn.end_offset);
        println!("  user:      {}", text(&turn.prompt_ids));
        println!("  assistant: {}", text(&turn.response_ids));
    }
    Ok(())
}
