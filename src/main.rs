use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chatstream::backend::HttpChatApi;
use chatstream::client::Client;
use chatstream::controller::{ChatConfig, ChatController, FAILURE_APOLOGY, TurnOutcome};
use chatstream::error::ChatError;
use chatstream::message::Role;
use chatstream::upload::{LocalFile, MemoryPreviews, TusUploader, UploadStatus};
use clap::Parser;
use config::{Settings, load_env_file};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Path of the tus endpoint under the API base
const UPLOAD_PATH: &str = "/files/upload";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Resume an existing conversation
    #[arg(long)]
    conversation: Option<String>,

    #[arg(long, short)]
    tracing: bool,

    /// Request complete answers instead of streamed ones
    #[arg(long)]
    no_stream: bool,

    /// Base URL of the chat backend
    #[arg(long, env = "CHATSTREAM_API_BASE")]
    api_base: Option<String>,

    #[arg(long, env = "CHATSTREAM_PROJECT")]
    project: Option<String>,

    #[arg(long, env = "CHATSTREAM_MODEL")]
    model: Option<String>,
}

fn setup_tracing(enable: bool) {
    if enable {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,chatstream=debug"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Setting default subscriber failed");
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::new("error"))
            .with_writer(std::io::sink)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Setting default subscriber failed");
    }
}

// Slash command parsing
mod commands {
    use std::path::PathBuf;

    pub enum Command {
        Quit,
        Help,
        Regenerate,
        Attach(PathBuf),
    }

    impl Command {
        pub fn parse(input: &str) -> Result<Self, String> {
            let Some(rest) = input.strip_prefix('/') else {
                return Err("Not a command".to_string());
            };
            let (name, arg) = match rest.split_once(char::is_whitespace) {
                Some((name, arg)) => (name, arg.trim()),
                None => (rest, ""),
            };
            match name {
                "quit" | "exit" => Ok(Command::Quit),
                "help" => Ok(Command::Help),
                "regenerate" => Ok(Command::Regenerate),
                "attach" if arg.is_empty() => Err("Usage: /attach <path>".to_string()),
                "attach" => Ok(Command::Attach(PathBuf::from(arg))),
                "" => Err("Empty command".to_string()),
                _ => Err(format!("Unknown command: /{}. Type /help for available commands.", name)),
            }
        }
    }

    pub fn print_help() {
        println!("Available commands:");
        println!("  /attach <path>   - Upload a file and send it with the next prompt");
        println!("  /regenerate      - Answer the last prompt again");
        println!("  /quit, /exit     - Exit the chat");
        println!("  /help            - Show this help message");
        println!("  Ctrl+C           - Stop the answer in progress");
        println!("  Ctrl+D           - Exit the chat");
    }
}

/// Tracks how much of the newest assistant message has been written to stdout
#[derive(Default)]
struct Printer {
    message_id: Option<String>,
    printed: usize,
}

impl Printer {
    async fn start(controller: &ChatController) -> Self {
        let (message_id, printed) = controller
            .state()
            .read(|s| {
                s.messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::Assistant)
                    .map(|m| (Some(m.id.clone()), m.text().map(str::len).unwrap_or(0)))
                    .unwrap_or_default()
            })
            .await;
        Self { message_id, printed }
    }

    async fn flush(&mut self, controller: &ChatController) -> anyhow::Result<()> {
        let latest = controller
            .state()
            .read(|s| {
                s.messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::Assistant)
                    .map(|m| (m.id.clone(), m.text().unwrap_or("").to_string()))
            })
            .await;
        let Some((id, text)) = latest else {
            return Ok(());
        };
        if self.message_id.as_deref() != Some(id.as_str()) || text.len() < self.printed {
            self.message_id = Some(id);
            self.printed = 0;
        }
        if let Some(delta) = text.get(self.printed..).filter(|d| !d.is_empty()) {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(delta.as_bytes()).await?;
            stdout.flush().await?;
            self.printed = text.len();
        }
        Ok(())
    }
}

/// Drive one turn, printing the answer as it grows. Ctrl-C stops the turn.
async fn run_turn(
    controller: &ChatController,
    turn: impl Future<Output = Result<TurnOutcome, ChatError>>,
) -> anyhow::Result<()> {
    let mut printer = Printer::start(controller).await;
    let mut changes = controller.subscribe();
    tokio::pin!(turn);

    let outcome = loop {
        tokio::select! {
            outcome = &mut turn => break outcome,
            Ok(()) = changes.changed() => printer.flush(controller).await?,
            _ = tokio::signal::ctrl_c() => controller.stop().await,
        }
    };

    match outcome {
        Ok(TurnOutcome::Completed(_)) => {
            printer.flush(controller).await?;
            println!();
        }
        Ok(TurnOutcome::Cancelled) => println!("\n[stopped]"),
        Ok(TurnOutcome::Failed(e)) => {
            println!("\n{}", FAILURE_APOLOGY);
            eprintln!("Error [{}]: {}", e.code(), e);
        }
        Err(e) => eprintln!("{}", e),
    }
    println!();
    Ok(())
}

async fn attach(controller: &ChatController, path: PathBuf) -> anyhow::Result<()> {
    let file = LocalFile::read(&path).await?;
    println!("Uploading {} ({} bytes)...", file.name, file.size());
    let ids = controller.add_files(vec![file]).await;
    for entry in controller.files().await.iter().filter(|f| ids.contains(&f.id)) {
        match entry.status {
            UploadStatus::Uploaded => println!("Attached {}", entry.file.name),
            _ => eprintln!(
                "Failed to upload {}: {}",
                entry.file.name,
                entry.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env_file();
    let args = Args::parse();

    setup_tracing(args.tracing);

    let mut settings = Settings::load();
    if let Some(api_base) = args.api_base {
        settings.api_base = api_base;
    }
    if let Some(project) = args.project {
        settings.project_code = Some(project);
    }
    if let Some(model) = args.model {
        settings.model = model;
    }
    if args.no_stream {
        settings.streaming = false;
    }

    let client = match &settings.token {
        Some(token) => Client::with_token(&settings.api_base, token)?,
        None => Client::new(&settings.api_base),
    };
    let api = Arc::new(HttpChatApi::new(client.clone()));
    let uploader = TusUploader::new(client.clone(), client.url(UPLOAD_PATH));
    let controller = ChatController::new(ChatConfig::from_settings(&settings), api.clone(), api)
        .with_uploader(Arc::new(uploader), Arc::new(MemoryPreviews::new()));

    println!("{} • {}", settings.api_base, settings.model);
    if let Some(code) = &args.conversation {
        println!("Resuming conversation {}", code);
        match controller.open(code).await {
            Ok(_) => {
                for message in controller.messages().await {
                    let who = match message.role {
                        Role::User => "you",
                        Role::Assistant => "assistant",
                    };
                    println!("{}: {}\n", who, message.text().unwrap_or(""));
                }
                if let Some(e) = controller.error().await {
                    eprintln!("Last turn failed: {}", e);
                }
            }
            Err(e) => eprintln!("Failed to load conversation: {}", e),
        }
    }
    println!("Type /help for commands, Ctrl+D or /quit to exit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::Write::flush(&mut std::io::stdout())?;

        let Some(line) = lines.next_line().await? else {
            println!();
            println!("Goodbye!");
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            match commands::Command::parse(input) {
                Ok(commands::Command::Quit) => {
                    println!("Goodbye!");
                    break;
                }
                Ok(commands::Command::Help) => commands::print_help(),
                Ok(commands::Command::Regenerate) => match controller.last_chat_id().await {
                    Some(turn_id) => run_turn(&controller, controller.regenerate(&turn_id)).await?,
                    None => eprintln!("Nothing to regenerate yet."),
                },
                Ok(commands::Command::Attach(path)) => {
                    if let Err(e) = attach(&controller, path).await {
                        eprintln!("Failed to attach file: {:#}", e);
                    }
                }
                Err(e) => eprintln!("{}", e),
            }
            continue;
        }

        controller.set_prompt(input).await;
        run_turn(&controller, controller.send()).await?;
    }

    if let Some(code) = controller.conversation_code().await {
        println!("Conversation: {}", code);
    }
    Ok(())
}
