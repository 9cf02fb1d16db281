mod api;
mod auth;
mod config;
mod error;
mod filter;
mod gateway;
mod history;
mod logging;
mod monitor;
mod normalize;
mod output;
mod realtime;
mod send;
mod session;
mod snapshot;
mod store;

use clap::{Args, Parser, Subcommand};
use dialoguer::{Input, Password, Select};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::auth::AuthStore;
use crate::config::Config;
use crate::filter::ChatFilter;
use crate::gateway::GatewaySession;
use crate::history::HistoryFetcher;
use crate::monitor::{Monitor, MonitorExit};
use crate::output::FilterCheck;
use crate::session::{ChatLookup, Session, retry_rate_limited};
use crate::store::JsonSnapshotFile;

const DEFAULT_CHATS_FILE: &str = "chats.json";
const DEFAULT_MONITOR_FILE: &str = "monitored_messages.json";
const HISTORY_PREVIEW_ROWS: usize = 20;

#[derive(Parser)]
#[command(
    name = "chatwatch",
    version,
    about = "Send, snapshot, page through and watch chats from the console",
    after_help = "Examples:\n  chatwatch auth login\n  chatwatch send --chat @rustaceans --text \"hello\"\n  chatwatch chats snapshot --output chats.json\n  chatwatch history --chat -1001234567890 --topic 7 --limit 500\n  chatwatch monitor --filter \"id=-1001234567890;topics=7,8\" --filter \"username=news\"\n  chatwatch filters check --filter \"title=Release notes\"\n  chatwatch            (interactive menu)"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(long, global = true, help = "Output JSON instead of a table")]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Save or clear the session token")]
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    #[command(about = "Send a message after checking you may post there")]
    Send(SendArgs),
    #[command(about = "Snapshot your chat list")]
    Chats {
        #[command(subcommand)]
        command: ChatsCommand,
    },
    #[command(about = "Page through a chat's history into a file")]
    History(HistoryArgs),
    #[command(about = "Listen for new messages matching filters")]
    Monitor(MonitorArgs),
    #[command(about = "Validate filter expressions without connecting")]
    Filters {
        #[command(subcommand)]
        command: FiltersCommand,
    },
}

#[derive(Subcommand)]
enum AuthCommand {
    #[command(about = "Store a session token for the configured gateway")]
    Login(AuthLoginArgs),
    #[command(about = "Clear the saved token")]
    Logout,
}

#[derive(Args)]
struct AuthLoginArgs {
    #[arg(long, help = "Session token (prompted when omitted)")]
    token: Option<String>,
}

#[derive(Args)]
struct SendArgs {
    #[arg(long, help = "Chat id, @username or t.me link")]
    chat: Option<String>,

    #[arg(long, help = "Message text")]
    text: Option<String>,

    #[arg(long, help = "Read message text from stdin")]
    stdin: bool,
}

#[derive(Subcommand)]
enum ChatsCommand {
    #[command(about = "Write all chats, with forum topics, to a JSON file")]
    Snapshot(ChatsSnapshotArgs),
}

#[derive(Args)]
struct ChatsSnapshotArgs {
    #[arg(long, default_value = DEFAULT_CHATS_FILE, help = "Output file")]
    output: PathBuf,
}

#[derive(Args)]
struct HistoryArgs {
    #[arg(long, help = "Chat id, @username or t.me link")]
    chat: Option<String>,

    #[arg(long, help = "Only messages in this forum topic")]
    topic: Option<i64>,

    #[arg(long, help = "Stop after roughly this many messages")]
    limit: Option<usize>,

    #[arg(long, help = "Output file (defaults to history_<chat id>.json)")]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct MonitorArgs {
    #[arg(long = "filter", value_name = "EXPR", help = "Filter like \"id=-100123;topics=7,8\" (repeatable)")]
    filters: Vec<String>,

    #[arg(long, help = "JSON file with an array of filters")]
    filters_file: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_MONITOR_FILE, help = "Output file")]
    output: PathBuf,
}

#[derive(Subcommand)]
enum FiltersCommand {
    #[command(about = "Parse filters and report what they match")]
    Check(FiltersCheckArgs),
}

#[derive(Args)]
struct FiltersCheckArgs {
    #[arg(long = "filter", value_name = "EXPR", help = "Filter expression (repeatable)")]
    filters: Vec<String>,

    #[arg(long, help = "JSON file with an array of filters")]
    filters_file: Option<PathBuf>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryReport {
    chat_id: i64,
    topic_id: Option<i64>,
    count: usize,
    output: PathBuf,
    complete: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MonitorReport {
    matched: usize,
    output: PathBuf,
    stream_closed: bool,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load();
    if let Err(error) = logging::init_logging(&config.log_filter, &config.log_file) {
        eprintln!("Logging disabled: {error}");
    }
    let auth_store = AuthStore::new(config.secrets_path.clone(), config.api_base_url.clone());

    let Some(command) = cli.command else {
        let mut session = connect(&config, &auth_store)?;
        let interrupts = Interrupts::install();
        return run_menu(&mut session, &interrupts).await;
    };

    match command {
        Command::Auth { command } => match command {
            AuthCommand::Login(args) => {
                let token = match args.token {
                    Some(token) => token,
                    None => Password::new().with_prompt("Session token").interact()?,
                };
                if token.trim().is_empty() {
                    return Err("token is empty".into());
                }
                auth_store.store_token(&token)?;
                println!("Token saved for {}.", config.api_base_url);
            }
            AuthCommand::Logout => {
                auth_store.clear_token()?;
                println!("Logged out.");
            }
        },
        Command::Send(args) => {
            let lookup = lookup_or_prompt(args.chat)?;
            let text = resolve_message_text(args.text, args.stdin)?;
            let mut session = connect(&config, &auth_store)?;
            run_send(&mut session, &lookup, &text, cli.json).await?;
        }
        Command::Chats { command } => match command {
            ChatsCommand::Snapshot(args) => {
                let mut session = connect(&config, &auth_store)?;
                run_snapshot(&mut session, &args.output, cli.json).await?;
            }
        },
        Command::History(args) => {
            let lookup = lookup_or_prompt(args.chat)?;
            let mut session = connect(&config, &auth_store)?;
            run_history(&mut session, &lookup, args.topic, args.limit, args.output, cli.json).await?;
        }
        Command::Monitor(args) => {
            let filters = collect_filters(&args.filters, args.filters_file.as_deref())?;
            let mut session = connect(&config, &auth_store)?;
            let interrupts = Interrupts::install();
            run_monitor(&mut session, filters, &args.output, cli.json, &interrupts).await?;
        }
        Command::Filters { command } => match command {
            FiltersCommand::Check(args) => {
                let filters = collect_filters(&args.filters, args.filters_file.as_deref())?;
                let checks: Vec<FilterCheck> = filters.into_iter().map(FilterCheck::new).collect();
                output::print_filter_checks(&checks, cli.json)?;
            }
        },
    }
    Ok(())
}

fn connect(config: &Config, auth_store: &AuthStore) -> Result<GatewaySession, Box<dyn std::error::Error>> {
    let token = auth_store
        .load_token()?
        .ok_or("Not logged in. Run `chatwatch auth login` or set CHATWATCH_TOKEN.")?;
    Ok(GatewaySession::new(
        config.api_base_url.clone(),
        config.realtime_url.clone(),
        token,
    ))
}

async fn run_menu<S: Session>(session: &mut S, interrupts: &Interrupts) -> Result<(), Box<dyn std::error::Error>> {
    let actions = [
        "Send a message",
        "Save chat list",
        "Fetch chat history",
        "Monitor chats",
        "Exit",
    ];

    loop {
        let selection = Select::new()
            .with_prompt("What would you like to do?")
            .items(&actions)
            .default(0)
            .interact()?;

        let result = match selection {
            0 => menu_send(session).await,
            1 => {
                let output = prompt_path("Output file", DEFAULT_CHATS_FILE)?;
                run_snapshot(session, &output, false).await
            }
            2 => menu_history(session).await,
            3 => menu_monitor(session, interrupts).await,
            _ => return Ok(()),
        };

        if let Err(error) = result {
            error!(%error, "action failed");
        }
    }
}

async fn menu_send<S: Session>(session: &mut S) -> Result<(), Box<dyn std::error::Error>> {
    let lookup = lookup_or_prompt(None)?;
    let text: String = Input::new().with_prompt("Message").interact_text()?;
    run_send(session, &lookup, &text, false).await
}

async fn menu_history<S: Session>(session: &mut S) -> Result<(), Box<dyn std::error::Error>> {
    let lookup = lookup_or_prompt(None)?;
    let topic = prompt_optional_number::<i64>("Topic id (blank for the whole chat)")?;
    let limit = prompt_optional_number::<usize>("Message limit (blank for everything)")?;
    run_history(session, &lookup, topic, limit, None, false).await
}

async fn menu_monitor<S: Session>(session: &mut S, interrupts: &Interrupts) -> Result<(), Box<dyn std::error::Error>> {
    let mut filters = Vec::new();
    loop {
        let expression: String = Input::new()
            .with_prompt("Filter (e.g. id=-100123;topics=7, * for everything, blank to start)")
            .allow_empty(true)
            .interact_text()?;
        if expression.trim().is_empty() {
            if filters.is_empty() {
                println!("Add at least one filter.");
                continue;
            }
            break;
        }
        match expression.parse::<ChatFilter>() {
            Ok(filter) => filters.push(filter),
            Err(error) => println!("{error}"),
        }
    }
    let output = prompt_path("Output file", DEFAULT_MONITOR_FILE)?;
    run_monitor(session, filters, &output, false, interrupts).await
}

async fn run_send<S: Session>(
    session: &mut S,
    lookup: &ChatLookup,
    text: &str,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = send::send_message(session, lookup, text).await?;
    output::print_send_outcome(&outcome, json)?;
    if !outcome.is_sent() {
        return Err(format!("message to {lookup} was not sent").into());
    }
    Ok(())
}

async fn run_snapshot<S: Session>(
    session: &mut S,
    output_path: &Path,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let chats = snapshot::snapshot_chats(session).await?;
    JsonSnapshotFile::new(output_path).save(&chats)?;
    info!(chats = chats.len(), path = %output_path.display(), "chat list saved");
    output::print_chat_list(&chats, json)?;
    Ok(())
}

async fn run_history<S: Session>(
    session: &mut S,
    lookup: &ChatLookup,
    topic_id: Option<i64>,
    limit: Option<usize>,
    output_path: Option<PathBuf>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let chat = match retry_rate_limited("resolve chat", async || session.resolve_chat(lookup).await).await {
        Ok(chat) => chat,
        Err(error) if error.is_not_found() => {
            println!("Chat {lookup} not found.");
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };
    let chat_id = chat.normalized_id();
    let output_path = output_path.unwrap_or_else(|| default_history_path(chat_id, topic_id));

    let mut messages = Vec::new();
    let mut fetcher = HistoryFetcher::new(session, chat, topic_id, limit);
    let result = fetcher.collect_into(&mut messages).await;
    if let Err(error) = &result {
        warn!(%error, fetched = fetcher.fetched(), "history sweep stopped early");
    }
    let complete = result.is_ok() && fetcher.is_finished();

    // Whatever was fetched is written even if the sweep failed part-way.
    JsonSnapshotFile::new(&output_path).save(&messages)?;
    info!(chat_id, count = messages.len(), path = %output_path.display(), "history saved");

    if json {
        output::print_json(&HistoryReport {
            chat_id,
            topic_id,
            count: messages.len(),
            output: output_path.clone(),
            complete,
        })?;
    } else {
        output::print_history(&messages, HISTORY_PREVIEW_ROWS, false)?;
        println!("Saved {} messages to {}.", messages.len(), output_path.display());
    }

    result?;
    Ok(())
}

async fn run_monitor<S: Session>(
    session: &mut S,
    filters: Vec<ChatFilter>,
    output_path: &Path,
    json: bool,
    interrupts: &Interrupts,
) -> Result<(), Box<dyn std::error::Error>> {
    for filter in filters.iter().filter(|filter| filter.is_match_all()) {
        warn!(%filter, "filter matches every message");
    }
    println!("Listening for new messages. Press Ctrl-C to stop.");

    let sink = JsonSnapshotFile::new(output_path);
    info!(filters = filters.len(), path = %sink.path().display(), "monitor started");
    let listener = interrupts.listen();
    let mut monitor = Monitor::new(session, filters, sink);
    let exit = monitor.run(listener.interrupted()).await;
    let matched = monitor.records().len();
    drop(listener);

    if json {
        output::print_json(&MonitorReport {
            matched,
            output: output_path.to_path_buf(),
            stream_closed: exit == MonitorExit::StreamClosed,
        })?;
    } else {
        println!("Stopped. {matched} matching messages saved to {}.", output_path.display());
    }
    Ok(())
}

/// Owns Ctrl-C for the whole process once installed. A press stops the
/// monitor that is currently listening, if any; otherwise it ends the process
/// the way the default SIGINT handling would.
#[derive(Clone, Default)]
struct Interrupts {
    listener: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl Interrupts {
    fn install() -> Self {
        let interrupts = Self::default();
        let router = interrupts.clone();
        tokio::spawn(async move {
            loop {
                if let Err(error) = tokio::signal::ctrl_c().await {
                    warn!(%error, "cannot listen for Ctrl-C");
                    return;
                }
                if !router.deliver() {
                    eprintln!("Interrupted.");
                    std::process::exit(130);
                }
            }
        });
        interrupts
    }

    /// Returns false when nothing is listening.
    fn deliver(&self) -> bool {
        match self.slot().as_ref() {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    fn listen(&self) -> InterruptListener {
        let notify = Arc::new(Notify::new());
        *self.slot() = Some(Arc::clone(&notify));
        InterruptListener {
            interrupts: self.clone(),
            notify,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Notify>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct InterruptListener {
    interrupts: Interrupts,
    notify: Arc<Notify>,
}

impl InterruptListener {
    async fn interrupted(&self) {
        self.notify.notified().await;
    }
}

impl Drop for InterruptListener {
    fn drop(&mut self) {
        *self.interrupts.slot() = None;
    }
}

fn collect_filters(
    expressions: &[String],
    filters_file: Option<&Path>,
) -> Result<Vec<ChatFilter>, Box<dyn std::error::Error>> {
    let mut filters: Vec<ChatFilter> = match filters_file {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .map_err(|error| format!("cannot read {}: {error}", path.display()))?;
            serde_json::from_str(&contents)?
        }
        None => Vec::new(),
    };
    for expression in expressions {
        filters.push(expression.parse()?);
    }
    if filters.is_empty() {
        return Err("Provide at least one --filter or --filters-file".into());
    }
    Ok(filters)
}

fn lookup_or_prompt(chat: Option<String>) -> Result<ChatLookup, Box<dyn std::error::Error>> {
    let raw = match chat {
        Some(chat) => chat,
        None => Input::new()
            .with_prompt("Chat (id, @username or t.me link)")
            .interact_text()?,
    };
    Ok(raw.parse()?)
}

fn resolve_message_text(text: Option<String>, stdin: bool) -> Result<String, Box<dyn std::error::Error>> {
    if stdin {
        use std::io::Read;
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        return Ok(buffer);
    }
    match text {
        Some(text) => Ok(text),
        None => Ok(Input::new().with_prompt("Message").interact_text()?),
    }
}

fn prompt_path(prompt: &str, default: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let value: String = Input::new()
        .with_prompt(prompt)
        .default(default.to_string())
        .interact_text()?;
    Ok(PathBuf::from(value.trim()))
}

fn prompt_optional_number<T>(prompt: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + 'static,
{
    let value: String = Input::new()
        .with_prompt(prompt)
        .allow_empty(true)
        .interact_text()?;
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    Ok(Some(value.parse::<T>()?))
}

fn default_history_path(chat_id: i64, topic_id: Option<i64>) -> PathBuf {
    match topic_id {
        Some(topic_id) => PathBuf::from(format!("history_{chat_id}_topic{topic_id}.json")),
        None => PathBuf::from(format!("history_{chat_id}.json")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_file_names() {
        assert_eq!(default_history_path(-100123, None), PathBuf::from("history_-100123.json"));
        assert_eq!(
            default_history_path(-100123, Some(7)),
            PathBuf::from("history_-100123_topic7.json")
        );
    }

    #[test]
    fn filters_need_at_least_one_source() {
        assert!(collect_filters(&[], None).is_err());
        let filters = collect_filters(&["id=-100123;topics=7".to_string(), "*".to_string()], None)
            .expect("valid filters");
        assert_eq!(filters.len(), 2);
        assert!(filters[1].is_match_all());
    }

    #[test]
    fn cli_parses_monitor_filters() {
        let cli = Cli::try_parse_from([
            "chatwatch",
            "monitor",
            "--filter",
            "id=-100123;topics=7",
            "--filter",
            "username=news",
            "--output",
            "out.json",
        ])
        .expect("valid args");
        let Some(Command::Monitor(args)) = cli.command else {
            panic!("expected monitor command");
        };
        assert_eq!(args.filters.len(), 2);
        assert_eq!(args.output, PathBuf::from("out.json"));
    }

    #[tokio::test]
    async fn interrupts_stop_only_a_listening_monitor() {
        let interrupts = Interrupts::default();
        assert!(!interrupts.deliver());

        let listener = interrupts.listen();
        assert!(interrupts.deliver());
        tokio::time::timeout(std::time::Duration::from_secs(1), listener.interrupted())
            .await
            .expect("listener is woken");

        drop(listener);
        assert!(!interrupts.deliver());
    }

    #[tokio::test]
    async fn a_new_listener_ignores_presses_meant_for_the_last_one() {
        let interrupts = Interrupts::default();
        let first = interrupts.listen();
        assert!(interrupts.deliver());
        drop(first);

        let second = interrupts.listen();
        let woken = tokio::time::timeout(std::time::Duration::from_millis(50), second.interrupted()).await;
        assert!(woken.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn history_resolves_through_rate_limits() {
        use crate::error::SessionError;
        use crate::session::ChatKind;
        use crate::session::fake::{FakeSession, chat};

        let mut session = FakeSession::with_history(1..=5);
        session.chats = vec![chat(123, ChatKind::Supergroup, "Group")];
        session.fail_next(
            "resolve_chat",
            SessionError::RateLimited {
                retry_after: std::time::Duration::from_secs(3),
            },
        );
        let output = std::env::temp_dir().join(format!("chatwatch-main-{}-history.json", std::process::id()));

        run_history(&mut session, &ChatLookup::Id(123), None, None, Some(output.clone()), true)
            .await
            .expect("history");

        let saved: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&output).expect("written")).expect("valid json");
        assert_eq!(saved.as_array().map(Vec::len), Some(5));
        let _ = fs::remove_file(output);
    }

    #[test]
    fn cli_defaults_to_the_menu() {
        let cli = Cli::try_parse_from(["chatwatch"]).expect("valid args");
        assert!(cli.command.is_none());
        assert!(!cli.json);
    }
}
