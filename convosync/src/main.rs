//! `convosync` — headless conversation sync client.
//!
//! Logs in (or joins the session another instance already holds), follows
//! one conversation and reads commands from stdin. Every input line counts
//! as user activity; the process exits when the session expires.
//!
//! ```bash
//! convosync --backend-url ws://127.0.0.1:9400/realtime --principal alice \
//!     --conversation general
//! ```
//!
//! Commands: plain text sends, `/retry <client-id>`, `/read`, `/list`,
//! `/logout`, `/quit`.

use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use convosync::backend::ws::WsBackend;
use convosync::config::{CliArgs, ClientConfig, ConfigError};
use convosync::crypto::MessageEnvelope;
use convosync::error::{ErrorKind, user_message};
use convosync::kv::{FileKv, KeyValueStore, KvError, TtlCache};
use convosync::send::{ConversationSender, SendPipeline};
use convosync::session::{
    ActivityKind, SessionEvent, SessionHandle, SessionManager, SessionStatus, SystemClock,
};
use convosync::store::{Action, DeliveryStatus, EncryptionTag, Message, StoreHandle};
use convosync::sync::{RealtimeSync, SyncEvent};
use convosync_proto::conversation::Conversation;
use convosync_proto::message::{ClientId, ConversationId, PrincipalId};

/// Cache namespace of the conversation list shown before the first sync.
const CONVERSATIONS_CACHE: &str = "conversations";

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] KvError),

    #[error("missing setting: {0}")]
    Missing(&'static str),

    #[error("stdin: {0}")]
    Input(#[from] std::io::Error),
}

impl AppError {
    const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Missing(_) => ErrorKind::ConfigurationAbsent,
            Self::Input(_) => ErrorKind::InvalidInput,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("convosync starting");

    let result = run(&cli, &config).await;
    tracing::info!("convosync exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, kind = %e.kind(), "fatal error");
            eprintln!("{} ({e})", user_message(e.kind()));
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file so they do not interleave with the conversation on
/// stdout. The returned guard must be held for the process lifetime.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("convosync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_env("CONVOSYNC_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

fn start_session(
    kv: &Arc<dyn KeyValueStore>,
    config: &ClientConfig,
    principal: &PrincipalId,
    remember_me: bool,
) -> Result<SessionHandle, AppError> {
    let mut manager = SessionManager::new(
        Arc::clone(kv),
        Arc::new(SystemClock),
        config.session.policy,
    );
    match manager.resume(principal.clone())? {
        Some(status) if status != SessionStatus::Expired => {
            println!("Joined existing session ({status})");
        }
        _ => {
            let status = manager.login(principal.clone(), remember_me)?;
            println!("Logged in as {principal} ({status})");
        }
    }
    Ok(SessionHandle::spawn(
        manager,
        config.session.driver(config.network.channel_capacity),
    ))
}

#[allow(clippy::too_many_lines)]
async fn run(cli: &CliArgs, config: &ClientConfig) -> Result<(), AppError> {
    let principal = config
        .network
        .principal
        .clone()
        .ok_or(AppError::Missing("principal"))?;
    let url = config
        .network
        .backend_url
        .clone()
        .ok_or(AppError::Missing("backend_url"))?;
    let cipher = config.messaging.cipher()?;

    let kv: Arc<dyn KeyValueStore> = Arc::new(FileKv::open(&config.state_file));
    let cache = TtlCache::new(Arc::clone(&kv));
    let mut session = start_session(&kv, config, &principal, cli.remember_me)?;

    let (store, effects) = StoreHandle::new(principal.clone());
    match cache.get::<Vec<Conversation>>(CONVERSATIONS_CACHE, Utc::now()) {
        Ok(Some(cached)) => {
            tracing::debug!(count = cached.len(), "seeding store from cache");
            store.dispatch(Action::LoadConversations(cached));
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "conversation cache unavailable"),
    }

    let backend = Arc::new(
        WsBackend::new(url, principal.clone())
            .with_request_timeout(config.network.request_timeout)
            .with_notification_capacity(config.network.channel_capacity),
    );
    let mut sync = RealtimeSync::spawn(
        Arc::clone(&backend),
        store.clone(),
        effects,
        principal.clone(),
        MessageEnvelope::new(config.messaging.encryption_enabled, cipher.clone()),
        config.sync(),
    );
    let pipeline = SendPipeline::new(
        backend,
        store.clone(),
        principal,
        config.messaging.encryption_enabled,
        cipher,
    );

    let mut sender: Option<ConversationSender<WsBackend>> = None;
    if let Some(id) = cli.conversation.as_deref().map(ConversationId::new) {
        sync.open(id.clone()).await;
        let opened = pipeline.open_conversation(id);
        println!(
            "Following {} ({})",
            opened.conversation(),
            if opened.is_encrypted() { "encrypted" } else { "unencrypted" }
        );
        sender = Some(opened);
    }

    let mut revision = store.subscribe();
    let mut seen: HashMap<String, DeliveryStatus> = HashMap::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                session.record(ActivityKind::Keyboard);
                if !handle_line(line.trim(), &store, sender.as_ref(), &session).await {
                    break;
                }
            }
            event = session.next_event() => match event {
                Some(SessionEvent::Warning { remaining }) => {
                    println!(
                        "Session expires in {}s without activity. Press enter to stay signed in.",
                        remaining.as_secs()
                    );
                }
                Some(SessionEvent::Resumed) => println!("Session resumed."),
                Some(SessionEvent::Expired) => {
                    println!("Session expired. Signed out.");
                    break;
                }
                Some(SessionEvent::LoggedOut) | None => {
                    println!("Signed out.");
                    break;
                }
            },
            event = sync.next_event() => match event {
                Some(SyncEvent::Connected) => println!("Connected."),
                Some(SyncEvent::Disconnected { attempt, retry_in }) => {
                    println!(
                        "{} (attempt {attempt}, retrying in {}ms)",
                        user_message(ErrorKind::TransientNetwork),
                        retry_in.as_millis()
                    );
                }
                Some(SyncEvent::Resynced { conversations }) => {
                    tracing::debug!(conversations, "resynced");
                    cache_conversations(&cache, &store);
                }
                Some(SyncEvent::Presence { principal, status }) => {
                    println!("* {principal} is {status}");
                }
                None => break,
            },
            changed = revision.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(sender) = sender.as_ref() {
                    print_changes(&store, sender.conversation(), &mut seen);
                }
            }
        }
    }

    sync.shutdown().await;
    Ok(())
}

/// Handles one input line. Returns `false` to stop.
async fn handle_line(
    line: &str,
    store: &StoreHandle,
    sender: Option<&ConversationSender<WsBackend>>,
    session: &SessionHandle,
) -> bool {
    match line {
        "" => {}
        "/quit" => return false,
        "/logout" => session.logout().await,
        "/list" => store.read(|s| {
            for conversation in s.conversations() {
                println!(
                    "{:>4}  {}  {}",
                    conversation.unread_count,
                    conversation.id,
                    conversation.last_message_preview.as_deref().unwrap_or("")
                );
            }
        }),
        "/read" => match sender {
            Some(sender) => {
                store.dispatch(Action::MarkRead(sender.conversation().clone()));
            }
            None => println!("No conversation open."),
        },
        _ if line.starts_with("/retry") => {
            let Some(sender) = sender else {
                println!("No conversation open.");
                return true;
            };
            match line["/retry".len()..].trim().parse::<ClientId>() {
                Ok(client_id) => {
                    if let Err(e) = sender.retry(client_id) {
                        println!("{} ({e})", user_message(e.kind()));
                    }
                }
                Err(_) => println!("Usage: /retry <client-id>"),
            }
        }
        text => match sender {
            Some(sender) => {
                if let Err(e) = sender.send(text) {
                    println!("{} ({e})", user_message(e.kind()));
                }
            }
            None => println!("No conversation open; start with --conversation."),
        },
    }
    true
}

fn cache_conversations(cache: &TtlCache, store: &StoreHandle) {
    let list: Vec<Conversation> =
        store.read(|s| s.conversations().into_iter().cloned().collect());
    if let Err(e) = cache.put(CONVERSATIONS_CACHE, &list, TimeDelta::hours(24), Utc::now()) {
        tracing::warn!(error = %e, "could not cache conversation list");
    }
}

fn message_key(message: &Message) -> Option<String> {
    message
        .client_id
        .map(|id| id.to_string())
        .or_else(|| message.server_id.as_ref().map(ToString::to_string))
}

/// Prints messages that are new or whose delivery status changed.
fn print_changes(
    store: &StoreHandle,
    conversation: &ConversationId,
    seen: &mut HashMap<String, DeliveryStatus>,
) {
    let lines: Vec<String> = store.read(|s| {
        s.messages(conversation)
            .into_iter()
            .filter_map(|message| {
                let key = message_key(message)?;
                if seen.get(&key) == Some(&message.status) {
                    return None;
                }
                seen.insert(key, message.status.clone());
                Some(format_message(message))
            })
            .collect()
    });
    for line in lines {
        println!("{line}");
    }
}

fn format_message(message: &Message) -> String {
    let lock = match message.encryption {
        EncryptionTag::Encrypted => " [enc]",
        EncryptionTag::Unencrypted => "",
    };
    let status = match &message.status {
        DeliveryStatus::Pending => "sending".to_string(),
        DeliveryStatus::Sent => "sent".to_string(),
        DeliveryStatus::Delivered => "delivered".to_string(),
        DeliveryStatus::Failed(reason) => match message.client_id {
            Some(id) => format!("failed: {reason}; /retry {id}"),
            None => format!("failed: {reason}"),
        },
    };
    let content = match message.content.as_text() {
        Some(text) => text.to_string(),
        None => message.content.preview(),
    };
    format!("{}{lock}: {content}  ({status})", message.sender_id)
}
