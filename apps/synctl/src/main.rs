use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use shared::{
    domain::{AttachmentRef, ChannelId, Conversation, MessageId, PrivateChatId, UserId},
    error::ApiError,
    protocol::Message,
};
use storage::{BlobStore, HttpBlobStore, MissingBlobStore, SqliteDocumentStore};
use sync_core::{
    config::{load_settings, prepare_database_url},
    ChatSync, ChatSyncOptions, ConversationView, MessageRef, SyncError, SyncEvent, ThreadView,
    WriteOutcome,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Drive the chat sync core against a local document store")]
struct Cli {
    /// User id the commands act as.
    #[arg(long = "as")]
    viewer: String,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    blob_base_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConversationArgs {
    #[arg(long, conflicts_with = "with", required_unless_present = "with")]
    channel: Option<String>,
    /// Peer user id of a private chat.
    #[arg(long)]
    with: Option<String>,
}

#[derive(Args, Debug)]
struct TargetArgs {
    #[command(flatten)]
    conversation: ConversationArgs,
    /// Parent message id when the target is a thread reply.
    #[arg(long, requires = "channel")]
    parent: Option<String>,
    #[arg(long)]
    message: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    Post {
        #[command(flatten)]
        conversation: ConversationArgs,
        content: String,
        #[arg(long = "attachment")]
        attachments: Vec<String>,
    },
    Reply {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        parent: String,
        content: String,
        #[arg(long = "attachment")]
        attachments: Vec<String>,
    },
    React {
        #[command(flatten)]
        target: TargetArgs,
        emoji: String,
    },
    Edit {
        #[command(flatten)]
        target: TargetArgs,
        content: String,
    },
    Delete {
        #[command(flatten)]
        target: TargetArgs,
    },
    Show {
        #[command(flatten)]
        conversation: ConversationArgs,
    },
    Thread {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        parent: String,
    },
    /// Prints every change until interrupted.
    Watch {
        #[command(flatten)]
        conversation: ConversationArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(database_url) = cli.database_url.clone() {
        settings.database_url = database_url;
    }
    if let Some(blob_base_url) = cli.blob_base_url.clone() {
        settings.blob_base_url = Some(blob_base_url);
    }

    let database_url = prepare_database_url(&settings.database_url);
    let store = SqliteDocumentStore::new(&database_url)
        .await
        .with_context(|| format!("failed to open document store at {database_url}"))?;
    store.health_check().await?;
    let blobs: Arc<dyn BlobStore> = match settings.blob_base_url.as_deref() {
        Some(base_url) => Arc::new(HttpBlobStore::new(base_url)?),
        None => Arc::new(MissingBlobStore),
    };
    info!(%database_url, blobs = settings.blob_base_url.is_some(), "synctl: store ready");

    let viewer = UserId::new(cli.viewer.clone());
    let sync = ChatSync::new(
        viewer.clone(),
        Arc::new(store),
        blobs,
        ChatSyncOptions::from_settings(&settings),
    );

    let result = run(&sync, &viewer, cli.command).await;
    sync.shutdown().await;
    result
}

async fn run(sync: &ChatSync, viewer: &UserId, command: Command) -> Result<()> {
    match command {
        Command::Post {
            conversation,
            content,
            attachments,
        } => {
            let conversation = resolve_conversation(viewer, &conversation)?;
            let message = sync
                .send_message(&conversation, content, attachment_refs(attachments))
                .await
                .map_err(report)?;
            println!("sent {} to {conversation}", message.id);
        }
        Command::Reply {
            channel,
            parent,
            content,
            attachments,
        } => {
            let reply = sync
                .send_reply(
                    &ChannelId::new(channel),
                    &MessageId::new(parent),
                    content,
                    attachment_refs(attachments),
                )
                .await
                .map_err(report)?;
            println!("sent reply {}", reply.id);
        }
        Command::React { target, emoji } => {
            let target = load_target(sync, viewer, &target).await?;
            let outcome = sync.react(&target, &emoji).await.map_err(report)?;
            print_outcome(&target, outcome);
        }
        Command::Edit { target, content } => {
            let target = load_target(sync, viewer, &target).await?;
            let outcome = sync.edit(&target, &content).await.map_err(report)?;
            print_outcome(&target, outcome);
        }
        Command::Delete { target } => {
            let target = load_target(sync, viewer, &target).await?;
            let outcome = sync.delete(&target).await.map_err(report)?;
            print_outcome(&target, outcome);
        }
        Command::Show { conversation } => {
            let conversation = resolve_conversation(viewer, &conversation)?;
            let view = sync
                .open_conversation(&conversation)
                .await
                .map_err(report)?;
            print_view(&view, viewer);
        }
        Command::Thread { channel, parent } => {
            let channel_id = ChannelId::new(channel);
            sync.select_thread(&channel_id, &MessageId::new(parent))
                .await
                .map_err(report)?;
            if let Some(thread) = sync.active_thread().await {
                print_thread(&thread);
            }
        }
        Command::Watch { conversation } => {
            let conversation = resolve_conversation(viewer, &conversation)?;
            let view = sync
                .open_conversation(&conversation)
                .await
                .map_err(report)?;
            print_view(&view, viewer);
            let mut events = sync.subscribe_events();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event, viewer),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            eprintln!("(skipped {skipped} events)");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }
    Ok(())
}

fn resolve_conversation(viewer: &UserId, args: &ConversationArgs) -> Result<Conversation> {
    match (&args.channel, &args.with) {
        (Some(channel), None) => Ok(Conversation::Channel(ChannelId::new(channel.clone()))),
        (None, Some(peer)) => {
            let chat_id = PrivateChatId::for_participants(viewer, &UserId::new(peer.clone()))?;
            Ok(Conversation::Private(chat_id))
        }
        _ => bail!("pass exactly one of --channel or --with"),
    }
}

/// Loads the conversation (and thread) holding the target so edits act on current state.
async fn load_target(sync: &ChatSync, viewer: &UserId, args: &TargetArgs) -> Result<MessageRef> {
    let conversation = resolve_conversation(viewer, &args.conversation)?;
    let message_id = MessageId::new(args.message.clone());
    let target = match (&conversation, &args.parent) {
        (Conversation::Channel(channel_id), Some(parent)) => {
            let parent_id = MessageId::new(parent.clone());
            sync.select_thread(channel_id, &parent_id)
                .await
                .map_err(report)?;
            MessageRef::Reply {
                channel_id: channel_id.clone(),
                parent_id,
                reply_id: message_id,
            }
        }
        (Conversation::Channel(channel_id), None) => MessageRef::Channel {
            channel_id: channel_id.clone(),
            message_id,
        },
        (Conversation::Private(chat_id), _) => MessageRef::Private {
            chat_id: chat_id.clone(),
            message_id,
        },
    };
    sync.open_conversation(&conversation)
        .await
        .map_err(report)?;
    Ok(target)
}

fn attachment_refs(raw: Vec<String>) -> Vec<AttachmentRef> {
    raw.into_iter().map(AttachmentRef::new).collect()
}

fn report(err: SyncError) -> anyhow::Error {
    let api = ApiError::from(&err);
    anyhow::anyhow!("{:?}: {}", api.code, api.message)
}

fn print_outcome(target: &MessageRef, outcome: WriteOutcome) {
    match outcome {
        WriteOutcome::Applied => println!("updated {}", target.message_id()),
        WriteOutcome::Deleted => println!("deleted {}", target.message_id()),
        WriteOutcome::Skipped(reason) => {
            println!("skipped {} ({reason:?})", target.message_id())
        }
    }
}

fn print_view(view: &ConversationView, viewer: &UserId) {
    let title = match &view.conversation {
        Conversation::Private(chat_id) => match chat_id.peer_of(viewer) {
            Ok(Some(peer)) => format!("chat with {peer}"),
            _ => view.conversation.to_string(),
        },
        Conversation::Channel(_) => view.conversation.to_string(),
    };
    println!("== {title} ({} messages)", view.len());
    for message in view.ordered() {
        print_message(message, "");
    }
}

fn print_thread(thread: &ThreadView) {
    println!("== thread {} ({} replies)", thread.parent_id, thread.replies.len());
    for reply in thread.ordered() {
        print_message(reply, "  ");
    }
}

fn print_message(message: &Message, indent: &str) {
    let reactions: Vec<String> = message
        .reactions
        .iter()
        .map(|reaction| format!("{}x{}", reaction.emoji, reaction.count))
        .collect();
    let attachments = if message.attachment_refs.is_empty() {
        String::new()
    } else {
        format!(" +{} attachment(s)", message.attachment_refs.len())
    };
    println!(
        "{indent}[{}] {} {}: {}{attachments} {}",
        message.id,
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.author_id,
        message.content,
        reactions.join(" ")
    );
}

fn print_event(event: &SyncEvent, viewer: &UserId) {
    match event {
        SyncEvent::ConversationChanged { view, .. } => print_view(view, viewer),
        SyncEvent::ActiveThreadChanged(Some(thread)) => print_thread(thread),
        SyncEvent::ActiveThreadChanged(None) => println!("== thread closed"),
        SyncEvent::ReactionUpdated { message, .. } => print_message(message, "* "),
        SyncEvent::EditRolledBack { message, reason } => {
            println!("! edit of {} rolled back: {reason}", message.id)
        }
        SyncEvent::ReplicationDegraded {
            chat_id,
            message_id,
            failed_owner,
            reason,
        } => println!("! {chat_id}/{message_id}: copy of {failed_owner} is behind: {reason}"),
    }
}
