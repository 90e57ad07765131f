//! classline-live: run the realtime client against a broker from the
//! terminal. One session per concern (chat, notifications, tasks), a
//! periodic state snapshot in the logs, ctrl-c for a clean teardown.

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use classline_realtime::{HistoryLoader, LiveSession, RealtimeConfig, Topic};

#[derive(Parser, Debug)]
#[command(name = "classline-live", about = "Classline realtime client")]
struct Args {
    /// Websocket broker endpoint, e.g. wss://live.classline.app/ws
    #[arg(long, env = "CLASSLINE_BROKER_URL")]
    broker_url: String,

    /// REST base for history pagination, e.g. https://api.classline.app
    #[arg(long, env = "CLASSLINE_API_URL")]
    api_url: String,

    /// Bearer credential for both transports
    #[arg(long, env = "CLASSLINE_TOKEN")]
    token: String,

    /// Authenticated user id
    #[arg(long, env = "CLASSLINE_USER_ID")]
    user_id: String,

    /// Scope (course) to join for chat
    #[arg(long, env = "CLASSLINE_SCOPE")]
    scope: String,

    /// Role hint sent at connect time
    #[arg(long, env = "CLASSLINE_ROLE")]
    role: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let args = Args::parse();
    let config = RealtimeConfig::from_env();

    let chat = LiveSession::new(
        config.clone(),
        &args.broker_url,
        &args.token,
        args.role.clone(),
        vec![Topic::ScopeChat {
            scope: args.scope.clone(),
        }],
    );
    let notifications = LiveSession::new(
        config.clone(),
        &args.broker_url,
        &args.token,
        args.role.clone(),
        vec![
            Topic::UserNotifications {
                user_id: args.user_id.clone(),
            },
            Topic::UserUnread {
                user_id: args.user_id.clone(),
            },
        ],
    );
    let tasks = LiveSession::new(
        config.clone(),
        &args.broker_url,
        &args.token,
        args.role.clone(),
        vec![Topic::ScopeTasks {
            scope: args.scope.clone(),
        }],
    );

    let chat_handle = chat.spawn();
    let notifications_handle = notifications.spawn();
    let tasks_handle = tasks.spawn();

    // Backfill the first history page. Page 0 replaces the message list,
    // so this runs once at startup, before the backlog matters.
    let loader = HistoryLoader::new(&config, &args.api_url, &args.scope, &args.token)?;
    match chat.load_history(&loader, 0).await {
        Ok(has_more) => info!(has_more, "loaded initial history page"),
        Err(e) => warn!(error = %e, "initial history load failed"),
    }

    let snapshot_chat = chat.clone();
    let snapshot_notifications = notifications.clone();
    let snapshot_tasks = tasks.clone();
    let snapshot = tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(30));
        loop {
            tick.tick().await;
            let (messages, typing, online) = {
                let chat_state = snapshot_chat.stores().chat.read();
                (
                    chat_state.messages().len(),
                    chat_state.typing_users().len(),
                    chat_state.online_count(),
                )
            };
            let unread = snapshot_notifications
                .stores()
                .notifications
                .read()
                .unread_total();
            let tracked = snapshot_tasks.stores().tasks.read().tracked_count();
            info!(
                link = %snapshot_chat.state(),
                messages,
                typing,
                online,
                unread,
                tracked_tasks = tracked,
                "session snapshot"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    snapshot.abort();
    chat.teardown();
    notifications.teardown();
    tasks.teardown();

    let _ = chat_handle.await;
    let _ = notifications_handle.await;
    let _ = tasks_handle.await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classline_realtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
