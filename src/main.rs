mod config;
mod tutor;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use config::Config;
use tutor::{Database, DialogueClient, LessonScheduler, Orchestrator, SpeechClient, TelegramClient};

struct BotState {
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<LessonScheduler>,
    dev_mode: Arc<AtomicBool>,
    config: Arc<Config>,
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "snake_case")]
enum Command {
    /// Register and start studying.
    Start,
    /// Show configuration health.
    Status,
    /// Toggle the offline fallback mode.
    DevMode,
    /// Send a scheduler test message.
    TestScheduler,
    /// Re-arm the scheduler jobs.
    RestartScheduler,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "marcus.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging: stdout plus a rolling file under data_dir/logs.
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("marcus.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting marcus...");
    info!("Loaded config from {config_path}");
    if config.dev_mode {
        info!("DEV MODE enabled: all provider calls use fallbacks");
    }

    let database = match Database::open(&config.data_dir.join("marcus.db")) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    if let Some(ref topics_path) = config.topics_path
        && let Err(e) = database.seed_topics_from_file(topics_path)
    {
        warn!("Topic seeding failed: {e}");
    }

    let bot = Bot::new(&config.telegram_bot_token);

    // Construct the collaborators once and inject them.
    let dev_mode = Arc::new(AtomicBool::new(config.dev_mode));
    let dialogue = Arc::new(DialogueClient::new(config.openai_api_key.clone(), dev_mode.clone()));
    let speech = Arc::new(SpeechClient::new(config.openai_api_key.clone(), dev_mode.clone()));
    let telegram = Arc::new(TelegramClient::new(bot.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        database,
        dialogue,
        speech,
        telegram,
    ));

    let scheduler = Arc::new(LessonScheduler::new(orchestrator.clone()));
    if let Err(e) = scheduler.start() {
        eprintln!("Failed to start scheduler: {e}");
        std::process::exit(1);
    }

    let state = Arc::new(BotState {
        orchestrator,
        scheduler,
        dev_mode,
        config,
    });

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn sender_name(msg: &Message) -> String {
    msg.from
        .as_ref()
        .map(|u| u.full_name())
        .unwrap_or_else(|| "student".to_string())
}

async fn handle_command(
    msg: Message,
    command: Command,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    let Some(ref user) = msg.from else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;

    match command {
        Command::Start => state.orchestrator.handle_start(user_id).await,
        Command::Status => {
            let dev = state.dev_mode.load(Ordering::Relaxed);
            let status = format!(
                "🔍 Bot status:\n\n\
                 🤖 OpenAI API: {}\n\
                 👥 Group chat: {}\n\
                 ⏰ Lessons: Mon-Fri {:02}:{:02} ({})\n\
                 💭 Reinforcement: every {} min\n\
                 🎤 Mode: {}",
                if state.config.openai_api_key.is_some() { "✅" } else { "❌" },
                if state.config.group_chat_id.is_some() { "✅" } else { "❌" },
                state.config.lesson_hour,
                state.config.lesson_minute,
                state.config.timezone,
                state.config.reinforcement_interval_minutes,
                if dev { "🔧 DEV (fallbacks only)" } else { "🚀 PRODUCTION" },
            );
            let _ = state.orchestrator.telegram.send_message(user_id, &status).await;
        }
        Command::DevMode => {
            let now_on = !state.dev_mode.load(Ordering::Relaxed);
            state.dev_mode.store(now_on, Ordering::Relaxed);
            info!("🔧 Dev mode toggled to {} by {}", now_on, user_id);
            let text = if now_on {
                "🔧 Dev mode ON: speech and dialogue run on deterministic fallbacks."
            } else {
                "🚀 Dev mode OFF: providers back in use."
            };
            let _ = state.orchestrator.telegram.send_message(user_id, text).await;
        }
        Command::TestScheduler => {
            let text = match state.scheduler.send_test_message(user_id).await {
                Ok(()) => "✅ Scheduler test message sent!".to_string(),
                Err(e) => format!("❌ Scheduler error: {e}"),
            };
            let _ = state.orchestrator.telegram.send_message(user_id, &text).await;
        }
        Command::RestartScheduler => {
            let text = match state.scheduler.restart() {
                Ok(()) => "✅ Scheduler restarted with current settings!".to_string(),
                Err(e) => format!("❌ Failed to restart scheduler: {e}"),
            };
            let _ = state.orchestrator.telegram.send_message(user_id, &text).await;
        }
    }

    Ok(())
}

async fn handle_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(ref user) = msg.from else {
        return Ok(());
    };
    if user.is_bot {
        return Ok(());
    }
    let user_id = user.id.0 as i64;
    let name = sender_name(&msg);

    if let Some(voice) = msg.voice() {
        info!("🎤 Voice from {} ({})", name, user_id);
        state
            .orchestrator
            .handle_voice(user_id, &name, &voice.file.id.0)
            .await;
    } else if let Some(text) = msg.text() {
        let preview: String = text.chars().take(50).collect();
        info!("📨 {} ({}): \"{}\"", name, user_id, preview);
        state.orchestrator.handle_text(user_id, &name, text).await;
    }

    Ok(())
}

async fn handle_callback(bot: Bot, query: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    let user_id = query.from.id.0 as i64;
    let Some(ref data) = query.data else {
        return Ok(());
    };

    // Acknowledge so the client stops its spinner.
    bot.answer_callback_query(query.id.clone()).await.ok();

    info!("🔘 Callback '{}' from {}", data, user_id);
    state.orchestrator.handle_callback(user_id, data).await;

    Ok(())
}
