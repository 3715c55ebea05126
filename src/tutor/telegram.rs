//! Telegram client using teloxide.

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{FileId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile};
use tracing::{info, warn};

/// Callback data for the lesson keyboard.
pub const CALLBACK_CONTINUE_LESSON: &str = "learn_lesson";
pub const CALLBACK_CHAT_WITH_TEACHER: &str = "chat_with_teacher";

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, String> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map(|msg| msg.id.0 as i64)
            .map_err(|e| {
                let msg = format!("Failed to send to {chat_id}: {e}");
                warn!("{}", msg);
                msg
            })
    }

    /// Send a voice message (OGG Opus bytes) with the reply text as caption.
    pub async fn send_voice(
        &self,
        chat_id: i64,
        voice_data: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<i64, String> {
        info!("🔊 Sending voice to {} ({} bytes)", chat_id, voice_data.len());

        let input_file = InputFile::memory(voice_data).file_name("voice.ogg");
        let mut request = self.bot.send_voice(ChatId(chat_id), input_file);
        if let Some(cap) = caption {
            request = request.caption(cap);
        }

        request.await.map(|msg| msg.id.0 as i64).map_err(|e| {
            let msg = format!("Failed to send voice to {chat_id}: {e}");
            warn!("{}", msg);
            msg
        })
    }

    /// Send the continue-lesson / chat-with-teacher choice keyboard.
    pub async fn send_lesson_keyboard(&self, chat_id: i64, text: &str) -> Result<i64, String> {
        let keyboard = InlineKeyboardMarkup::new(vec![vec![
            InlineKeyboardButton::callback("📚 Continue lesson", CALLBACK_CONTINUE_LESSON),
            InlineKeyboardButton::callback("💬 Ask the teacher", CALLBACK_CHAT_WITH_TEACHER),
        ]]);

        self.bot
            .send_message(ChatId(chat_id), text)
            .reply_markup(keyboard)
            .await
            .map(|msg| msg.id.0 as i64)
            .map_err(|e| {
                let msg = format!("Failed to send keyboard to {chat_id}: {e}");
                warn!("{}", msg);
                msg
            })
    }

    /// Download a voice message by file id. Returns OGG Opus bytes.
    pub async fn download_voice(&self, file_id: &str) -> Result<Vec<u8>, String> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(|e| format!("Failed to get file info: {e}"))?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| format!("Failed to download file: {e}"))?;

        info!("📥 Downloaded voice ({} bytes)", data.len());
        Ok(data)
    }
}
