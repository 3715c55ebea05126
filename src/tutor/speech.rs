//! Speech-to-text and text-to-speech through the OpenAI audio API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

const TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Speech client. `synthesize` returning empty bytes means "unavailable,
/// send text only".
pub struct SpeechClient {
    api_key: Option<String>,
    client: reqwest::Client,
    dev_mode: Arc<AtomicBool>,
}

impl SpeechClient {
    pub fn new(api_key: Option<String>, dev_mode: Arc<AtomicBool>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            dev_mode,
        }
    }

    fn available(&self) -> Option<&str> {
        if self.dev_mode.load(Ordering::Relaxed) {
            return None;
        }
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }

    /// Transcribe a Telegram voice message (OGG Opus bytes) to English text.
    pub async fn transcribe(&self, ogg_data: Vec<u8>) -> Result<String, String> {
        let api_key = self.available().ok_or("Speech model unavailable")?;
        debug!("Transcribing {} bytes of audio", ogg_data.len());

        let part = reqwest::multipart::Part::bytes(ogg_data)
            .file_name("voice.ogg")
            .mime_str("audio/ogg")
            .map_err(|e| format!("Bad audio mime: {e}"))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", "whisper-1")
            .text("language", "en");

        let response = self
            .client
            .post(TRANSCRIPTION_URL)
            .bearer_auth(api_key)
            .timeout(REQUEST_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|e| format!("Transcription request failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Transcription error {}: {}", status, body));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse transcription response: {e}"))?;

        let text = data["text"].as_str().unwrap_or("").trim().to_string();
        info!("Transcribed: \"{}\"", text.chars().take(100).collect::<String>());
        Ok(text)
    }

    /// Synthesize speech for a teacher reply. Returns empty bytes when the
    /// provider is unavailable or fails, which callers treat as
    /// "text only".
    pub async fn synthesize(&self, text: &str) -> Vec<u8> {
        let api_key = match self.available() {
            Some(key) => key,
            None => return Vec::new(),
        };

        let preview: String = text.chars().take(50).collect();
        info!("🔊 TTS: \"{}\"", preview);

        let response = self
            .client
            .post(SPEECH_URL)
            .bearer_auth(api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&serde_json::json!({
                "model": "tts-1",
                "voice": "onyx",
                "input": text,
                "response_format": "opus",
            }))
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!("TTS error {}", r.status());
                return Vec::new();
            }
            Err(e) => {
                warn!("TTS request failed: {e}");
                return Vec::new();
            }
        };

        match response.bytes().await {
            Ok(bytes) => {
                debug!("Generated {} bytes of voice audio", bytes.len());
                bytes.to_vec()
            }
            Err(e) => {
                warn!("Failed to read TTS response: {e}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_without_key() {
        let dev_mode = Arc::new(AtomicBool::new(false));
        let client = SpeechClient::new(None, dev_mode);

        assert!(client.transcribe(vec![0u8; 16]).await.is_err());
        assert!(client.synthesize("hello").await.is_empty());
    }

    #[tokio::test]
    async fn test_dev_mode_forces_fallback() {
        let dev_mode = Arc::new(AtomicBool::new(true));
        let client = SpeechClient::new(Some("key".to_string()), dev_mode);

        assert!(client.transcribe(vec![0u8; 16]).await.is_err());
        assert!(client.synthesize("hello").await.is_empty());
    }
}
