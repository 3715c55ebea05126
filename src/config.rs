use chrono_tz::Tz;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    /// OpenAI API key for dialogue, transcription and TTS.
    /// Empty or absent means the deterministic fallbacks are always used.
    #[serde(default)]
    openai_api_key: String,
    /// Group chat that receives lesson summaries and homework answers.
    group_chat_id: Option<i64>,
    /// Directory for state files (database, logs). Defaults to current directory.
    data_dir: Option<String>,
    /// IANA timezone for the scheduler.
    #[serde(default = "default_timezone")]
    timezone: String,
    /// Local time of the weekday lesson, "HH:MM".
    #[serde(default = "default_lesson_time")]
    lesson_time: String,
    /// Minutes between reinforcement questions.
    #[serde(default = "default_reinforcement_interval")]
    reinforcement_interval_minutes: u32,
    /// Correct lesson turns before homework is issued in-lesson.
    /// 0 keeps lessons open-ended; homework then comes from the weekly job.
    #[serde(default)]
    lesson_turns: u32,
    /// Start with all provider calls on their fallbacks.
    #[serde(default)]
    dev_mode: bool,
    /// JSON file of topics to seed an empty database with.
    topics_path: Option<String>,
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_lesson_time() -> String {
    "12:00".to_string()
}

fn default_reinforcement_interval() -> u32 {
    180
}

pub struct Config {
    pub telegram_bot_token: String,
    pub openai_api_key: Option<String>,
    pub group_chat_id: Option<i64>,
    pub data_dir: PathBuf,
    pub timezone: Tz,
    pub lesson_hour: u32,
    pub lesson_minute: u32,
    pub reinforcement_interval_minutes: u32,
    pub lesson_turns: u32,
    pub dev_mode: bool,
    pub topics_path: Option<PathBuf>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }

        let timezone: Tz = file.timezone.parse().map_err(|_| {
            ConfigError::Validation(format!("unknown timezone '{}'", file.timezone))
        })?;

        let (lesson_hour, lesson_minute) = parse_lesson_time(&file.lesson_time)
            .ok_or_else(|| {
                ConfigError::Validation(format!("lesson_time '{}' is not HH:MM", file.lesson_time))
            })?;

        if file.reinforcement_interval_minutes == 0 {
            return Err(ConfigError::Validation(
                "reinforcement_interval_minutes must be at least 1".into(),
            ));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            openai_api_key: Some(file.openai_api_key).filter(|k| !k.is_empty()),
            group_chat_id: file.group_chat_id,
            data_dir,
            timezone,
            lesson_hour,
            lesson_minute,
            reinforcement_interval_minutes: file.reinforcement_interval_minutes,
            lesson_turns: file.lesson_turns,
            dev_mode: file.dev_mode,
            topics_path: file.topics_path.map(PathBuf::from),
        })
    }
}

fn parse_lesson_time(s: &str) -> Option<(u32, u32)> {
    let (hour, minute) = s.split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn assert_err<T>(result: Result<T, ConfigError>) -> ConfigError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_valid_config() {
        let file = write_config(
            r#"{
            "telegram_bot_token": "123456789:ABCdefGHIjklMNOpqrsTUVwxyz",
            "openai_api_key": "sk-test",
            "group_chat_id": -100200300,
            "timezone": "Europe/Moscow",
            "lesson_time": "09:30",
            "reinforcement_interval_minutes": 120
        }"#,
        );
        let config = Config::load(file.path()).expect("should load valid config");
        assert_eq!(config.group_chat_id, Some(-100200300));
        assert_eq!(config.lesson_hour, 9);
        assert_eq!(config.lesson_minute, 30);
        assert_eq!(config.reinforcement_interval_minutes, 120);
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_defaults() {
        let file = write_config(r#"{"telegram_bot_token": "123456789:ABCdef"}"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.timezone, chrono_tz::Asia::Shanghai);
        assert_eq!(config.lesson_hour, 12);
        assert_eq!(config.reinforcement_interval_minutes, 180);
        assert_eq!(config.lesson_turns, 0);
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_empty_token() {
        let file = write_config(r#"{"telegram_bot_token": ""}"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("telegram_bot_token"));
    }

    #[test]
    fn test_invalid_token_format() {
        for token in ["no_colon_here", "notanumber:ABCdef", "123456789:"] {
            let file = write_config(&format!(r#"{{"telegram_bot_token": "{token}"}}"#));
            let err = assert_err(Config::load(file.path()));
            assert!(matches!(err, ConfigError::Validation(_)));
        }
    }

    #[test]
    fn test_unknown_timezone() {
        let file = write_config(
            r#"{"telegram_bot_token": "123456789:ABCdef", "timezone": "Mars/Olympus"}"#,
        );
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("timezone"));
    }

    #[test]
    fn test_bad_lesson_time() {
        for time in ["25:00", "12", "12:99", "noon"] {
            let file = write_config(&format!(
                r#"{{"telegram_bot_token": "123456789:ABCdef", "lesson_time": "{time}"}}"#
            ));
            let err = assert_err(Config::load(file.path()));
            assert!(matches!(err, ConfigError::Validation(_)));
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let file = write_config(
            r#"{"telegram_bot_token": "123456789:ABCdef", "reinforcement_interval_minutes": 0}"#,
        );
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("reinforcement_interval_minutes"));
    }

    #[test]
    fn test_file_not_found() {
        let err = assert_err(Config::load("/nonexistent/path/config.json"));
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let file = write_config("{ invalid json }");
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }
}
