//! Persistent SQLite storage for users, topics, message history and homework.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

/// Who wrote a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Bot,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "bot",
        }
    }

    /// Role name expected by the chat completions API.
    pub fn as_openai(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "assistant",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "bot" => Role::Bot,
            _ => Role::User,
        }
    }
}

/// A student.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub current_topic_id: Option<i64>,
    pub last_lesson_at: Option<DateTime<Utc>>,
    /// Ordered ids of completed topics.
    pub progress: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

/// A unit of curriculum content.
#[derive(Debug, Clone)]
pub struct Topic {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub tasks: Vec<String>,
}

/// One entry of a user's conversation log.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub user_id: i64,
    pub role: Role,
    pub content: String,
    pub voice_file_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A homework assignment, answered at most once.
#[derive(Debug, Clone)]
pub struct Homework {
    pub id: i64,
    pub user_id: i64,
    pub topic_id: i64,
    pub task_text: String,
    pub answer_text: Option<String>,
    pub is_checked: bool,
    pub is_passed: bool,
    pub assigned_at: DateTime<Utc>,
    pub checked_at: Option<DateTime<Utc>>,
}

/// Topics file format: `[{"title": ..., "description": ..., "tasks": [...]}]`.
#[derive(serde::Deserialize)]
struct TopicSeed {
    title: String,
    description: String,
    #[serde(default)]
    tasks: Vec<String>,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Bad timestamp '{s}' in database: {e}");
            Utc::now()
        })
}

fn parse_progress(s: &str) -> Vec<i64> {
    serde_json::from_str(s).unwrap_or_else(|e| {
        warn!("Bad progress list '{s}': {e}");
        Vec::new()
    })
}

/// Persistent SQLite database for the tutor.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create a new in-memory database (tests).
    pub fn new() -> Self {
        let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema();
        db
    }

    /// Open (or create) a database at the given path.
    pub fn open(path: &Path) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("Failed to open database: {e}"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema();

        let (users, topics) = db.counts();
        info!("Loaded database from {:?} ({} users, {} topics)", path, users, topics);
        Ok(db)
    }

    fn init_schema(&self) {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                current_topic_id INTEGER,
                last_lesson_at TEXT,
                progress TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS topics (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                tasks TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS message_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                voice_file_id TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS homework (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                topic_id INTEGER NOT NULL,
                task_text TEXT NOT NULL,
                answer_text TEXT,
                is_checked INTEGER NOT NULL DEFAULT 0,
                is_passed INTEGER NOT NULL DEFAULT 0,
                assigned_at TEXT NOT NULL,
                checked_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_history_user_ts ON message_history(user_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_homework_user ON homework(user_id, is_checked);
        "#,
        )
        .expect("Failed to initialize database schema");
    }

    fn counts(&self) -> (usize, usize) {
        let conn = self.conn.lock().unwrap();
        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap_or(0);
        let topics: i64 = conn
            .query_row("SELECT COUNT(*) FROM topics", [], |row| row.get(0))
            .unwrap_or(0);
        (users as usize, topics as usize)
    }

    // ==================== USERS ====================

    pub fn get_user(&self, user_id: i64) -> Result<Option<User>, String> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, current_topic_id, last_lesson_at, progress, created_at
             FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    current_topic_id: row.get(1)?,
                    last_lesson_at: row.get::<_, Option<String>>(2)?.map(|s| parse_ts(&s)),
                    progress: parse_progress(&row.get::<_, String>(3)?),
                    created_at: parse_ts(&row.get::<_, String>(4)?),
                })
            },
        )
        .optional()
        .map_err(|e| format!("Failed to load user {user_id}: {e}"))
    }

    /// Create a user row with empty progress. Idempotent.
    pub fn create_user(&self, user_id: i64) -> Result<User, String> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO users (id, progress, created_at) VALUES (?1, '[]', ?2)",
                params![user_id, Utc::now().to_rfc3339()],
            )
            .map_err(|e| format!("Failed to create user {user_id}: {e}"))?;
        }
        self.get_user(user_id)?
            .ok_or_else(|| format!("User {user_id} missing after insert"))
    }

    pub fn all_users(&self) -> Result<Vec<User>, String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, current_topic_id, last_lesson_at, progress, created_at
                 FROM users ORDER BY id",
            )
            .map_err(|e| format!("Failed to prepare user query: {e}"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(User {
                    id: row.get(0)?,
                    current_topic_id: row.get(1)?,
                    last_lesson_at: row.get::<_, Option<String>>(2)?.map(|s| parse_ts(&s)),
                    progress: parse_progress(&row.get::<_, String>(3)?),
                    created_at: parse_ts(&row.get::<_, String>(4)?),
                })
            })
            .map_err(|e| format!("Failed to query users: {e}"))?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_current_topic(&self, user_id: i64, topic_id: Option<i64>) -> Result<(), String> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET current_topic_id = ?2 WHERE id = ?1",
            params![user_id, topic_id],
        )
        .map_err(|e| format!("Failed to set current topic for {user_id}: {e}"))?;
        Ok(())
    }

    pub fn touch_last_lesson(&self, user_id: i64) -> Result<(), String> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET last_lesson_at = ?2 WHERE id = ?1",
            params![user_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("Failed to update last lesson for {user_id}: {e}"))?;
        Ok(())
    }

    /// Mark a topic completed for the user and clear it as current, in one
    /// transaction. The topic id enters the progress list at most once.
    pub fn complete_topic(&self, user_id: i64, topic_id: i64) -> Result<(), String> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| format!("Failed to begin transaction: {e}"))?;

        let progress: String = tx
            .query_row("SELECT progress FROM users WHERE id = ?1", params![user_id], |row| {
                row.get(0)
            })
            .map_err(|e| format!("Failed to read progress for {user_id}: {e}"))?;

        let mut completed = parse_progress(&progress);
        if !completed.contains(&topic_id) {
            completed.push(topic_id);
        }
        let new_progress = serde_json::to_string(&completed)
            .map_err(|e| format!("Failed to serialize progress: {e}"))?;

        tx.execute(
            "UPDATE users SET progress = ?2, current_topic_id = NULL WHERE id = ?1",
            params![user_id, new_progress],
        )
        .map_err(|e| format!("Failed to update progress for {user_id}: {e}"))?;

        tx.commit().map_err(|e| format!("Failed to commit progress for {user_id}: {e}"))
    }

    // ==================== TOPICS ====================

    pub fn get_topic(&self, topic_id: i64) -> Result<Option<Topic>, String> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, title, description, tasks FROM topics WHERE id = ?1",
            params![topic_id],
            |row| {
                Ok(Topic {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    tasks: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
                })
            },
        )
        .optional()
        .map_err(|e| format!("Failed to load topic {topic_id}: {e}"))
    }

    fn all_topics(&self) -> Result<Vec<Topic>, String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, title, description, tasks FROM topics ORDER BY id")
            .map_err(|e| format!("Failed to prepare topic query: {e}"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(Topic {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    tasks: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
                })
            })
            .map_err(|e| format!("Failed to query topics: {e}"))?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Next uncompleted topic for the user: lowest id not in their progress.
    pub fn next_topic_for(&self, progress: &[i64]) -> Result<Option<Topic>, String> {
        Ok(self.all_topics()?.into_iter().find(|t| !progress.contains(&t.id)))
    }

    pub fn first_topic(&self) -> Result<Option<Topic>, String> {
        Ok(self.all_topics()?.into_iter().next())
    }

    /// Load topics from a JSON seed file if the table is empty.
    pub fn seed_topics_from_file(&self, path: &Path) -> Result<usize, String> {
        {
            let conn = self.conn.lock().unwrap();
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM topics", [], |row| row.get(0))
                .map_err(|e| format!("Failed to count topics: {e}"))?;
            if count > 0 {
                return Ok(0);
            }
        }

        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read topics file {:?}: {e}", path))?;
        let seeds: Vec<TopicSeed> =
            serde_json::from_str(&json).map_err(|e| format!("Failed to parse topics file: {e}"))?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| format!("Failed to begin transaction: {e}"))?;
        let mut inserted = 0;
        for seed in &seeds {
            let tasks = serde_json::to_string(&seed.tasks)
                .map_err(|e| format!("Failed to serialize tasks: {e}"))?;
            tx.execute(
                "INSERT INTO topics (title, description, tasks) VALUES (?1, ?2, ?3)",
                params![seed.title, seed.description, tasks],
            )
            .map_err(|e| format!("Failed to insert topic '{}': {e}", seed.title))?;
            inserted += 1;
        }
        tx.commit().map_err(|e| format!("Failed to commit topics: {e}"))?;

        info!("📥 Seeded {} topics from {:?}", inserted, path);
        Ok(inserted)
    }

    // ==================== MESSAGE HISTORY ====================

    pub fn append_history(
        &self,
        user_id: i64,
        role: Role,
        content: &str,
        voice_file_id: Option<&str>,
    ) -> Result<(), String> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO message_history (user_id, role, content, voice_file_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, role.as_str(), content, voice_file_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("Failed to append history for {user_id}: {e}"))?;
        Ok(())
    }

    /// Last `limit` entries for a user, in chronological order.
    pub fn recent_history(&self, user_id: i64, limit: usize) -> Result<Vec<HistoryEntry>, String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, role, content, voice_file_id, timestamp
                 FROM message_history WHERE user_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )
            .map_err(|e| format!("Failed to prepare history query: {e}"))?;

        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    role: Role::from_str(&row.get::<_, String>(2)?),
                    content: row.get(3)?,
                    voice_file_id: row.get(4)?,
                    timestamp: parse_ts(&row.get::<_, String>(5)?),
                })
            })
            .map_err(|e| format!("Failed to query history: {e}"))?;

        let mut result: Vec<HistoryEntry> = rows.filter_map(|r| r.ok()).collect();
        result.reverse();
        Ok(result)
    }

    /// Whether the user has any history entry at or after `since`.
    pub fn has_history_since(&self, user_id: i64, since: DateTime<Utc>) -> Result<bool, String> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM message_history WHERE user_id = ?1 AND timestamp >= ?2",
                params![user_id, since.to_rfc3339()],
                |row| row.get(0),
            )
            .map_err(|e| format!("Failed to query history since: {e}"))?;
        Ok(count > 0)
    }

    /// Recent bot messages starting with `prefix`, newest first.
    pub fn recent_bot_messages_with_prefix(
        &self,
        user_id: i64,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, String> {
        let conn = self.conn.lock().unwrap();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, role, content, voice_file_id, timestamp
                 FROM message_history
                 WHERE user_id = ?1 AND role = 'bot' AND content LIKE ?2 ESCAPE '\\'
                 ORDER BY timestamp DESC, id DESC LIMIT ?3",
            )
            .map_err(|e| format!("Failed to prepare question query: {e}"))?;

        let rows = stmt
            .query_map(params![user_id, pattern, limit as i64], |row| {
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    role: Role::from_str(&row.get::<_, String>(2)?),
                    content: row.get(3)?,
                    voice_file_id: row.get(4)?,
                    timestamp: parse_ts(&row.get::<_, String>(5)?),
                })
            })
            .map_err(|e| format!("Failed to query questions: {e}"))?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ==================== HOMEWORK ====================

    pub fn create_homework(
        &self,
        user_id: i64,
        topic_id: i64,
        task_text: &str,
    ) -> Result<i64, String> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO homework (user_id, topic_id, task_text, assigned_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, topic_id, task_text, Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("Failed to create homework for {user_id}: {e}"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest unchecked homework for the user, if any.
    pub fn latest_unchecked_homework(&self, user_id: i64) -> Result<Option<Homework>, String> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, topic_id, task_text, answer_text, is_checked, is_passed, assigned_at, checked_at
             FROM homework WHERE user_id = ?1 AND is_checked = 0
             ORDER BY assigned_at DESC, id DESC LIMIT 1",
            params![user_id],
            |row| {
                Ok(Homework {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    topic_id: row.get(2)?,
                    task_text: row.get(3)?,
                    answer_text: row.get(4)?,
                    is_checked: row.get::<_, i64>(5)? != 0,
                    is_passed: row.get::<_, i64>(6)? != 0,
                    assigned_at: parse_ts(&row.get::<_, String>(7)?),
                    checked_at: row.get::<_, Option<String>>(8)?.map(|s| parse_ts(&s)),
                })
            },
        )
        .optional()
        .map_err(|e| format!("Failed to load homework for {user_id}: {e}"))
    }

    /// Record the user's answer against their latest unchecked homework.
    /// Returns the updated record, or None when nothing was outstanding.
    pub fn submit_homework_answer(
        &self,
        user_id: i64,
        answer: &str,
        passed: bool,
    ) -> Result<Option<Homework>, String> {
        let homework = match self.latest_unchecked_homework(user_id)? {
            Some(hw) => hw,
            None => return Ok(None),
        };

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE homework SET answer_text = ?2, is_checked = 1, is_passed = ?3, checked_at = ?4
                 WHERE id = ?1",
                params![homework.id, answer, passed as i64, Utc::now().to_rfc3339()],
            )
            .map_err(|e| format!("Failed to update homework {}: {e}", homework.id))?;
        }

        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, topic_id, task_text, answer_text, is_checked, is_passed, assigned_at, checked_at
             FROM homework WHERE id = ?1",
            params![homework.id],
            |row| {
                Ok(Homework {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    topic_id: row.get(2)?,
                    task_text: row.get(3)?,
                    answer_text: row.get(4)?,
                    is_checked: row.get::<_, i64>(5)? != 0,
                    is_passed: row.get::<_, i64>(6)? != 0,
                    assigned_at: parse_ts(&row.get::<_, String>(7)?),
                    checked_at: row.get::<_, Option<String>>(8)?.map(|s| parse_ts(&s)),
                })
            },
        )
        .optional()
        .map_err(|e| format!("Failed to reload homework {}: {e}", homework.id))
    }

    #[cfg(test)]
    pub fn homework_count(&self, user_id: i64) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM homework WHERE user_id = ?1",
            params![user_id],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0) as usize
    }

    #[cfg(test)]
    pub fn seed_topics(&self, topics: &[(&str, &str, &[&str])]) {
        let conn = self.conn.lock().unwrap();
        for (title, description, tasks) in topics {
            let tasks_json = serde_json::to_string(tasks).unwrap();
            conn.execute(
                "INSERT INTO topics (title, description, tasks) VALUES (?1, ?2, ?3)",
                params![title, description, tasks_json],
            )
            .unwrap();
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_topics() -> Database {
        let db = Database::new();
        db.seed_topics(&[
            ("Greetings", "How to say hello", &["Introduce yourself"]),
            ("Hobbies", "Talking about hobbies", &["Describe your hobby"]),
            ("Food", "Food vocabulary", &["Describe your favorite meal"]),
            ("Travel", "Travel vocabulary", &["Describe a trip"]),
        ]);
        db
    }

    #[test]
    fn test_create_user_empty_progress() {
        let db = Database::new();
        let user = db.create_user(100).unwrap();

        assert_eq!(user.id, 100);
        assert!(user.progress.is_empty());
        assert!(user.current_topic_id.is_none());

        // Idempotent
        let again = db.create_user(100).unwrap();
        assert_eq!(again.created_at, user.created_at);
    }

    #[test]
    fn test_next_topic_lowest_uncompleted() {
        let db = db_with_topics();
        db.create_user(100).unwrap();

        db.complete_topic(100, 1).unwrap();
        db.complete_topic(100, 2).unwrap();

        let user = db.get_user(100).unwrap().unwrap();
        assert_eq!(user.progress, vec![1, 2]);

        let next = db.next_topic_for(&user.progress).unwrap().unwrap();
        assert_eq!(next.id, 3);
    }

    #[test]
    fn test_next_topic_none_when_all_completed() {
        let db = db_with_topics();
        db.create_user(100).unwrap();
        for id in 1..=4 {
            db.complete_topic(100, id).unwrap();
        }

        let user = db.get_user(100).unwrap().unwrap();
        assert!(db.next_topic_for(&user.progress).unwrap().is_none());
    }

    #[test]
    fn test_complete_topic_no_duplicates_and_clears_current() {
        let db = db_with_topics();
        db.create_user(100).unwrap();
        db.set_current_topic(100, Some(1)).unwrap();

        db.complete_topic(100, 1).unwrap();
        db.complete_topic(100, 1).unwrap();

        let user = db.get_user(100).unwrap().unwrap();
        assert_eq!(user.progress, vec![1]);
        assert!(user.current_topic_id.is_none());
    }

    #[test]
    fn test_history_chronological_window() {
        let db = Database::new();
        db.create_user(100).unwrap();

        db.append_history(100, Role::User, "first", Some("voice1")).unwrap();
        db.append_history(100, Role::Bot, "second", None).unwrap();
        db.append_history(100, Role::User, "third", None).unwrap();

        let history = db.recent_history(100, 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "second");
        assert_eq!(history[1].content, "third");
        assert_eq!(history[1].role, Role::User);
    }

    #[test]
    fn test_homework_lifecycle() {
        let db = db_with_topics();
        db.create_user(100).unwrap();

        db.create_homework(100, 1, "Write about greetings").unwrap();
        assert_eq!(db.homework_count(100), 1);

        let open = db.latest_unchecked_homework(100).unwrap().unwrap();
        assert!(!open.is_checked);
        assert!(open.answer_text.is_none());

        let checked = db.submit_homework_answer(100, "Hello, my name is Sam", true).unwrap().unwrap();
        assert!(checked.is_checked);
        assert!(checked.is_passed);
        assert_eq!(checked.answer_text.as_deref(), Some("Hello, my name is Sam"));
        assert!(checked.checked_at.is_some());

        // Re-submitting with nothing outstanding creates no record and
        // touches nothing.
        assert!(db.submit_homework_answer(100, "again", true).unwrap().is_none());
        assert_eq!(db.homework_count(100), 1);
        assert!(db.latest_unchecked_homework(100).unwrap().is_none());
    }

    #[test]
    fn test_first_contact_flow() {
        let db = db_with_topics();
        let user = db.create_user(500).unwrap();
        assert!(user.progress.is_empty());

        // First voice turn: lowest topic assigned, both sides logged.
        let topic = db.next_topic_for(&user.progress).unwrap().unwrap();
        assert_eq!(topic.id, 1);
        db.set_current_topic(500, Some(topic.id)).unwrap();
        db.append_history(500, Role::User, "hello teacher", Some("voice-1")).unwrap();
        db.append_history(500, Role::Bot, "Hello! Tell me about yourself.", None).unwrap();
        db.touch_last_lesson(500).unwrap();

        let user = db.get_user(500).unwrap().unwrap();
        assert_eq!(user.current_topic_id, Some(1));
        assert!(user.last_lesson_at.is_some());
        assert_eq!(db.recent_history(500, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_prefix_query_finds_reinforcement_questions() {
        let db = Database::new();
        db.create_user(100).unwrap();

        db.append_history(100, Role::Bot, "💭 Review question:\n\nWhat is your hobby?", None)
            .unwrap();
        db.append_history(100, Role::Bot, "Nice work!", None).unwrap();
        db.append_history(100, Role::User, "💭 Review question: fake from user", None).unwrap();

        let found = db
            .recent_bot_messages_with_prefix(100, "💭 Review question:", 5)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].content.contains("hobby"));
    }
}
