//! Per-user lesson orchestrator.
//!
//! Each user has one transient `Session` behind its own async mutex; a turn
//! holds that lock end to end, so two inbound messages from the same user
//! (or a scheduler job racing a turn) cannot interleave mutations of the
//! user's topic and progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::tutor::ai::{AnswerFeedback, DialogueClient, HomeworkReview};
use crate::tutor::database::{Database, HistoryEntry, Role, Topic};
use crate::tutor::idle::IdleChain;
use crate::tutor::speech::SpeechClient;
use crate::tutor::telegram::{
    CALLBACK_CHAT_WITH_TEACHER, CALLBACK_CONTINUE_LESSON, TelegramClient,
};
use crate::tutor::texts;

/// History entries passed to the dialogue model.
const HISTORY_WINDOW: usize = 20;

/// Silence before the re-engagement nudge.
const NUDGE_AFTER: Duration = Duration::from_secs(3 * 60);
/// Further silence before the session is closed.
const CLOSE_AFTER: Duration = Duration::from_secs(2 * 60);

/// How long a reinforcement question stays answerable by text, in minutes.
const REINFORCEMENT_ANSWER_WINDOW_MINUTES: i64 = 30;

/// Pacing between consecutive group-channel sends.
const GROUP_SEND_PACING: Duration = Duration::from_millis(100);

/// What kind of conversation the user is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatMode {
    /// Topic-bound lesson with correctness checking.
    #[default]
    Lesson,
    /// Free questions to the teacher, no topic binding.
    Teacher,
}

/// Transient per-user session state.
#[derive(Default)]
pub struct Session {
    pub mode: ChatMode,
    /// Lesson turns taken since the topic was assigned.
    pub iteration: u32,
    /// Set when the idle chain closed the session; cleared on any inbound
    /// message. The scheduler reads this instead of sniffing message text.
    pub ended: bool,
    idle: Option<IdleChain>,
}

impl Session {
    fn cancel_idle(&mut self) {
        if let Some(chain) = self.idle.take() {
            chain.cancel();
        }
    }

    fn arm_idle(&mut self, chain: IdleChain) {
        // Replacing the slot supersedes any chain still pending.
        if let Some(prev) = self.idle.replace(chain) {
            prev.cancel();
        }
    }
}

/// Owns every user's session mutex.
#[derive(Default)]
pub struct SessionManager {
    inner: Mutex<HashMap<i64, Arc<Mutex<Session>>>>,
}

impl SessionManager {
    pub async fn session(&self, user_id: i64) -> Arc<Mutex<Session>> {
        let mut map = self.inner.lock().await;
        map.entry(user_id).or_default().clone()
    }

    /// Whether the user's session was closed by the idle chain. A user with
    /// no session record, or one that is mid-turn, counts as not ended.
    pub async fn is_ended(&self, user_id: i64) -> bool {
        let map = self.inner.lock().await;
        match map.get(&user_id) {
            Some(cell) => cell.try_lock().map(|s| s.ended).unwrap_or(false),
            None => false,
        }
    }
}

/// The conversation orchestrator. Constructed once at startup with its
/// collaborators injected; the scheduler reuses its delivery and homework
/// logic.
pub struct Orchestrator {
    pub(crate) config: Arc<Config>,
    pub(crate) db: Arc<Database>,
    pub(crate) ai: Arc<DialogueClient>,
    pub(crate) speech: Arc<SpeechClient>,
    pub(crate) telegram: Arc<TelegramClient>,
    pub(crate) sessions: SessionManager,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        ai: Arc<DialogueClient>,
        speech: Arc<SpeechClient>,
        telegram: Arc<TelegramClient>,
    ) -> Self {
        Self {
            config,
            db,
            ai,
            speech,
            telegram,
            sessions: SessionManager::default(),
        }
    }

    /// `/start`: register the user and greet them.
    pub async fn handle_start(&self, user_id: i64) {
        let text = match self.db.get_user(user_id) {
            Ok(Some(_)) => texts::WELCOME_BACK,
            Ok(None) => match self.db.create_user(user_id) {
                Ok(_) => {
                    info!("👤 New user {}", user_id);
                    texts::WELCOME
                }
                Err(e) => {
                    error!("Failed to create user {user_id}: {e}");
                    texts::GENERIC_APOLOGY
                }
            },
            Err(e) => {
                error!("Failed to load user {user_id}: {e}");
                texts::GENERIC_APOLOGY
            }
        };

        if let Err(e) = self.telegram.send_message(user_id, text).await {
            warn!("Failed to greet {user_id}: {e}");
        }
    }

    /// A voice message: transcribe and run one lesson or teacher turn.
    pub async fn handle_voice(self: &Arc<Self>, user_id: i64, user_name: &str, voice_file_id: &str) {
        let session_cell = self.sessions.session(user_id).await;
        let mut session = session_cell.lock().await;
        session.cancel_idle();
        session.ended = false;

        let user = match self.db.get_user(user_id) {
            Ok(Some(user)) => user,
            Ok(None) => {
                let _ = self.telegram.send_message(user_id, texts::START_FIRST).await;
                return;
            }
            Err(e) => {
                error!("Failed to load user {user_id}: {e}");
                let _ = self.telegram.send_message(user_id, texts::GENERIC_APOLOGY).await;
                return;
            }
        };

        let transcript = self.transcribe_voice(voice_file_id).await;

        match session.mode {
            ChatMode::Teacher => {
                self.run_teacher_turn(&mut session, user_id, user_name, &transcript, voice_file_id)
                    .await;
            }
            ChatMode::Lesson => {
                // Resolve the current topic, assigning the next uncompleted
                // one when there is none.
                let topic = match self.resolve_topic(&user).await {
                    Ok(Some(topic)) => topic,
                    Ok(None) => {
                        let _ = self
                            .telegram
                            .send_message(user_id, texts::ALL_TOPICS_COMPLETED)
                            .await;
                        session.iteration = 0;
                        return;
                    }
                    Err(e) => {
                        error!("Topic resolution failed for {user_id}: {e}");
                        let _ = self.telegram.send_message(user_id, texts::GENERIC_APOLOGY).await;
                        return;
                    }
                };

                self.run_lesson_turn(&mut session, user_id, user_name, &transcript, &topic, voice_file_id)
                    .await;
            }
        }
    }

    /// Download and transcribe a voice message, falling back to a canned
    /// phrase when anything goes wrong or the transcript comes back empty.
    async fn transcribe_voice(&self, voice_file_id: &str) -> String {
        let audio = match self.telegram.download_voice(voice_file_id).await {
            Ok(audio) => audio,
            Err(e) => {
                warn!("Voice download failed: {e}");
                return texts::FALLBACK_TRANSCRIPT.to_string();
            }
        };

        match self.speech.transcribe(audio).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => texts::FALLBACK_TRANSCRIPT.to_string(),
            Err(e) => {
                warn!("Transcription failed: {e}");
                texts::FALLBACK_TRANSCRIPT.to_string()
            }
        }
    }

    /// Current topic, or the next uncompleted one (lowest id) assigned as
    /// current. None when the curriculum is exhausted.
    async fn resolve_topic(&self, user: &crate::tutor::database::User) -> Result<Option<Topic>, String> {
        if let Some(topic_id) = user.current_topic_id
            && let Some(topic) = self.db.get_topic(topic_id)?
        {
            return Ok(Some(topic));
        }

        match self.db.next_topic_for(&user.progress)? {
            Some(topic) => {
                self.db.set_current_topic(user.id, Some(topic.id))?;
                info!("📖 Assigned topic {} to user {}", topic.id, user.id);
                Ok(Some(topic))
            }
            None => Ok(None),
        }
    }

    async fn run_lesson_turn(
        self: &Arc<Self>,
        session: &mut Session,
        user_id: i64,
        user_name: &str,
        transcript: &str,
        topic: &Topic,
        voice_file_id: &str,
    ) {
        let history = self.db.recent_history(user_id, HISTORY_WINDOW).unwrap_or_else(|e| {
            warn!("History load failed for {user_id}: {e}");
            Vec::new()
        });

        // Check first, then reply from the verdict: the reply can never
        // contradict the feedback the student sees.
        let (reply, feedback) = self.ai.respond(transcript, &history, topic).await;

        if let Err(e) = self.deliver_reply(user_id, &reply).await {
            warn!("Reply delivery failed for {user_id}: {e}");
        }

        let block = format_feedback_block("💡 Feedback on your answer", &feedback);
        let _ = self.telegram.send_message(user_id, &block).await;
        let _ = self.telegram.send_lesson_keyboard(user_id, texts::BUTTONS_INFO).await;

        if let Err(e) = self.persist_turn(user_id, transcript, &reply, Some(voice_file_id)) {
            error!("Failed to persist lesson turn for {user_id}: {e}");
            let _ = self.telegram.send_message(user_id, texts::GENERIC_APOLOGY).await;
        }

        session.iteration += 1;

        // Optional in-lesson completion: after enough correct turns, hand
        // out homework and close the topic. With lesson_turns = 0 lessons
        // stay open-ended and the weekly job issues homework instead.
        if self.config.lesson_turns > 0
            && feedback.is_correct
            && session.iteration >= self.config.lesson_turns
        {
            let _ = self
                .telegram
                .send_message(user_id, &texts::lesson_completed(&topic.title))
                .await;
            if let Err(e) = self.issue_homework(user_id, user_name, topic).await {
                error!("Homework issuance failed for {user_id}: {e}");
                let _ = self.telegram.send_message(user_id, texts::GENERIC_APOLOGY).await;
            }
            session.iteration = 0;
            return;
        }

        session.arm_idle(self.start_idle_chain(user_id, user_name));
    }

    async fn run_teacher_turn(
        self: &Arc<Self>,
        session: &mut Session,
        user_id: i64,
        user_name: &str,
        transcript: &str,
        voice_file_id: &str,
    ) {
        let history = self.db.recent_history(user_id, HISTORY_WINDOW).unwrap_or_else(|e| {
            warn!("History load failed for {user_id}: {e}");
            Vec::new()
        });

        let reply = self.ai.reply(transcript, &history).await;

        if let Err(e) = self.deliver_reply(user_id, &reply).await {
            warn!("Reply delivery failed for {user_id}: {e}");
        }
        let _ = self.telegram.send_lesson_keyboard(user_id, texts::BUTTONS_INFO).await;

        if let Err(e) = self.persist_turn(user_id, transcript, &reply, Some(voice_file_id)) {
            error!("Failed to persist teacher turn for {user_id}: {e}");
            let _ = self.telegram.send_message(user_id, texts::GENERIC_APOLOGY).await;
        }

        session.arm_idle(self.start_idle_chain(user_id, user_name));
    }

    /// Write both sides of a turn and the lesson timestamp.
    fn persist_turn(
        &self,
        user_id: i64,
        transcript: &str,
        reply: &str,
        voice_file_id: Option<&str>,
    ) -> Result<(), String> {
        self.db.append_history(user_id, Role::User, transcript, voice_file_id)?;
        self.db.append_history(user_id, Role::Bot, reply, None)?;
        self.db.touch_last_lesson(user_id)
    }

    /// Speak the reply if synthesis is available, otherwise send text. A
    /// failed voice send also falls back to text.
    pub(crate) async fn deliver_reply(&self, user_id: i64, reply: &str) -> Result<(), String> {
        let audio = self.speech.synthesize(reply).await;
        if audio.is_empty() {
            self.telegram.send_message(user_id, reply).await?;
            return Ok(());
        }

        if self.telegram.send_voice(user_id, audio, Some(reply)).await.is_err() {
            self.telegram.send_message(user_id, reply).await?;
        }
        Ok(())
    }

    /// A text message: homework answer, reinforcement answer, or a prompt
    /// to use voice.
    pub async fn handle_text(&self, user_id: i64, user_name: &str, text: &str) {
        let session_cell = self.sessions.session(user_id).await;
        // Held for the whole turn to serialize against voice turns and jobs.
        let mut session = session_cell.lock().await;
        session.cancel_idle();
        session.ended = false;

        match self.db.latest_unchecked_homework(user_id) {
            Ok(Some(homework)) => {
                self.handle_homework_answer(user_id, user_name, text, homework).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!("Homework lookup failed for {user_id}: {e}");
                let _ = self.telegram.send_message(user_id, texts::GENERIC_APOLOGY).await;
                return;
            }
        }

        let last = self
            .db
            .recent_history(user_id, 1)
            .unwrap_or_default()
            .pop();
        if reinforcement_answer_pending(last.as_ref(), Utc::now()) {
            self.handle_reinforcement_answer(user_id, text).await;
            return;
        }

        let _ = self.telegram.send_message(user_id, texts::SEND_VOICE_PROMPT).await;
    }

    async fn handle_homework_answer(
        &self,
        user_id: i64,
        user_name: &str,
        answer: &str,
        homework: crate::tutor::database::Homework,
    ) {
        let topic_title = self
            .db
            .get_topic(homework.topic_id)
            .ok()
            .flatten()
            .map(|t| t.title)
            .unwrap_or_else(|| "English".to_string());

        let review = self.ai.check_homework(&homework.task_text, answer, &topic_title).await;
        let _ = self
            .telegram
            .send_message(user_id, &format_homework_review(&review))
            .await;

        let passed = review.score >= 5;
        match self.db.submit_homework_answer(user_id, answer, passed) {
            Ok(Some(checked)) => {
                info!("📝 Homework {} checked for {} (score {})", checked.id, user_id, review.score);
                self.send_homework_answer_to_group(user_id, user_name, &checked.task_text, answer)
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                error!("Failed to record homework answer for {user_id}: {e}");
                let _ = self.telegram.send_message(user_id, texts::GENERIC_APOLOGY).await;
            }
        }
    }

    async fn handle_reinforcement_answer(&self, user_id: i64, answer: &str) {
        if let Err(e) = self.db.append_history(user_id, Role::User, answer, None) {
            error!("Failed to persist reinforcement answer for {user_id}: {e}");
        }

        // The question's topic: current one, or the first in the curriculum.
        let topic = self
            .db
            .get_user(user_id)
            .ok()
            .flatten()
            .and_then(|u| u.current_topic_id)
            .and_then(|id| self.db.get_topic(id).ok().flatten())
            .or_else(|| self.db.first_topic().ok().flatten());

        let Some(topic) = topic else {
            let _ = self
                .telegram
                .send_message(user_id, "Thanks for your answer! Keep up the English practice! 🌟")
                .await;
            return;
        };

        let history = self.db.recent_history(user_id, 10).unwrap_or_default();
        let feedback = self
            .ai
            .check_answer(answer, Some(&topic), &history, "Reinforcement question response")
            .await;

        let block = format_feedback_block("💡 Feedback on your review answer", &feedback);
        let _ = self.telegram.send_message(user_id, &block).await;
        if let Err(e) = self.db.append_history(user_id, Role::Bot, &block, None) {
            error!("Failed to persist reinforcement feedback for {user_id}: {e}");
        }
    }

    /// Inline keyboard presses.
    pub async fn handle_callback(&self, user_id: i64, data: &str) {
        let session_cell = self.sessions.session(user_id).await;
        let mut session = session_cell.lock().await;
        session.cancel_idle();
        session.ended = false;

        match data {
            CALLBACK_CONTINUE_LESSON => {
                session.mode = ChatMode::Lesson;
                drop(session);
                let _ = self
                    .telegram
                    .send_message(user_id, texts::CONTINUE_LESSON_PROMPT)
                    .await;
            }
            CALLBACK_CHAT_WITH_TEACHER => {
                session.mode = ChatMode::Teacher;
                drop(session);
                let _ = self.telegram.send_message(user_id, texts::TEACHER_CHAT_PROMPT).await;
            }
            other => warn!("Unknown callback '{other}' from {user_id}"),
        }
    }

    /// Generate homework for the topic, record it, close the topic for the
    /// user, notify them and forward the lesson summary. One entry point
    /// shared by the lesson flow and the weekly job.
    pub async fn issue_homework(&self, user_id: i64, user_name: &str, topic: &Topic) -> Result<(), String> {
        let history = self.db.recent_history(user_id, HISTORY_WINDOW).unwrap_or_default();
        let homework_text = self.ai.generate_homework(topic, &history).await;

        self.db.create_homework(user_id, topic.id, &homework_text)?;
        self.db.complete_topic(user_id, topic.id)?;

        let _ = self
            .telegram
            .send_message(user_id, &texts::homework_assigned(&homework_text))
            .await;

        self.send_lesson_summary_to_group(user_id, user_name, &history, &homework_text)
            .await;

        info!("📚 Homework issued to {} for topic {}", user_id, topic.id);
        Ok(())
    }

    fn start_idle_chain(self: &Arc<Self>, user_id: i64, user_name: &str) -> IdleChain {
        let nudge = self.clone();
        let close = self.clone();
        let name = user_name.to_string();

        IdleChain::start(
            NUDGE_AFTER,
            CLOSE_AFTER,
            move || async move {
                info!("⏰ Idle nudge for {}", user_id);
                if let Err(e) = nudge.telegram.send_message(user_id, texts::IDLE_NUDGE).await {
                    warn!("Failed to send idle nudge to {user_id}: {e}");
                }
            },
            move || async move { close.close_session(user_id, &name).await },
        )
    }

    /// Final idle stage: say a personalized goodbye and mark the session
    /// ended so the scheduler may talk to the user again.
    async fn close_session(&self, user_id: i64, user_name: &str) {
        info!("🏁 Closing session for {}", user_id);

        let recent = self.db.recent_history(user_id, 5).unwrap_or_default();
        let summary = conversation_summary(&recent);

        let goodbye = self.ai.generate_lesson_end(&summary, user_name).await;
        if let Err(e) = self.telegram.send_message(user_id, &goodbye).await {
            warn!("Failed to send goodbye to {user_id}: {e}");
        }

        let session_cell = self.sessions.session(user_id).await;
        let mut session = session_cell.lock().await;
        session.ended = true;
        session.iteration = 0;
        // A turn may have armed a fresh chain while the goodbye was being
        // sent; cancel whatever sits in the slot rather than orphaning it.
        session.cancel_idle();
    }

    // === Group channel forwarding ===

    async fn send_lesson_summary_to_group(
        &self,
        user_id: i64,
        user_name: &str,
        history: &[HistoryEntry],
        homework_text: &str,
    ) {
        let Some(group_id) = self.config.group_chat_id else {
            return;
        };

        let dialogs = pair_dialogs(history);
        let header = format!(
            "📚 ENGLISH LESSON COMPLETED\n👤 Student: {}\n🆔 ID: {}\n📅 Date: {}\n💬 Dialog turns: {}\n{}",
            user_name,
            user_id,
            Utc::now().format("%d.%m.%Y %H:%M"),
            dialogs.len(),
            "=".repeat(40),
        );
        if let Err(e) = self.telegram.send_message(group_id, &header).await {
            warn!("Group summary header failed: {e}");
            return;
        }

        for (i, (student, bot)) in dialogs.iter().enumerate() {
            let text = format!(
                "💬 Turn #{}\n👤 Student: {}\n🤖 Teacher: {}\n{}",
                i + 1,
                clamp(student, 100),
                clamp(bot, 100),
                "-".repeat(30),
            );
            if let Err(e) = self.telegram.send_message(group_id, &text).await {
                warn!("Group summary turn failed: {e}");
            }
            tokio::time::sleep(GROUP_SEND_PACING).await;
        }

        let homework = format!(
            "📝 HOMEWORK\n👤 Student: {}\n🆔 ID: {}\n📋 Task:\n{}\n{}",
            user_name,
            user_id,
            homework_text,
            "=".repeat(40),
        );
        if let Err(e) = self.telegram.send_message(group_id, &homework).await {
            warn!("Group homework message failed: {e}");
        }
    }

    async fn send_homework_answer_to_group(
        &self,
        user_id: i64,
        user_name: &str,
        task_text: &str,
        answer: &str,
    ) {
        let Some(group_id) = self.config.group_chat_id else {
            return;
        };

        let text = format!(
            "📝 HOMEWORK ANSWER\n👤 Student: {}\n🆔 ID: {}\n📅 Date: {}\n📋 Task:\n{}\n✏️ Answer:\n{}\n{}",
            user_name,
            user_id,
            Utc::now().format("%d.%m.%Y %H:%M"),
            clamp(task_text, 200),
            clamp(answer, 300),
            "=".repeat(40),
        );
        if let Err(e) = self.telegram.send_message(group_id, &text).await {
            warn!("Group homework answer failed: {e}");
        }
    }
}

/// Whether a text message should be treated as the answer to a
/// reinforcement question: the latest history entry is a bot message
/// carrying the question marker, sent within the answer window.
pub(crate) fn reinforcement_answer_pending(
    last: Option<&HistoryEntry>,
    now: chrono::DateTime<Utc>,
) -> bool {
    match last {
        Some(entry) => {
            entry.role == Role::Bot
                && entry.content.starts_with(texts::REINFORCEMENT_PREFIX)
                && (now - entry.timestamp).num_minutes() < REINFORCEMENT_ANSWER_WINDOW_MINUTES
        }
        None => false,
    }
}

/// Feedback block shown after a checked answer. The correction details only
/// appear when the verdict is negative.
pub(crate) fn format_feedback_block(header: &str, feedback: &AnswerFeedback) -> String {
    let mut text = format!("{}\n\n{}\n", header, feedback.feedback);
    if !feedback.is_correct {
        text.push_str(&format!("\nCorrect answer: {}\n", feedback.correct_answer));
        if !feedback.explanation.is_empty() {
            text.push_str(&format!("\nExplanation: {}\n", feedback.explanation));
        }
    }
    text
}

/// Render a graded homework review for the student.
pub(crate) fn format_homework_review(review: &HomeworkReview) -> String {
    let mut text = format!(
        "📝 Homework review\n\n🎯 Score: {}/10 ({})\n\n💬 Feedback:\n{}\n",
        review.score, review.grade_description, review.feedback
    );

    if !review.grammar_errors.is_empty() {
        text.push_str("\n❌ Grammar errors:\n");
        for error in &review.grammar_errors {
            text.push_str(&format!("• {error}\n"));
        }
    }
    if !review.vocabulary_notes.is_empty() {
        text.push_str(&format!("\n📚 Vocabulary:\n{}\n", review.vocabulary_notes));
    }
    if !review.suggestions.is_empty() {
        text.push_str("\n💡 Suggestions:\n");
        for suggestion in &review.suggestions {
            text.push_str(&format!("• {suggestion}\n"));
        }
    }
    text
}

/// Pair student and teacher messages in chronological order for the group
/// summary. Unmatched tails are dropped.
pub(crate) fn pair_dialogs(history: &[HistoryEntry]) -> Vec<(String, String)> {
    let students: Vec<&HistoryEntry> = history.iter().filter(|e| e.role == Role::User).collect();
    let bots: Vec<&HistoryEntry> = history.iter().filter(|e| e.role == Role::Bot).collect();

    students
        .iter()
        .zip(bots.iter())
        .map(|(s, b)| (s.content.clone(), b.content.clone()))
        .collect()
}

/// One-line description of recent conversation for the goodbye prompt.
pub(crate) fn conversation_summary(recent: &[HistoryEntry]) -> String {
    if recent.is_empty() {
        return "The lesson ended after the student went quiet".to_string();
    }
    let snippets: Vec<String> = recent
        .iter()
        .rev()
        .take(3)
        .map(|e| format!("{}...", clamp(&e.content, 50)))
        .collect();
    format!("We talked about: {}", snippets.join(", "))
}

/// Truncate to `max` characters on char boundaries.
fn clamp(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(role: Role, content: &str, age_secs: i64) -> HistoryEntry {
        HistoryEntry {
            id: 0,
            user_id: 100,
            role,
            content: content.to_string(),
            voice_file_id: None,
            timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_reinforcement_answer_pending() {
        let now = Utc::now();
        let question = format!("{}\n\nWhat is your hobby?", texts::REINFORCEMENT_PREFIX);

        let fresh = entry(Role::Bot, &question, 60);
        assert!(reinforcement_answer_pending(Some(&fresh), now));

        let stale = entry(Role::Bot, &question, 31 * 60);
        assert!(!reinforcement_answer_pending(Some(&stale), now));

        let not_a_question = entry(Role::Bot, "Nice work!", 60);
        assert!(!reinforcement_answer_pending(Some(&not_a_question), now));

        let from_user = entry(Role::User, &question, 60);
        assert!(!reinforcement_answer_pending(Some(&from_user), now));

        assert!(!reinforcement_answer_pending(None, now));
    }

    #[test]
    fn test_feedback_block_hides_correction_when_correct() {
        let correct = AnswerFeedback {
            is_correct: true,
            feedback: "Well done".to_string(),
            correct_answer: "hidden".to_string(),
            explanation: "hidden".to_string(),
        };
        let block = format_feedback_block("💡 Feedback", &correct);
        assert!(block.contains("Well done"));
        assert!(!block.contains("Correct answer"));

        let wrong = AnswerFeedback { is_correct: false, ..correct };
        let block = format_feedback_block("💡 Feedback", &wrong);
        assert!(block.contains("Correct answer: hidden"));
        assert!(block.contains("Explanation: hidden"));
    }

    #[test]
    fn test_homework_review_formatting() {
        let review = HomeworkReview {
            score: 7,
            feedback: "Good work overall".to_string(),
            grammar_errors: vec!["a/an confusion".to_string()],
            vocabulary_notes: "Try richer verbs".to_string(),
            suggestions: vec!["Read short stories".to_string()],
            grade_description: "good".to_string(),
        };

        let text = format_homework_review(&review);
        assert!(text.contains("7/10"));
        assert!(text.contains("good"));
        assert!(text.contains("• a/an confusion"));
        assert!(text.contains("Try richer verbs"));
        assert!(text.contains("• Read short stories"));

        let bare = HomeworkReview {
            score: 5,
            feedback: "ok".to_string(),
            grammar_errors: vec![],
            vocabulary_notes: String::new(),
            suggestions: vec![],
            grade_description: "satisfactory".to_string(),
        };
        let text = format_homework_review(&bare);
        assert!(!text.contains("Grammar errors"));
        assert!(!text.contains("Suggestions"));
    }

    #[test]
    fn test_pair_dialogs() {
        let history = vec![
            entry(Role::User, "hello", 50),
            entry(Role::Bot, "hi there", 40),
            entry(Role::User, "how are you", 30),
            entry(Role::Bot, "great", 20),
            entry(Role::User, "unanswered", 10),
        ];

        let pairs = pair_dialogs(&history);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("hello".to_string(), "hi there".to_string()));
        assert_eq!(pairs[1], ("how are you".to_string(), "great".to_string()));
    }

    #[test]
    fn test_conversation_summary() {
        assert!(conversation_summary(&[]).contains("went quiet"));

        let history = vec![
            entry(Role::User, "I like music", 30),
            entry(Role::Bot, "What kind of music?", 20),
        ];
        let summary = conversation_summary(&history);
        assert!(summary.contains("We talked about"));
        assert!(summary.contains("What kind of music?"));
    }

    #[tokio::test]
    async fn test_session_manager_defaults() {
        let manager = SessionManager::default();

        // Unknown users are not "ended".
        assert!(!manager.is_ended(100).await);

        let cell = manager.session(100).await;
        {
            let mut session = cell.lock().await;
            assert_eq!(session.mode, ChatMode::Lesson);
            session.ended = true;
        }
        assert!(manager.is_ended(100).await);

        // A session that is mid-turn counts as active.
        let _guard = cell.lock().await;
        assert!(!manager.is_ended(100).await);
    }
}
