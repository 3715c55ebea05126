//! Calendar-driven jobs: weekday lessons, reinforcement questions, weekly
//! homework and topic rotation.
//!
//! Every job iterates all known users. A failure for one user is logged and
//! the batch continues; a short pacing delay sits between users. Jobs check
//! recent activity first so they never talk over a live conversation.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::tutor::database::{Role, User};
use crate::tutor::session::Orchestrator;
use crate::tutor::texts;

/// A user active within this window is skipped by the lesson reminder.
const LESSON_ACTIVITY_THRESHOLD_SECS: i64 = 600;
/// Minimum spacing between reinforcement questions to the same user.
const QUESTION_COOLDOWN_SECS: i64 = 120;
/// Previous questions passed to the model to avoid repeats.
const QUESTION_MEMORY: usize = 5;
/// Delay between per-user sends inside a job.
const USER_PACING: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
enum JobKind {
    WeekdayLesson,
    WeeklyHomework,
    TopicRotation,
}

/// The lesson scheduler. Reuses the orchestrator's topic selection,
/// delivery and homework issuance.
pub struct LessonScheduler {
    orchestrator: Arc<Orchestrator>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl LessonScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Spawn all job tasks.
    pub fn start(self: &Arc<Self>) -> Result<(), String> {
        let config = &self.orchestrator.config;
        info!(
            "🚀 Starting scheduler: lessons Mon-Fri {:02}:{:02} {}, reinforcement every {} min",
            config.lesson_hour, config.lesson_minute, config.timezone, config.reinforcement_interval_minutes
        );

        let lesson_expr = format!("0 {} {} * * Mon-Fri *", config.lesson_minute, config.lesson_hour);
        let handles = vec![
            self.spawn_cron_job(&lesson_expr, JobKind::WeekdayLesson)?,
            self.spawn_cron_job("0 0 18 * * Fri *", JobKind::WeeklyHomework)?,
            self.spawn_cron_job("0 0 12 * * Mon *", JobKind::TopicRotation)?,
            self.spawn_reinforcement_job(),
        ];

        let mut jobs = self.jobs.lock().unwrap();
        jobs.extend(handles);
        Ok(())
    }

    /// Abort all job tasks.
    pub fn stop(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        for handle in jobs.drain(..) {
            handle.abort();
        }
        info!("🛑 Scheduler stopped");
    }

    /// Re-arm all jobs with the current configuration.
    pub fn restart(self: &Arc<Self>) -> Result<(), String> {
        self.stop();
        self.start()
    }

    /// `/test_scheduler`: prove the scheduler path can reach the user.
    pub async fn send_test_message(&self, user_id: i64) -> Result<(), String> {
        self.orchestrator
            .telegram
            .send_message(user_id, texts::SCHEDULER_TEST)
            .await
            .map(|_| ())
    }

    fn spawn_cron_job(self: &Arc<Self>, expr: &str, kind: JobKind) -> Result<JoinHandle<()>, String> {
        let schedule =
            Schedule::from_str(expr).map_err(|e| format!("Invalid cron '{expr}': {e}"))?;
        let tz = self.orchestrator.config.timezone;
        let scheduler = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                let now = Utc::now().with_timezone(&tz);
                let Some(next) = schedule.after(&now).next() else {
                    warn!("Cron job {:?} has no future run, exiting", kind);
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                info!("⏰ Running scheduled job {:?}", kind);
                match kind {
                    JobKind::WeekdayLesson => scheduler.run_lesson_reminder().await,
                    JobKind::WeeklyHomework => scheduler.run_weekly_homework().await,
                    JobKind::TopicRotation => scheduler.run_topic_rotation().await,
                }
            }
        }))
    }

    fn spawn_reinforcement_job(self: &Arc<Self>) -> JoinHandle<()> {
        let minutes = self.orchestrator.config.reinforcement_interval_minutes as u64;
        let scheduler = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(minutes * 60));
            interval.tick().await; // the first tick completes immediately
            loop {
                interval.tick().await;
                scheduler.run_reinforcement_round().await;
            }
        })
    }

    fn users(&self) -> Vec<User> {
        match self.orchestrator.db.all_users() {
            Ok(users) => users,
            Err(e) => {
                error!("Failed to list users: {e}");
                Vec::new()
            }
        }
    }

    // === Weekday lesson ===

    async fn run_lesson_reminder(&self) {
        let users = self.users();
        info!("📚 Lesson reminder round for {} user(s)", users.len());

        for user in users {
            if let Err(e) = self.remind_user(&user).await {
                warn!("Lesson reminder for {} failed: {e}", user.id);
            }
            tokio::time::sleep(USER_PACING).await;
        }
    }

    async fn remind_user(&self, user: &User) -> Result<(), String> {
        let db = &self.orchestrator.db;

        let history = db.recent_history(user.id, 3)?;
        let ended = self.orchestrator.sessions.is_ended(user.id).await;
        if should_skip(
            history.last().map(|e| e.timestamp),
            Utc::now(),
            LESSON_ACTIVITY_THRESHOLD_SECS,
            ended,
        ) {
            info!("⏭️ User {} is mid-conversation, skipping lesson reminder", user.id);
            return Ok(());
        }

        let Some(topic) = db.next_topic_for(&user.progress)? else {
            self.orchestrator
                .telegram
                .send_message(user.id, texts::ALL_TOPICS_COMPLETED)
                .await?;
            return Ok(());
        };

        let lesson_text = self.orchestrator.ai.generate_lesson_start(&topic).await;
        let task_text = self.orchestrator.ai.generate_lesson_task(&topic).await;

        db.set_current_topic(user.id, Some(topic.id))?;

        self.orchestrator.deliver_reply(user.id, &lesson_text).await?;
        self.orchestrator
            .telegram
            .send_message(user.id, &texts::lesson_task(&task_text))
            .await?;

        info!("✅ Lesson reminder sent to {} (topic {})", user.id, topic.id);
        Ok(())
    }

    // === Reinforcement questions ===

    async fn run_reinforcement_round(&self) {
        let users = self.users();
        info!("💭 Reinforcement round for {} user(s)", users.len());

        for user in users {
            if let Err(e) = self.reinforce_user(&user).await {
                warn!("Reinforcement for {} failed: {e}", user.id);
            }
            tokio::time::sleep(USER_PACING).await;
        }
    }

    async fn reinforce_user(&self, user: &User) -> Result<(), String> {
        let db = &self.orchestrator.db;
        let now = Utc::now();
        let interval_secs = self.orchestrator.config.reinforcement_interval_minutes as i64 * 60;

        let history = db.recent_history(user.id, 5)?;
        if let Some(last) = history.last() {
            // A fresh reinforcement answer should not postpone the next
            // question, but any other recent activity does.
            let answering = last.role == Role::User
                && history.len() >= 2
                && history[history.len() - 2].role == Role::Bot
                && history[history.len() - 2]
                    .content
                    .starts_with(texts::REINFORCEMENT_PREFIX);

            if (now - last.timestamp).num_seconds() < interval_secs && !answering {
                info!("⏭️ User {} was recently active, skipping question", user.id);
                return Ok(());
            }

            let question_just_sent = history.iter().any(|e| {
                e.role == Role::Bot
                    && e.content.starts_with(texts::REINFORCEMENT_PREFIX)
                    && (now - e.timestamp).num_seconds() < QUESTION_COOLDOWN_SECS
            });
            if question_just_sent {
                info!("⏭️ User {} already has a fresh question", user.id);
                return Ok(());
            }
        }

        // The topic being studied, falling back to the first in the
        // curriculum so brand-new users still get a question.
        let topic = user
            .current_topic_id
            .and_then(|id| db.get_topic(id).ok().flatten())
            .or_else(|| db.first_topic().ok().flatten());

        let question = match topic {
            Some(topic) => {
                let previous: Vec<String> = db
                    .recent_bot_messages_with_prefix(user.id, texts::REINFORCEMENT_PREFIX, QUESTION_MEMORY)?
                    .iter()
                    .filter_map(|e| extract_question(&e.content))
                    .collect();

                match self
                    .orchestrator
                    .ai
                    .generate_reinforcement_question(&topic, &previous)
                    .await
                {
                    Ok(question) => question,
                    Err(e) => {
                        warn!("Question generation failed, using the bank: {e}");
                        pick_bank_question()
                    }
                }
            }
            None => pick_bank_question(),
        };

        let message = texts::reinforcement_question(&question);
        self.orchestrator.telegram.send_message(user.id, &message).await?;
        db.append_history(user.id, Role::Bot, &message, None)?;

        info!("✅ Reinforcement question sent to {}", user.id);
        Ok(())
    }

    // === Weekly homework ===

    async fn run_weekly_homework(&self) {
        let users = self.users();
        info!("📝 Weekly homework round for {} user(s)", users.len());

        for user in users {
            if let Err(e) = self.assign_weekly_homework(&user).await {
                warn!("Weekly homework for {} failed: {e}", user.id);
            }
            tokio::time::sleep(USER_PACING).await;
        }
    }

    async fn assign_weekly_homework(&self, user: &User) -> Result<(), String> {
        let db = &self.orchestrator.db;

        let week_start = start_of_week_utc(self.orchestrator.config.timezone, Utc::now());
        let studied_this_week = db.has_history_since(user.id, week_start)?;

        let topic = user
            .current_topic_id
            .filter(|_| studied_this_week)
            .and_then(|id| db.get_topic(id).ok().flatten());

        match topic {
            Some(topic) => {
                let name = format!("Student {}", user.id);
                self.orchestrator.issue_homework(user.id, &name, &topic).await
            }
            None => {
                self.orchestrator
                    .telegram
                    .send_message(user.id, texts::WEEKLY_REST)
                    .await?;
                Ok(())
            }
        }
    }

    // === Topic rotation ===

    async fn run_topic_rotation(&self) {
        let users = self.users();
        info!("🔄 Topic rotation for {} user(s)", users.len());

        for user in users {
            if let Err(e) = self.rotate_topic(&user).await {
                warn!("Topic rotation for {} failed: {e}", user.id);
            }
            tokio::time::sleep(USER_PACING).await;
        }
    }

    async fn rotate_topic(&self, user: &User) -> Result<(), String> {
        let db = &self.orchestrator.db;

        match db.next_topic_for(&user.progress)? {
            Some(topic) => {
                db.set_current_topic(user.id, Some(topic.id))?;
                self.orchestrator
                    .telegram
                    .send_message(
                        user.id,
                        &texts::new_topic_announcement(&topic.title, &topic.description),
                    )
                    .await?;
                info!("✅ New topic {} for user {}", topic.id, user.id);
            }
            None => {
                self.orchestrator
                    .telegram
                    .send_message(user.id, texts::ALL_TOPICS_COMPLETED)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Suppression rule shared by the push jobs: skip a user whose latest
/// history entry is younger than the threshold, unless their session was
/// explicitly closed by the idle chain.
pub(crate) fn should_skip(
    last_activity: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold_secs: i64,
    session_ended: bool,
) -> bool {
    match last_activity {
        Some(ts) if !session_ended => (now - ts).num_seconds() < threshold_secs,
        _ => false,
    }
}

/// Pull the bare question text back out of a stored reinforcement message.
pub(crate) fn extract_question(content: &str) -> Option<String> {
    let rest = content.strip_prefix(texts::REINFORCEMENT_PREFIX)?.trim();
    let rest = rest.strip_suffix(texts::REINFORCEMENT_SUFFIX).unwrap_or(rest).trim();
    if rest.is_empty() { None } else { Some(rest.to_string()) }
}

fn pick_bank_question() -> String {
    let idx = rand::rng().random_range(0..texts::GENERAL_QUESTIONS.len());
    texts::GENERAL_QUESTIONS[idx].to_string()
}

/// Local Monday midnight of the current week, as UTC.
fn start_of_week_utc(tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let monday = local.date_naive()
        - chrono::Duration::days(local.weekday().num_days_from_monday() as i64);
    monday
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(tz).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_skip_recent_activity() {
        let now = Utc::now();
        let two_min_ago = now - chrono::Duration::minutes(2);

        // 2 minutes of silence: suppressed by a 10-minute threshold, not by
        // a 1-minute one.
        assert!(should_skip(Some(two_min_ago), now, 600, false));
        assert!(!should_skip(Some(two_min_ago), now, 60, false));
    }

    #[test]
    fn test_should_skip_ignores_ended_sessions() {
        let now = Utc::now();
        let two_min_ago = now - chrono::Duration::minutes(2);

        assert!(!should_skip(Some(two_min_ago), now, 600, true));
        assert!(!should_skip(None, now, 600, false));
    }

    #[test]
    fn test_extract_question_roundtrip() {
        let message = texts::reinforcement_question("What is your favorite season?");
        assert_eq!(
            extract_question(&message).as_deref(),
            Some("What is your favorite season?")
        );

        assert!(extract_question("Nice work!").is_none());
        assert!(extract_question(texts::REINFORCEMENT_PREFIX).is_none());
    }

    #[test]
    fn test_cron_expressions_parse() {
        // 7-field format: sec min hour day month dow year
        for expr in ["0 0 12 * * Mon-Fri *", "0 0 18 * * Fri *", "0 0 12 * * Mon *", "0 30 9 * * Mon-Fri *"] {
            assert!(Schedule::from_str(expr).is_ok(), "bad cron: {expr}");
        }
    }

    #[test]
    fn test_week_start_is_monday_midnight() {
        let tz = chrono_tz::UTC;
        let now = Utc::now();
        let start = start_of_week_utc(tz, now);

        assert!(start <= now);
        assert_eq!(start.with_timezone(&tz).weekday(), chrono::Weekday::Mon);
        assert!((now - start).num_days() < 7);
    }

    #[test]
    fn test_week_start_respects_timezone() {
        let tz = chrono_tz::Asia::Shanghai;
        let now = Utc::now();
        let start = start_of_week_utc(tz, now);

        assert!(start <= now);
        assert!((now - start).num_days() < 7);
    }
}
