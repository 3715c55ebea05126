//! Canned bot messages and deterministic fallback phrases.
//!
//! Every string the bot can send without asking the dialogue model lives
//! here, so the fallback paths stay reviewable in one place.

pub const WELCOME: &str = "Hello! 👋 My name is Marcus, your personal English teacher. \
Send me a voice message to start your first lesson, or just ask me a question about English!";

pub const WELCOME_BACK: &str = "Welcome back! 👋 Ready to continue? \
Send me a voice message and we'll pick up where we left off.";

pub const START_FIRST: &str = "Please run /start first so I can set up your study plan.";

pub const ALL_TOPICS_COMPLETED: &str =
    "🎉 Congratulations! You've completed all topics! You're doing great!";

pub const SEND_VOICE_PROMPT: &str =
    "🎤 Send a voice message to start a lesson or to ask the teacher a question!";

pub const BUTTONS_INFO: &str = "What would you like to do next?";

pub const CONTINUE_LESSON_PROMPT: &str =
    "🎤 Great! Let's continue the lesson. Send me a voice message!";

pub const TEACHER_CHAT_PROMPT: &str = "💬 Great! You can now ask me anything about English. \
Send a voice message with your question!";

pub const IDLE_NUDGE: &str = "Hey! We were having such a good conversation. Shall we continue? 🚀";

pub const GENERIC_APOLOGY: &str = "Sorry, something went wrong on my side. Please try again later.";

/// Used when transcription fails or returns nothing.
pub const FALLBACK_TRANSCRIPT: &str = "Hello, teacher!";

pub const FALLBACK_REPLY: &str = "I'm sorry, there was an error. Please try again later.";

/// Marker prefix for reinforcement questions. The text router recognizes
/// answers to them by matching this prefix on the latest bot message.
pub const REINFORCEMENT_PREFIX: &str = "💭 Review question:";

pub const REINFORCEMENT_SUFFIX: &str = "Send a text answer!";

pub const HOMEWORK_CHECK_FALLBACK: &str =
    "✅ Thanks for handing in your homework! I'll review it and give you feedback.";

pub const WEEKLY_REST: &str = "📚 You didn't study a new topic this week. \
Take a rest and get ready for the next one! 😊";

pub const SCHEDULER_TEST: &str = "✅ Scheduler is alive. This is a test message.";

/// Generic question bank used when no topic can be resolved for a
/// reinforcement question.
pub const GENERAL_QUESTIONS: &[&str] = &[
    "What do you like to do in your free time?",
    "How do you spend your weekends?",
    "What is your favorite hobby?",
    "Describe your best friend in one sentence.",
    "What makes you happy?",
    "How do you relax after a busy day?",
    "What is your biggest dream?",
    "How do you help others?",
];

pub fn homework_assigned(homework_text: &str) -> String {
    format!(
        "📚 Homework time!\n\n{homework_text}\n\n✍️ Send your answer as a text message when you're ready."
    )
}

pub fn lesson_task(task_text: &str) -> String {
    format!("📝 Your task for this lesson:\n\n{task_text}\n\n🎤 Answer with a voice message!")
}

pub fn lesson_completed(topic_title: &str) -> String {
    format!(
        "🎉 Great work! The lesson on \"{topic_title}\" is complete!\n\n\
         ✅ You practiced speaking and got feedback.\n\
         📚 Homework is on its way to help the material stick."
    )
}

pub fn new_topic_announcement(title: &str, description: &str) -> String {
    format!(
        "🎯 New week, new topic! This week we'll study: {title}\n\n{description}\n\n\
         Ready? Send a voice message!"
    )
}

pub fn lesson_start_fallback(topic_title: &str) -> String {
    format!("Hello! 👋 My name is Marcus. Ready to learn about {topic_title}? Let's start our English lesson!")
}

pub fn lesson_end_fallback(name: &str) -> String {
    format!(
        "Great work today, {name}! Keep practicing and you'll get even better. \
         You have a lot of potential! 😊"
    )
}

pub fn reinforcement_question(question: &str) -> String {
    format!("{REINFORCEMENT_PREFIX}\n\n{question}\n\n{REINFORCEMENT_SUFFIX}")
}

pub fn homework_fallback(topic_title: &str) -> String {
    format!(
        "Write a short paragraph (5-7 sentences) about \"{topic_title}\". \
         Use the words and grammar we practiced. Send your answer as text."
    )
}
