//! Dialogue client for the OpenAI chat completions API.
//!
//! Every method degrades to a deterministic fallback on failure: a canned
//! phrase, or for answer checking a local word-set similarity. A single
//! failed attempt goes straight to the fallback, no retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::tutor::database::{HistoryEntry, Role, Topic};
use crate::tutor::texts;

const CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Similarity threshold for the fallback answer check.
const SIMILARITY_THRESHOLD: f64 = 0.7;
/// Relaxed threshold when conversational context is available.
const SIMILARITY_THRESHOLD_WITH_CONTEXT: f64 = 0.5;

/// Structured verdict on a student utterance.
#[derive(Debug, Clone, Deserialize)]
pub struct AnswerFeedback {
    pub is_correct: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub correct_answer: String,
    #[serde(default)]
    pub explanation: String,
}

/// Graded homework review.
#[derive(Debug, Clone, Deserialize)]
pub struct HomeworkReview {
    pub score: u8,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub grammar_errors: Vec<String>,
    #[serde(default)]
    pub vocabulary_notes: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub grade_description: String,
}

/// Client for the dialogue model.
pub struct DialogueClient {
    api_key: Option<String>,
    client: reqwest::Client,
    /// When set, all calls short-circuit to their fallbacks.
    dev_mode: Arc<AtomicBool>,
}

impl DialogueClient {
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

    /// One chat completion round. Returns the assistant message content.
    async fn chat(
        &self,
        messages: Vec<serde_json::Value>,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<String, String> {
        let api_key = self.available().ok_or("Dialogue model unavailable")?;

        let response = self
            .client
            .post(CHAT_URL)
            .bearer_auth(api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&serde_json::json!({
                "model": MODEL,
                "messages": messages,
                "max_tokens": max_tokens,
                "temperature": temperature,
            }))
            .send()
            .await
            .map_err(|e| format!("Chat request failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Chat error {}: {}", status, body));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse chat response: {e}"))?;

        data["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| "Chat response missing content".to_string())
    }

    fn history_messages(history: &[HistoryEntry], window: usize) -> Vec<serde_json::Value> {
        history
            .iter()
            .rev()
            .take(window)
            .rev()
            .map(|entry| {
                serde_json::json!({
                    "role": entry.role.as_openai(),
                    "content": entry.content,
                })
            })
            .collect()
    }

    fn topic_prompt(topic: &Topic) -> String {
        format!(
            "\n\nCurrent topic: {}\nDescription: {}\nExample tasks: {}\n\
             Stay on this topic and use its vocabulary.",
            topic.title,
            topic.description,
            topic.tasks.join("; ")
        )
    }

    /// Check a student utterance, then generate a reply seeded with the
    /// verdict. The ordering matters: generating the reply and the verdict
    /// independently lets them contradict each other, so the reply prompt is
    /// always built from the already-computed feedback.
    pub async fn respond(
        &self,
        student_text: &str,
        history: &[HistoryEntry],
        topic: &Topic,
    ) -> (String, AnswerFeedback) {
        let feedback = self
            .check_answer(student_text, Some(topic), history, "Lesson turn")
            .await;
        let reply = self
            .reply_with_feedback(student_text, history, topic, &feedback)
            .await;
        (reply, feedback)
    }

    /// Check correctness of a student utterance against the topic and
    /// conversation. Falls back to the local similarity check on any
    /// provider or parse failure.
    pub async fn check_answer(
        &self,
        student_text: &str,
        topic: Option<&Topic>,
        history: &[HistoryEntry],
        context: &str,
    ) -> AnswerFeedback {
        let conversation_context: String = history
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let topic_title = topic.map(|t| t.title.as_str()).unwrap_or("English");
        let topic_description = topic.map(|t| t.description.as_str()).unwrap_or("");

        let system = format!(
            "You are Marcus, an English teacher. Check the student's answer for the topic \
             \"{topic_title}\" and give short feedback.\n\
             Topic description: {topic_description}\n\
             Conversation context: {conversation_context}\n\n\
             Rules:\n\
             1. Allow for transcription slips (yoy for you, dont for don't, and so on).\n\
             2. Judge the answer by how well it continues the conversation, not by a template.\n\
             3. If it fits the conversation, praise the student.\n\
             4. If there are mistakes, explain them briefly and show the corrected English.\n\
             5. Keep it to 1-2 sentences, friendly and supportive.\n\n\
             Answer strictly as JSON:\n\
             {{\"is_correct\": true/false, \"feedback\": \"...\", \
             \"correct_answer\": \"...\", \"explanation\": \"...\"}}"
        );

        let user = format!(
            "Topic: {topic_title}\nConversation context: {conversation_context}\n\
             Student's answer: \"{student_text}\"\nExtra context: \"{context}\"\n\n\
             Check the answer in the context of the conversation and reply as JSON."
        );

        let messages = vec![
            serde_json::json!({"role": "system", "content": system}),
            serde_json::json!({"role": "user", "content": user}),
        ];

        match self.chat(messages, 200, 0.3).await {
            Ok(content) => match parse_json_reply::<AnswerFeedback>(&content) {
                Ok(feedback) => feedback,
                Err(e) => {
                    warn!("Unparseable verdict, using similarity fallback: {e}");
                    fallback_check(student_text, topic, !conversation_context.is_empty())
                }
            },
            Err(e) => {
                warn!("Answer check failed, using similarity fallback: {e}");
                fallback_check(student_text, topic, !conversation_context.is_empty())
            }
        }
    }

    /// Conversational reply whose prompt is seeded with the verdict, so its
    /// tone cannot contradict it.
    pub async fn reply_with_feedback(
        &self,
        student_text: &str,
        history: &[HistoryEntry],
        topic: &Topic,
        feedback: &AnswerFeedback,
    ) -> String {
        let system = format!(
            "You are Marcus, a personal English teacher: competent, supportive, patient.\n\
             Always answer in English, with simple school-level constructions.\n\
             Keep replies SHORT, at most 2-3 sentences, and end with a practice question.\n\n\
             CHECK RESULT FOR THE STUDENT'S ANSWER:\n\
             - Correct: {}\n\
             - Corrected version: {}\n\
             - Explanation: {}\n\n\
             Your reply must agree with this check result. If the answer was correct, \
             praise the student and ask the next question. If not, gently correct them \
             and ask a question on the same topic.{}",
            feedback.is_correct,
            feedback.correct_answer,
            feedback.explanation,
            Self::topic_prompt(topic),
        );

        let mut messages = vec![serde_json::json!({"role": "system", "content": system})];
        messages.extend(Self::history_messages(history, 20));
        messages.push(serde_json::json!({"role": "user", "content": student_text}));

        match self.chat(messages, 150, 0.7).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Reply generation failed, using fallback: {e}");
                fallback_reply(feedback)
            }
        }
    }

    /// Free-form teacher chat: answer a question about English directly,
    /// without a correctness check or topic binding.
    pub async fn reply(&self, student_text: &str, history: &[HistoryEntry]) -> String {
        let system = "You are Marcus, a friendly English teacher. Answer the student's \
             questions about English: grammar, pronunciation, word meanings, idioms.\n\
             Explain clearly, give a usage example, stay friendly.\n\
             Keep it short, at most 3 sentences.";

        let mut messages = vec![serde_json::json!({"role": "system", "content": system})];
        messages.extend(Self::history_messages(history, 10));
        messages.push(serde_json::json!({"role": "user", "content": student_text}));

        match self.chat(messages, 200, 0.7).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Teacher chat failed, using fallback: {e}");
                texts::FALLBACK_REPLY.to_string()
            }
        }
    }

    pub async fn generate_homework(&self, topic: &Topic, history: &[HistoryEntry]) -> String {
        let system = format!(
            "You are an English teacher. Create one homework task for the student.\n\
             Topic: {}\nDescription: {}\n\n\
             Rules: the task relates to the topic, uses simple constructions, takes \
             10-15 minutes, and is answered with a text message.",
            topic.title, topic.description
        );

        let user_entries: Vec<&HistoryEntry> =
            history.iter().filter(|e| e.role == Role::User).collect();
        let recent_answers: Vec<&str> = user_entries
            .iter()
            .rev()
            .take(5)
            .rev()
            .map(|e| e.content.as_str())
            .collect();

        let user = format!(
            "The student's recent answers: {}\n\n\
             Create a homework task matched to their level and the material covered.",
            recent_answers.join("; ")
        );

        let messages = vec![
            serde_json::json!({"role": "system", "content": system}),
            serde_json::json!({"role": "user", "content": user}),
        ];

        match self.chat(messages, 300, 0.7).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Homework generation failed, using fallback: {e}");
                texts::homework_fallback(&topic.title)
            }
        }
    }

    /// Grade a homework answer 1-10 with detailed notes.
    pub async fn check_homework(
        &self,
        task_text: &str,
        answer_text: &str,
        topic_title: &str,
    ) -> HomeworkReview {
        let system = "You are Marcus, an experienced English teacher grading homework.\n\
             Scale: 9-10 excellent, 7-8 good, 5-6 satisfactory, 3-4 poor, 1-2 very poor.\n\n\
             Answer strictly as JSON:\n\
             {\"score\": 1-10, \"feedback\": \"...\", \"grammar_errors\": [\"...\"], \
             \"vocabulary_notes\": \"...\", \"suggestions\": [\"...\"], \
             \"grade_description\": \"excellent/good/satisfactory/poor\"}";

        let user = format!(
            "Topic: {topic_title}\n\nHomework task:\n{task_text}\n\n\
             Student's answer:\n{answer_text}\n\nGrade it on the 10-point scale."
        );

        let messages = vec![
            serde_json::json!({"role": "system", "content": system}),
            serde_json::json!({"role": "user", "content": user}),
        ];

        match self.chat(messages, 500, 0.3).await {
            Ok(content) => match parse_json_reply::<HomeworkReview>(&content) {
                Ok(review) => review,
                Err(e) => {
                    warn!("Unparseable homework review: {e}");
                    fallback_homework_review()
                }
            },
            Err(e) => {
                warn!("Homework check failed, using fallback: {e}");
                fallback_homework_review()
            }
        }
    }

    pub async fn generate_lesson_start(&self, topic: &Topic) -> String {
        let system = "You are Marcus, a friendly English teacher. Write a short, motivating \
             greeting to open a lesson: 2-3 sentences, in English, with an emoji or two.";
        let user = format!(
            "Open a lesson on the topic \"{}\".\nTopic description: {}",
            topic.title, topic.description
        );

        let messages = vec![
            serde_json::json!({"role": "system", "content": system}),
            serde_json::json!({"role": "user", "content": user}),
        ];

        match self.chat(messages, 150, 0.7).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Lesson start generation failed, using fallback: {e}");
                texts::lesson_start_fallback(&topic.title)
            }
        }
    }

    /// A very simple warm-up task, answerable in one or two sentences.
    pub async fn generate_lesson_task(&self, topic: &Topic) -> String {
        let system = "You are Marcus, an English teacher. Create ONE very simple warm-up \
             question for the start of a lesson. Not homework: it must be answerable in \
             1-2 sentences, in 30 seconds, like a question in a conversation.\n\
             Good examples: \"Tell me about your best friend in two words\", \
             \"What's your favorite hobby?\". Output only the question, in English.";
        let user = format!(
            "Topic: \"{}\"\nDescription: {}\nExample tasks: {}",
            topic.title,
            topic.description,
            topic.tasks.join("; ")
        );

        let messages = vec![
            serde_json::json!({"role": "system", "content": system}),
            serde_json::json!({"role": "user", "content": user}),
        ];

        match self.chat(messages, 50, 0.7).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Lesson task generation failed, using fallback: {e}");
                topic
                    .tasks
                    .first()
                    .cloned()
                    .unwrap_or_else(|| format!("Tell me about {} in one sentence.", topic.title))
            }
        }
    }

    /// A reinforcement question that avoids repeating recent ones. Errors
    /// propagate so the scheduler can fall back to its question bank.
    pub async fn generate_reinforcement_question(
        &self,
        topic: &Topic,
        previous_questions: &[String],
    ) -> Result<String, String> {
        let system = "You are Marcus, an English teacher. Create ONE short review question \
             to help the student revisit today's topic. It must be different from the \
             previous questions, answerable in 1-2 sentences, in English. \
             Output only the question.";
        let user = format!(
            "Topic: \"{}\"\nDescription: {}\nPrevious questions, do not repeat them:\n{}",
            topic.title,
            topic.description,
            previous_questions.join("\n")
        );

        let messages = vec![
            serde_json::json!({"role": "system", "content": system}),
            serde_json::json!({"role": "user", "content": user}),
        ];

        self.chat(messages, 60, 0.8).await
    }

    /// Personalized goodbye when a session is closed for inactivity.
    pub async fn generate_lesson_end(&self, summary: &str, name: &str) -> String {
        let system = "You are Marcus, a caring English teacher. Write a short, personal, \
             encouraging goodbye for a student whose lesson is ending: 2-3 sentences, \
             friendly, with an emoji.";
        let user = format!("Student's name: {name}\nWhat the lesson covered: {summary}");

        let messages = vec![
            serde_json::json!({"role": "system", "content": system}),
            serde_json::json!({"role": "user", "content": user}),
        ];

        match self.chat(messages, 100, 0.7).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Lesson end generation failed, using fallback: {e}");
                texts::lesson_end_fallback(name)
            }
        }
    }
}

/// Parse a JSON object out of a model reply, tolerating ``` fences.
fn parse_json_reply<T: serde::de::DeserializeOwned>(content: &str) -> Result<T, String> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).map_err(|e| format!("Invalid JSON reply: {e}"))
}

// === Deterministic fallbacks ===

/// Local answer check used when the dialogue model is unavailable or
/// returns garbage: word-set similarity between the normalized student text
/// and an expected answer derived from the topic.
pub fn fallback_check(student_text: &str, topic: Option<&Topic>, has_context: bool) -> AnswerFeedback {
    let expected = topic
        .and_then(|t| t.tasks.first().cloned())
        .or_else(|| topic.map(|t| format!("Answer about {}", t.title)))
        .unwrap_or_else(|| "Hello, my name is [name]. I like [hobby].".to_string());

    let topic_title = topic.map(|t| t.title.clone()).unwrap_or_else(|| "English".to_string());

    let score = similarity(&normalize(student_text), &normalize(&expected));
    let threshold = if has_context {
        SIMILARITY_THRESHOLD_WITH_CONTEXT
    } else {
        SIMILARITY_THRESHOLD
    };

    info!("Fallback check: similarity {:.2} against threshold {:.1}", score, threshold);

    if score >= threshold {
        AnswerFeedback {
            is_correct: true,
            feedback: format!("Great! 👍 Good answer on \"{topic_title}\"!"),
            correct_answer: student_text.to_string(),
            explanation: String::new(),
        }
    } else {
        AnswerFeedback {
            is_correct: false,
            feedback: format!("Almost! On \"{topic_title}\" a better answer would be: \"{expected}\""),
            correct_answer: expected,
            explanation: format!("Try again, keeping to the topic \"{topic_title}\"."),
        }
    }
}

/// Canned reply whose tone is derived from the verdict, so even the
/// fallback path cannot contradict the check result.
pub fn fallback_reply(feedback: &AnswerFeedback) -> String {
    if feedback.is_correct {
        "Great job! 🌟 Let's keep going. Can you tell me a bit more about that?".to_string()
    } else if feedback.correct_answer.is_empty() {
        "Good try! Let's practice that once more. Can you say it again?".to_string()
    } else {
        format!(
            "Good try! A better way to say it: \"{}\". Can you try again?",
            feedback.correct_answer
        )
    }
}

fn fallback_homework_review() -> HomeworkReview {
    HomeworkReview {
        score: 5,
        feedback: texts::HOMEWORK_CHECK_FALLBACK.to_string(),
        grammar_errors: Vec::new(),
        vocabulary_notes: String::new(),
        suggestions: Vec::new(),
        grade_description: "satisfactory".to_string(),
    }
}

/// Lower-case, collapse whitespace, and fix frequent transcription typos.
/// Corrections apply per word, so "time" is never mangled by the "im" rule.
pub fn normalize(answer: &str) -> String {
    const CORRECTIONS: &[(&str, &str)] = &[
        ("yoy", "you"),
        ("dont", "don't"),
        ("cant", "can't"),
        ("wont", "won't"),
        ("im", "i'm"),
        ("ive", "i've"),
        ("youre", "you're"),
        ("theyre", "they're"),
        ("were", "we're"),
    ];

    answer
        .to_lowercase()
        .split_whitespace()
        .map(|word| {
            CORRECTIONS
                .iter()
                .find(|(wrong, _)| *wrong == word)
                .map(|(_, fixed)| *fixed)
                .unwrap_or(word)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Jaccard similarity of the two texts' word sets.
pub fn similarity(text1: &str, text2: &str) -> f64 {
    let words1: std::collections::HashSet<&str> = text1.split_whitespace().collect();
    let words2: std::collections::HashSet<&str> = text2.split_whitespace().collect();

    if words1.is_empty() || words2.is_empty() {
        return 0.0;
    }

    let intersection = words1.intersection(&words2).count();
    let union = words1.union(&words2).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> Topic {
        Topic {
            id: 1,
            title: "Greetings".to_string(),
            description: "How to say hello".to_string(),
            tasks: vec!["hello my name is Sam".to_string()],
        }
    }

    #[test]
    fn test_similarity_identical() {
        assert_eq!(similarity("hello my name is sam", "hello my name is sam"), 1.0);
    }

    #[test]
    fn test_similarity_empty() {
        assert_eq!(similarity("", "anything"), 0.0);
        assert_eq!(similarity("anything", ""), 0.0);
    }

    #[test]
    fn test_normalize_corrections() {
        assert_eq!(normalize("I dont cant"), "i don't can't");
        assert_eq!(normalize("  Hello   World  "), "hello world");
        // Corrections never fire inside longer words.
        assert_eq!(normalize("sometimes time flies"), "sometimes time flies");
    }

    #[test]
    fn test_normalize_idempotent() {
        for input in ["I dont cant", "yoy were right", "Im fine, thanks"] {
            let once = normalize(input);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_fallback_check_matches_expected() {
        let feedback = fallback_check("hello my name is Sam", Some(&topic()), false);
        assert!(feedback.is_correct);
    }

    #[test]
    fn test_fallback_check_rejects_unrelated() {
        let feedback = fallback_check("bananas are yellow fruit today", Some(&topic()), false);
        assert!(!feedback.is_correct);
        assert_eq!(feedback.correct_answer, "hello my name is Sam");
    }

    #[test]
    fn test_fallback_check_relaxed_with_context() {
        // Word order is ignored: identical sets score 1.0.
        let strict = fallback_check("hello my name sam is", Some(&topic()), false);
        assert!(strict.is_correct);

        // 4 of 6 distinct words shared scores ~0.67: enough with context
        // (0.5 threshold), not without (0.7).

        let partial = fallback_check("well hello my name is", Some(&topic()), true);
        assert!(partial.is_correct);
        let partial_strict = fallback_check("well hello my name is", Some(&topic()), false);
        assert!(!partial_strict.is_correct);
    }

    #[test]
    fn test_fallback_reply_agrees_with_verdict() {
        let correct = AnswerFeedback {
            is_correct: true,
            feedback: String::new(),
            correct_answer: "hi".to_string(),
            explanation: String::new(),
        };
        let wrong = AnswerFeedback {
            is_correct: false,
            ..correct.clone()
        };

        assert!(fallback_reply(&correct).contains("Great job"));
        let correction = fallback_reply(&wrong);
        assert!(correction.contains("Good try"));
        assert!(correction.contains("hi"));
    }

    #[test]
    fn test_parse_json_reply_plain_and_fenced() {
        let plain = r#"{"is_correct": true, "feedback": "ok"}"#;
        let fenced = format!("```json\n{plain}\n```");

        let a: AnswerFeedback = parse_json_reply(plain).unwrap();
        let b: AnswerFeedback = parse_json_reply(&fenced).unwrap();
        assert!(a.is_correct && b.is_correct);

        assert!(parse_json_reply::<AnswerFeedback>("not json").is_err());
    }
}
