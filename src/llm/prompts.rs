//! System prompt and prompt assembly for the retail assistant
//!
//! Everything here is pure: the same inputs always build the same text.

use crate::models::PersonStatus;

/// Default system prompt for the in-store assistant
pub const SYSTEM_PROMPT: &str = r#"You are a friendly in-store shopping assistant. Your replies are converted to speech, so keep them short, warm, and conversational.

Guidelines:
1. Answer in the customer's language (Arabic unless they speak another language)
2. Keep replies to 1-3 sentences
3. Recommend products only when the customer asks or clearly needs help choosing
4. Never invent prices or stock levels; offer to check with staff instead
5. Do not use lists, markdown, or URLs"#;

/// Everything known about the customer when the conversation step runs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InteractionContext {
    /// What the customer said
    pub transcript: String,

    /// Language of the conversation
    pub language: String,

    /// People visible in the tracked footage
    pub people_detected: Option<usize>,

    pub status: Option<PersonStatus>,
}

impl InteractionContext {
    pub fn new(transcript: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            language: language.into(),
            ..Default::default()
        }
    }

    pub fn with_people_detected(mut self, count: usize) -> Self {
        self.people_detected = Some(count);
        self
    }

    pub fn with_status(mut self, status: PersonStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Tone hint for a detected mood
fn mood_guidance(mood: &str) -> Option<&'static str> {
    match mood.to_ascii_lowercase().as_str() {
        "angry" | "frustrated" | "disgust" => {
            Some("The customer seems upset; be calm, brief, and apologetic where appropriate.")
        }
        "sad" | "fear" | "anxious" => Some("The customer seems uneasy; be gentle and reassuring."),
        "happy" | "surprise" => Some("The customer seems in a good mood; match their energy."),
        _ => None,
    }
}

/// Merge step outputs into the message sent to the conversation model
pub fn merge_context(context: &InteractionContext) -> String {
    let mut lines = vec!["Customer context:".to_string()];

    if let Some(count) = context.people_detected {
        lines.push(format!("- People in view: {}", count));
    }
    if let Some(status) = &context.status {
        lines.push(format!("- Estimated age: {}", status.age));
        lines.push(format!("- Gender: {}", status.gender));
        lines.push(format!(
            "- Mood: {} (confidence {:.2})",
            status.mood, status.confidence
        ));
    }
    if !context.language.is_empty() {
        lines.push(format!("- Language: {}", context.language));
    }
    if lines.len() == 1 {
        lines.push("- Nothing known yet".to_string());
    }

    if let Some(hint) = context.status.as_ref().and_then(|s| mood_guidance(&s.mood)) {
        lines.push(String::new());
        lines.push(hint.to_string());
    }

    lines.push(String::new());
    lines.push(format!("Customer said: \"{}\"", context.transcript.trim()));
    lines.join("\n")
}

/// Opening line once someone has been detected
pub fn greeting_text(people_detected: usize, language: &str) -> String {
    let arabic = language.eq_ignore_ascii_case("ar");
    match (arabic, people_detected > 1) {
        (true, false) => "أهلاً وسهلاً! كيف يمكنني مساعدتك اليوم؟".to_string(),
        (true, true) => "أهلاً وسهلاً بكم! كيف يمكنني مساعدتكم اليوم؟".to_string(),
        (false, false) => "Welcome! How can I help you today?".to_string(),
        (false, true) => "Welcome, everyone! How can I help you today?".to_string(),
    }
}
