//! Splitting response text into ordered synthesis units
//!
//! Units end at sentence terminators (Latin and Arabic) and are further
//! bounded by a character budget, breaking at whitespace where possible.

/// Characters that close a sentence when followed by whitespace or the end
const TERMINATORS: &[char] = &['.', '!', '?', '؟', '…', '。', '\n'];

/// Markdown decoration that should never reach the synthesizer
const DECORATION: &[char] = &['*', '#', '`', '_', '~'];

/// A piece of text synthesized as one audio chunk
#[derive(Clone, Debug, PartialEq)]
pub struct SynthesisUnit {
    /// Position of this unit in the emitted sequence
    pub index: usize,

    pub text: String,
}

#[derive(Clone, Debug)]
pub struct TextSegmenter {
    max_chars: usize,
}

impl TextSegmenter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Split text into units; text with nothing speakable yields none
    pub fn split(&self, text: &str) -> Vec<SynthesisUnit> {
        let cleaned: String = text.chars().filter(|c| !DECORATION.contains(c)).collect();

        split_sentences(&cleaned)
            .into_iter()
            .flat_map(|sentence| bound_length(&sentence, self.max_chars))
            .filter(|unit| unit.chars().any(char::is_alphanumeric))
            .enumerate()
            .map(|(index, text)| SynthesisUnit { index, text })
            .collect()
    }
}

impl Default for TextSegmenter {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\n' {
            current.push(c);
        }
        let at_boundary = chars.peek().map_or(true, |next| next.is_whitespace());
        if c == '\n' || (TERMINATORS.contains(&c) && at_boundary) {
            push_sentence(&mut sentences, &current);
            current.clear();
        }
    }
    push_sentence(&mut sentences, &current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if !collapsed.is_empty() {
        sentences.push(collapsed);
    }
}

fn bound_length(sentence: &str, max_chars: usize) -> Vec<String> {
    if sentence.chars().count() <= max_chars {
        return vec![sentence.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        let word_len = word.chars().count();
        let current_len = current.chars().count();

        if current_len > 0 && current_len + 1 + word_len > max_chars {
            pieces.push(std::mem::take(&mut current));
        }

        if word_len > max_chars {
            // No whitespace to break at
            let chars: Vec<char> = word.chars().collect();
            for slice in chars.chunks(max_chars) {
                pieces.push(slice.iter().collect());
            }
            continue;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
