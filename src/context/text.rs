//! Shared text helpers: word splitting and stop words

const STOP_WORDS: &[&str] = &[
    "a", "about", "again", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be",
    "been", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has",
    "have", "he", "her", "him", "his", "how", "i", "i'm", "if", "in", "into", "is", "it",
    "it's", "its", "just", "me", "mentioned", "more", "my", "no", "not", "of", "on", "or",
    "our", "said", "say", "she", "so", "some", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "those", "to", "told", "us", "was", "we", "were",
    "what", "when", "where", "which", "who", "why", "will", "with", "would", "you", "your",
];

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Lowercased words with surrounding punctuation stripped
pub fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().filter_map(|raw| {
        let word = raw
            .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
            .trim_matches('\'')
            .to_lowercase();
        if word.is_empty() {
            None
        } else {
            Some(word)
        }
    })
}

/// Lowercased words that are not stop words
pub fn content_words(text: &str) -> impl Iterator<Item = String> + '_ {
    words(text).filter(|w| !is_stop_word(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_strip_punctuation() {
        let collected: Vec<String> = words("Hello, World! (it's) ...").collect();
        assert_eq!(collected, vec!["hello", "world", "it's"]);
    }

    #[test]
    fn test_content_words_drop_stop_words() {
        let collected: Vec<String> = content_words("What was my favorite color?").collect();
        assert_eq!(collected, vec!["favorite", "color"]);
    }
}
