const SENTENCE_END: &[char] = &['.', '!', '?', '…', '。', '！', '？'];
const CLOSERS: &[char] = &['"', '\'', '”', '’', ')', '」', '』'];

pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

pub fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Splits on sentence terminators, keeping trailing closing quotes with the
/// sentence they close.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        current.push(c);
        i += 1;
        if !SENTENCE_END.contains(&c) {
            continue;
        }
        while i < chars.len() && (SENTENCE_END.contains(&chars[i]) || CLOSERS.contains(&chars[i])) {
            current.push(chars[i]);
            i += 1;
        }
        let at_boundary = i >= chars.len() || chars[i].is_whitespace() || !c.is_ascii();
        if at_boundary {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Packs whole sentences into chunks of at most `max_chars` characters.
/// A single sentence longer than the ceiling is split at word boundaries,
/// and only a word longer than the ceiling is cut mid-word.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        let pieces = if char_len(&sentence) > max_chars {
            split_oversized(&sentence, max_chars)
        } else {
            vec![sentence]
        };
        for piece in pieces {
            let extra = if current.is_empty() { 0 } else { 1 };
            if !current.is_empty() && char_len(&current) + extra + char_len(&piece) > max_chars {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&piece);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_oversized(sentence: &str, max_chars: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        let mut word = word.to_string();
        while char_len(&word) > max_chars {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            let head: String = word.chars().take(max_chars).collect();
            word = word.chars().skip(max_chars).collect();
            parts.push(head);
        }
        if word.is_empty() {
            continue;
        }
        let extra = if current.is_empty() { 0 } else { 1 };
        if char_len(&current) + extra + char_len(&word) > max_chars {
            parts.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Cuts to at most `max_chars` characters, backing off to a word boundary.
pub fn truncate_at_word(s: &str, max_chars: usize) -> String {
    let s = s.trim();
    if char_len(s) <= max_chars {
        return s.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let head: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    let cut = match head.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => &head[..idx],
        _ => head.as_str(),
    };
    let cut = cut.trim_end_matches(|c: char| c == ',' || c == ';' || c == ':' || c.is_whitespace());
    format!("{}…", cut)
}
