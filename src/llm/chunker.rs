//! Cuts streamed reply text into speakable pieces

/// Punctuation that ends a clause regardless of what follows
const CJK_BREAKS: &[char] = &['。', '！', '？', '；', '，', '、', '：', '…', '\n'];

/// ASCII punctuation that ends a clause only when followed by whitespace,
/// so `3.14` and `1,000` stay whole
const ASCII_BREAKS: &[char] = &['.', '!', '?', ';', ',', ':'];

/// Closing marks kept with the clause they end
const CLOSERS: &[char] = &['”', '’', '」', '』', '）', ')', '"', '\''];

/// Incremental sentence and clause segmentation
///
/// Text is held until a break yields at least `min_chars` characters, or
/// until more than `max_chars` accumulate without one, in which case it is
/// cut at the last whitespace (or at a character boundary when there is
/// none).
#[derive(Debug, Clone)]
pub struct SentenceChunker {
    buffer: String,
    min_chars: usize,
    max_chars: usize,
}

impl SentenceChunker {
    #[must_use]
    pub fn new(min_chars: usize, max_chars: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            buffer: String::new(),
            min_chars: min_chars.min(max_chars),
            max_chars,
        }
    }

    /// Append a delta and return every chunk it completed
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut chunks = Vec::new();
        while let Some(end) = self.break_point().or_else(|| self.overflow_point()) {
            let piece: String = self.buffer.drain(..end).collect();
            let piece = piece.trim();
            if !piece.is_empty() {
                chunks.push(piece.to_string());
            }
        }
        chunks
    }

    /// Take whatever is left
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Whether any text is held back
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }

    /// Byte offset just past the first break that makes a long enough chunk
    fn break_point(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();

        while let Some((idx, ch)) = chars.next() {
            let is_break = if CJK_BREAKS.contains(&ch) {
                true
            } else if ASCII_BREAKS.contains(&ch) {
                chars.peek().is_some_and(|&(_, next)| next.is_whitespace())
            } else {
                false
            };
            if !is_break {
                continue;
            }

            let mut end = idx + ch.len_utf8();
            while let Some(&(next_idx, next)) = chars.peek() {
                if !CLOSERS.contains(&next) {
                    break;
                }
                end = next_idx + next.len_utf8();
                chars.next();
            }

            if self.buffer[..end].trim().chars().count() >= self.min_chars {
                return Some(end);
            }
        }

        None
    }

    /// Forced cut once the buffer runs past `max_chars`
    fn overflow_point(&self) -> Option<usize> {
        let (limit, next) = self.buffer.char_indices().nth(self.max_chars)?;
        if next.is_whitespace() {
            return Some(limit);
        }

        let head = &self.buffer[..limit];
        match head.rfind(char::is_whitespace) {
            Some(pos) if !head[..pos].trim().is_empty() => Some(pos),
            _ => Some(limit),
        }
    }
}

impl Default for SentenceChunker {
    fn default() -> Self {
        Self::new(4, 120)
    }
}
