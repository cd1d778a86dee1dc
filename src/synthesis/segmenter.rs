//! Sentence segmentation for streamed LLM text
//!
//! Tokens arrive at arbitrary granularity. The segmenter buffers them and
//! releases complete sentences as soon as their terminating punctuation is
//! seen, so synthesis can start before the reply is finished.

use std::fmt;

/// Characters that end a sentence
const TERMINATORS: [char; 3] = ['.', '!', '?'];

/// Closing quotes and brackets that stay attached to a terminator
const CLOSERS: [char; 6] = ['"', '\'', ')', ']', '\u{201D}', '\u{2019}'];

/// A complete, trimmed span of text queued for synthesis
///
/// Never empty. Once created the text is not split again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechUnit {
    text: String,
}

impl SpeechUnit {
    /// Create a unit from text, or `None` if nothing is left after trimming
    #[must_use]
    pub fn new(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self {
            text: trimmed.to_string(),
        })
    }

    /// Unit text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Whether the unit is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Display for SpeechUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Groups text fragments into sentence units
#[derive(Debug, Default)]
pub struct TextSegmenter {
    buffer: String,
}

impl TextSegmenter {
    /// Create an empty segmenter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every sentence it completed
    ///
    /// Units are returned left to right. Text after the last terminator
    /// stays buffered for the next fragment, and so does a terminator at the
    /// very end of the buffer, since the next fragment may extend its run.
    pub fn feed(&mut self, fragment: &str) -> Vec<SpeechUnit> {
        if fragment.is_empty() {
            return Vec::new();
        }

        self.buffer.push_str(fragment);

        let mut units = Vec::new();
        let mut start = 0;
        let mut chars = self.buffer.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            if !TERMINATORS.contains(&c) {
                continue;
            }

            // "?!", "..." and a trailing closing quote belong to the same sentence
            let mut end = i + c.len_utf8();
            while let Some(&(j, next)) = chars.peek() {
                if TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                    end = j + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }

            if end == self.buffer.len() {
                break;
            }

            if let Some(unit) = SpeechUnit::new(&self.buffer[start..end]) {
                units.push(unit);
            }
            start = end;
        }

        self.buffer.drain(..start);

        if !units.is_empty() {
            tracing::trace!(
                units = units.len(),
                remainder = self.buffer.len(),
                "segmented fragment"
            );
        }

        units
    }

    /// Flush whatever remains at the end of a reply
    ///
    /// Returns `None` for an empty or whitespace-only remainder. The buffer is
    /// always cleared.
    pub fn end_of_reply(&mut self) -> Option<SpeechUnit> {
        let unit = SpeechUnit::new(&self.buffer);
        self.buffer.clear();
        unit
    }

    /// Drop any partial sentence
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Text waiting for a terminator
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}
