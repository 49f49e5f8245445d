use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::config::SegmenterConfig;
use crate::error::Result;

/// Silence (ms) after which a new caption starts
pub const DEFAULT_MAX_GAP_MS: u64 = 600;
/// Longest joined caption text, in characters
pub const DEFAULT_MAX_CHARS: usize = 42;

/// A single transcribed word with millisecond timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub start: u64,
    pub end: u64,
    pub text: String,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

impl Word {
    pub fn new<S: Into<String>>(start: u64, end: u64, text: S) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            confidence: full_confidence(),
        }
    }

    fn ends_sentence(&self) -> bool {
        self.text.ends_with(['.', '?', '!'])
    }
}

fn full_confidence() -> f32 {
    1.0
}

/// A contiguous run of words shown together on screen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionChunk {
    pub start: u64,
    pub end: u64,
    pub text: String,
}

/// Groups words into caption chunks by silence, length and sentence ends
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    pub max_gap_ms: u64,
    pub max_chars: usize,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self {
            max_gap_ms: DEFAULT_MAX_GAP_MS,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

impl From<&SegmenterConfig> for Segmenter {
    fn from(config: &SegmenterConfig) -> Self {
        Self {
            max_gap_ms: config.max_gap_ms,
            max_chars: config.max_chars,
        }
    }
}

impl Segmenter {
    pub fn new(max_gap_ms: u64, max_chars: usize) -> Self {
        Self { max_gap_ms, max_chars }
    }

    pub fn segment(&self, words: &[Word]) -> Vec<CaptionChunk> {
        let mut chunks = Vec::new();
        let mut current: Vec<&Word> = Vec::new();
        let mut current_chars = 0usize;

        for word in words {
            let word_chars = word.text.chars().count();

            if let Some(prev) = current.last() {
                let gap = word.start.saturating_sub(prev.end);
                let joined = current_chars + 1 + word_chars;

                if gap > self.max_gap_ms || joined > self.max_chars || prev.ends_sentence() {
                    chunks.push(flush(&current));
                    current.clear();
                    current_chars = 0;
                }
            }

            current_chars = if current.is_empty() {
                word_chars
            } else {
                current_chars + 1 + word_chars
            };
            current.push(word);
        }

        if !current.is_empty() {
            chunks.push(flush(&current));
        }

        debug!("Segmented {} words into {} captions", words.len(), chunks.len());
        chunks
    }
}

fn flush(words: &[&Word]) -> CaptionChunk {
    let text = words
        .iter()
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    CaptionChunk {
        start: words[0].start,
        end: words[words.len() - 1].end,
        text,
    }
}

/// Segment with the default gap and length limits
pub fn segment(words: &[Word]) -> Vec<CaptionChunk> {
    Segmenter::default().segment(words)
}

/// Serialize chunks as a numbered SRT caption track
pub fn to_caption_track(chunks: &[CaptionChunk]) -> String {
    let mut srt_content = String::new();

    for (index, chunk) in chunks.iter().enumerate() {
        srt_content.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_srt_time(chunk.start),
            format_srt_time(chunk.end),
            chunk.text
        ));
    }

    srt_content
}

/// Write the caption track for `chunks` to `output_path`
pub async fn write_caption_track<P: AsRef<Path>>(
    chunks: &[CaptionChunk],
    output_path: P,
) -> Result<()> {
    let output_path = output_path.as_ref();
    info!("Writing caption track: {}", output_path.display());

    fs::write(output_path, to_caption_track(chunks)).await?;
    Ok(())
}

/// Format milliseconds as HH:MM:SS,mmm
pub fn format_srt_time(total_milliseconds: u64) -> String {
    let hours = total_milliseconds / 3_600_000;
    let minutes = (total_milliseconds % 3_600_000) / 60_000;
    let secs = (total_milliseconds % 60_000) / 1_000;
    let millis = total_milliseconds % 1_000;

    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(spec: &[(u64, u64, &str)]) -> Vec<Word> {
        spec.iter().map(|&(s, e, t)| Word::new(s, e, t)).collect()
    }

    fn assert_well_formed(input: &[Word], chunks: &[CaptionChunk]) {
        for pair in chunks.windows(2) {
            assert!(pair[0].end <= pair[1].start, "chunks overlap: {:?}", pair);
        }
        for chunk in chunks {
            assert!(chunk.start <= chunk.end);
        }
        let original = input.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ");
        let rebuilt = chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join(" ");
        assert_eq!(original, rebuilt);
    }

    #[test]
    fn test_format_srt_time() {
        assert_eq!(format_srt_time(0), "00:00:00,000");
        assert_eq!(format_srt_time(65_123), "00:01:05,123");
        assert_eq!(format_srt_time(3_661_500), "01:01:01,500");
        assert_eq!(format_srt_time(36_000_007), "10:00:00,007");
    }

    #[test]
    fn test_empty_input_yields_empty_track() {
        assert!(segment(&[]).is_empty());
        assert_eq!(to_caption_track(&segment(&[])), "");
    }

    #[test]
    fn test_gap_over_threshold_splits() {
        let input = words(&[(0, 400, "Hello"), (1200, 1500, "world")]);
        let chunks = segment(&input);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], CaptionChunk { start: 0, end: 400, text: "Hello".into() });
        assert_eq!(chunks[1], CaptionChunk { start: 1200, end: 1500, text: "world".into() });
    }

    #[test]
    fn test_gap_at_threshold_keeps_chunk() {
        let input = words(&[(0, 400, "Hello"), (1000, 1500, "world")]);
        let chunks = segment(&input);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 1500));
    }

    #[test]
    fn test_sentence_end_always_splits() {
        let input = words(&[(0, 100, "Go."), (100, 200, "Now"), (200, 300, "why?"), (300, 400, "Yes!"), (400, 500, "ok")]);
        let chunks = segment(&input);

        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["Go.", "Now why?", "Yes!", "ok"]);
        assert_well_formed(&input, &chunks);
    }

    #[test]
    fn test_char_limit_breaks_before_overflow() {
        let lyric = "we were dancing in the kitchen light until the morning came around again";
        let input: Vec<Word> = lyric
            .split(' ')
            .enumerate()
            .map(|(i, t)| Word::new(i as u64 * 300, i as u64 * 300 + 250, t))
            .collect();

        let chunks = segment(&input);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= DEFAULT_MAX_CHARS, "too long: {}", chunk.text);
        }
        // Each break happens only because the next word would not fit
        for pair in chunks.windows(2) {
            let next_word = pair[1].text.split(' ').next().unwrap();
            assert!(pair[0].text.chars().count() + 1 + next_word.chars().count() > DEFAULT_MAX_CHARS);
        }
        assert_well_formed(&input, &chunks);
    }

    #[test]
    fn test_oversized_single_word_is_its_own_chunk() {
        let long = "a".repeat(60);
        let input = words(&[(0, 100, "hi"), (100, 200, &long), (200, 300, "there")]);
        let chunks = Segmenter::default().segment(&input);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].text, long);
        assert_well_formed(&input, &chunks);
    }

    #[test]
    fn test_custom_limits() {
        let input = words(&[(0, 100, "one"), (250, 300, "two"), (320, 400, "three")]);
        let chunks = Segmenter::new(100, 100).segment(&input);

        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two three"]);
    }

    #[test]
    fn test_caption_track_format() {
        let chunks = vec![
            CaptionChunk { start: 0, end: 1_250, text: "Hello there".into() },
            CaptionChunk { start: 61_000, end: 3_723_004, text: "world".into() },
        ];

        assert_eq!(
            to_caption_track(&chunks),
            "1\n00:00:00,000 --> 00:00:01,250\nHello there\n\n\
             2\n00:01:01,000 --> 01:02:03,004\nworld\n\n"
        );
    }

    #[tokio::test]
    async fn test_write_caption_track() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captions.srt");
        let chunks = segment(&words(&[(0, 400, "Hello"), (1200, 1500, "world")]));

        write_caption_track(&chunks, &path).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("1\n00:00:00,000 --> 00:00:00,400\nHello\n\n2\n"));
    }

    #[test]
    fn test_word_confidence_defaults_when_missing() {
        let word: Word = serde_json::from_str(r#"{"start": 10, "end": 20, "text": "la"}"#).unwrap();
        assert_eq!(word, Word::new(10, 20, "la"));
        assert_eq!(word.confidence, 1.0);
    }

    /// Deterministic word sequences mixing gaps, lengths and punctuation
    fn generated(seed: u64, count: usize, limits: &Segmenter) -> Vec<Word> {
        let mut state = seed;
        let mut next = move |bound: u64| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) % bound
        };

        let mut words = Vec::with_capacity(count);
        let mut clock = 0u64;
        for _ in 0..count {
            let gap = match next(5) {
                0 => limits.max_gap_ms,
                1 => limits.max_gap_ms + 1,
                2 => 0,
                _ => next(limits.max_gap_ms),
            };
            let len = match next(8) {
                0 => limits.max_chars,
                1 => limits.max_chars + 3,
                _ => 1 + next(9) as usize,
            };
            let mut text = "x".repeat(len);
            match next(6) {
                0 => text.push('.'),
                1 => text.push('?'),
                2 => text.push('!'),
                _ => {}
            }

            let start = clock + gap;
            let end = start + 50 + next(400);
            words.push(Word::new(start, end, text));
            clock = end;
        }
        words
    }

    #[test]
    fn test_segment_invariants_on_generated_sequences() {
        for limits in [Segmenter::default(), Segmenter::new(200, 12)] {
            for seed in 0..200u64 {
                let input = generated(seed, 1 + (seed % 40) as usize, &limits);
                let chunks = limits.segment(&input);
                assert_well_formed(&input, &chunks);

                let mut remaining = input.as_slice();
                for chunk in &chunks {
                    let taken = chunk.text.split(' ').count();
                    let (members, rest) = remaining.split_at(taken);
                    remaining = rest;

                    assert_eq!(chunk.start, members[0].start);
                    assert_eq!(chunk.end, members[taken - 1].end);
                    if taken > 1 {
                        assert!(chunk.text.chars().count() <= limits.max_chars, "seed {}: {}", seed, chunk.text);
                    }
                    for pair in members.windows(2) {
                        assert!(pair[1].start - pair[0].end <= limits.max_gap_ms, "seed {}", seed);
                        assert!(!pair[0].ends_sentence(), "seed {}", seed);
                    }
                }
                assert!(remaining.is_empty());
            }
        }
    }

    #[test]
    fn test_word_exactly_at_char_limit_fits_alone() {
        let full = "y".repeat(DEFAULT_MAX_CHARS);
        let input = words(&[(0, 100, &full), (100, 200, "a")]);
        let chunks = segment(&input);

        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec![full.as_str(), "a"]);
    }
}
