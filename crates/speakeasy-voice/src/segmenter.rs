//! Turns streamed model text into bounded, speakable chunks.
//!
//! The first chunk of a turn goes out as soon as enough text has arrived
//! (the fast path) so speech starts early. After that, text is cut at
//! sentence ends, and anything longer than the size limit is re-split on
//! clause punctuation and then on whitespace.

use crate::command::CommandListener;
use crate::config::{NormalizationOrder, SegmenterConfig};
use crate::message::{Chunk, Envelope, Generation, TextEvent};
use crate::normalize::TextNormalizer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn is_sentence_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？')
}

fn is_closing_mark(c: char) -> bool {
    matches!(
        c,
        '"' | '\'' | ')' | ']' | '”' | '’' | '）' | '」' | '』' | '》'
    )
}

fn is_clause_delimiter(c: char) -> bool {
    matches!(c, ',' | ';' | '，' | '；' | '、')
}

/// Clause and sentence marks that need no following space to end a token.
fn is_wide_break(c: char) -> bool {
    matches!(c, '，' | '；' | '、' | '。' | '！' | '？')
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split off every complete sentence at the front of `buf`. Returns the
/// sentences and the byte offset where the unfinished remainder starts.
///
/// A run of terminals and closing marks is one boundary. A run ending in
/// `.` only counts when whitespace follows (so "3.14" survives), and a run
/// at the very end of the buffer waits for more text.
fn split_sentences(buf: &str) -> (Vec<&str>, usize) {
    let chars: Vec<(usize, char)> = buf.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        if !is_sentence_terminal(chars[i].1) {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        let mut last_terminal = chars[i].1;
        while j < chars.len() && (is_sentence_terminal(chars[j].1) || is_closing_mark(chars[j].1)) {
            if is_sentence_terminal(chars[j].1) {
                last_terminal = chars[j].1;
            }
            j += 1;
        }
        if j == chars.len() {
            break;
        }
        if last_terminal == '.' && !chars[j].1.is_whitespace() {
            i = j;
            continue;
        }

        let end = chars[j].0;
        sentences.push(&buf[start..end]);
        start = end;
        i = j;
    }

    (sentences, start)
}

/// Byte offset where the fast path may cut `buf` without splitting a token
/// that could still be growing, or `None` to wait for more text.
///
/// The trailing token is only complete once whitespace follows it, so the
/// cut goes after the last whitespace or wide break. With no such point the
/// whole buffer goes out, unless it ends like a number in progress.
fn fast_path_cut(buf: &str) -> Option<usize> {
    let last = buf.chars().next_back()?;
    if last.is_whitespace() {
        return Some(buf.len());
    }
    let cut = buf
        .char_indices()
        .rev()
        .find(|&(_, c)| c.is_whitespace() || is_wide_break(c))
        .map(|(idx, c)| idx + c.len_utf8());
    match cut {
        Some(cut) if !buf[..cut].trim().is_empty() => Some(cut),
        _ if last.is_ascii_digit() || matches!(last, ',' | '.') => None,
        _ => Some(buf.len()),
    }
}

/// Greedily join pieces while the running length stays within `max`.
fn pack<'a>(pieces: impl IntoIterator<Item = &'a str>, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for piece in pieces {
        if !current.is_empty() && char_len(&current) + char_len(piece) > max {
            out.push(std::mem::take(&mut current));
        }
        current.push_str(piece);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Pieces ending in a delimiter group; a run of delimiters is never split.
fn clause_pieces(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut iter = text.char_indices().peekable();
    while let Some((idx, c)) = iter.next() {
        if !is_clause_delimiter(c) {
            continue;
        }
        let next_is_delim = iter.peek().is_some_and(|&(_, n)| is_clause_delimiter(n));
        if !next_is_delim {
            let end = idx + c.len_utf8();
            pieces.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Cut `text` into pieces of at most `max` characters. A single token with
/// no delimiter or whitespace to split on is returned whole.
pub fn enforce_length(text: &str, max: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if char_len(text) <= max {
        return vec![text.to_string()];
    }

    let mut out = Vec::new();
    for clause in pack(clause_pieces(text), max) {
        if char_len(&clause) <= max {
            out.push(clause);
        } else {
            out.extend(pack(clause.split_inclusive(char::is_whitespace), max));
        }
    }
    out.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub struct Segmenter {
    config: SegmenterConfig,
    normalizer: Option<Arc<dyn TextNormalizer>>,
    buffer: String,
    fast_path_armed: bool,
    turn_active: bool,
    muted: bool,
    generation: Generation,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig, normalizer: Option<Arc<dyn TextNormalizer>>) -> Self {
        Self {
            config,
            normalizer,
            buffer: String::new(),
            fast_path_armed: true,
            turn_active: false,
            muted: false,
            generation: 0,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Accept a fragment and return every chunk that is now final.
    pub fn feed(&mut self, fragment: &str) -> Vec<Chunk> {
        if self.muted {
            return Vec::new();
        }
        self.turn_active = true;
        self.buffer.push_str(fragment);

        if self.fast_path_armed && char_len(&self.buffer) >= self.config.fast_path_min_chars {
            if let Some(cut) = fast_path_cut(&self.buffer) {
                self.fast_path_armed = false;
                let text: String = self.buffer.drain(..cut).collect();
                debug!(chars = char_len(&text), held_back = char_len(&self.buffer), "fast-path chunk");
                return self.finalize(&text);
            }
        }

        let (sentences, consumed) = split_sentences(&self.buffer);
        if sentences.is_empty() {
            return Vec::new();
        }
        let sentences: Vec<String> = sentences.into_iter().map(str::to_string).collect();
        self.buffer.drain(..consumed);

        let chunks: Vec<Chunk> = sentences.iter().flat_map(|s| self.finalize(s)).collect();
        if !chunks.is_empty() {
            self.fast_path_armed = false;
        }
        chunks
    }

    /// End of turn: emit whatever is left and re-arm for the next turn.
    pub fn flush(&mut self) -> Vec<Chunk> {
        let rest = std::mem::take(&mut self.buffer);
        let chunks = if self.muted { Vec::new() } else { self.finalize(&rest) };
        self.fast_path_armed = true;
        self.turn_active = false;
        self.muted = false;
        chunks
    }

    /// CLEAR: forget buffered text. Mid-turn, the rest of the turn is muted
    /// when configured; otherwise the next chunk gets the fast path again.
    pub fn interrupt(&mut self, generation: Generation) {
        if generation <= self.generation {
            return;
        }
        self.generation = generation;
        let dropped = char_len(&self.buffer);
        self.buffer.clear();
        if self.turn_active && self.config.mute_rest_of_turn {
            self.muted = true;
        } else {
            self.fast_path_armed = true;
        }
        info!(generation, dropped_chars = dropped, muted = self.muted, "segmenter cleared");
    }

    fn normalize(&self, text: &str) -> String {
        let Some(normalizer) = self.normalizer.as_ref().filter(|_| self.config.normalize) else {
            return text.to_string();
        };
        match normalizer.normalize(text) {
            Ok(spoken) => spoken,
            Err(e) => {
                warn!(error = %e, "normalization failed; speaking chunk as written");
                text.to_string()
            }
        }
    }

    fn finalize(&self, text: &str) -> Vec<Chunk> {
        let max = self.config.max_chunk_chars;
        let pieces = match self.config.normalization_order {
            NormalizationOrder::BeforeSplit => enforce_length(&self.normalize(text.trim()), max),
            NormalizationOrder::AfterSplit => enforce_length(text, max)
                .iter()
                .map(|piece| self.normalize(piece))
                .collect(),
        };
        pieces
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| Chunk::new(p, self.generation))
            .collect()
    }
}

/// Segmenter stage: text events in, chunks out.
pub struct SegmenterStage {
    segmenter: Segmenter,
    commands: CommandListener,
}

impl SegmenterStage {
    pub fn new(segmenter: Segmenter, commands: CommandListener) -> Self {
        Self {
            segmenter,
            commands,
        }
    }

    pub async fn run(mut self, mut input: mpsc::Receiver<TextEvent>, output: mpsc::Sender<Envelope<Chunk>>) {
        info!("segmenter started");
        loop {
            let event = tokio::select! {
                biased;
                command = self.commands.recv() => {
                    self.segmenter.interrupt(command.generation);
                    continue;
                }
                event = input.recv() => event.unwrap_or(TextEvent::EndOfSession),
            };

            let (chunks, session_over) = match event {
                TextEvent::Fragment { text, generation } => {
                    // The bus may already be ahead of the broadcast we have
                    // seen; anything read before the newest CLEAR is stale.
                    let current = self.commands.bus().generation().max(self.segmenter.generation());
                    if generation < current {
                        self.segmenter.interrupt(current);
                        debug!(generation, current, chars = char_len(&text), "dropping fragment from before CLEAR");
                        continue;
                    }
                    (self.segmenter.feed(&text), false)
                }
                TextEvent::EndOfTurn => (self.segmenter.flush(), false),
                TextEvent::EndOfSession => (self.segmenter.flush(), true),
            };

            if !self.forward(chunks, &output).await {
                break;
            }
            if session_over {
                let _ = output.send(Envelope::EndOfSession).await;
                break;
            }
        }
        info!("segmenter stopped");
    }

    /// Send chunks downstream without ever blocking CLEAR. Returns false once
    /// the scheduler has gone away.
    async fn forward(&mut self, chunks: Vec<Chunk>, output: &mpsc::Sender<Envelope<Chunk>>) -> bool {
        for chunk in chunks {
            debug!(chars = chunk.char_len(), generation = chunk.generation, "chunk ready");
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    self.segmenter.interrupt(command.generation);
                    return true;
                }
                sent = output.send(Envelope::Data(chunk)) => {
                    if sent.is_err() {
                        warn!("scheduler queue closed; segmenter exiting");
                        return false;
                    }
                }
            }
        }
        true
    }
}
