//! Synthesis scheduler: parallel TTS, strictly ordered output.
//!
//! Chunks get a sequence number on submission and run on a bounded worker
//! pool. Results land in a reorder buffer and leave only when every earlier
//! sequence number has been released, so audio order always matches text
//! order. A failed chunk releases its slot empty instead of holding up the
//! rest.

use crate::command::{CommandListener, Inbox};
use crate::error::{VoiceError, VoiceResult};
use crate::message::{AudioBuffer, Chunk, Envelope, Generation, SynthesisTask, SynthesizedAudio};
use crate::voice_output::TtsBackend;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Holds out-of-order results until the head of the sequence is ready.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    slots: BTreeMap<u64, Option<T>>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            slots: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    /// Record the outcome for `seq`; `None` marks a slot that produced nothing.
    /// Sequence numbers already released are ignored.
    pub fn complete(&mut self, seq: u64, item: Option<T>) {
        if seq < self.next {
            debug!(seq, next = self.next, "ignoring result for released slot");
            return;
        }
        self.slots.insert(seq, item);
    }

    /// Everything now releasable, in order. Empty slots are skipped.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(item) = self.slots.remove(&self.next) {
            self.next += 1;
            if let Some(item) = item {
                ready.push(item);
            }
        }
        ready
    }

    pub fn next_seq(&self) -> u64 {
        self.next
    }

    /// Results waiting on an earlier slot.
    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    pub fn reset(&mut self) {
        self.next = 0;
        self.slots.clear();
    }
}

type TaskOutcome = (u64, Generation, String, VoiceResult<AudioBuffer>);

pub struct SynthesisScheduler {
    tts: Arc<dyn TtsBackend>,
    workers: Arc<Semaphore>,
    queue_depth: usize,
    commands: CommandListener,
    generation: Generation,
    next_seq: u64,
    cancel: CancellationToken,
    tasks: JoinSet<TaskOutcome>,
    reorder: ReorderBuffer<SynthesizedAudio>,
}

impl SynthesisScheduler {
    pub fn new(tts: Arc<dyn TtsBackend>, workers: usize, queue_depth: usize, commands: CommandListener) -> Self {
        let generation = commands.bus().generation();
        Self {
            tts,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            queue_depth: queue_depth.max(workers).max(1),
            commands,
            generation,
            next_seq: 0,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            reorder: ReorderBuffer::default(),
        }
    }

    /// Assign the next sequence number and start synthesis in the background.
    pub fn submit(&mut self, chunk: Chunk) -> SynthesisTask {
        let task = SynthesisTask {
            seq: self.next_seq,
            chunk,
        };
        self.next_seq += 1;

        let seq = task.seq;
        let generation = task.chunk.generation;
        let text = task.chunk.text.clone();
        let tts = Arc::clone(&self.tts);
        let workers = Arc::clone(&self.workers);
        let token = self.cancel.clone();

        self.tasks.spawn(async move {
            let permit = tokio::select! {
                _ = token.cancelled() => return (seq, generation, text, Err(VoiceError::Cancelled)),
                permit = workers.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return (seq, generation, text, Err(VoiceError::Tts("worker pool closed".into()))),
                },
            };

            let job_text = text.clone();
            let job_token = token.clone();
            let job = tokio::task::spawn_blocking(move || {
                // The permit lives as long as the engine call, even if the
                // waiting task below is cancelled.
                let _permit = permit;
                if job_token.is_cancelled() {
                    return Err(VoiceError::Cancelled);
                }
                tts.synthesize(&job_text)
            });

            let result = tokio::select! {
                _ = token.cancelled() => Err(VoiceError::Cancelled),
                joined = job => joined.unwrap_or_else(|e| Err(VoiceError::Tts(format!("synthesis worker failed: {e}")))),
            };
            (seq, generation, text, result)
        });

        debug!(seq, generation, in_flight = self.tasks.len(), "chunk submitted");
        task
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Apply a CLEAR for `generation`. Already-applied generations are a
    /// no-op, so a CLEAR seen first through a data stamp and later through
    /// the bus is handled once.
    fn clear(&mut self, generation: Generation, input: &mut Inbox<Chunk>) {
        if generation <= self.generation {
            return;
        }
        self.generation = generation;
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        let cancelled = self.tasks.len();
        // Dropping the set aborts the waiting tasks; blocking engine calls
        // already running finish on their own and are never read.
        self.tasks = JoinSet::new();
        let unreleased = self.reorder.pending();
        self.reorder.reset();
        self.next_seq = 0;
        let discarded = input.drain_stale(|chunk| chunk.generation < generation);
        info!(generation, cancelled, unreleased, discarded, "synthesis queue cleared");
    }

    fn record(&mut self, outcome: TaskOutcome) {
        let (seq, generation, text, result) = outcome;
        if generation != self.generation {
            return;
        }
        let audio = match result {
            Ok(audio) if !audio.is_empty() => Some(SynthesizedAudio {
                seq,
                generation,
                text,
                audio,
            }),
            Ok(_) => {
                warn!(seq, "synthesis produced no audio; skipping chunk");
                None
            }
            Err(VoiceError::Cancelled) => None,
            Err(e) => {
                warn!(seq, error = %e, "synthesis failed; skipping chunk");
                None
            }
        };
        self.reorder.complete(seq, audio);
    }

    /// Send released audio downstream, giving way to CLEAR. Returns false
    /// once playback has gone away.
    async fn release(
        &mut self,
        input: &mut Inbox<Chunk>,
        output: &mpsc::Sender<Envelope<SynthesizedAudio>>,
    ) -> bool {
        for audio in self.reorder.drain_ready() {
            if audio.generation != self.generation {
                continue;
            }
            debug!(seq = audio.seq, "releasing audio");
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    self.clear(command.generation, input);
                    return true;
                }
                sent = output.send(Envelope::Data(audio)) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub async fn run(mut self, mut input: Inbox<Chunk>, output: mpsc::Sender<Envelope<SynthesizedAudio>>) {
        info!(queue_depth = self.queue_depth, "synthesis scheduler started");
        let mut session_over = false;

        loop {
            if session_over && self.tasks.is_empty() {
                break;
            }
            let unreleased = self.tasks.len() + self.reorder.pending();
            let accepting = !session_over && unreleased < self.queue_depth;

            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    self.clear(command.generation, &mut input);
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match joined {
                        Ok(outcome) => self.record(outcome),
                        Err(e) => error!(error = %e, "synthesis task failed to join"),
                    }
                    if !self.release(&mut input, &output).await {
                        warn!("playback queue closed; scheduler exiting");
                        return;
                    }
                }
                item = input.recv(), if accepting => match item {
                    Envelope::Data(chunk) => {
                        let current = self.commands.bus().generation();
                        if chunk.generation < current {
                            debug!(generation = chunk.generation, current, "dropping stale chunk");
                        } else {
                            if chunk.generation > self.generation {
                                self.clear(chunk.generation, &mut input);
                            }
                            self.submit(chunk);
                        }
                    }
                    Envelope::EndOfSession => {
                        debug!(in_flight = self.tasks.len(), "session ending; waiting for synthesis");
                        session_over = true;
                    }
                },
            }
        }

        let _ = output.send(Envelope::EndOfSession).await;
        info!("synthesis scheduler stopped");
    }
}
