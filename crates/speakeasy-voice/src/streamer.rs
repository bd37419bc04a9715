//! Completion streamer stage: one utterance in, a turn of text fragments out.

use crate::command::CommandListener;
use crate::completion::{ChatRequest, CompletionService};
use crate::message::{Envelope, TextEvent, TranscriptEvent, Utterance};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The downstream queue is gone; nothing left to do.
struct Disconnected;

pub struct CompletionStreamer {
    service: Arc<dyn CompletionService>,
    system_prompt: String,
    transcript: Option<mpsc::UnboundedSender<TranscriptEvent>>,
    /// Drop the in-flight reply when CLEAR arrives mid-turn.
    abort_on_clear: bool,
    commands: CommandListener,
}

impl CompletionStreamer {
    pub fn new(
        service: Arc<dyn CompletionService>,
        system_prompt: impl Into<String>,
        commands: CommandListener,
    ) -> Self {
        Self {
            service,
            system_prompt: system_prompt.into(),
            transcript: None,
            abort_on_clear: false,
            commands,
        }
    }

    pub fn with_transcript(mut self, transcript: mpsc::UnboundedSender<TranscriptEvent>) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn abort_on_clear(mut self, abort: bool) -> Self {
        self.abort_on_clear = abort;
        self
    }

    fn publish(&self, event: TranscriptEvent) {
        if let Some(tx) = &self.transcript {
            // Nobody reading the transcript is fine.
            let _ = tx.send(event);
        }
    }

    pub async fn run(mut self, mut input: mpsc::Receiver<Envelope<Utterance>>, output: mpsc::Sender<TextEvent>) {
        info!(service = self.service.name(), "completion streamer started");
        loop {
            let utterance = tokio::select! {
                biased;
                // Between turns there is nothing in flight to abort.
                _ = self.commands.recv() => continue,
                next = input.recv() => match next {
                    Some(Envelope::Data(utterance)) => utterance,
                    Some(Envelope::EndOfSession) | None => break,
                },
            };

            let text = utterance.text().trim();
            if text.is_empty() {
                continue;
            }
            let text = text.to_string();
            if self.stream_turn(&text, &output).await.is_err() {
                warn!("segmenter queue closed; completion streamer exiting");
                return;
            }
            if output.send(TextEvent::EndOfTurn).await.is_err() {
                return;
            }
        }

        let _ = output.send(TextEvent::EndOfSession).await;
        info!("completion streamer stopped");
    }

    /// Stream one reply. Service errors end the turn early and are not
    /// propagated; only a closed output is.
    async fn stream_turn(&mut self, text: &str, output: &mpsc::Sender<TextEvent>) -> Result<(), Disconnected> {
        self.publish(TranscriptEvent::UserTurn(text.to_string()));
        let request = ChatRequest::new(self.system_prompt.clone(), text);

        let mut fragments = match self.service.stream_chat(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, upstream = e.is_upstream(), "completion request failed; skipping turn");
                self.publish(TranscriptEvent::TurnFailed(e.to_string()));
                return Ok(());
            }
        };

        let mut received = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.commands.recv(), if self.abort_on_clear => {
                    info!(received, "reply abandoned after CLEAR");
                    break;
                }
                next = fragments.next() => next,
            };

            match next {
                Some(Ok(delta)) => {
                    if delta.is_empty() {
                        continue;
                    }
                    received += delta.chars().count();
                    self.publish(TranscriptEvent::Delta(delta.clone()));
                    let generation = self.commands.bus().generation();
                    if output.send(TextEvent::fragment(delta, generation)).await.is_err() {
                        return Err(Disconnected);
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, received, "completion stream failed mid-turn");
                    self.publish(TranscriptEvent::TurnFailed(e.to_string()));
                    return Ok(());
                }
                None => break,
            }
        }

        debug!(received, "reply complete");
        self.publish(TranscriptEvent::TurnComplete);
        Ok(())
    }
}
