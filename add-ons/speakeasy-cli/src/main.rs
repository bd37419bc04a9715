//! Speakeasy terminal front end.
//!
//! Reads one utterance per line from stdin and speaks the model's reply as
//! it streams. `/clear` interrupts speech, `exit` or `quit` ends the
//! session after the queued audio has played, CTRL-C ends it as well.

use anyhow::Context;
use speakeasy_voice::{PipelineConfig, PipelineHandle, TranscriptEvent, VoicePipeline};
use std::collections::VecDeque;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Input {
    Say(String),
    Clear,
    Quit,
}

fn parse_line(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        None
    } else if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
        Some(Input::Quit)
    } else if line.eq_ignore_ascii_case("/clear") {
        Some(Input::Clear)
    } else {
        Some(Input::Say(line.to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[speakeasy] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = PipelineConfig::load().context("load speakeasy config")?;
    let mut handle = VoicePipeline::from_config(config)
        .context("build voice pipeline")?
        .start()
        .context("start voice pipeline")?;

    if let Some(transcript) = handle.take_transcript() {
        tokio::spawn(print_transcript(transcript));
    }

    tracing::info!("speakeasy ready");
    println!("Type a message and press enter. /clear interrupts, exit quits.");

    // Lines typed while the pipeline is still busy wait here, so a full
    // utterance queue never stops /clear or CTRL-C from being read.
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                pending.clear();
                handle.clear();
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("read stdin")? else {
                    break;
                };
                match parse_line(&line) {
                    Some(Input::Say(text)) => pending.push_back(text),
                    Some(Input::Clear) => {
                        let dropped = pending.len();
                        pending.clear();
                        let generation = handle.clear();
                        tracing::info!(generation, dropped, "speech cleared");
                    }
                    Some(Input::Quit) => break,
                    None => {}
                }
            }
            sent = submit_next(&handle, &mut pending), if !pending.is_empty() => sent?,
        }
    }

    while !pending.is_empty() {
        submit_next(&handle, &mut pending).await?;
    }
    handle.finish().await.context("shut down voice pipeline")?;
    // The stdin reader can still be parked in a blocking read, which would
    // keep the runtime from shutting down.
    std::process::exit(0)
}

/// Hand the oldest pending line to the pipeline. The line leaves the queue
/// only once it has been accepted, so dropping this future loses nothing.
async fn submit_next(handle: &PipelineHandle, pending: &mut VecDeque<String>) -> anyhow::Result<()> {
    let Some(text) = pending.front().cloned() else {
        return Ok(());
    };
    handle.submit(text).await.context("submit utterance")?;
    pending.pop_front();
    Ok(())
}

async fn print_transcript(mut transcript: mpsc::UnboundedReceiver<TranscriptEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = transcript.recv().await {
        match event {
            TranscriptEvent::UserTurn(_) => {
                let _ = write!(stdout, "assistant> ");
            }
            TranscriptEvent::Delta(text) => {
                let _ = write!(stdout, "{text}");
            }
            TranscriptEvent::TurnComplete => {
                let _ = writeln!(stdout);
            }
            TranscriptEvent::TurnFailed(reason) => {
                let _ = writeln!(stdout, "\n[reply failed: {reason}]");
            }
        }
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_recognised() {
        assert!(matches!(parse_line("  exit "), Some(Input::Quit)));
        assert!(matches!(parse_line("quit"), Some(Input::Quit)));
        assert!(matches!(parse_line("EXIT"), Some(Input::Quit)));
        assert!(matches!(parse_line("Quit"), Some(Input::Quit)));
        assert!(matches!(parse_line("/clear"), Some(Input::Clear)));
        assert!(matches!(parse_line("/CLEAR"), Some(Input::Clear)));
        assert!(parse_line("   ").is_none());
        match parse_line(" hello there ") {
            Some(Input::Say(text)) => assert_eq!(text, "hello there"),
            _ => panic!("expected an utterance"),
        }
    }

    /// Never answers, so the streamer stays busy with the first turn.
    struct SilentCompletion;

    #[async_trait::async_trait]
    impl speakeasy_voice::CompletionService for SilentCompletion {
        async fn stream_chat(
            &self,
            _request: speakeasy_voice::ChatRequest,
        ) -> speakeasy_voice::VoiceResult<speakeasy_voice::FragmentStream> {
            Ok(Box::pin(futures::stream::pending()))
        }

        fn name(&self) -> &str {
            "silent"
        }
    }

    #[tokio::test]
    async fn blocked_submission_leaves_the_line_queued() {
        use speakeasy_voice::{OutputDevice, PlaceholderTts, VoiceIdentity};
        use std::sync::Arc;
        use std::time::Duration;

        let mut config = PipelineConfig::default();
        config.pipeline.channel_capacity = 1;
        config.playback.device = OutputDevice::Null;
        let tts = Arc::new(PlaceholderTts::new(Arc::new(VoiceIdentity::generate("alloy")), 24_000));
        let handle = VoicePipeline::new(config, Arc::new(SilentCompletion), tts)
            .unwrap()
            .start()
            .unwrap();

        let mut pending: VecDeque<String> = ["one", "two", "three", "four"].map(String::from).into();
        let mut accepted = 0;
        while !pending.is_empty() {
            match tokio::time::timeout(Duration::from_millis(100), submit_next(&handle, &mut pending)).await {
                Ok(sent) => {
                    sent.unwrap();
                    accepted += 1;
                }
                Err(_) => break,
            }
        }

        // The first turn never ends and the queue holds one more, so at
        // most two lines get through before submission blocks.
        assert!(accepted <= 2, "accepted {accepted} lines");
        assert_eq!(pending.len(), 4 - accepted);
        assert_eq!(pending.front().map(String::as_str), ["one", "two", "three", "four"].get(accepted).copied());

        // The loop is free again, so CLEAR still goes out.
        assert_eq!(handle.clear(), 1);
    }
}
