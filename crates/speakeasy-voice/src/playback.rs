//! Playback controller.
//!
//! ```text
//!   IDLE ──audio──▶ PLAYING ──device finished──▶ IDLE
//!                      │
//!                    CLEAR
//!                      ▼
//!                  STOPPING ──device quiet / timeout──▶ IDLE
//!
//!   IDLE ──end of session──▶ TERMINATED
//! ```
//!
//! The device is polled on a short tick while sounding so CLEAR is seen
//! within one tick. rodio's output stream is not `Send`, so the controller
//! owns its device on a dedicated thread with a current-thread runtime.

use crate::command::{CommandListener, Inbox};
use crate::error::{VoiceError, VoiceResult};
use crate::message::{Envelope, Generation, SynthesizedAudio};
use crate::voice_output::{AudioDevice, NullDevice};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Stopping,
    Terminated,
}

/// What happened to each buffer, for front ends and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { seq: u64, generation: Generation, text: String },
    Finished { seq: u64 },
    Interrupted { seq: u64 },
    /// Stale buffers dropped without playing.
    Discarded { count: usize },
}

/// Builds the device on the playback thread.
pub type DeviceFactory = Box<dyn FnOnce() -> VoiceResult<Box<dyn AudioDevice>> + Send>;

pub struct PlaybackController {
    device: Box<dyn AudioDevice>,
    commands: CommandListener,
    poll_interval: Duration,
    stop_timeout: Duration,
    state: watch::Sender<PlaybackState>,
    events: Option<mpsc::UnboundedSender<PlaybackEvent>>,
    current: Option<SynthesizedAudio>,
}

impl PlaybackController {
    pub fn new(
        device: Box<dyn AudioDevice>,
        commands: CommandListener,
        poll_interval: Duration,
        stop_timeout: Duration,
    ) -> (Self, watch::Receiver<PlaybackState>) {
        let (state, state_rx) = watch::channel(PlaybackState::Idle);
        let controller = Self {
            device,
            commands,
            poll_interval,
            stop_timeout,
            state,
            events: None,
            current: None,
        };
        (controller, state_rx)
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.send_replace(state);
    }

    fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    fn emit(&self, event: PlaybackEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Start a buffer unless it is stale. Device errors count as finished.
    fn start(&mut self, item: SynthesizedAudio) {
        if !self.commands.bus().is_current(item.generation) {
            debug!(seq = item.seq, generation = item.generation, "dropping stale audio");
            self.emit(PlaybackEvent::Discarded { count: 1 });
            return;
        }
        match self.device.play(&item.audio) {
            Ok(()) => {
                debug!(seq = item.seq, duration_ms = item.audio.duration().as_millis() as u64, "playing");
                self.emit(PlaybackEvent::Started {
                    seq: item.seq,
                    generation: item.generation,
                    text: item.text.clone(),
                });
                self.current = Some(item);
                self.set_state(PlaybackState::Playing);
            }
            Err(e) => {
                warn!(seq = item.seq, error = %e, "audio device failed; treating buffer as played");
                self.emit(PlaybackEvent::Finished { seq: item.seq });
            }
        }
    }

    fn finish_current(&mut self) {
        if let Some(item) = self.current.take() {
            self.emit(PlaybackEvent::Finished { seq: item.seq });
        }
        self.set_state(PlaybackState::Idle);
    }

    /// CLEAR: silence anything older than `generation` and drop queued
    /// stale buffers. Returns when STOPPING should give up waiting.
    fn clear(&mut self, generation: Generation, input: &mut Inbox<SynthesizedAudio>) -> Option<Instant> {
        let discarded = input.drain_stale(|item| item.generation < generation);
        if discarded > 0 {
            self.emit(PlaybackEvent::Discarded { count: discarded });
        }

        let playing_stale = self
            .current
            .as_ref()
            .is_some_and(|item| item.generation < generation);
        if !playing_stale {
            debug!(generation, discarded, "CLEAR with nothing stale playing");
            return None;
        }

        if let Some(item) = self.current.take() {
            info!(seq = item.seq, generation, discarded, "stopping playback");
            self.emit(PlaybackEvent::Interrupted { seq: item.seq });
        }
        if let Err(e) = self.device.stop() {
            warn!(error = %e, "audio device failed to stop cleanly");
        }
        self.set_state(PlaybackState::Stopping);
        Some(Instant::now() + self.stop_timeout)
    }

    pub async fn run(mut self, mut input: Inbox<SynthesizedAudio>) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "playback controller started");
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop_deadline: Option<Instant> = None;

        loop {
            match self.state() {
                PlaybackState::Idle => {
                    tokio::select! {
                        biased;
                        command = self.commands.recv() => {
                            self.clear(command.generation, &mut input);
                        }
                        item = input.recv() => match item {
                            Envelope::Data(item) => self.start(item),
                            Envelope::EndOfSession => break,
                        },
                    }
                }
                PlaybackState::Playing => {
                    tokio::select! {
                        biased;
                        command = self.commands.recv() => {
                            stop_deadline = self.clear(command.generation, &mut input);
                        }
                        _ = tick.tick() => {
                            if !self.device.is_playing() {
                                self.finish_current();
                            }
                        }
                    }
                }
                PlaybackState::Stopping => {
                    tokio::select! {
                        biased;
                        command = self.commands.recv() => {
                            self.clear(command.generation, &mut input);
                        }
                        _ = tick.tick() => {
                            let timed_out = stop_deadline.is_some_and(|deadline| Instant::now() >= deadline);
                            if !self.device.is_playing() || timed_out {
                                if timed_out {
                                    warn!("device still busy after stop timeout; moving on");
                                }
                                stop_deadline = None;
                                self.set_state(PlaybackState::Idle);
                            }
                        }
                    }
                }
                PlaybackState::Terminated => break,
            }
        }

        if let Err(e) = self.device.stop() {
            debug!(error = %e, "device stop on shutdown failed");
        }
        self.set_state(PlaybackState::Terminated);
        info!("playback controller stopped");
    }

    /// Run the controller on its own thread. The device is built there, and
    /// a device that cannot be opened is replaced by [`NullDevice`] so the
    /// rest of the pipeline still drains.
    pub fn spawn(
        factory: DeviceFactory,
        commands: CommandListener,
        poll_interval: Duration,
        stop_timeout: Duration,
        events: Option<mpsc::UnboundedSender<PlaybackEvent>>,
        input: Inbox<SynthesizedAudio>,
    ) -> VoiceResult<(thread::JoinHandle<()>, watch::Receiver<PlaybackState>)> {
        let (state_tx, state_rx) = watch::channel(PlaybackState::Idle);
        let handle = thread::Builder::new()
            .name("speakeasy-playback".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Playback: runtime init failed: {}", e);
                        state_tx.send_replace(PlaybackState::Terminated);
                        return;
                    }
                };
                let device = factory().unwrap_or_else(|e| {
                    error!("Playback: audio device unavailable ({}); discarding audio", e);
                    Box::new(NullDevice::default())
                });
                let mut controller = PlaybackController {
                    device,
                    commands,
                    poll_interval,
                    stop_timeout,
                    state: state_tx,
                    events: None,
                    current: None,
                };
                if let Some(events) = events {
                    controller = controller.with_events(events);
                }
                rt.block_on(controller.run(input));
            })
            .map_err(VoiceError::Io)?;
        Ok((handle, state_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBus;
    use crate::message::AudioBuffer;
    use std::sync::{Arc, Mutex};
    use std::time::Instant as StdInstant;

    /// Sounds for a fixed wall-clock time per buffer.
    #[derive(Clone, Default)]
    struct TimedDevice {
        until: Arc<Mutex<Option<StdInstant>>>,
        stops: Arc<Mutex<usize>>,
        per_buffer: Duration,
    }

    impl AudioDevice for TimedDevice {
        fn play(&mut self, _audio: &AudioBuffer) -> VoiceResult<()> {
            *self.until.lock().unwrap() = Some(StdInstant::now() + self.per_buffer);
            Ok(())
        }

        fn is_playing(&self) -> bool {
            self.until.lock().unwrap().is_some_and(|t| StdInstant::now() < t)
        }

        fn stop(&mut self) -> VoiceResult<()> {
            *self.until.lock().unwrap() = None;
            *self.stops.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct BrokenDevice;

    impl AudioDevice for BrokenDevice {
        fn play(&mut self, _audio: &AudioBuffer) -> VoiceResult<()> {
            Err(VoiceError::Playback("unplugged".into()))
        }

        fn is_playing(&self) -> bool {
            false
        }

        fn stop(&mut self) -> VoiceResult<()> {
            Err(VoiceError::Playback("unplugged".into()))
        }
    }

    fn audio(seq: u64, generation: Generation) -> Envelope<SynthesizedAudio> {
        Envelope::Data(SynthesizedAudio {
            seq,
            generation,
            text: format!("chunk {seq}"),
            audio: AudioBuffer::new(vec![0.0; 240], 24_000),
        })
    }

    fn collect(rx: &mut mpsc::UnboundedReceiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    // The controller future is not Send (rodio devices are not), so tests
    // drive it alongside the test body with join! instead of spawning it.

    #[tokio::test]
    async fn plays_in_order_then_terminates() {
        let bus = CommandBus::new(4);
        let device = TimedDevice {
            per_buffer: Duration::from_millis(20),
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel(8);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (controller, mut state) =
            PlaybackController::new(Box::new(device), bus.listener(), Duration::from_millis(5), Duration::from_millis(100));

        let feed = async {
            tx.send(audio(0, 0)).await.unwrap();
            tx.send(audio(1, 0)).await.unwrap();
            tx.send(Envelope::EndOfSession).await.unwrap();
        };
        tokio::join!(controller.with_events(ev_tx).run(Inbox::new(rx)), feed);

        assert_eq!(*state.borrow_and_update(), PlaybackState::Terminated);
        let started: Vec<u64> = collect(&mut ev_rx)
            .into_iter()
            .filter_map(|ev| match ev {
                PlaybackEvent::Started { seq, .. } => Some(seq),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![0, 1]);
    }

    #[tokio::test]
    async fn clear_stops_current_and_discards_queue() {
        let bus = CommandBus::new(4);
        let device = TimedDevice {
            per_buffer: Duration::from_secs(10),
            ..Default::default()
        };
        let stops = Arc::clone(&device.stops);
        let (tx, rx) = mpsc::channel(8);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (controller, mut state) =
            PlaybackController::new(Box::new(device), bus.listener(), Duration::from_millis(10), Duration::from_millis(100));

        let drive = async {
            for seq in 0..4 {
                tx.send(audio(seq, 0)).await.unwrap();
            }
            state.wait_for(|s| *s == PlaybackState::Playing).await.unwrap();

            let cleared_at = StdInstant::now();
            bus.clear();
            state.wait_for(|s| *s == PlaybackState::Idle).await.unwrap();
            assert!(cleared_at.elapsed() < Duration::from_millis(200));
            assert_eq!(*stops.lock().unwrap(), 1);

            tx.send(audio(0, 1)).await.unwrap();
            tx.send(Envelope::EndOfSession).await.unwrap();
            // The fresh buffer plays; stop it so the test does not wait 10s.
            state.wait_for(|s| *s == PlaybackState::Playing).await.unwrap();
            bus.clear();
        };
        tokio::join!(controller.with_events(ev_tx).run(Inbox::new(rx)), drive);

        let events = collect(&mut ev_rx);
        let started: Vec<(u64, Generation)> = events
            .iter()
            .filter_map(|ev| match ev {
                PlaybackEvent::Started { seq, generation, .. } => Some((*seq, *generation)),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![(0, 0), (0, 1)]);
        assert!(events.contains(&PlaybackEvent::Interrupted { seq: 0 }));
        assert!(events.contains(&PlaybackEvent::Discarded { count: 3 }));
    }

    #[tokio::test]
    async fn device_errors_count_as_played() {
        let bus = CommandBus::new(4);
        let (tx, rx) = mpsc::channel(8);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (controller, _state) =
            PlaybackController::new(Box::new(BrokenDevice), bus.listener(), Duration::from_millis(5), Duration::from_millis(50));

        tx.send(audio(0, 0)).await.unwrap();
        tx.send(audio(1, 0)).await.unwrap();
        tx.send(Envelope::EndOfSession).await.unwrap();
        controller.with_events(ev_tx).run(Inbox::new(rx)).await;

        let events = collect(&mut ev_rx);
        assert_eq!(
            events,
            vec![PlaybackEvent::Finished { seq: 0 }, PlaybackEvent::Finished { seq: 1 }]
        );
    }

    #[tokio::test]
    async fn clear_while_idle_keeps_running() {
        let bus = CommandBus::new(4);
        let (tx, rx) = mpsc::channel(8);
        let (controller, state) =
            PlaybackController::new(Box::new(NullDevice::default()), bus.listener(), Duration::from_millis(5), Duration::from_millis(50));

        let drive = async {
            bus.clear();
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(*state.borrow(), PlaybackState::Idle);
            tx.send(Envelope::EndOfSession).await.unwrap();
        };
        tokio::join!(controller.run(Inbox::new(rx)), drive);
        assert_eq!(*state.borrow(), PlaybackState::Terminated);
    }

    #[test]
    fn spawned_thread_falls_back_to_null_device() {
        let bus = CommandBus::new(4);
        let (tx, rx) = mpsc::channel(4);
        let factory: DeviceFactory = Box::new(|| Err(VoiceError::AudioDevice("no output".into())));
        let (handle, state) = PlaybackController::spawn(
            factory,
            bus.listener(),
            Duration::from_millis(5),
            Duration::from_millis(50),
            None,
            Inbox::new(rx),
        )
        .unwrap();

        tx.blocking_send(audio(0, 0)).unwrap();
        tx.blocking_send(Envelope::EndOfSession).unwrap();
        handle.join().unwrap();
        assert_eq!(*state.borrow(), PlaybackState::Terminated);
    }
}
