//! One duplex voice session: inbound frames in, spoken replies out.
//!
//! ```text
//!  Idle ──audio──► Accumulating ──turn end──► Finalizing ──transcript──► Generating
//!   ▲                                              │ (empty)                 │ reply
//!   │                                              ▼                         ▼
//!   └──────────────────────────────────────────── Idle ◄──── done ──── Synthesizing
//!
//!  any state ──disconnect / terminate / transport failure──► Closing
//!  any state ──turn-fatal error──► Error ──cleanup──► Idle
//! ```
//!
//! The session task owns the turn buffer, the turn detector and the dialogue history.
//! Finalizing, Generating and Synthesizing run on a separate turn task so the session
//! keeps reading frames (cancel, buffered audio, disconnect) while adapters work.
//! At most one turn task exists at a time.

use crate::accumulator::{AppendOutcome, AudioAccumulator};
use crate::config::{MidTurnAudioPolicy, SessionConfig};
use crate::dialogue::{DialogueEntry, DialogueHistory, Role};
use crate::error::{Severity, VoiceError, VoiceResult};
use crate::format::{AudioNormalizer, SourceEncoding};
use crate::generator::ReplyGenerator;
use crate::protocol::{ClientFrame, ServerMessage};
use crate::segmenter::segment;
use crate::stt::SttBackend;
use crate::synthesis::{SynthesisPipeline, TurnReport};
use crate::tts::TtsBackend;
use crate::turn::TurnDetector;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle phase of a session, observable through [`Session::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Accumulating,
    Finalizing,
    Generating,
    Synthesizing,
    Error,
    Closing,
}

impl SessionPhase {
    pub fn label(self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Accumulating => "accumulating",
            SessionPhase::Finalizing => "finalizing",
            SessionPhase::Generating => "generating",
            SessionPhase::Synthesizing => "synthesizing",
            SessionPhase::Error => "error",
            SessionPhase::Closing => "closing",
        }
    }

    /// A turn task is running.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SessionPhase::Finalizing | SessionPhase::Generating | SessionPhase::Synthesizing
        )
    }
}

/// External capabilities shared by every session. Implementations must tolerate concurrent calls.
#[derive(Clone)]
pub struct Adapters {
    pub normalizer: Arc<dyn AudioNormalizer>,
    pub stt: Arc<dyn SttBackend>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub tts: Arc<dyn TtsBackend>,
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Inbound stream ended.
    ClientDisconnected,
    /// Cancelled from outside (manager `terminate` or shutdown).
    Terminated,
    /// The outbound channel broke.
    TransportFailed,
}

/// Final state of a session after [`Session::run`] returns.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: Uuid,
    /// Turns that produced a reply.
    pub turns_completed: usize,
    pub history: Vec<DialogueEntry>,
    pub close_reason: CloseReason,
}

/// Result of one turn task.
#[derive(Debug)]
enum TurnOutcome {
    /// Nothing intelligible was said.
    Skipped,
    Completed {
        user: String,
        reply: String,
        report: TurnReport,
    },
    Failed {
        /// Transcript, when transcription succeeded before the failure.
        user: Option<String>,
        error: VoiceError,
    },
    Cancelled,
}

struct InFlightTurn {
    handle: JoinHandle<TurnOutcome>,
    cancel: CancellationToken,
}

/// Everything a turn task needs, owned so the task shares nothing mutable with the session.
struct TurnJob {
    audio: Vec<u8>,
    encoding: SourceEncoding,
    history: DialogueHistory,
    adapters: Adapters,
    lookahead: usize,
    out: mpsc::Sender<ServerMessage>,
    phase: Arc<watch::Sender<SessionPhase>>,
    cancel: CancellationToken,
}

pub struct Session {
    id: Uuid,
    config: SessionConfig,
    adapters: Adapters,
    accumulator: AudioAccumulator,
    detector: TurnDetector,
    dialogue: DialogueHistory,
    phase: Arc<watch::Sender<SessionPhase>>,
    cancel: CancellationToken,
    in_flight: Option<InFlightTurn>,
    /// An end trigger arrived while a turn was in flight.
    pending_end: bool,
    turns_completed: usize,
}

impl Session {
    /// `cancel` closes the session when fired.
    pub fn new(
        id: Uuid,
        config: SessionConfig,
        adapters: Adapters,
        cancel: CancellationToken,
    ) -> VoiceResult<Self> {
        let vad = config.vad.build()?;
        let detector = TurnDetector::new(
            config.turn.clone(),
            vad,
            config.audio.source_encoding.clone(),
        );
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Ok(Self {
            id,
            accumulator: AudioAccumulator::new(&config.audio),
            dialogue: DialogueHistory::new(config.history_window),
            detector,
            adapters,
            phase: Arc::new(phase),
            cancel,
            in_flight: None,
            pending_end: false,
            turns_completed: 0,
            config,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    /// Drive the session until the inbound stream ends, the session is cancelled, or the
    /// outbound channel fails.
    pub async fn run<S>(mut self, inbound: S, out: mpsc::Sender<ServerMessage>) -> SessionSummary
    where
        S: Stream<Item = ClientFrame> + Unpin,
    {
        let mut inbound = inbound;
        info!(target: "parley::session", id = %self.id, "session started");

        let close_reason = loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break CloseReason::Terminated,
                joined = join_turn(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    self.finish_turn(joined, &out).await
                }
                frame = inbound.next() => match frame {
                    Some(frame) => self.on_frame(frame, &out).await,
                    None => break CloseReason::ClientDisconnected,
                },
            };
            if let Err(err) = step {
                warn!(target: "parley::session", id = %self.id, "closing session: {}", err);
                break CloseReason::TransportFailed;
            }
        };

        self.close().await;
        info!(
            target: "parley::session",
            id = %self.id,
            turns = self.turns_completed,
            reason = ?close_reason,
            "session closed"
        );
        SessionSummary {
            id: self.id,
            turns_completed: self.turns_completed,
            history: self.dialogue.entries().to_vec(),
            close_reason,
        }
    }

    fn set_phase(&self, phase: SessionPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(target: "parley::session", id = %self.id, ?previous, ?phase, "phase");
        }
    }

    /// Handle one inbound frame. Errors returned here are session-fatal.
    async fn on_frame(&mut self, frame: ClientFrame, out: &mpsc::Sender<ServerMessage>) -> VoiceResult<()> {
        match frame {
            ClientFrame::Audio(chunk) => self.on_audio(chunk, out).await,
            ClientFrame::EndOfTurn => {
                if self.in_flight.is_some() {
                    debug!(target: "parley::session", id = %self.id, "end marker while busy; deferred");
                    self.pending_end = true;
                    Ok(())
                } else {
                    self.finalize_turn(out).await
                }
            }
            ClientFrame::Cancel => self.on_cancel(out).await,
            ClientFrame::Text(text) => {
                debug!(target: "parley::session", id = %self.id, "ignoring text frame: {}", text);
                Ok(())
            }
        }
    }

    async fn on_audio(&mut self, chunk: Vec<u8>, out: &mpsc::Sender<ServerMessage>) -> VoiceResult<()> {
        let busy = self.in_flight.is_some();
        if busy && self.config.mid_turn_audio == MidTurnAudioPolicy::Reject {
            return send(out, ServerMessage::status("busy: audio dropped until the reply is done"))
                .await;
        }

        let outcome = match self.accumulator.append(&chunk) {
            Ok(outcome) => outcome,
            Err(err) if busy => {
                warn!(target: "parley::session", id = %self.id, "dropping buffered frame: {}", err);
                return send(out, ServerMessage::status(format!("audio dropped: {}", err))).await;
            }
            Err(err) => return self.abort_accumulating(err, out).await,
        };
        if !busy {
            self.set_phase(SessionPhase::Accumulating);
        }

        let silence_end = self.detector.observe(&chunk);
        if !self.detector.speech_seen() {
            // Silence before the utterance is pre-roll, not part of the turn.
            let dropped = self.accumulator.keep_recent(self.config.turn.pre_roll());
            if dropped > 0 {
                debug!(target: "parley::session", id = %self.id, dropped, "leading silence trimmed");
            }
        }
        let limit_end = outcome == AppendOutcome::LimitReached && self.accumulator.is_full();
        if limit_end {
            debug!(target: "parley::session", id = %self.id, bytes = self.accumulator.len(), "turn buffer limit reached");
        }
        if !(silence_end || limit_end) {
            return Ok(());
        }
        if busy {
            self.pending_end = true;
            Ok(())
        } else {
            self.finalize_turn(out).await
        }
    }

    async fn on_cancel(&mut self, out: &mpsc::Sender<ServerMessage>) -> VoiceResult<()> {
        if let Some(turn) = self.in_flight.as_ref() {
            info!(target: "parley::session", id = %self.id, "cancelling in-flight turn");
            // The outcome arrives through the join branch.
            turn.cancel.cancel();
            return Ok(());
        }
        if self.accumulator.is_empty() {
            return Ok(());
        }
        self.accumulator.clear();
        self.detector.reset();
        self.set_phase(SessionPhase::Idle);
        send(out, ServerMessage::status("turn cancelled")).await?;
        send(out, ServerMessage::Done).await
    }

    /// Ingest failure while accumulating: the turn is aborted.
    async fn abort_accumulating(&mut self, err: VoiceError, out: &mpsc::Sender<ServerMessage>) -> VoiceResult<()> {
        warn!(target: "parley::session", id = %self.id, "turn aborted: {}", err);
        self.set_phase(SessionPhase::Error);
        self.accumulator.clear();
        self.detector.reset();
        send(
            out,
            ServerMessage::Error {
                stage: err.stage().to_string(),
                reason: err.to_string(),
            },
        )
        .await?;
        send(out, ServerMessage::Done).await?;
        self.set_phase(SessionPhase::Idle);
        Ok(())
    }

    /// Drain the turn buffer and start processing it.
    async fn finalize_turn(&mut self, out: &mpsc::Sender<ServerMessage>) -> VoiceResult<()> {
        self.pending_end = false;
        let audio = self.accumulator.drain();
        let speech_seen = self.detector.speech_seen();
        self.detector.reset();

        if audio.is_empty() || (self.config.skip_silent_turns && !speech_seen) {
            debug!(target: "parley::session", id = %self.id, bytes = audio.len(), "silent turn skipped");
            self.set_phase(SessionPhase::Idle);
            send(out, ServerMessage::status("no speech detected")).await?;
            return send(out, ServerMessage::Done).await;
        }

        info!(target: "parley::session", id = %self.id, bytes = audio.len(), "turn finalized");
        self.set_phase(SessionPhase::Finalizing);
        let cancel = self.cancel.child_token();
        let job = TurnJob {
            audio,
            encoding: self.config.audio.source_encoding.clone(),
            history: self.dialogue.clone(),
            adapters: self.adapters.clone(),
            lookahead: self.config.synthesis_lookahead,
            out: out.clone(),
            phase: Arc::clone(&self.phase),
            cancel: cancel.clone(),
        };
        self.in_flight = Some(InFlightTurn {
            handle: tokio::spawn(run_turn(job)),
            cancel,
        });
        Ok(())
    }

    /// Apply a finished turn to the session and close it with exactly one `done`.
    async fn finish_turn(
        &mut self,
        joined: Result<TurnOutcome, JoinError>,
        out: &mpsc::Sender<ServerMessage>,
    ) -> VoiceResult<()> {
        // The turn task publishes its own progress, so the phase names where it died.
        let reached = self.phase();
        let outcome = joined.unwrap_or_else(|err| TurnOutcome::Failed {
            user: None,
            error: VoiceError::Internal(format!(
                "turn task failed while {}: {}",
                reached.label(),
                err
            )),
        });

        match outcome {
            TurnOutcome::Skipped => {
                send(out, ServerMessage::status("no speech detected")).await?;
            }
            TurnOutcome::Completed { user, reply, report } => {
                self.dialogue.append(Role::User, user);
                self.dialogue.append(Role::Assistant, reply);
                self.turns_completed += 1;
                info!(
                    target: "parley::session",
                    id = %self.id,
                    delivered = report.delivered,
                    failed = report.failed,
                    "turn complete"
                );
            }
            TurnOutcome::Failed { user, error } => {
                if let Some(user) = user {
                    self.dialogue.append(Role::User, user);
                }
                if error.severity() == Severity::Session {
                    return Err(error);
                }
                warn!(target: "parley::session", id = %self.id, stage = error.stage(), "turn failed: {}", error);
                self.set_phase(SessionPhase::Error);
                send(
                    out,
                    ServerMessage::Error {
                        stage: error.stage().to_string(),
                        reason: error.to_string(),
                    },
                )
                .await?;
            }
            TurnOutcome::Cancelled => {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                send(out, ServerMessage::status("turn cancelled")).await?;
            }
        }
        send(out, ServerMessage::Done).await?;
        self.set_phase(SessionPhase::Idle);

        // Audio buffered during the turn starts the next one.
        if self.pending_end || self.accumulator.is_full() {
            self.finalize_turn(out).await
        } else {
            if !self.accumulator.is_empty() {
                self.set_phase(SessionPhase::Accumulating);
            }
            Ok(())
        }
    }

    /// Cancel any in-flight turn, wait for it to unwind, and drop buffered state.
    async fn close(&mut self) {
        self.set_phase(SessionPhase::Closing);
        self.cancel.cancel();
        if let Some(turn) = self.in_flight.take() {
            turn.cancel.cancel();
            if let Err(err) = turn.handle.await {
                warn!(target: "parley::session", id = %self.id, "turn task ended abnormally: {}", err);
            }
        }
        self.accumulator.clear();
        self.detector.reset();
    }
}

async fn send(out: &mpsc::Sender<ServerMessage>, message: ServerMessage) -> VoiceResult<()> {
    out.send(message)
        .await
        .map_err(|_| VoiceError::Transport("client channel closed".to_string()))
}

async fn join_turn(in_flight: &mut Option<InFlightTurn>) -> Result<TurnOutcome, JoinError> {
    match in_flight {
        Some(turn) => (&mut turn.handle).await,
        None => std::future::pending().await,
    }
}

/// Finalizing → Generating → Synthesizing for one turn, abandoned as soon as `cancel` fires.
async fn run_turn(job: TurnJob) -> TurnOutcome {
    let cancel = job.cancel.clone();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => TurnOutcome::Cancelled,
        outcome = process_turn(job) => outcome,
    }
}

async fn process_turn(job: TurnJob) -> TurnOutcome {
    let TurnJob {
        audio,
        encoding,
        mut history,
        adapters,
        lookahead,
        out,
        phase,
        cancel,
    } = job;

    let pcm = match adapters.normalizer.normalize(&audio, &encoding).await {
        Ok(pcm) => pcm,
        Err(error) => return TurnOutcome::Failed { user: None, error },
    };
    drop(audio);

    let transcript = match adapters.stt.transcribe(&pcm).await {
        Ok(text) => text.trim().to_string(),
        Err(error) => return TurnOutcome::Failed { user: None, error },
    };
    if transcript.is_empty() {
        return TurnOutcome::Skipped;
    }
    debug!(target: "parley::session", stt = adapters.stt.name(), "transcript: {}", transcript);
    if out
        .send(ServerMessage::Transcript {
            text: transcript.clone(),
        })
        .await
        .is_err()
    {
        return TurnOutcome::Failed {
            user: Some(transcript),
            error: VoiceError::Transport("client channel closed".to_string()),
        };
    }

    phase.send_replace(SessionPhase::Generating);
    history.append(Role::User, transcript.clone());
    let reply = match adapters.generator.generate(&history.snapshot()).await {
        Ok(reply) if reply.trim().is_empty() => {
            return TurnOutcome::Failed {
                user: Some(transcript),
                error: VoiceError::Generation("empty reply".to_string()),
            }
        }
        Ok(reply) => reply,
        Err(error) => {
            return TurnOutcome::Failed {
                user: Some(transcript),
                error,
            }
        }
    };

    phase.send_replace(SessionPhase::Synthesizing);
    let sentences = segment(&reply);
    let pipeline = SynthesisPipeline::new(Arc::clone(&adapters.tts), lookahead);
    match pipeline.run(sentences, &out, &cancel).await {
        Ok(report) => TurnOutcome::Completed {
            user: transcript,
            reply,
            report,
        },
        Err(VoiceError::Cancelled(_)) => TurnOutcome::Cancelled,
        Err(error) => TurnOutcome::Failed {
            user: Some(transcript),
            error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DefaultNormalizer;
    use crate::generator::PlaceholderGenerator;
    use crate::stt::PlaceholderStt;
    use crate::tts::PlaceholderTts;
    use tokio_stream::wrappers::ReceiverStream;

    fn adapters(stt: &str, reply: &str) -> Adapters {
        Adapters {
            normalizer: Arc::new(DefaultNormalizer::default()),
            stt: Arc::new(PlaceholderStt::with_response(stt)),
            generator: Arc::new(PlaceholderGenerator::with_response(reply)),
            tts: Arc::new(PlaceholderTts::default()),
        }
    }

    /// 100 ms of loud 16 kHz mono PCM.
    fn speech_chunk() -> Vec<u8> {
        (0..1600)
            .flat_map(|i| if i % 2 == 0 { 4000i16 } else { -4000i16 }.to_le_bytes())
            .collect()
    }

    fn silence_chunk() -> Vec<u8> {
        vec![0u8; 3200]
    }

    async fn drive(
        adapters: Adapters,
        config: SessionConfig,
        frames: Vec<ClientFrame>,
    ) -> (Vec<ServerMessage>, SessionSummary) {
        let session = Session::new(Uuid::new_v4(), config, adapters, CancellationToken::new()).unwrap();
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let task = tokio::spawn(session.run(ReceiverStream::new(in_rx), out_tx));
        for f in frames {
            in_tx.send(f).await.unwrap();
        }
        let mut messages = Vec::new();
        // Wait for the turn's done before disconnecting.
        while let Some(m) = out_rx.recv().await {
            let done = m == ServerMessage::Done;
            messages.push(m);
            if done {
                break;
            }
        }
        drop(in_tx);
        let summary = task.await.unwrap();
        (messages, summary)
    }

    #[test]
    fn busy_phases() {
        assert!(SessionPhase::Generating.is_busy());
        assert!(!SessionPhase::Accumulating.is_busy());
        assert!(!SessionPhase::Closing.is_busy());
    }

    #[tokio::test]
    async fn end_marker_runs_a_full_turn() {
        let frames = vec![
            ClientFrame::Audio(speech_chunk()),
            ClientFrame::Audio(speech_chunk()),
            ClientFrame::EndOfTurn,
        ];
        let (messages, summary) = drive(
            adapters("hello there.", "Hi. Nice to meet you!"),
            SessionConfig::default(),
            frames,
        )
        .await;
        assert_eq!(
            messages[0],
            ServerMessage::Transcript {
                text: "hello there.".into()
            }
        );
        assert!(matches!(&messages[1], ServerMessage::Tts { ordinal: 0, sentence, .. } if sentence == "Hi"));
        assert!(
            matches!(&messages[2], ServerMessage::Tts { ordinal: 1, sentence, .. } if sentence == "Nice to meet you!")
        );
        assert_eq!(messages[3], ServerMessage::Done);
        assert_eq!(summary.turns_completed, 1);
        assert_eq!(summary.close_reason, CloseReason::ClientDisconnected);
    }

    #[tokio::test]
    async fn silent_turn_is_skipped_without_history() {
        let frames = vec![ClientFrame::Audio(silence_chunk()), ClientFrame::EndOfTurn];
        let (messages, summary) = drive(adapters("unused", "unused"), SessionConfig::default(), frames).await;
        assert_eq!(
            messages,
            vec![ServerMessage::status("no speech detected"), ServerMessage::Done]
        );
        assert!(summary.history.is_empty());
    }

    #[tokio::test]
    async fn empty_transcript_is_skipped() {
        let frames = vec![ClientFrame::Audio(speech_chunk()), ClientFrame::EndOfTurn];
        let (messages, summary) = drive(adapters("   ", "unused"), SessionConfig::default(), frames).await;
        assert_eq!(
            messages,
            vec![ServerMessage::status("no speech detected"), ServerMessage::Done]
        );
        assert_eq!(summary.turns_completed, 0);
    }

    #[tokio::test]
    async fn oversized_frame_aborts_the_turn() {
        let mut config = SessionConfig::default();
        config.audio.max_chunk_bytes = 1024;
        let frames = vec![ClientFrame::Audio(speech_chunk())];
        let (messages, _) = drive(adapters("x", "y"), config, frames).await;
        assert!(matches!(&messages[0], ServerMessage::Error { stage, .. } if stage == "ingest"));
        assert_eq!(messages[1], ServerMessage::Done);
    }

    #[tokio::test]
    async fn buffer_limit_forces_turn_end() {
        let mut config = SessionConfig::default();
        // 200 ms of 16 kHz mono PCM
        config.audio.max_turn_ms = 200;
        let frames = vec![
            ClientFrame::Audio(speech_chunk()),
            ClientFrame::Audio(speech_chunk()),
        ];
        let (messages, _) = drive(adapters("long turn.", "Okay."), config, frames).await;
        assert!(matches!(messages[0], ServerMessage::Transcript { .. }));
        assert_eq!(messages.last(), Some(&ServerMessage::Done));
    }

    /// Panics mid-transcription.
    struct CrashingStt;

    #[async_trait::async_trait]
    impl SttBackend for CrashingStt {
        async fn transcribe(&self, _audio: &crate::format::PcmAudio) -> VoiceResult<String> {
            panic!("decoder crashed");
        }

        fn name(&self) -> &'static str {
            "crashing"
        }
    }

    #[tokio::test]
    async fn crashed_turn_task_reports_the_phase_it_died_in() {
        let mut adapters = adapters("unused", "unused");
        adapters.stt = Arc::new(CrashingStt);
        let frames = vec![ClientFrame::Audio(speech_chunk()), ClientFrame::EndOfTurn];
        let (messages, summary) = drive(adapters, SessionConfig::default(), frames).await;
        match &messages[0] {
            ServerMessage::Error { stage, reason } => {
                assert_eq!(stage, "internal");
                assert!(reason.contains("while finalizing"), "{}", reason);
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(messages[1], ServerMessage::Done);
        assert!(summary.history.is_empty());
        assert_eq!(summary.close_reason, CloseReason::ClientDisconnected);
    }

    #[tokio::test]
    async fn phase_is_observable() {
        let session = Session::new(
            Uuid::new_v4(),
            SessionConfig::default(),
            adapters("x", "y"),
            CancellationToken::new(),
        )
        .unwrap();
        let rx = session.subscribe();
        assert_eq!(*rx.borrow(), SessionPhase::Idle);
        assert_eq!(session.phase(), SessionPhase::Idle);
    }
}
