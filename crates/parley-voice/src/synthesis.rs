//! Sentence synthesis and ordered delivery.
//!
//! ```text
//!  sentences ─► dispatcher ──(permit)──► TTS task × window ──► mpsc ──► ReorderBuffer ──► client
//!                    ▲                                                        │
//!                    └──────────────── permit released on delivery ◄──────────┘
//! ```
//!
//! The dispatcher takes one permit per sentence in ordinal order, so the sentences holding
//! permits are always the lowest undelivered ordinals. At most `lookahead + 1` sentences are
//! synthesized or waiting for delivery at any time: the one being sent plus `lookahead` ahead.

use crate::error::{VoiceError, VoiceResult};
use crate::format::{encode_wav, resample_linear, OUTPUT_SAMPLE_RATE};
use crate::protocol::ServerMessage;
use crate::tts::TtsBackend;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One sentence of a reply, numbered from 0 in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceUnit {
    pub ordinal: usize,
    pub text: String,
}

/// How a turn's synthesis ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnReport {
    pub delivered: usize,
    pub failed: usize,
}

impl TurnReport {
    pub fn total(&self) -> usize {
        self.delivered + self.failed
    }

    pub fn all_delivered(&self) -> bool {
        self.failed == 0
    }
}

/// Holds results that arrived ahead of their predecessors until they can be emitted in order.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    pending: BTreeMap<usize, T>,
    next: usize,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            next: 0,
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordinals below the next expected one were already emitted and are ignored.
    pub fn insert(&mut self, ordinal: usize, item: T) {
        if ordinal >= self.next {
            self.pending.insert(ordinal, item);
        }
    }

    /// Next item in ordinal order, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    /// Give up waiting for the next ordinal: return it if buffered and move past it either way.
    pub fn advance(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next);
        self.next += 1;
        item
    }

    pub fn next_expected(&self) -> usize {
        self.next
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

struct Synthesized {
    unit: SentenceUnit,
    audio: VoiceResult<String>,
    // Returned to the dispatcher once this unit is delivered.
    _permit: OwnedSemaphorePermit,
}

/// Bounded producer/consumer pipeline from sentence text to `tts` / `tts_error` messages.
#[derive(Clone)]
pub struct SynthesisPipeline {
    tts: Arc<dyn TtsBackend>,
    lookahead: usize,
}

impl SynthesisPipeline {
    pub fn new(tts: Arc<dyn TtsBackend>, lookahead: usize) -> Self {
        Self { tts, lookahead }
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }

    /// Synthesize `sentences` and send one message per ordinal to `out`, in ordinal order.
    ///
    /// A failed sentence becomes a `tts_error` and the turn continues. Returns
    /// `Transport` when `out` is closed and `Cancelled` when `cancel` fires; in both cases
    /// nothing further is sent and in-flight synthesis tasks are aborted.
    pub async fn run(
        &self,
        sentences: Vec<String>,
        out: &mpsc::Sender<ServerMessage>,
        cancel: &CancellationToken,
    ) -> VoiceResult<TurnReport> {
        let total = sentences.len();
        if total == 0 {
            return Ok(TurnReport::default());
        }
        let window = self.lookahead + 1;
        let (tx, mut rx) = mpsc::channel::<Synthesized>(window);
        let stop = cancel.child_token();

        let dispatcher = dispatch(
            Arc::clone(&self.tts),
            sentences,
            Arc::new(Semaphore::new(window)),
            tx,
            stop.clone(),
        );

        let delivery = async {
            let mut reorder = ReorderBuffer::new();
            let mut report = TurnReport::default();
            while report.total() < total {
                let arrived = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(VoiceError::Cancelled("synthesis cancelled".to_string()));
                    }
                    arrived = rx.recv() => arrived,
                };
                let Some(arrived) = arrived else {
                    break;
                };
                reorder.insert(arrived.unit.ordinal, arrived);

                while let Some(ready) = reorder.pop_ready() {
                    let ordinal = ready.unit.ordinal;
                    deliver(out, cancel, ordinal, Some(ready), &mut report).await?;
                }
            }

            // Producers are gone; every ordinal still owed gets a result or an error marker.
            while reorder.next_expected() < total {
                let ordinal = reorder.next_expected();
                let ready = reorder.advance();
                deliver(out, cancel, ordinal, ready, &mut report).await?;
            }
            Ok::<TurnReport, VoiceError>(report)
        };

        let delivery = async move {
            let result = delivery.await;
            stop.cancel();
            result
        };

        let (result, ()) = tokio::join!(delivery, dispatcher);
        result
    }
}

/// Start one synthesis task per sentence, in ordinal order, gated by `window` permits.
async fn dispatch(
    tts: Arc<dyn TtsBackend>,
    sentences: Vec<String>,
    window: Arc<Semaphore>,
    tx: mpsc::Sender<Synthesized>,
    stop: CancellationToken,
) {
    let mut tasks = JoinSet::new();
    for (ordinal, text) in sentences.into_iter().enumerate() {
        let permit = tokio::select! {
            _ = stop.cancelled() => return,
            permit = Arc::clone(&window).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };
        let tts = Arc::clone(&tts);
        let tx = tx.clone();
        tasks.spawn(async move {
            let audio = AssertUnwindSafe(synthesize_payload(tts.as_ref(), ordinal, &text))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(VoiceError::Synthesis {
                        ordinal,
                        reason: format!("synthesis panicked: {}", panic_message(&*panic)),
                    })
                });
            let _ = tx
                .send(Synthesized {
                    unit: SentenceUnit { ordinal, text },
                    audio,
                    _permit: permit,
                })
                .await;
        });
    }
    drop(tx);
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = async { while tasks.join_next().await.is_some() {} } => {}
    }
    // Dropping the set aborts anything still running.
}

/// Send the result for `ordinal`; `None` means its synthesis task vanished without one.
async fn deliver(
    out: &mpsc::Sender<ServerMessage>,
    cancel: &CancellationToken,
    ordinal: usize,
    ready: Option<Synthesized>,
    report: &mut TurnReport,
) -> VoiceResult<()> {
    if cancel.is_cancelled() {
        return Err(VoiceError::Cancelled("synthesis cancelled".to_string()));
    }
    // The unit's permit is held until its message is sent.
    let (audio, _permit) = match ready {
        Some(Synthesized {
            unit,
            audio,
            _permit: permit,
        }) => (audio.map(|audio| (unit.text, audio)), Some(permit)),
        None => (
            Err(VoiceError::Synthesis {
                ordinal,
                reason: "synthesis task ended without a result".to_string(),
            }),
            None,
        ),
    };
    let message = match audio {
        Ok((sentence, audio)) => {
            report.delivered += 1;
            ServerMessage::Tts {
                sentence,
                ordinal,
                audio,
            }
        }
        Err(err) => {
            report.failed += 1;
            warn!(target: "parley::synthesis", ordinal, "sentence synthesis failed: {}", err);
            ServerMessage::TtsError {
                ordinal,
                reason: synthesis_reason(err),
            }
        }
    };
    out.send(message)
        .await
        .map_err(|_| VoiceError::Transport("client channel closed".to_string()))?;
    debug!(target: "parley::synthesis", ordinal, "delivered");
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Synthesize one sentence into a base64 24 kHz mono WAV.
async fn synthesize_payload(tts: &dyn TtsBackend, ordinal: usize, text: &str) -> VoiceResult<String> {
    let retag = |err: VoiceError| VoiceError::Synthesis {
        ordinal,
        reason: synthesis_reason(err),
    };
    let audio = tts.synthesize(text).await.map_err(retag)?;
    let samples = resample_linear(&audio.samples, audio.sample_rate, OUTPUT_SAMPLE_RATE);
    let wav = encode_wav(&samples, OUTPUT_SAMPLE_RATE).map_err(retag)?;
    Ok(STANDARD.encode(wav))
}

fn synthesis_reason(err: VoiceError) -> String {
    match err {
        VoiceError::Synthesis { reason, .. } => reason,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{decode_wav, PcmAudio};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Per-sentence delay and failure script.
    #[derive(Default)]
    struct ScriptedTts {
        delays: HashMap<String, u64>,
        failing: Vec<String>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedTts {
        fn delay(mut self, sentence: &str, ms: u64) -> Self {
            self.delays.insert(sentence.to_string(), ms);
            self
        }

        fn fail(mut self, sentence: &str) -> Self {
            self.failing.push(sentence.to_string());
            self
        }
    }

    #[async_trait]
    impl TtsBackend for ScriptedTts {
        async fn synthesize(&self, text: &str) -> VoiceResult<PcmAudio> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let ms = self.delays.get(text).copied().unwrap_or(5);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.failing.iter().any(|f| f == text) {
                return Err(VoiceError::Synthesis {
                    ordinal: 0,
                    reason: "voice unavailable".into(),
                });
            }
            Ok(PcmAudio::new(vec![0.1; 1_600], 16_000))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn sentences(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn collect(mut rx: mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Some(m) = rx.recv().await {
            out.push(m);
        }
        out
    }

    fn ordinals(messages: &[ServerMessage]) -> Vec<usize> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Tts { ordinal, .. } | ServerMessage::TtsError { ordinal, .. } => {
                    Some(*ordinal)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn reorder_buffer_holds_early_arrivals() {
        let mut buf = ReorderBuffer::new();
        buf.insert(1, "b");
        assert_eq!(buf.pop_ready(), None);
        buf.insert(0, "a");
        assert_eq!(buf.pop_ready(), Some("a"));
        assert_eq!(buf.pop_ready(), Some("b"));
        assert_eq!(buf.pop_ready(), None);
        buf.insert(0, "stale");
        assert_eq!(buf.buffered(), 0);
        assert_eq!(buf.next_expected(), 2);
    }

    #[test]
    fn advance_skips_a_missing_ordinal() {
        let mut buf = ReorderBuffer::new();
        buf.insert(1, "b");
        assert_eq!(buf.advance(), None);
        assert_eq!(buf.next_expected(), 1);
        assert_eq!(buf.advance(), Some("b"));
        assert_eq!(buf.buffered(), 0);
    }

    /// Panics instead of returning for one sentence.
    struct PanickingTts {
        on: &'static str,
    }

    #[async_trait]
    impl TtsBackend for PanickingTts {
        async fn synthesize(&self, text: &str) -> VoiceResult<PcmAudio> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if text == self.on {
                panic!("voice model crashed on {:?}", text);
            }
            Ok(PcmAudio::new(vec![0.0; 240], 24_000))
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    async fn run_with_panic(items: &[&str], lookahead: usize) -> (TurnReport, Vec<ServerMessage>) {
        let pipeline = SynthesisPipeline::new(Arc::new(PanickingTts { on: "s1" }), lookahead);
        let (tx, rx) = mpsc::channel(16);
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.run(sentences(items), &tx, &CancellationToken::new()),
        )
        .await
        .expect("pipeline stalled after a panicking sentence")
        .unwrap();
        drop(tx);
        (report, collect(rx).await)
    }

    #[tokio::test]
    async fn panicking_sentence_becomes_tts_error_with_long_reply() {
        let (report, messages) =
            run_with_panic(&["s0", "s1", "s2", "s3", "s4", "s5"], 1).await;
        assert_eq!(ordinals(&messages), vec![0, 1, 2, 3, 4, 5]);
        match &messages[1] {
            ServerMessage::TtsError { ordinal, reason } => {
                assert_eq!(*ordinal, 1);
                assert!(reason.contains("voice model crashed"), "{}", reason);
            }
            other => panic!("expected tts_error, got {:?}", other),
        }
        assert_eq!(report, TurnReport { delivered: 5, failed: 1 });
    }

    #[tokio::test]
    async fn panicking_sentence_does_not_drop_later_sentences() {
        let (report, messages) = run_with_panic(&["s0", "s1", "s2"], 2).await;
        assert!(matches!(messages[0], ServerMessage::Tts { ordinal: 0, .. }));
        assert!(matches!(messages[1], ServerMessage::TtsError { ordinal: 1, .. }));
        assert!(matches!(messages[2], ServerMessage::Tts { ordinal: 2, .. }));
        assert_eq!(messages.len(), 3);
        assert_eq!(report, TurnReport { delivered: 2, failed: 1 });
    }

    #[tokio::test]
    async fn delivers_in_ordinal_order_despite_completion_order() {
        // completes s1, s0, s2
        let tts = ScriptedTts::default()
            .delay("s0", 80)
            .delay("s1", 10)
            .delay("s2", 160);
        let pipeline = SynthesisPipeline::new(Arc::new(tts), 2);
        let (tx, rx) = mpsc::channel(16);
        let report = pipeline
            .run(sentences(&["s0", "s1", "s2"]), &tx, &CancellationToken::new())
            .await
            .unwrap();
        drop(tx);
        let messages = collect(rx).await;
        assert_eq!(ordinals(&messages), vec![0, 1, 2]);
        assert_eq!(report, TurnReport { delivered: 3, failed: 0 });
    }

    #[tokio::test]
    async fn failed_sentence_is_reported_and_turn_continues() {
        let tts = ScriptedTts::default().fail("s1");
        let pipeline = SynthesisPipeline::new(Arc::new(tts), 1);
        let (tx, rx) = mpsc::channel(16);
        let report = pipeline
            .run(sentences(&["s0", "s1", "s2"]), &tx, &CancellationToken::new())
            .await
            .unwrap();
        drop(tx);
        let messages = collect(rx).await;
        assert!(matches!(messages[0], ServerMessage::Tts { ordinal: 0, .. }));
        assert_eq!(
            messages[1],
            ServerMessage::TtsError {
                ordinal: 1,
                reason: "voice unavailable".into()
            }
        );
        assert!(matches!(messages[2], ServerMessage::Tts { ordinal: 2, .. }));
        assert_eq!(messages.len(), 3);
        assert_eq!(report, TurnReport { delivered: 2, failed: 1 });
        assert!(!report.all_delivered());
    }

    #[tokio::test]
    async fn payload_is_base64_wav_at_output_rate() {
        let pipeline = SynthesisPipeline::new(Arc::new(ScriptedTts::default()), 0);
        let (tx, rx) = mpsc::channel(4);
        pipeline
            .run(sentences(&["hello"]), &tx, &CancellationToken::new())
            .await
            .unwrap();
        drop(tx);
        let messages = collect(rx).await;
        let ServerMessage::Tts { sentence, audio, .. } = &messages[0] else {
            panic!("expected tts, got {:?}", messages[0]);
        };
        assert_eq!(sentence, "hello");
        let wav = STANDARD.decode(audio).unwrap();
        let decoded = decode_wav(&wav).unwrap();
        assert_eq!(decoded.sample_rate, OUTPUT_SAMPLE_RATE);
        // 0.1 s at 16 kHz resampled to 24 kHz
        assert_eq!(decoded.samples.len(), 2_400);
    }

    #[tokio::test]
    async fn lookahead_bounds_concurrent_synthesis() {
        let tts = Arc::new(ScriptedTts::default());
        let pipeline = SynthesisPipeline::new(tts.clone(), 1);
        let (tx, rx) = mpsc::channel(16);
        let report = pipeline
            .run(
                sentences(&["a", "b", "c", "d", "e", "f"]),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        drop(tx);
        assert_eq!(collect(rx).await.len(), 6);
        assert_eq!(report.delivered, 6);
        assert!(tts.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancellation_stops_further_delivery() {
        let tts = ScriptedTts::default()
            .delay("s0", 5)
            .delay("s1", 200)
            .delay("s2", 200);
        let pipeline = SynthesisPipeline::new(Arc::new(tts), 0);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pipeline
                    .run(sentences(&["s0", "s1", "s2"]), &tx, &cancel)
                    .await
            })
        };
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ServerMessage::Tts { ordinal: 0, .. }));
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(VoiceError::Cancelled(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_client_is_a_transport_error() {
        let pipeline = SynthesisPipeline::new(Arc::new(ScriptedTts::default()), 1);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = pipeline
            .run(sentences(&["a", "b"]), &tx, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(VoiceError::Transport(_))));
    }
}
