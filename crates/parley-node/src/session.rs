// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-connection session state: inbound frame handling, turn scheduling,
//! cancellation, rate limits, and the bounded outbound queue.
//!
//! The socket write path is a separate task draining the outbound queue;
//! when a slow client lets the queue fill, the producing turn blocks on its
//! own sends — backpressure slows that session's generation without
//! affecting any other connection.
//!
//! Turns never interleave on one session: a `chat` frame arriving while a
//! turn is in flight is answered with `error{validation}` rather than
//! queued, which keeps the per-turn ordering guarantee trivial.
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use parley_core::{ErrorCode, Orchestrator, TurnRequest, TurnStats};

use crate::protocol::{ClientFrame, ServerFrame};

pub type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub frames_per_second: u32,
    pub turns_per_minute: u32,
    pub outbound_queue: usize,
}

impl From<&parley_config::LimitsConfig> for SessionLimits {
    fn from(cfg: &parley_config::LimitsConfig) -> Self {
        Self {
            frames_per_second: cfg.frames_per_second,
            turns_per_minute: cfg.turns_per_minute,
            outbound_queue: cfg.outbound_queue,
        }
    }
}

struct ActiveTurn {
    turn_id: Uuid,
    cancel: CancellationToken,
}

/// One authenticated session. Lives as long as the connection.
pub struct Session {
    user_id: String,
    orchestrator: Arc<Orchestrator>,
    out_tx: mpsc::Sender<ServerFrame>,
    /// Inbound frame limiter, one per session.
    frame_limiter: DirectLimiter,
    /// Turn limiter shared across the user's sessions.
    turn_limiter: Arc<DirectLimiter>,
    active: Arc<Mutex<Option<ActiveTurn>>>,
}

impl Session {
    /// Create the session plus the receiving half of its bounded outbound
    /// queue; the caller owns draining it to the socket.
    pub fn new(
        user_id: String,
        orchestrator: Arc<Orchestrator>,
        turn_limiter: Arc<DirectLimiter>,
        limits: SessionLimits,
    ) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (out_tx, out_rx) = mpsc::channel(limits.outbound_queue.max(1));
        let quota = Quota::per_second(
            NonZeroU32::new(limits.frames_per_second.max(1)).expect("nonzero"),
        );
        let session = Self {
            user_id,
            orchestrator,
            out_tx,
            frame_limiter: RateLimiter::direct(quota),
            turn_limiter,
            active: Arc::new(Mutex::new(None)),
        };
        (session, out_rx)
    }

    /// Per-user turn limiter (shared across that user's sessions).
    pub fn user_turn_limiter(turns_per_minute: u32) -> Arc<DirectLimiter> {
        let quota =
            Quota::per_minute(NonZeroU32::new(turns_per_minute.max(1)).expect("nonzero"));
        Arc::new(RateLimiter::direct(quota))
    }

    /// Handle one inbound frame. Over-limit frames are answered with
    /// `error{rate_limited}` and dropped.
    pub async fn handle_frame(&self, frame: ClientFrame) {
        if self.frame_limiter.check().is_err() {
            self.send_error(None, ErrorCode::RateLimited, "inbound frame rate exceeded").await;
            return;
        }
        match frame {
            ClientFrame::Chat { conversation_id, content, options } => {
                self.start_turn(conversation_id, content, options).await;
            }
            ClientFrame::Cancel { turn_id } => {
                let active = self.active.lock().await;
                match active.as_ref() {
                    Some(turn) if turn.turn_id == turn_id => {
                        info!(user = %self.user_id, turn = %turn_id, "turn cancelled by client");
                        turn.cancel.cancel();
                    }
                    _ => debug!(user = %self.user_id, turn = %turn_id, "cancel for unknown turn"),
                }
            }
        }
    }

    async fn start_turn(
        &self,
        conversation_id: Uuid,
        content: String,
        options: parley_core::TurnOptions,
    ) {
        let mut active = self.active.lock().await;
        if active.is_some() {
            self.send_error(None, ErrorCode::Validation, "a turn is already in flight").await;
            return;
        }
        if self.turn_limiter.check().is_err() {
            self.send_error(None, ErrorCode::RateLimited, "turn rate exceeded").await;
            return;
        }

        let turn_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        *active = Some(ActiveTurn { turn_id, cancel: cancel.clone() });
        drop(active);

        let req = TurnRequest {
            user_id: self.user_id.clone(),
            conversation_id,
            turn_id,
            text: content,
            options,
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        let out = self.out_tx.clone();
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let (ev_tx, mut ev_rx) = mpsc::channel(16);
            // The pump forwards ordered events into the bounded outbound
            // queue; its awaited sends are where backpressure bites.
            let pump = async {
                while let Some(ev) = ev_rx.recv().await {
                    if out.send(ServerFrame::from_event(turn_id, ev)).await.is_err() {
                        break;
                    }
                }
            };
            let (result, ()) = tokio::join!(orchestrator.run_turn(req, ev_tx, cancel), pump);
            if let Err(e) = result {
                error!(turn = %turn_id, error = %e, "turn failed internally");
                let _ = out
                    .send(ServerFrame::Error {
                        turn_id: Some(turn_id),
                        code: ErrorCode::Internal,
                        message: "something went wrong; the turn was aborted".into(),
                    })
                    .await;
                let _ = out
                    .send(ServerFrame::TurnEnded {
                        turn_id,
                        stats: TurnStats::default(),
                        cancelled: false,
                    })
                    .await;
            }
            *active.lock().await = None;
        });
    }

    /// Answer a frame that failed to parse. Counts against the inbound
    /// limiter like any other frame.
    pub async fn handle_malformed(&self, message: String) {
        if self.frame_limiter.check().is_err() {
            self.send_error(None, ErrorCode::RateLimited, "inbound frame rate exceeded").await;
            return;
        }
        self.send_error(None, ErrorCode::Validation, &message).await;
    }

    /// Cancel whatever is in flight (connection teardown).
    pub async fn shutdown(&self) {
        if let Some(turn) = self.active.lock().await.take() {
            turn.cancel.cancel();
        }
    }

    async fn send_error(&self, turn_id: Option<Uuid>, code: ErrorCode, message: &str) {
        let _ = self
            .out_tx
            .send(ServerFrame::Error { turn_id, code, message: message.into() })
            .await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_config::{DisciplineLevel, RetrievalConfig};
    use parley_model::mock::MockEmbedder;
    use parley_model::{
        ChatProvider, CompletionRequest, FinishReason, ModelGateway, ProviderError,
        ResponseEvent, ResponseStream,
    };
    use parley_retrieval::HybridSearcher;
    use parley_store::Store;
    use parley_tabular::{CredentialCrypto, EngineRegistry, TabularPlanner};
    use std::time::Duration;

    const DIM: usize = 32;

    /// Emits `n` deltas with a small delay each, so tests can observe
    /// in-flight turns and backpressure.
    struct SlowProvider {
        deltas: usize,
        delay: Duration,
    }

    #[async_trait]
    impl ChatProvider for SlowProvider {
        fn name(&self) -> &str {
            "mock"
        }
        fn model_name(&self) -> &str {
            "mock-model"
        }
        async fn complete(
            &self,
            _req: CompletionRequest,
        ) -> Result<ResponseStream, ProviderError> {
            let deltas = self.deltas;
            let delay = self.delay;
            let stream = async_stream_events(deltas, delay);
            Ok(Box::pin(stream))
        }
    }

    fn async_stream_events(
        deltas: usize,
        delay: Duration,
    ) -> impl futures::Stream<Item = Result<ResponseEvent, ProviderError>> + Send {
        futures::stream::unfold(0usize, move |i| async move {
            if i < deltas {
                tokio::time::sleep(delay).await;
                Some((Ok(ResponseEvent::TextDelta(format!("tok{i} "))), i + 1))
            } else if i == deltas {
                Some((Ok(ResponseEvent::Done(FinishReason::Stop)), i + 1))
            } else {
                None
            }
        })
    }

    struct Harness {
        store: Store,
        orchestrator: Arc<Orchestrator>,
    }

    fn harness(deltas: usize, delay: Duration) -> Harness {
        let store = Store::in_memory(DIM).unwrap();
        let gateway = Arc::new(ModelGateway::with_providers(
            vec![(
                "default".into(),
                Arc::new(SlowProvider { deltas, delay }) as Arc<dyn ChatProvider>,
            )],
            Arc::new(MockEmbedder::new(DIM)),
        ));
        let searcher = Arc::new(HybridSearcher::new(
            store.clone(),
            Arc::clone(&gateway),
            None,
            RetrievalConfig::default(),
        ));
        let tabular = Arc::new(TabularPlanner::new(
            store.clone(),
            Arc::clone(&gateway),
            EngineRegistry::new(),
            CredentialCrypto::ephemeral(),
            Duration::from_secs(5),
            1_000,
        ));
        let budget = Arc::new(parley_core::BudgetGovernor::new(store.clone(), 1_000_000, 0.8));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            gateway,
            searcher,
            tabular,
            None,
            budget,
            "default".into(),
            DisciplineLevel::Exploration,
        ));
        Harness { store, orchestrator }
    }

    fn session(h: &Harness, limits: SessionLimits) -> (Session, mpsc::Receiver<ServerFrame>) {
        Session::new(
            "alice".into(),
            Arc::clone(&h.orchestrator),
            Session::user_turn_limiter(limits.turns_per_minute),
            limits,
        )
    }

    fn limits() -> SessionLimits {
        SessionLimits { frames_per_second: 10, turns_per_minute: 100, outbound_queue: 64 }
    }

    async fn collect_turn(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            let done = matches!(frame, ServerFrame::TurnEnded { .. });
            frames.push(frame);
            if done {
                break;
            }
        }
        frames
    }

    #[tokio::test]
    async fn chat_produces_ordered_turn_frames() {
        let h = harness(3, Duration::from_millis(1));
        let conv = h.store.create_conversation("alice", None).await.unwrap();
        let (session, mut rx) = session(&h, limits());

        session
            .handle_frame(ClientFrame::Chat {
                conversation_id: conv.id,
                content: "hello".into(),
                options: Default::default(),
            })
            .await;

        let frames = collect_turn(&mut rx).await;
        assert!(matches!(frames.first(), Some(ServerFrame::TurnStarted { .. })));
        assert!(matches!(frames.last(), Some(ServerFrame::TurnEnded { cancelled: false, .. })));
        let deltas = frames
            .iter()
            .filter(|f| matches!(f, ServerFrame::TextDelta { .. }))
            .count();
        assert_eq!(deltas, 3);
        // All frames of the turn share its id.
        let turn_id = match &frames[0] {
            ServerFrame::TurnStarted { turn_id, .. } => *turn_id,
            _ => unreachable!(),
        };
        for f in &frames {
            if let ServerFrame::TextDelta { turn_id: t, .. } = f {
                assert_eq!(*t, turn_id);
            }
        }
    }

    #[tokio::test]
    async fn second_chat_while_in_flight_is_rejected() {
        let h = harness(20, Duration::from_millis(20));
        let conv = h.store.create_conversation("alice", None).await.unwrap();
        let (session, mut rx) = session(&h, limits());

        session
            .handle_frame(ClientFrame::Chat {
                conversation_id: conv.id,
                content: "first".into(),
                options: Default::default(),
            })
            .await;
        // Give the turn a moment to register as active.
        tokio::time::sleep(Duration::from_millis(10)).await;
        session
            .handle_frame(ClientFrame::Chat {
                conversation_id: conv.id,
                content: "second".into(),
                options: Default::default(),
            })
            .await;

        let mut saw_validation = false;
        let mut ended = 0;
        while let Some(frame) = rx.recv().await {
            match frame {
                ServerFrame::Error { code: ErrorCode::Validation, .. } => saw_validation = true,
                ServerFrame::TurnEnded { .. } => {
                    ended += 1;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_validation, "second chat must be rejected");
        assert_eq!(ended, 1, "only the first turn ran");
    }

    #[tokio::test]
    async fn cancel_mid_turn_ends_with_cancelled_flag() {
        let h = harness(500, Duration::from_millis(10));
        let conv = h.store.create_conversation("alice", None).await.unwrap();
        let (session, mut rx) = session(&h, limits());

        session
            .handle_frame(ClientFrame::Chat {
                conversation_id: conv.id,
                content: "long one".into(),
                options: Default::default(),
            })
            .await;

        // Read until the turn is visibly started, then cancel it.
        let turn_id = loop {
            match rx.recv().await {
                Some(ServerFrame::TurnStarted { turn_id, .. }) => break turn_id,
                Some(_) => {}
                None => panic!("stream closed early"),
            }
        };
        session.handle_frame(ClientFrame::Cancel { turn_id }).await;

        let mut cancelled = false;
        while let Some(frame) = rx.recv().await {
            if let ServerFrame::TurnEnded { cancelled: c, .. } = frame {
                cancelled = c;
                break;
            }
        }
        assert!(cancelled);

        // The session accepts new turns afterwards.
        session
            .handle_frame(ClientFrame::Chat {
                conversation_id: conv.id,
                content: "again".into(),
                options: Default::default(),
            })
            .await;
        let frames = collect_turn(&mut rx).await;
        assert!(matches!(frames.last(), Some(ServerFrame::TurnEnded { .. })));
    }

    #[tokio::test]
    async fn over_limit_frames_get_rate_limited_errors() {
        let h = harness(1, Duration::from_millis(1));
        let (session, mut rx) = session(
            &h,
            SessionLimits { frames_per_second: 1, turns_per_minute: 100, outbound_queue: 16 },
        );

        // Burst of cancels for an unknown turn: the first is within quota
        // (and silently ignored), the rest are over it.
        for _ in 0..3 {
            session.handle_frame(ClientFrame::Cancel { turn_id: Uuid::new_v4() }).await;
        }
        let mut rate_limited = 0;
        while let Ok(frame) = rx.try_recv() {
            if matches!(frame, ServerFrame::Error { code: ErrorCode::RateLimited, .. }) {
                rate_limited += 1;
            }
        }
        assert_eq!(rate_limited, 2);
    }

    #[tokio::test]
    async fn slow_consumer_gets_every_frame_in_order() {
        let h = harness(30, Duration::from_millis(1));
        let conv = h.store.create_conversation("alice", None).await.unwrap();
        // Tiny outbound queue: the producer must block rather than drop.
        let (session, mut rx) = session(
            &h,
            SessionLimits { frames_per_second: 100, turns_per_minute: 100, outbound_queue: 2 },
        );

        session
            .handle_frame(ClientFrame::Chat {
                conversation_id: conv.id,
                content: "stream a lot".into(),
                options: Default::default(),
            })
            .await;

        let mut deltas = Vec::new();
        while let Some(frame) = rx.recv().await {
            // A deliberately slow reader.
            tokio::time::sleep(Duration::from_millis(3)).await;
            match frame {
                ServerFrame::TextDelta { text, .. } => deltas.push(text),
                ServerFrame::TurnEnded { .. } => break,
                _ => {}
            }
        }
        assert_eq!(deltas.len(), 30, "no frame was dropped");
        for (i, d) in deltas.iter().enumerate() {
            assert_eq!(d, &format!("tok{i} "), "frames arrived out of order");
        }
    }
}
