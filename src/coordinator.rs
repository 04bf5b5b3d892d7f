//! Generation lifecycle coordination.
//!
//! The host delivers [`HostSignal`]s over a flume channel; the coordinator
//! reacts by sweeping stray status data, gating on reply integrity, and
//! arming the debounced automation that runs the status pipeline and the
//! automatic summarization pass. The debounce is an explicit state machine
//! with pure transitions, so the scheduling rules are testable without a
//! runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

use crate::config::EffectiveConfig;
use crate::host::{Host, HostSignal};
use crate::retrieval;
use crate::status::{integrity_ok, swipe_rolled_back, StatusEngine, StatusEvent};
use crate::summarize::{SummarizeOptions, Summarizer};

/// Fixed retry budget for a freshly switched chat whose data the host has
/// not finished loading.
const CHAT_READY_RETRIES: usize = 10;
const CHAT_READY_PAUSE: Duration = Duration::from_millis(200);

/// Why a pending automation trigger is currently refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    GenerationActive,
}

/// The debounce, modeled as explicit states advanced by pure transitions.
/// Arming while pending replaces the deadline (latest wins); arming while
/// suppressed is refused until [`DebounceState::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending { deadline: Instant },
    Suppressed { reason: SuppressReason },
}

impl DebounceState {
    pub fn arm(self, deadline: Instant) -> Self {
        match self {
            DebounceState::Suppressed { .. } => self,
            _ => DebounceState::Pending { deadline },
        }
    }

    pub fn suppress(self, reason: SuppressReason) -> Self {
        DebounceState::Suppressed { reason }
    }

    pub fn resume(self) -> Self {
        match self {
            DebounceState::Suppressed { .. } => DebounceState::Idle,
            other => other,
        }
    }

    pub fn cancel(self) -> Self {
        match self {
            DebounceState::Pending { .. } => DebounceState::Idle,
            other => other,
        }
    }

    /// Fire when pending and the deadline has passed. A timer that wakes to
    /// find a later deadline was out-armed and does nothing.
    pub fn fire_due(self, now: Instant) -> (Self, bool) {
        match self {
            DebounceState::Pending { deadline } if now >= deadline => (DebounceState::Idle, true),
            other => (other, false),
        }
    }
}

/// In-memory state of the generation currently in flight. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct GenerationSession {
    pub active: bool,
    pub is_swipe: bool,
    pub was_stopped: bool,
    /// Content of the reply being swiped, cached at generation start so a
    /// cancelled swipe (byte-identical result) can be recognized.
    pub pre_swipe_content: Option<String>,
}

struct Inner {
    host: Host,
    cfg: Mutex<EffectiveConfig>,
    status: StatusEngine,
    summarizer: Summarizer,
    session: Mutex<GenerationSession>,
    debounce: Mutex<DebounceState>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        host: Host,
        cfg: EffectiveConfig,
        events: Option<flume::Sender<StatusEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                status: StatusEngine::new(host.clone(), events),
                summarizer: Summarizer::new(host.clone()),
                host,
                cfg: Mutex::new(cfg),
                session: Mutex::new(GenerationSession::default()),
                debounce: Mutex::new(DebounceState::Idle),
            }),
        }
    }

    /// Consume host signals until the channel closes. Handler errors are
    /// logged, never fatal to the loop.
    pub fn listen(&self, signals: flume::Receiver<HostSignal>) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Ok(signal) = signals.recv_async().await {
                if let Err(error) = coordinator.handle(signal).await {
                    tracing::warn!("signal handling failed: {error:#}");
                }
            }
        })
    }

    pub fn set_config(&self, cfg: EffectiveConfig) {
        *self.inner.cfg.lock().unwrap() = cfg;
    }

    pub fn set_swipe_state(&self, is_swipe: bool) {
        self.inner.session.lock().unwrap().is_swipe = is_swipe;
    }

    pub fn is_summarizing(&self) -> bool {
        self.inner.summarizer.is_running()
    }

    /// Manual summarization entry point (also used by the fired automation).
    pub async fn run_summarization(&self, opts: SummarizeOptions) -> Result<()> {
        let cfg = self.inner.cfg.lock().unwrap().clone();
        self.inner.summarizer.run(&cfg, opts).await
    }

    /// Explicit user-requested watermark override.
    pub async fn reset_watermark(&self, watermark: crate::summarize::Watermark) -> Result<()> {
        self.inner.summarizer.reset_watermark(watermark).await
    }

    /// The prompt interceptor: refresh both retrieval injections for the
    /// upcoming generation.
    pub async fn interceptor(&self) -> Result<()> {
        let cfg = self.inner.cfg.lock().unwrap().clone();
        let count = self.inner.host.log.message_count().await?;
        let messages = if count > 0 {
            self.inner.host.log.messages_in_range(0, count - 1).await?
        } else {
            Vec::new()
        };
        let is_swipe = self.inner.session.lock().unwrap().is_swipe;
        retrieval::run_retrieval(&self.inner.host, &cfg, &messages, is_swipe).await
    }

    pub async fn handle(&self, signal: HostSignal) -> Result<()> {
        match signal {
            HostSignal::GenerationStarted { dry_run, is_swipe } => {
                if dry_run {
                    return Ok(());
                }
                self.on_generation_started(is_swipe).await
            }
            HostSignal::GenerationStopped => {
                self.on_generation_stopped();
                Ok(())
            }
            HostSignal::GenerationEnded => self.on_generation_ended().await,
            HostSignal::UserMessageRendered { message_id } => {
                self.on_user_rendered(message_id).await
            }
            // Assistant messages legitimately carry snapshots; nothing to do.
            HostSignal::CharacterMessageRendered { .. } => Ok(()),
            HostSignal::ChatChanged { chat_id } => self.on_chat_changed(&chat_id).await,
        }
    }

    async fn on_generation_started(&self, is_swipe: bool) -> Result<()> {
        {
            let mut debounce = self.inner.debounce.lock().unwrap();
            *debounce = debounce.cancel().suppress(SuppressReason::GenerationActive);
        }

        let pre_swipe = if is_swipe {
            self.inner
                .host
                .log
                .newest(1)
                .await?
                .pop()
                .filter(|m| m.is_assistant())
                .map(|m| m.content)
        } else {
            None
        };

        {
            let mut session = self.inner.session.lock().unwrap();
            session.active = true;
            session.is_swipe = is_swipe;
            session.was_stopped = false;
            session.pre_swipe_content = pre_swipe;
        }

        self.inner.status.pre_generation_sweep().await
    }

    fn on_generation_stopped(&self) {
        let mut session = self.inner.session.lock().unwrap();
        session.active = false;
        session.was_stopped = true;
        let mut debounce = self.inner.debounce.lock().unwrap();
        *debounce = debounce.resume().cancel();
    }

    async fn on_generation_ended(&self) -> Result<()> {
        let (was_stopped, is_swipe, pre_swipe) = {
            let mut session = self.inner.session.lock().unwrap();
            session.active = false;
            (
                session.was_stopped,
                session.is_swipe,
                session.pre_swipe_content.take(),
            )
        };
        {
            let mut debounce = self.inner.debounce.lock().unwrap();
            *debounce = debounce.resume();
        }
        if was_stopped {
            return Ok(());
        }

        let Some(frontier) = self.inner.status.post_generation_check().await? else {
            return Ok(());
        };

        if is_swipe {
            self.inner.session.lock().unwrap().is_swipe = false;
            if let Some(pre) = pre_swipe {
                if swipe_rolled_back(&pre, &frontier.content) {
                    tracing::debug!("swipe cancelled, reply content unchanged");
                    self.inner.status.swipe_cancelled(frontier.message_id);
                    return Ok(());
                }
            }
        }

        let cfg = self.inner.cfg.lock().unwrap().clone();
        if !integrity_ok(
            &frontier.content,
            cfg.min_reply_chars,
            cfg.reply_terminator.as_deref(),
        ) {
            tracing::warn!("reply {} failed the integrity gate", frontier.message_id);
            return retrieval::clear_injections(&self.inner.host, &cfg.lorebook).await;
        }

        self.arm_automation(frontier.message_id, Duration::from_millis(cfg.debounce_ms));
        Ok(())
    }

    /// Schedule the automation timer. Each arm spawns its own timer; a timer
    /// that wakes under a newer deadline loses the [`DebounceState::fire_due`]
    /// race and exits.
    fn arm_automation(&self, message_id: i64, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut debounce = self.inner.debounce.lock().unwrap();
            let armed = debounce.arm(deadline);
            let scheduled = matches!(armed, DebounceState::Pending { deadline: d } if d == deadline);
            *debounce = armed;
            if !scheduled {
                return;
            }
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut debounce = inner.debounce.lock().unwrap();
                let (next, fire) = debounce.fire_due(Instant::now());
                *debounce = next;
                fire
            };
            if fire {
                Inner::run_automation(&inner, message_id).await;
            }
        });
    }

    async fn on_user_rendered(&self, message_id: i64) -> Result<()> {
        let window = self.inner.cfg.lock().unwrap().historical_render_window;
        let count = self.inner.host.log.message_count().await?;
        // A user message far behind the frontier is being re-rendered from
        // history; any snapshot on it is stray data from before the sweeps
        // existed.
        if count - 1 - message_id >= window {
            self.inner.status.purge_ghost(message_id).await?;
        }
        Ok(())
    }

    async fn on_chat_changed(&self, chat_id: &str) -> Result<()> {
        *self.inner.session.lock().unwrap() = GenerationSession::default();
        *self.inner.debounce.lock().unwrap() = DebounceState::Idle;
        tracing::info!("chat switched to {chat_id}");

        if !self.await_chat_ready().await {
            tracing::warn!("chat data not available after {CHAT_READY_RETRIES} attempts");
            return Ok(());
        }
        // Injections built for the previous chat must not leak into this one.
        let book = self.inner.cfg.lock().unwrap().lorebook.clone();
        retrieval::clear_injections(&self.inner.host, &book).await
    }

    async fn await_chat_ready(&self) -> bool {
        for _ in 0..CHAT_READY_RETRIES {
            if self.inner.host.log.message_count().await.is_ok() {
                return true;
            }
            tokio::time::sleep(CHAT_READY_PAUSE).await;
        }
        false
    }
}

impl Inner {
    /// The debounced automation body: status pipeline first, then the
    /// automatic summarization pass. A status failure is logged and does not
    /// cancel the summarization that the same reply triggered.
    async fn run_automation(inner: &Arc<Inner>, message_id: i64) {
        let cfg = inner.cfg.lock().unwrap().clone();
        if let Err(error) = inner.status.update_status(&cfg, message_id).await {
            tracing::warn!("status update for message {message_id} failed: {error:#}");
        }
        if let Err(error) = inner.summarizer.run(&cfg, SummarizeOptions::default()).await {
            tracing::warn!("automatic summarization failed: {error:#}");
        }
    }
}
