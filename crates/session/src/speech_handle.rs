use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use parley_events::SpeechOrigin;
use parley_task::{CancellationToken, Promise};
use uuid::Uuid;

/// The supplied future lost the race against the handle's interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Lifecycle token for one agent utterance.
///
/// Created when a reply is planned, queued by the scheduler, authorized when
/// it reaches the front, and marked done when its playout finished (or was
/// cut short). `interrupted` is monotonic: once set it never clears, and
/// every later [`wait_if_not_interrupted`] resolves immediately.
///
/// [`wait_if_not_interrupted`]: SpeechHandle::wait_if_not_interrupted
#[derive(Clone)]
pub struct SpeechHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: String,
    allow_interruptions: bool,
    step_index: u32,
    parent_id: Option<String>,
    origin: SpeechOrigin,
    interrupted: CancellationToken,
    authorized: Promise<()>,
    authorize_called: AtomicBool,
    playout_done: Promise<()>,
    /// Steps scheduled in this turn, shared across the handle chain.
    steps: Arc<AtomicU32>,
    /// Per-step generation promises, shared across the handle chain.
    generations: Arc<Mutex<HashMap<u32, Promise<()>>>>,
}

impl SpeechHandle {
    pub(crate) fn new(allow_interruptions: bool, origin: SpeechOrigin) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: format!("speech_{}", Uuid::new_v4().simple()),
                allow_interruptions,
                step_index: 0,
                parent_id: None,
                origin,
                interrupted: CancellationToken::new(),
                authorized: Promise::new(),
                authorize_called: AtomicBool::new(false),
                playout_done: Promise::new(),
                steps: Arc::new(AtomicU32::new(1)),
                generations: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// A follow-up step in the same turn. Inherits the parent's
    /// interruption policy unconditionally and links back by id only.
    pub(crate) fn child(parent: &SpeechHandle) -> Self {
        parent.inner.steps.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Arc::new(HandleInner {
                id: format!("speech_{}", Uuid::new_v4().simple()),
                allow_interruptions: parent.inner.allow_interruptions,
                step_index: parent.inner.step_index + 1,
                parent_id: Some(parent.inner.id.clone()),
                origin: SpeechOrigin::ToolResponse,
                interrupted: CancellationToken::new(),
                authorized: Promise::new(),
                authorize_called: AtomicBool::new(false),
                playout_done: Promise::new(),
                steps: parent.inner.steps.clone(),
                generations: parent.inner.generations.clone(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn allow_interruptions(&self) -> bool {
        self.inner.allow_interruptions
    }

    pub fn step_index(&self) -> u32 {
        self.inner.step_index
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.inner.parent_id.as_deref()
    }

    pub fn origin(&self) -> SpeechOrigin {
        self.inner.origin
    }

    /// Total steps scheduled in this turn so far.
    pub fn num_steps(&self) -> u32 {
        self.inner.steps.load(Ordering::SeqCst)
    }

    pub fn interrupted(&self) -> bool {
        self.inner.interrupted.is_cancelled()
    }

    /// Request this utterance to stop. Idempotent.
    pub fn interrupt(&self) {
        if !self.inner.interrupted.is_cancelled() {
            tracing::debug!(speech_id = %self.inner.id, "speech interrupted");
            self.inner.interrupted.cancel();
        }
    }

    pub(crate) fn interruption_token(&self) -> &CancellationToken {
        &self.inner.interrupted
    }

    /// Grant exclusive playout rights. May only ever be called once.
    pub(crate) fn authorize(&self) {
        assert!(
            !self.inner.authorize_called.swap(true, Ordering::SeqCst),
            "speech handle {} authorized twice",
            self.inner.id
        );
        self.inner.authorized.resolve(());
    }

    /// Resolves when the scheduler grants playout rights.
    pub async fn wait_for_authorization(&self) {
        self.inner.authorized.wait().await;
    }

    pub fn is_done(&self) -> bool {
        self.inner.playout_done.is_done()
    }

    /// Resolves when this utterance's playout completed (or was drained
    /// after an interruption).
    pub async fn wait_for_playout(&self) {
        self.inner.playout_done.wait().await;
    }

    /// Mark playout finished. The reply task calls this on every exit path.
    pub(crate) fn mark_playout_done(&self) {
        if !self.inner.playout_done.resolve(()) {
            tracing::debug!(speech_id = %self.inner.id, "playout already marked done");
        }
    }

    /// Race `future` against the interruption signal. Resolves immediately
    /// with `Err(Interrupted)` if the handle is already interrupted.
    pub async fn wait_if_not_interrupted<F>(&self, future: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        if self.interrupted() {
            return Err(Interrupted);
        }
        tokio::select! {
            _ = self.inner.interrupted.cancelled() => Err(Interrupted),
            value = future => Ok(value),
        }
    }

    fn generation_promise(&self, step_index: u32) -> Promise<()> {
        self.inner
            .generations
            .lock()
            .expect("generation map lock poisoned")
            .entry(step_index)
            .or_insert_with(Promise::new)
            .clone()
    }

    /// Resolve the generation promise of one step; called by the reply task
    /// once the step's spoken output is complete.
    pub(crate) fn mark_generation_done(&self, step_index: u32) {
        self.generation_promise(step_index).resolve(());
    }

    /// Await the specific spoken reply step that preceded a tool call —
    /// not the entire multi-step reply.
    pub async fn wait_for_generation(&self, step_index: u32) {
        self.generation_promise(step_index).wait().await;
    }
}

impl std::fmt::Debug for SpeechHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechHandle")
            .field("id", &self.inner.id)
            .field("step_index", &self.inner.step_index)
            .field("interrupted", &self.interrupted())
            .field("done", &self.is_done())
            .finish()
    }
}
