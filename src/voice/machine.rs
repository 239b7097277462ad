//! The single owner of [`VoiceMode`] and the script table.
//!
//! Both the dispatcher (external requests) and the audio loop (internal
//! triggers) go through [`VoiceMachine`]; every mutation takes the same lock,
//! so an external `deaf` cannot interleave with a wake detection.

use super::VoiceError;
use super::state::{ScriptEntry, Transition, TransitionOrigin, VoiceMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Mutable settings applied at construction and by the record watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSettings {
    pub wake_alias: String,
    pub conversation_timeout: Duration,
    pub llm_timeout: Duration,
    pub script: Vec<ScriptEntry>,
}

/// Consistent copy of the voice state for readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSnapshot {
    pub mode: VoiceMode,
    pub wake_alias: String,
    pub script: Vec<ScriptEntry>,
    pub conversation_timeout: Duration,
    pub llm_timeout: Duration,
    pub conversation_deadline: Option<Instant>,
    pub llm_deadline: Option<Instant>,
}

impl VoiceSnapshot {
    /// Deadline of the current heavy mode, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self.mode {
            VoiceMode::Conversation => self.conversation_deadline,
            VoiceMode::Llm => self.llm_deadline,
            VoiceMode::Deaf | VoiceMode::NameListen => None,
        }
    }
}

#[derive(Debug)]
struct VoiceState {
    mode: VoiceMode,
    settings: VoiceSettings,
    conversation_deadline: Option<Instant>,
    llm_deadline: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<VoiceState>,
    shut_down: AtomicBool,
}

/// Cloneable handle to the process-wide voice state.
#[derive(Debug, Clone)]
pub struct VoiceMachine {
    inner: Arc<Inner>,
}

impl VoiceMachine {
    /// Create the machine in `initial`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::ExternalTargetRefused`] if `initial` is a heavy
    /// mode; only `Deaf` and `NameListen` are valid starting points.
    pub fn new(initial: VoiceMode, settings: VoiceSettings) -> Result<Self, VoiceError> {
        if !initial.is_externally_reachable() {
            return Err(VoiceError::ExternalTargetRefused(initial));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(VoiceState {
                    mode: initial,
                    settings,
                    conversation_deadline: None,
                    llm_deadline: None,
                }),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, VoiceState>, VoiceError> {
        self.inner.state.lock().map_err(|_| VoiceError::Poisoned)
    }

    /// Lock for a mutation; refused once shutdown has begun.
    fn lock_for_write(&self) -> Result<MutexGuard<'_, VoiceState>, VoiceError> {
        let guard = self.lock()?;
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(VoiceError::ShutDown);
        }
        Ok(guard)
    }

    /// # Errors
    ///
    /// Returns [`VoiceError::Poisoned`] if a writer panicked.
    pub fn snapshot(&self) -> Result<VoiceSnapshot, VoiceError> {
        let st = self.lock()?;
        Ok(VoiceSnapshot {
            mode: st.mode,
            wake_alias: st.settings.wake_alias.clone(),
            script: st.settings.script.clone(),
            conversation_timeout: st.settings.conversation_timeout,
            llm_timeout: st.settings.llm_timeout,
            conversation_deadline: st.conversation_deadline,
            llm_deadline: st.llm_deadline,
        })
    }

    /// # Errors
    ///
    /// Returns [`VoiceError::Poisoned`] if a writer panicked.
    pub fn mode(&self) -> Result<VoiceMode, VoiceError> {
        Ok(self.lock()?.mode)
    }

    /// Apply an operator/NMS/GUI request.
    ///
    /// Requesting the current light mode is accepted as a no-op.
    ///
    /// # Errors
    ///
    /// [`VoiceError::ExternalTargetRefused`] for `Conversation`/`Llm`,
    /// [`VoiceError::IllegalTransition`] when the device is mid-session.
    /// The state is unchanged on error.
    pub fn request_external(&self, target: VoiceMode) -> Result<Transition, VoiceError> {
        if !target.is_externally_reachable() {
            tracing::warn!(to = %target, origin = "external", "refused external request for heavy mode");
            return Err(VoiceError::ExternalTargetRefused(target));
        }
        let mut st = self.lock_for_write()?;
        if st.mode == target {
            return Ok(Transition {
                from: target,
                to: target,
                origin: TransitionOrigin::External,
            });
        }
        apply(&mut st, target, TransitionOrigin::External, Instant::now())
    }

    /// Apply a transition raised by the audio loop.
    ///
    /// # Errors
    ///
    /// [`VoiceError::IllegalTransition`] for an edge not in the table.
    pub fn trigger_internal(&self, target: VoiceMode, now: Instant) -> Result<Transition, VoiceError> {
        let mut st = self.lock_for_write()?;
        apply(&mut st, target, TransitionOrigin::Internal, now)
    }

    /// Wake name heard: `NameListen → Conversation`.
    ///
    /// # Errors
    ///
    /// [`VoiceError::IllegalTransition`] unless currently `NameListen`.
    pub fn wake_detected(&self, now: Instant) -> Result<Transition, VoiceError> {
        self.trigger_internal(VoiceMode::Conversation, now)
    }

    /// Unconditional safety fallback to `NameListen`.
    ///
    /// # Errors
    ///
    /// Only [`VoiceError::ShutDown`] or [`VoiceError::Poisoned`].
    pub fn fallback(&self, reason: &str) -> Result<Transition, VoiceError> {
        let mut st = self.lock_for_write()?;
        tracing::info!(from = %st.mode, reason, "voice fallback");
        apply(&mut st, VoiceMode::NameListen, TransitionOrigin::Internal, Instant::now())
    }

    /// Push the current session deadline out after activity.
    ///
    /// # Errors
    ///
    /// Only [`VoiceError::ShutDown`] or [`VoiceError::Poisoned`].
    pub fn touch(&self, now: Instant) -> Result<(), VoiceError> {
        let mut st = self.lock_for_write()?;
        match st.mode {
            VoiceMode::Conversation => st.conversation_deadline = Some(now + st.settings.conversation_timeout),
            VoiceMode::Llm => st.llm_deadline = Some(now + st.settings.llm_timeout),
            VoiceMode::Deaf | VoiceMode::NameListen => {}
        }
        Ok(())
    }

    /// End the session if its deadline has passed. Returns the transition
    /// back to `NameListen` when one happened.
    ///
    /// # Errors
    ///
    /// Only [`VoiceError::ShutDown`] or [`VoiceError::Poisoned`].
    pub fn expire(&self, now: Instant) -> Result<Option<Transition>, VoiceError> {
        let mut st = self.lock_for_write()?;
        let deadline = match st.mode {
            VoiceMode::Conversation => st.conversation_deadline,
            VoiceMode::Llm => st.llm_deadline,
            VoiceMode::Deaf | VoiceMode::NameListen => return Ok(None),
        };
        match deadline {
            Some(at) if now < at => Ok(None),
            _ => {
                tracing::info!(mode = %st.mode, "session deadline elapsed");
                apply(&mut st, VoiceMode::NameListen, TransitionOrigin::Internal, now).map(Some)
            }
        }
    }

    /// Replace the script table wholesale. The mode is not touched.
    ///
    /// # Errors
    ///
    /// Only [`VoiceError::ShutDown`] or [`VoiceError::Poisoned`].
    pub fn replace_script(&self, script: Vec<ScriptEntry>) -> Result<(), VoiceError> {
        let mut st = self.lock_for_write()?;
        tracing::info!(old_len = st.settings.script.len(), new_len = script.len(), "script table replaced");
        st.settings.script = script;
        Ok(())
    }

    /// Update alias and timeouts from a reloaded record. Running deadlines
    /// keep their current value until the next activity.
    ///
    /// # Errors
    ///
    /// Only [`VoiceError::ShutDown`] or [`VoiceError::Poisoned`].
    pub fn update_settings(&self, wake_alias: &str, conversation_timeout: Duration, llm_timeout: Duration) -> Result<(), VoiceError> {
        let mut st = self.lock_for_write()?;
        st.settings.wake_alias = wake_alias.to_owned();
        st.settings.conversation_timeout = conversation_timeout;
        st.settings.llm_timeout = llm_timeout;
        Ok(())
    }

    /// Refuse every later mutation. Readers keep working.
    pub fn shutdown(&self) {
        // Taking the lock orders the flag after any in-flight transition.
        let _guard = self.inner.state.lock();
        self.inner.shut_down.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

fn apply(st: &mut VoiceState, target: VoiceMode, origin: TransitionOrigin, now: Instant) -> Result<Transition, VoiceError> {
    let from = st.mode;
    if !from.can_transition_to(target, origin) {
        tracing::warn!(from = %from, to = %target, origin = %origin, "illegal voice transition refused");
        return Err(VoiceError::IllegalTransition { from, to: target, origin });
    }
    st.mode = target;
    match target {
        VoiceMode::Conversation => {
            st.conversation_deadline = Some(now + st.settings.conversation_timeout);
            st.llm_deadline = None;
        }
        VoiceMode::Llm => {
            st.conversation_deadline = None;
            st.llm_deadline = Some(now + st.settings.llm_timeout);
        }
        VoiceMode::Deaf | VoiceMode::NameListen => {
            st.conversation_deadline = None;
            st.llm_deadline = None;
        }
    }
    tracing::info!(from = %from, to = %target, origin = %origin, "voice transition");
    Ok(Transition { from, to: target, origin })
}
