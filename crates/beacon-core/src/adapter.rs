//! Bluetooth adapter gate.
//!
//! Checks that the radio is powered and, when it is not, brokers the one-shot
//! "turn on Bluetooth" prompt. The host reports the user's answer through
//! [`AdapterGate::on_activity_result`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::traits::{BluetoothRadio, EnablePrompt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptState {
    Waiting,
    Answered(bool),
    Abandoned,
}

/// Radio power check and enable-prompt broker.
pub struct AdapterGate {
    radio: Arc<dyn BluetoothRadio>,
    prompt: Arc<dyn EnablePrompt>,
    pending: Mutex<Option<watch::Sender<PromptState>>>,
}

impl fmt::Debug for AdapterGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterGate").finish_non_exhaustive()
    }
}

impl AdapterGate {
    /// Create a gate over a radio and a prompt.
    pub fn new(radio: Arc<dyn BluetoothRadio>, prompt: Arc<dyn EnablePrompt>) -> Self {
        Self {
            radio,
            prompt,
            pending: Mutex::new(None),
        }
    }

    /// Whether the radio is powered, without prompting.
    pub async fn is_enabled(&self) -> Result<bool> {
        self.radio.is_powered().await
    }

    /// Whether a prompt is outstanding.
    pub async fn is_prompt_pending(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    /// Ensure the radio is on, prompting the user if needed.
    ///
    /// Resolves to `true` once the radio is on and `false` if the user
    /// declined. Fails with [`Error::BusyPrompt`] while another prompt is
    /// outstanding and with [`Error::Cancelled`] if the prompt is abandoned.
    pub async fn ensure_enabled(&self) -> Result<bool> {
        if self.radio.is_powered().await? {
            return Ok(true);
        }

        let rx = {
            let mut pending = self.pending.lock().await;
            if pending.is_some() {
                debug!("enable prompt already outstanding");
                return Err(Error::BusyPrompt);
            }
            let (tx, rx) = watch::channel(PromptState::Waiting);
            *pending = Some(tx);
            rx
        };

        info!("radio off, requesting enable");
        if let Err(e) = self.prompt.request_enable().await {
            warn!(error = %e, "failed to raise enable prompt");
            self.pending.lock().await.take();
            return Err(e);
        }
        self.await_answer(rx).await
    }

    /// Like [`ensure_enabled`](Self::ensure_enabled), but joins an outstanding
    /// prompt instead of failing with [`Error::BusyPrompt`].
    pub async fn wait_enabled(&self) -> Result<bool> {
        let joined = self.pending.lock().await.as_ref().map(|tx| tx.subscribe());
        match joined {
            Some(rx) => self.await_answer(rx).await,
            None => self.ensure_enabled().await,
        }
    }

    /// Deliver the user's answer to the outstanding prompt.
    ///
    /// Returns `false` when no prompt was outstanding.
    pub async fn on_activity_result(&self, accepted: bool) -> bool {
        match self.pending.lock().await.take() {
            Some(tx) => {
                info!(accepted, "enable prompt answered");
                let _ = tx.send(PromptState::Answered(accepted));
                true
            }
            None => {
                warn!("activity result without an outstanding prompt");
                false
            }
        }
    }

    /// Abandon the outstanding prompt. Waiters resolve with [`Error::Cancelled`].
    pub async fn abandon(&self) {
        if let Some(tx) = self.pending.lock().await.take() {
            debug!("enable prompt abandoned");
            let _ = tx.send(PromptState::Abandoned);
        }
    }

    async fn await_answer(&self, mut rx: watch::Receiver<PromptState>) -> Result<bool> {
        let state = *rx
            .wait_for(|s| *s != PromptState::Waiting)
            .await
            .map_err(|_| Error::Cancelled)?;
        match state {
            PromptState::Answered(true) => self.radio.is_powered().await,
            PromptState::Answered(false) => Ok(false),
            PromptState::Waiting | PromptState::Abandoned => Err(Error::Cancelled),
        }
    }
}
