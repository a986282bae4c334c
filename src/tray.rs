//! Tray signal relay.
//!
//! The host forwards tray clicks and window-state changes in as
//! [`TraySignal`]s and drains [`TrayIntent`]s telling it what to do with its
//! main window. When a minimized-state probe is installed the relay also
//! polls it, so a window minimized behind the host's back still gets hidden
//! to the tray.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use strum_macros::{Display, EnumString};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TraySignal {
    /// "Show" picked from the tray menu or icon clicked.
    Show,
    /// "Quit" picked from the tray menu.
    Quit,
    Minimized,
    Restored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TrayIntent {
    Show,
    Hide,
    Quit,
}

/// Reports whether the host's main window is currently minimized.
pub trait WindowProbe: Send + Sync {
    fn is_minimized(&self) -> bool;
}

#[derive(Debug, Default)]
struct RelayState {
    hidden: bool,
}

impl RelayState {
    fn on_signal(&mut self, signal: TraySignal) -> Option<TrayIntent> {
        match signal {
            TraySignal::Show => {
                self.hidden = false;
                Some(TrayIntent::Show)
            }
            TraySignal::Quit => Some(TrayIntent::Quit),
            TraySignal::Minimized => self.hide(),
            TraySignal::Restored => {
                self.hidden = false;
                None
            }
        }
    }

    fn on_poll(&mut self, minimized: bool) -> Option<TrayIntent> {
        if minimized { self.hide() } else { None }
    }

    fn hide(&mut self) -> Option<TrayIntent> {
        if self.hidden {
            return None;
        }
        self.hidden = true;
        Some(TrayIntent::Hide)
    }
}

pub struct TrayRelay {
    signals: UnboundedSender<TraySignal>,
    intents: Mutex<UnboundedReceiver<TrayIntent>>,
    task: JoinHandle<()>,
}

impl TrayRelay {
    pub fn spawn(runtime: &Handle, probe: Option<Arc<dyn WindowProbe>>, poll_every: Duration) -> Self {
        let (signals, mut signal_rx) = mpsc::unbounded_channel();
        let (intent_tx, intents) = mpsc::unbounded_channel();

        let task = runtime.spawn(async move {
            let mut state = RelayState::default();
            let mut ticker = interval(poll_every.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(polling = probe.is_some(), "tray relay started");

            loop {
                let intent = tokio::select! {
                    signal = signal_rx.recv() => match signal {
                        Some(signal) => {
                            debug!(%signal, "tray signal");
                            state.on_signal(signal)
                        }
                        None => break,
                    },
                    _ = ticker.tick(), if probe.is_some() => {
                        let minimized = probe.as_ref().is_some_and(|p| p.is_minimized());
                        state.on_poll(minimized)
                    }
                };
                if let Some(intent) = intent {
                    debug!(%intent, "tray intent");
                    if intent_tx.send(intent).is_err() {
                        break;
                    }
                    if intent == TrayIntent::Quit {
                        break;
                    }
                }
            }
            info!("tray relay stopped");
        });

        Self {
            signals,
            intents: Mutex::new(intents),
            task,
        }
    }

    pub fn signal(&self, signal: TraySignal) {
        if self.signals.send(signal).is_err() {
            warn!(%signal, "tray relay is no longer running");
        }
    }

    /// Next pending intent, without waiting.
    pub fn next_intent(&self) -> Option<TrayIntent> {
        let mut intents = self.intents.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match intents.try_recv() {
            Ok(intent) => Some(intent),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for TrayRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}
