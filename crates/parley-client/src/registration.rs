use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

/// How long to wait for the server's register acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(8000);

/// Who asked for this registration attempt. Manual attempts surface
/// rejections to the user; automatic ones (post-reconnect replays) are
/// logged and suppressed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Manual,
    Automatic,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("display name must not be empty")]
    EmptyName,

    #[error("a registration attempt is already in flight")]
    AlreadyInFlight,

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("no acknowledgment within {}ms", .0.as_millis())]
    TimedOut(Duration),

    #[error("connection closed before acknowledgment")]
    ChannelClosed,
}

/// Outcome of the server's ack, as delivered by the event pump.
type AckOutcome = Result<(), String>;

/// Owns the register ack/timeout race.
///
/// At most one attempt may be outstanding; a concurrent second call is
/// rejected, not queued. The pending slot is a single-assignment outcome
/// cell: whichever of {ack, timeout} fires first takes the slot and
/// commits the result, and the loser finds it empty and is ignored.
pub struct Registrar {
    timeout: Duration,
    pending: Mutex<Option<oneshot::Sender<AckOutcome>>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_ACK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Mutex::new(None),
        }
    }

    /// Run one registration attempt: send the command via `send`, then wait
    /// for the ack or the timeout, whichever comes first.
    ///
    /// The caller trims the name before display; this validates the trimmed
    /// form. Returns the (trimmed) name on success so the caller can cache
    /// it for automatic re-registration.
    pub async fn register<E>(
        &self,
        username: &str,
        send: impl FnOnce(&str) -> Result<(), E>,
    ) -> Result<String, RegistrationError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(RegistrationError::EmptyName);
        }

        let rx = {
            let mut pending = self.pending.lock().expect("registrar lock poisoned");
            if pending.is_some() {
                return Err(RegistrationError::AlreadyInFlight);
            }
            let (tx, rx) = oneshot::channel();
            *pending = Some(tx);
            rx
        };

        if send(username).is_err() {
            // Never left the client; free the slot for a retry.
            self.take_pending();
            return Err(RegistrationError::ChannelClosed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            // Ack won the race.
            Ok(Ok(Ok(()))) => Ok(username.to_string()),
            Ok(Ok(Err(error))) => Err(RegistrationError::Rejected(error)),
            // Sender dropped without an ack: transport went away.
            Ok(Err(_)) => Err(RegistrationError::ChannelClosed),
            // Timeout won; drop the slot so a late ack is ignored.
            Err(_) => {
                self.take_pending();
                Err(RegistrationError::TimedOut(self.timeout))
            }
        }
    }

    /// Deliver the server's ack. Called from the event pump. An ack with no
    /// attempt outstanding (late after timeout, or duplicate) is dropped.
    pub fn deliver_ack(&self, ok: bool, error: Option<String>) {
        match self.take_pending() {
            Some(tx) => {
                let outcome = if ok {
                    Ok(())
                } else {
                    Err(error.unwrap_or_else(|| "registration rejected".to_string()))
                };
                // Receiver gone means the timeout already resolved the race.
                let _ = tx.send(outcome);
            }
            None => debug!("register ack with no attempt outstanding, ignoring"),
        }
    }

    /// Resolve any outstanding attempt as transport loss. Called when the
    /// connection drops so the waiter is not left running out its timer.
    pub fn abort_pending(&self) {
        // Dropping the sender surfaces ChannelClosed at the waiter.
        drop(self.take_pending());
    }

    /// True while an attempt is awaiting its ack.
    pub fn in_flight(&self) -> bool {
        self.pending.lock().expect("registrar lock poisoned").is_some()
    }

    fn take_pending(&self) -> Option<oneshot::Sender<AckOutcome>> {
        self.pending.lock().expect("registrar lock poisoned").take()
    }
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}
