//! Run/pause/abort signal between the operator and the scan task.
//!
//! One [`ControlHandle`] writes, one [`ControlReceiver`] reads; neither is
//! `Clone`. The value travels over a `tokio::sync::watch` channel, so the
//! reader always sees a whole value and is woken on every change.

use crate::error::{HoloError, HoloResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info};

/// Operator command for the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlSignal {
    /// Keep scanning.
    #[default]
    Run,
    /// Hold before the next pixel.
    Pause,
    /// Stop and release the hardware.
    Abort,
}

/// Create a connected handle/receiver pair starting at [`ControlSignal::Run`].
pub fn control_channel() -> (ControlHandle, ControlReceiver) {
    let (tx, rx) = watch::channel(ControlSignal::Run);
    (ControlHandle { tx }, ControlReceiver { rx })
}

/// Writer side, held by the supervisor.
#[derive(Debug)]
pub struct ControlHandle {
    tx: watch::Sender<ControlSignal>,
}

impl ControlHandle {
    /// Publish `signal`.
    pub fn set(&self, signal: ControlSignal) {
        info!(?signal, "control signal");
        self.tx.send_replace(signal);
    }

    /// Resume scanning.
    pub fn run(&self) {
        self.set(ControlSignal::Run);
    }

    /// Hold before the next pixel.
    pub fn pause(&self) {
        self.set(ControlSignal::Pause);
    }

    /// Abort the scan.
    pub fn abort(&self) {
        self.set(ControlSignal::Abort);
    }

    /// Last published signal.
    pub fn current(&self) -> ControlSignal {
        *self.tx.borrow()
    }
}

/// Reader side, owned by the sequencer.
#[derive(Debug)]
pub struct ControlReceiver {
    rx: watch::Receiver<ControlSignal>,
}

impl ControlReceiver {
    /// Latest signal. Never blocks.
    pub fn current(&self) -> ControlSignal {
        *self.rx.borrow()
    }

    /// Fail with [`HoloError::UserAborted`] if an abort has been published.
    pub fn check_abort(&self) -> HoloResult<()> {
        match self.current() {
            ControlSignal::Abort => Err(HoloError::UserAborted),
            _ => Ok(()),
        }
    }

    /// Resolve once an abort is published. Never resolves if the writer is gone.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() == ControlSignal::Abort {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Hold while paused, re-checking at least every `repoll`.
    ///
    /// Returns once the signal is `Run`. An abort, or the writer going away
    /// while paused, ends the wait with [`HoloError::UserAborted`].
    pub async fn wait_while_paused(&mut self, repoll: Duration) -> HoloResult<()> {
        loop {
            let signal = *self.rx.borrow_and_update();
            match signal {
                ControlSignal::Run => return Ok(()),
                ControlSignal::Abort => return Err(HoloError::UserAborted),
                ControlSignal::Pause => match timeout(repoll, self.rx.changed()).await {
                    Ok(Ok(())) | Err(_) => {}
                    Ok(Err(_)) => {
                        debug!("control writer dropped while paused");
                        return Err(HoloError::UserAborted);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pause_then_run_resumes() {
        let (handle, mut receiver) = control_channel();
        handle.pause();

        let waiter = tokio::spawn(async move {
            receiver.wait_while_paused(Duration::from_secs(1)).await
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        handle.run();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_paused() {
        let (handle, mut receiver) = control_channel();
        handle.pause();
        let waiter = tokio::spawn(async move {
            receiver.wait_while_paused(Duration::from_secs(1)).await
        });
        handle.abort();
        assert!(matches!(waiter.await.unwrap(), Err(HoloError::UserAborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_writer_while_paused_aborts() {
        let (handle, mut receiver) = control_channel();
        handle.pause();
        drop(handle);
        assert!(receiver
            .wait_while_paused(Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_resolves_on_abort() {
        let (handle, mut receiver) = control_channel();
        let waiter = tokio::spawn(async move {
            receiver.aborted().await;
            receiver.current()
        });
        handle.pause();
        handle.abort();
        assert_eq!(waiter.await.unwrap(), ControlSignal::Abort);
    }

    #[test]
    fn test_check_abort() {
        let (handle, receiver) = control_channel();
        assert!(receiver.check_abort().is_ok());
        handle.abort();
        assert!(receiver.check_abort().is_err());
        assert_eq!(handle.current(), ControlSignal::Abort);
    }
}
