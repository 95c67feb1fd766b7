use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Messages delivered to a running server out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Stop,
}

/// Wakes a server blocked inside its transport.
pub(crate) trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

type InterruptSlot = Arc<Mutex<Option<Arc<dyn Interrupt>>>>;

/// Requests an immediate stop of a server, even while it is blocked waiting for a request.
///
/// The stop is queued on the server's control channel first and the transport is interrupted
/// second, so the server observes the message whichever side of its blocking wait it is on.
#[derive(Clone)]
pub struct StopHandle {
    control: Sender<Control>,
    interrupt: InterruptSlot,
}

impl StopHandle {
    pub(crate) fn new(control: Sender<Control>, interrupt: InterruptSlot) -> Self {
        Self { control, interrupt }
    }

    pub fn stop(&self) {
        // The receiver only goes away once the server is gone, which is the requested outcome.
        let _ = self.control.send(Control::Stop);
        let slot = self
            .interrupt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(interrupt) = slot.as_ref() {
            interrupt.interrupt();
        }
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle").finish_non_exhaustive()
    }
}

/// Server side of the control channel. Latches once a stop was received.
pub(crate) struct StopSignal {
    control: Receiver<Control>,
    stopped: bool,
}

impl StopSignal {
    pub(crate) fn new(control: Receiver<Control>) -> Self {
        Self {
            control,
            stopped: false,
        }
    }

    pub(crate) fn is_set(&mut self) -> bool {
        if !self.stopped {
            match self.control.try_recv() {
                Ok(Control::Stop) => self.stopped = true,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
            }
        }
        self.stopped
    }

    /// Block for up to `timeout` waiting for a stop.
    pub(crate) fn wait(&mut self, timeout: Duration) -> bool {
        if !self.stopped {
            match self.control.recv_timeout(timeout) {
                Ok(Control::Stop) => self.stopped = true,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(timeout),
            }
        }
        self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    struct Counter(AtomicUsize);

    impl Interrupt for Counter {
        fn interrupt(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn stop_queues_message_and_interrupts() {
        let (tx, rx) = mpsc::channel();
        let slot: InterruptSlot = Arc::new(Mutex::new(None));
        let handle = StopHandle::new(tx, Arc::clone(&slot));
        let mut signal = StopSignal::new(rx);
        assert!(!signal.is_set());

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        *slot.lock().unwrap() = Some(counter.clone() as Arc<dyn Interrupt>);

        handle.clone().stop();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(signal.is_set());
        // Latched.
        assert!(signal.is_set());
        assert!(signal.wait(Duration::from_millis(1)));
    }

    #[test]
    fn stop_before_transport_exists_is_still_observed() {
        let (tx, rx) = mpsc::channel();
        let handle = StopHandle::new(tx, Arc::new(Mutex::new(None)));
        handle.stop();
        let mut signal = StopSignal::new(rx);
        assert!(signal.wait(Duration::from_millis(1)));
    }
}
