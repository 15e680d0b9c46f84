use super::CallResult;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{
    self, Receiver, Sender, UnboundedReceiver, UnboundedSender, error::TryRecvError,
    error::TrySendError,
};

/// How completed call results are buffered on their way to the aggregator. Lifecycle callbacks
/// never wait on the aggregator in either mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResultsBuffer {
    /// Results queue up without limit until the aggregator reads them
    #[default]
    Unbounded,
    /// At most this many results are buffered. Results completed while the buffer is full are
    /// dropped and counted. A size of 0 is treated as 1.
    Bounded(usize),
}

pub(super) struct ResultSender {
    tx: ResultTx,
    dropped: AtomicU64,
}

enum ResultTx {
    Unbounded(UnboundedSender<CallResult>),
    Bounded(Sender<CallResult>),
}

impl ResultSender {
    pub(super) fn channel(buffer: ResultsBuffer) -> (Self, CallResults) {
        let (tx, rx) = match buffer {
            ResultsBuffer::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                (ResultTx::Unbounded(tx), ResultRx::Unbounded(rx))
            }
            ResultsBuffer::Bounded(size) => {
                let (tx, rx) = mpsc::channel(size.max(1));
                (ResultTx::Bounded(tx), ResultRx::Bounded(rx))
            }
        };
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            CallResults { rx },
        )
    }

    pub(super) fn send(&self, result: CallResult) {
        let token = result.token;
        match &self.tx {
            ResultTx::Unbounded(tx) => {
                if tx.send(result).is_err() {
                    debug!(%token, "Results receiver is gone, discarding call result");
                }
            }
            ResultTx::Bounded(tx) => match tx.try_send(result) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(%token, dropped, "Results buffer is full, dropping call result");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%token, "Results receiver is gone, discarding call result");
                }
            },
        }
    }

    pub(super) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Stream of completed call results, one per call
pub struct CallResults {
    rx: ResultRx,
}

enum ResultRx {
    Unbounded(UnboundedReceiver<CallResult>),
    Bounded(Receiver<CallResult>),
}

impl CallResults {
    /// Wait for the next result. Returns `None` once the handler is dropped and every buffered
    /// result has been read.
    pub async fn recv(&mut self) -> Option<CallResult> {
        match &mut self.rx {
            ResultRx::Unbounded(rx) => rx.recv().await,
            ResultRx::Bounded(rx) => rx.recv().await,
        }
    }

    /// Take the next result if one is ready
    pub fn try_recv(&mut self) -> Option<CallResult> {
        let res = match &mut self.rx {
            ResultRx::Unbounded(rx) => rx.try_recv(),
            ResultRx::Bounded(rx) => rx.try_recv(),
        };
        match res {
            Ok(r) => Some(r),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Read every result that is ready right now
    pub fn drain_ready(&mut self) -> Vec<CallResult> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
