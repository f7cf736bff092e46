//! Resolve-once result cells connecting a chunk task to whoever consumes its results.

use tokio::sync::oneshot;

use crate::error::ScannerError;
use crate::primitives::BlockIndex;

type Outcome<T> = Result<T, ScannerError>;

/// Create a connected resolver/deferred pair for the chunk starting at `start_index`.
pub fn deferred<T>(start_index: BlockIndex) -> (Resolver<T>, Deferred<T>) {
    let (sender, receiver) = oneshot::channel();

    (
        Resolver { sender },
        Deferred {
            start_index,
            state: State::Pending(receiver),
        },
    )
}

/// Producer half. Resolving consumes it, so a cell resolves at most once.
#[derive(Debug)]
pub struct Resolver<T> {
    sender: oneshot::Sender<Outcome<T>>,
}

impl<T> Resolver<T> {
    pub fn resolve(self, outcome: Outcome<T>) {
        // the consumer may have been dropped by a drain, that's fine
        let _ = self.sender.send(outcome);
    }
}

#[derive(Debug)]
enum State<T> {
    Pending(oneshot::Receiver<Outcome<T>>),
    Resolved(Outcome<T>),
}

/// Consumer half of a result that is pending, resolved or failed.
///
/// A resolver dropped without resolving surfaces as [`ScannerError::Abandoned`].
#[derive(Debug)]
pub struct Deferred<T> {
    start_index: BlockIndex,
    state: State<T>,
}

impl<T> Deferred<T> {
    pub fn start_index(&self) -> BlockIndex {
        self.start_index
    }

    /// Whether the result is available without waiting.
    pub fn is_resolved(&mut self) -> bool {
        let State::Pending(receiver) = &mut self.state else {
            return true;
        };

        let outcome = match receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return false,
            Err(oneshot::error::TryRecvError::Closed) => Err(ScannerError::Abandoned {
                start_index: self.start_index,
            }),
        };

        self.state = State::Resolved(outcome);
        true
    }

    pub async fn wait(self) -> Outcome<T> {
        match self.state {
            State::Resolved(outcome) => outcome,
            State::Pending(receiver) => receiver.await.unwrap_or(Err(ScannerError::Abandoned {
                start_index: self.start_index,
            })),
        }
    }
}
