//! Replayable request bodies
//!
//! An inbound body can be read once. `ReplayBody` hands each upstream attempt
//! its own copy by forking the unread remainder with a lazy tee: one branch
//! goes to the attempt, the other is kept for the next attempt. The number of
//! forks is fixed up front; the last attempt gets the kept branch itself.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Wake, Waker};

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};

/// Errors surfaced while replaying a request body.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplayError {
    /// Reading the inbound body failed.
    #[error("request body read failed: {0}")]
    Source(String),

    /// `next()` was called after the remainder had already been handed out.
    #[error("request body replay budget exhausted")]
    Exhausted,
}

type SourceStream = Pin<Box<dyn Stream<Item = Result<Bytes, ReplayError>> + Send>>;

/// Body for one upstream attempt.
pub enum AttemptBody {
    Empty,
    Stream(AttemptStream),
}

impl AttemptBody {
    pub fn into_reqwest(self) -> Option<reqwest::Body> {
        match self {
            AttemptBody::Empty => None,
            AttemptBody::Stream(stream) => Some(reqwest::Body::wrap_stream(stream)),
        }
    }
}

/// Byte stream of one attempt: either a tee branch or the unforked source.
pub struct AttemptStream(Inner);

enum Inner {
    // Mutex only to make the stream `Sync`; polling goes through `get_mut`.
    Unforked(Mutex<SourceStream>),
    Branch(Branch),
}

impl Stream for AttemptStream {
    type Item = Result<Bytes, ReplayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().0 {
            Inner::Unforked(source) => source
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .as_mut()
                .poll_next(cx),
            Inner::Branch(branch) => branch.poll_branch(cx),
        }
    }
}

/// Replay budget over a single-consumption body.
pub struct ReplayBody {
    remaining: Option<AttemptStream>,
    forks_left: usize,
    absent: bool,
}

impl ReplayBody {
    /// `max_forks` is the number of attempts that receive a fork; the attempt
    /// after them receives the remainder. With `max_attempts` attempts use
    /// `max_attempts - 1`.
    pub fn new<S>(source: Option<S>, max_forks: usize) -> Self
    where
        S: Stream<Item = Result<Bytes, ReplayError>> + Send + 'static,
    {
        match source {
            Some(source) => Self {
                remaining: Some(AttemptStream(Inner::Unforked(Mutex::new(Box::pin(source))))),
                forks_left: max_forks,
                absent: false,
            },
            None => Self {
                remaining: None,
                forks_left: max_forks,
                absent: true,
            },
        }
    }

    /// Wrap an inbound axum body. A body that is already at end of stream is
    /// treated as absent.
    pub fn from_axum(body: axum::body::Body, max_forks: usize) -> Self {
        use axum::body::HttpBody;

        if body.is_end_stream() {
            return Self::new(None::<SourceStream>, max_forks);
        }
        let source = body
            .into_data_stream()
            .map_err(|e| ReplayError::Source(e.to_string()));
        Self::new(Some(source), max_forks)
    }

    /// Body for the next attempt.
    pub fn next(&mut self) -> Result<AttemptBody, ReplayError> {
        if self.absent {
            return Ok(AttemptBody::Empty);
        }
        let remaining = self.remaining.take().ok_or(ReplayError::Exhausted)?;
        if self.forks_left == 0 {
            return Ok(AttemptBody::Stream(remaining));
        }
        self.forks_left -= 1;
        let (attempt, kept) = tee(remaining);
        self.remaining = Some(AttemptStream(Inner::Branch(kept)));
        Ok(AttemptBody::Stream(AttemptStream(Inner::Branch(attempt))))
    }

    #[cfg(test)]
    pub fn forks_left(&self) -> usize {
        self.forks_left
    }
}

struct TeeState {
    source: SourceStream,
    buffers: [VecDeque<Bytes>; 2],
    alive: [bool; 2],
    /// Error from the source, handed to each branch once.
    error: Option<ReplayError>,
    error_seen: [bool; 2],
    done: bool,
}

/// Wakes every branch that is waiting on the shared source, so whichever
/// branch polled last does not starve the other.
#[derive(Default)]
struct BranchWakers(Mutex<[Option<Waker>; 2]>);

impl Wake for BranchWakers {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let wakers = self.0.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
    }
}

struct Branch {
    state: Arc<Mutex<TeeState>>,
    wakers: Arc<BranchWakers>,
    side: usize,
}

fn tee(source: AttemptStream) -> (Branch, Branch) {
    let state = Arc::new(Mutex::new(TeeState {
        source: Box::pin(source),
        buffers: [VecDeque::new(), VecDeque::new()],
        alive: [true, true],
        error: None,
        error_seen: [false, false],
        done: false,
    }));
    let wakers = Arc::new(BranchWakers::default());
    (
        Branch {
            state: state.clone(),
            wakers: wakers.clone(),
            side: 0,
        },
        Branch {
            state,
            wakers,
            side: 1,
        },
    )
}

impl Branch {
    fn poll_branch(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, ReplayError>>> {
        let me = self.side;
        let other = 1 - me;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(chunk) = state.buffers[me].pop_front() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        if let Some(error) = &state.error {
            if !state.error_seen[me] {
                let error = error.clone();
                state.error_seen[me] = true;
                return Poll::Ready(Some(Err(error)));
            }
        }
        if state.done {
            return Poll::Ready(None);
        }

        self.wakers.0.lock().unwrap_or_else(PoisonError::into_inner)[me] =
            Some(cx.waker().clone());
        let shared = Waker::from(self.wakers.clone());
        let mut shared_cx = Context::from_waker(&shared);

        match state.source.as_mut().poll_next(&mut shared_cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if state.alive[other] {
                    state.buffers[other].push_back(chunk.clone());
                    self.wake_other();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                state.done = true;
                state.error = Some(error.clone());
                state.error_seen[me] = true;
                self.wake_other();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                state.done = true;
                self.wake_other();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn wake_other(&self) {
        let waker = self.wakers.0.lock().unwrap_or_else(PoisonError::into_inner)[1 - self.side].take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl Drop for Branch {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.alive[self.side] = false;
        state.buffers[self.side].clear();
        drop(state);
        self.wake_other();
    }
}
