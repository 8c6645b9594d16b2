// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stream duplexer.
//!
//! [`tee`] splits one body stream into the *wire* side, which is polled by
//! whoever actually forwards the body, and a *tap* side for logging.  Every
//! chunk is passed through on the wire side untouched; a `Bytes` clone is
//! queued for the tap.
//!
//! The queue between the two is bounded in **bytes**: each queued chunk
//! holds semaphore permits until the tap side takes it.  When the budget is
//! exhausted the tap is cut off and the wire side carries on at full speed,
//! so a slow or stuck logging sink can never stall proxied traffic.


use bytes::Bytes;
use futures_util::Stream;
use futures_util::stream::StreamExt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};

use crate::decode::ByteStream;

/// Default tap budget, 4 MiB.
pub const DEFAULT_TAP_CAPACITY: usize = 4 * 1024 * 1024;

enum TapItem {
    Chunk(Bytes, OwnedSemaphorePermit),
    Failed(io::Error),
    Overflowed { captured: u64 },
}

struct TapSender {
    tx: mpsc::UnboundedSender<TapItem>,
    budget: Arc<Semaphore>,
    capacity: usize,
    captured: u64,
}

/// What happened to the tap after offering it a chunk.
enum Offer {
    Queued,
    Closed,
}

impl TapSender {
    fn offer(&mut self, chunk: &Bytes) -> Offer {
        if chunk.is_empty() {
            return Offer::Queued;
        }
        if self.tx.is_closed() {
            return Offer::Closed;
        }

        let permits = u32::try_from(chunk.len().min(self.capacity)).unwrap_or(u32::MAX);
        let Ok(permit) = self.budget.clone().try_acquire_many_owned(permits) else {
            log::debug!(
                "Log tap over budget after {} bytes; cutting capture",
                self.captured
            );
            let _ = self.tx.send(TapItem::Overflowed {
                captured: self.captured,
            });
            return Offer::Closed;
        };

        if self.tx.send(TapItem::Chunk(chunk.clone(), permit)).is_err() {
            return Offer::Closed;
        }
        self.captured += chunk.len() as u64;
        Offer::Queued
    }
}

/// Wire side of a tee. Yields the original stream unchanged.
pub struct Tee {
    inner: ByteStream,
    tap: Option<TapSender>,
    finished: bool,
}

/// Tap side of a tee.
///
/// Ends normally when the wire side reaches its end or is dropped, and with
/// an error if the source failed or the budget ran out.
pub struct TapStream {
    rx: mpsc::UnboundedReceiver<TapItem>,
}

/// Split `stream` into a wire side and a tap side with `capacity` bytes of
/// buffering between them.
pub fn tee(stream: ByteStream, capacity: usize) -> (Tee, TapStream) {
    let capacity = capacity.clamp(1, u32::MAX as usize);
    let (tx, rx) = mpsc::unbounded_channel();

    let tap = TapSender {
        tx,
        budget: Arc::new(Semaphore::new(capacity)),
        capacity,
        captured: 0,
    };

    (
        Tee {
            inner: stream,
            tap: Some(tap),
            finished: false,
        },
        TapStream { rx },
    )
}

impl Tee {
    /// Box the wire side for handing to an HTTP body.
    pub fn boxed(self) -> ByteStream {
        StreamExt::boxed(self)
    }

    fn close_tap_with(&mut self, item: TapItem) {
        if let Some(tap) = self.tap.take() {
            let _ = tap.tx.send(item);
        }
    }
}

impl Stream for Tee {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let item = ready!(this.inner.poll_next_unpin(cx));

        match &item {
            Some(Ok(chunk)) => {
                if let Some(tap) = this.tap.as_mut() {
                    if let Offer::Closed = tap.offer(chunk) {
                        this.tap = None;
                    }
                }
            }
            Some(Err(e)) => {
                this.close_tap_with(TapItem::Failed(io::Error::new(e.kind(), e.to_string())));
            }
            None => {
                this.finished = true;
                this.tap = None;
            }
        }

        Poll::Ready(item)
    }
}

impl Drop for Tee {
    fn drop(&mut self) {
        if !self.finished && self.tap.is_some() {
            log::debug!("Body dropped before end of stream; closing log tap");
        }
    }
}

impl Stream for TapStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = match ready!(self.rx.poll_recv(cx)) {
            // the permit is released here, returning budget to the wire side
            Some(TapItem::Chunk(chunk, _permit)) => Some(Ok(chunk)),
            Some(TapItem::Failed(e)) => Some(Err(e)),
            Some(TapItem::Overflowed { captured }) => Some(Err(io::Error::other(format!(
                "log tap overflowed after {captured} bytes; remainder of body not captured"
            )))),
            None => None,
        };
        Poll::Ready(item)
    }
}
