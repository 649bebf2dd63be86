use std::{io, mem};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{Response, IntoResponse};
use bytes::{Bytes, BytesMut};
use http_body::{Body, SizeHint, Frame};
use futures::Stream;
use futures::future::poll_fn;
use pin_project::pin_project;
use tokio::io::ReadBuf;

use crate::RangeBody;

const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Response body stream. Implements [`Stream`], [`Body`], and [`IntoResponse`].
///
/// Emits exactly `length` bytes starting at `start`. Once the response head
/// has been sent there is nobody to report failures to, so read errors and
/// a source that ends early are logged and end the body.
#[pin_project]
pub struct RangedStream<B> {
    state: StreamState,
    length: u64,
    #[pin]
    body: B,
}

impl<B: RangeBody + Send + 'static> RangedStream<B> {
    pub(crate) fn new(body: B, start: u64, length: u64) -> Self {
        RangedStream {
            state: StreamState::Seek { start },
            length,
            body,
        }
    }
}

impl<B> std::fmt::Debug for RangedStream<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangedStream")
            .field("state", &self.state)
            .field("length", &self.length)
            .finish()
    }
}

#[derive(Debug)]
enum StreamState {
    Seek { start: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
    Done,
}

impl<B: RangeBody + Unpin> RangedStream<B> {
    /// Positions the body at the window start ahead of streaming, so a seek
    /// failure can still become an error response.
    pub async fn seek_to_start(&mut self) -> io::Result<()> {
        poll_fn(|cx| Pin::new(&mut *self).poll_seek(cx)).await
    }
}

impl<B: RangeBody> RangedStream<B> {
    fn poll_seek(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();

        if let StreamState::Seek { start } = *this.state {
            this.body.as_mut().start_seek(start)?;
            let remaining = *this.length;
            *this.state = StreamState::Seeking { remaining };
        }

        if let StreamState::Seeking { remaining } = *this.state {
            match this.body.as_mut().poll_complete(cx) {
                Poll::Pending => { return Poll::Pending; }
                Poll::Ready(Err(e)) => { return Poll::Ready(Err(e)); }
                Poll::Ready(Ok(())) => {
                    let buffer = allocate_buffer();
                    *this.state = StreamState::Reading { buffer, remaining };
                }
            }
        }

        Poll::Ready(Ok(()))
    }
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedStream<B> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<B: RangeBody> Body for RangedStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> Stream for RangedStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<Option<io::Result<Bytes>>> {
        match self.as_mut().poll_seek(cx) {
            Poll::Pending => { return Poll::Pending; }
            Poll::Ready(Err(e)) => {
                tracing::warn!(error = %e, "seek failed after response was committed");
                *self.as_mut().project().state = StreamState::Done;
                return Poll::Ready(Some(Err(e)));
            }
            Poll::Ready(Ok(())) => {}
        }

        let mut this = self.project();

        let StreamState::Reading { buffer, remaining } = &mut *this.state else {
            return Poll::Ready(None);
        };

        if *remaining == 0 {
            *this.state = StreamState::Done;
            return Poll::Ready(None);
        }

        let uninit = buffer.spare_capacity_mut();

        // calculate max number of bytes to read in this iteration, the
        // smaller of the buffer size and the number of bytes remaining
        let nbytes = std::cmp::min(
            uninit.len(),
            usize::try_from(*remaining).unwrap_or(usize::MAX),
        );

        let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

        match this.body.as_mut().poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                tracing::warn!(error = %e, remaining = *remaining, "read failed while streaming body");
                *this.state = StreamState::Done;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Ok(())) => {
                match read_buf.filled().len() {
                    0 => {
                        tracing::warn!(remaining = *remaining, "source ended before the window was complete");
                        *this.state = StreamState::Done;
                        Poll::Ready(None)
                    }
                    n => {
                        // SAFETY: poll_read has filled the buffer with `n`
                        // additional bytes. `buffer.len` should always be
                        // 0 here, but include it for rigorous correctness
                        unsafe { buffer.set_len(buffer.len() + n); }

                        // replace state buffer and take this one to return
                        let chunk = mem::replace(buffer, allocate_buffer());

                        // n <= remaining because of the cmp::min above
                        *remaining -= n as u64;

                        Poll::Ready(Some(Ok(chunk.freeze())))
                    }
                }
            }
        }
    }
}

fn allocate_buffer() -> BytesMut {
    BytesMut::with_capacity(IO_BUFFER_SIZE)
}
