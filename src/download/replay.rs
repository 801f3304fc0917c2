//! Bounded peek into a body stream.
//!
//! [`peek`] reads at most `limit` bytes for inspection and returns a
//! [`Peeked`] value.  The original stream is moved into it untouched;
//! [`Peeked::into_stream`] yields the inspected bytes followed by whatever the
//! original stream still has to offer.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::storage::BodyStream;

pub struct Peeked {
    /// At most `limit` bytes from the start of the body.
    pub prefix: Bytes,
    /// Whether the body ended within the limit, the limit itself included
    /// (`prefix` is the whole body).
    pub complete: bool,
    /// Bytes of the chunk that straddled the limit, not part of `prefix`.
    overflow: Option<Bytes>,
    rest: BodyStream,
}

impl Peeked {
    /// Replay the full body: `prefix`, then the remainder of the original
    /// stream.
    pub fn into_stream(self) -> BodyStream {
        let head = std::iter::once(self.prefix)
            .chain(self.overflow)
            .filter(|b| !b.is_empty())
            .map(Ok);
        Box::pin(futures::stream::iter(head).chain(self.rest))
    }
}

/// Read up to `limit` bytes from `body`.
pub async fn peek(mut body: BodyStream, limit: usize) -> std::io::Result<Peeked> {
    let mut buf = BytesMut::new();
    let mut overflow = None;
    let mut complete = false;

    loop {
        if buf.len() >= limit {
            // Full to the byte: one more poll tells whether the body ends here.
            while overflow.is_none() {
                match body.next().await {
                    Some(chunk) => overflow = Some(chunk?).filter(|c| !c.is_empty()),
                    None => {
                        complete = true;
                        break;
                    }
                }
            }
            break;
        }
        match body.next().await {
            Some(chunk) => {
                let mut chunk = chunk?;
                let room = limit - buf.len();
                if chunk.len() > room {
                    overflow = Some(chunk.split_off(room));
                }
                buf.extend_from_slice(&chunk);
            }
            None => {
                complete = true;
                break;
            }
        }
    }

    Ok(Peeked {
        prefix: buf.freeze(),
        complete,
        overflow,
        rest: body,
    })
}
