// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Overlap engine: read-after-write and write-after-write consistency.
//!
//! A new read or write is compared against every queued write, newest
//! first, and classified by how its byte range relates to the queued
//! one: contained, overlapping at either end, containing, or disjoint.
//! Ranges that merely touch (`end == req.offset` or `offset == req_end`)
//! do not overlap; the comparison is strictly exclusive.
//!
//! The engine works on [`Span`]s, residual subranges of the caller's
//! request, kept on an explicit work list. When a queued write sits
//! strictly inside a span, the span is split and the tail half continues
//! the walk from the same position instead of recursing. A span that
//! survives a whole walk is handed to the next pass (for reads: pending,
//! then in-flight, then the backend; for writes: the residue becomes a
//! real queued request).
//!
//! Whenever a span intersects a queued write, the issuing context is
//! pulled forward to that write's section, so a later write from the
//! same producer cannot land in an earlier section than data it depends
//! on.

use slab::Slab;

use crate::{
    backend::AioToken,
    context::Context,
    request::{Request, RequestKind},
};

/// A residual subrange of a caller request.
///
/// `offset` positions the span on the backend; `start` positions it in
/// the caller's buffer. `from` is the walk position: the number of
/// requests (counted from the oldest end of the list) this span still
/// has to examine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub(crate) offset: u64,
    pub(crate) start:  usize,
    pub(crate) len:    usize,
    from:              usize,
}

impl Span {
    pub(crate) const fn new(offset: u64, start: usize, len: usize) -> Self {
        Self {
            offset,
            start,
            len,
            from: 0,
        }
    }

    const fn end(&self) -> u64 { self.offset + self.len as u64 }
}

fn write_range(req: &Request) -> Option<(u64, u64)> {
    match &req.kind {
        RequestKind::Write { offset, buf } => Some((*offset, *offset + buf.len() as u64)),
        RequestKind::Barrier => None,
    }
}

/// Satisfy read spans from queued writes in `ids`, walking newest first.
///
/// Returns the spans no write in this list could serve; `buf` is the
/// caller's full read buffer.
pub(crate) fn read_pass(
    arena: &Slab<Request>,
    ids: &[AioToken],
    ctx: &mut Context,
    buf: &mut [u8],
    spans: Vec<Span>,
) -> Vec<Span> {
    let mut work: Vec<Span> = spans
        .into_iter()
        .map(|mut span| {
            span.from = ids.len();
            span
        })
        .collect();
    let mut residual = Vec::new();

    'spans: while let Some(mut span) = work.pop() {
        let mut i = span.from;
        while i > 0 {
            i -= 1;
            let req = &arena[ids[i].0];
            let Some((r_off, r_end)) = write_range(req) else {
                continue;
            };
            if !(span.end() > r_off && span.offset < r_end) {
                continue;
            }

            // The read observes this write, so the producer's next write
            // depends on it.
            ctx.depend_on(req.section);

            let RequestKind::Write { buf: r_buf, .. } = &req.kind else {
                unreachable!()
            };

            if span.offset >= r_off && span.end() <= r_end {
                // Completely contained in the queued write.
                let src = &r_buf[(span.offset - r_off) as usize..]
                    [..span.len];
                buf[span.start..span.start + span.len].copy_from_slice(src);
                continue 'spans;
            } else if span.offset < r_off && span.end() <= r_end {
                // Overlap at the end of the span; keep the prefix.
                let n = (span.end() - r_off) as usize;
                let at = span.start + (r_off - span.offset) as usize;
                buf[at..at + n].copy_from_slice(&r_buf[..n]);
                span.len -= n;
            } else if span.offset >= r_off {
                // Overlap at the start of the span; advance past it.
                let n = (r_end - span.offset) as usize;
                let src = &r_buf[(span.offset - r_off) as usize..][..n];
                buf[span.start..span.start + n].copy_from_slice(src);
                span.offset = r_end;
                span.start += n;
                span.len -= n;
            } else {
                // Queued write strictly inside the span: copy the middle,
                // queue the tail for the remaining (older) requests, keep
                // walking with the head.
                let mid = (r_off - span.offset) as usize;
                buf[span.start + mid..span.start + mid + r_buf.len()].copy_from_slice(r_buf);
                work.push(Span {
                    offset: r_end,
                    start:  span.start + mid + r_buf.len(),
                    len:    (span.end() - r_end) as usize,
                    from:   i,
                });
                span.len = mid;
            }
        }
        residual.push(Span::new(span.offset, span.start, span.len));
    }

    residual
}

/// Merge an incoming write into overlapping queued writes, in place.
///
/// Only requests at the context's current section or later may absorb
/// new data; merging into an earlier section would hoist bytes across a
/// barrier. The filter is read live, so once a span has merged into a
/// request the walk cannot fall back into an older section.
///
/// Returns the spans of `data` no queued write absorbed; the caller
/// inserts each as a fresh request.
pub(crate) fn write_merge_pass(
    arena: &mut Slab<Request>,
    ids: &[AioToken],
    ctx: &mut Context,
    data: &[u8],
    spans: Vec<Span>,
) -> Vec<Span> {
    let mut work: Vec<Span> = spans
        .into_iter()
        .map(|mut span| {
            span.from = ids.len();
            span
        })
        .collect();
    let mut residual = Vec::new();

    'spans: while let Some(mut span) = work.pop() {
        let mut i = span.from;
        while i > 0 {
            i -= 1;
            let req = &mut arena[ids[i].0];
            if req.section < ctx.section {
                continue;
            }
            let Some((r_off, r_end)) = write_range(req) else {
                continue;
            };
            if !(span.end() > r_off && span.offset < r_end) {
                continue;
            }

            ctx.depend_on(req.section);

            let RequestKind::Write { buf: r_buf, .. } = &mut req.kind else {
                unreachable!()
            };

            if span.offset >= r_off && span.end() <= r_end {
                let dst = &mut r_buf[(span.offset - r_off) as usize..]
                    [..span.len];
                dst.copy_from_slice(&data[span.start..span.start + span.len]);
                continue 'spans;
            } else if span.offset < r_off && span.end() <= r_end {
                let n = (span.end() - r_off) as usize;
                let at = span.start + (r_off - span.offset) as usize;
                r_buf[..n].copy_from_slice(&data[at..at + n]);
                span.len -= n;
            } else if span.offset >= r_off {
                let n = (r_end - span.offset) as usize;
                let dst = &mut r_buf[(span.offset - r_off) as usize..][..n];
                dst.copy_from_slice(&data[span.start..span.start + n]);
                span.offset = r_end;
                span.start += n;
                span.len -= n;
            } else {
                let mid = (r_off - span.offset) as usize;
                let r_len = r_buf.len();
                r_buf.copy_from_slice(&data[span.start + mid..span.start + mid + r_len]);
                work.push(Span {
                    offset: r_end,
                    start:  span.start + mid + r_len,
                    len:    (span.end() - r_end) as usize,
                    from:   i,
                });
                span.len = mid;
            }
        }
        residual.push(Span::new(span.offset, span.start, span.len));
    }

    residual
}

/// Raise the context past every write in `ids` the range intersects.
///
/// Used for the in-flight pass of the write path: a submitted buffer is
/// owned by the backend operation and is never patched, but a new write
/// that touches its range still depends on it.
pub(crate) fn depend_pass(
    arena: &Slab<Request>,
    ids: &[AioToken],
    ctx: &mut Context,
    offset: u64,
    len: usize,
) {
    let end = offset + len as u64;
    for token in ids.iter().rev() {
        let req = &arena[token.0];
        if let Some((r_off, r_end)) = write_range(req)
            && end > r_off
            && offset < r_end
        {
            ctx.depend_on(req.section);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use test_case::test_case;

    use super::*;

    fn queue_write(arena: &mut Slab<Request>, offset: u64, data: &[u8], section: u64) -> AioToken {
        let buf = BytesMut::from(data);
        AioToken(arena.insert(Request::write(offset, buf, section)))
    }

    fn run_read(
        arena: &Slab<Request>,
        ids: &[AioToken],
        offset: u64,
        len: usize,
    ) -> (Vec<u8>, Vec<Span>, Context) {
        let mut ctx = Context::new();
        let mut buf = vec![0u8; len];
        let residual = read_pass(
            arena,
            ids,
            &mut ctx,
            &mut buf,
            vec![Span::new(offset, 0, len)],
        );
        (buf, residual, ctx)
    }

    #[test]
    fn test_read_contained_in_write() {
        let mut arena = Slab::new();
        let ids = vec![queue_write(&mut arena, 5, &[0x12; 5], 0)];

        let (buf, residual, _) = run_read(&arena, &ids, 6, 3);
        assert_eq!(buf, vec![0x12; 3]);
        assert!(residual.is_empty());
    }

    #[test]
    fn test_read_overlap_at_end() {
        let mut arena = Slab::new();
        let ids = vec![queue_write(&mut arena, 5, &[0x12; 5], 0)];

        // Read [0, 8): bytes 5..8 come from the write, 0..5 are residual.
        let (buf, residual, _) = run_read(&arena, &ids, 0, 8);
        assert_eq!(&buf[5..8], &[0x12; 3]);
        assert_eq!(residual, vec![Span::new(0, 0, 5)]);
    }

    #[test]
    fn test_read_overlap_at_start() {
        let mut arena = Slab::new();
        let ids = vec![queue_write(&mut arena, 5, &[0x12; 5], 0)];

        // Read [7, 15): bytes 7..10 come from the write, 10..15 residual.
        let (buf, residual, _) = run_read(&arena, &ids, 7, 8);
        assert_eq!(&buf[..3], &[0x12; 3]);
        assert_eq!(residual, vec![Span::new(10, 3, 5)]);
    }

    #[test]
    fn test_read_write_inside_read_splits() {
        let mut arena = Slab::new();
        let ids = vec![queue_write(&mut arena, 5, &[0x12; 5], 0)];

        // Read [0, 32): the write splits it into [0,5) and [10,32).
        let (buf, mut residual, _) = run_read(&arena, &ids, 0, 32);
        assert_eq!(&buf[5..10], &[0x12; 5]);
        residual.sort_by_key(|s| s.offset);
        assert_eq!(
            residual,
            vec![Span::new(0, 0, 5), Span::new(10, 10, 22)]
        );
    }

    #[test]
    fn test_read_newest_write_wins() {
        let mut arena = Slab::new();
        let ids = vec![
            queue_write(&mut arena, 0, &[0x11; 8], 0),
            queue_write(&mut arena, 2, &[0x22; 4], 0),
        ];

        let (buf, residual, _) = run_read(&arena, &ids, 0, 8);
        assert!(residual.is_empty());
        assert_eq!(buf, vec![0x11, 0x11, 0x22, 0x22, 0x22, 0x22, 0x11, 0x11]);
    }

    #[test]
    fn test_read_split_tail_served_by_older_write() {
        let mut arena = Slab::new();
        // Oldest covers the whole range, newest only the middle.
        let ids = vec![
            queue_write(&mut arena, 0, &[0x11; 16], 0),
            queue_write(&mut arena, 4, &[0x22; 4], 0),
        ];

        let (buf, residual, _) = run_read(&arena, &ids, 0, 16);
        assert!(residual.is_empty());
        assert_eq!(&buf[..4], &[0x11; 4]);
        assert_eq!(&buf[4..8], &[0x22; 4]);
        assert_eq!(&buf[8..], &[0x11; 8]);
    }

    // Touching ranges are not overlap: the boundary is strictly
    // exclusive on both sides.
    #[test_case(0, 5 ; "ends where the write starts")]
    #[test_case(10, 5 ; "starts where the write ends")]
    fn test_read_touching_is_not_overlap(offset: u64, len: usize) {
        let mut arena = Slab::new();
        let ids = vec![queue_write(&mut arena, 5, &[0x12; 5], 3)];

        let (_, residual, ctx) = run_read(&arena, &ids, offset, len);
        assert_eq!(residual, vec![Span::new(offset, 0, len)]);
        // No overlap, no dependency.
        assert_eq!(ctx.section(), 0);
    }

    #[test]
    fn test_read_raises_section_on_any_overlap() {
        let mut arena = Slab::new();
        let ids = vec![
            queue_write(&mut arena, 0, &[0x11; 4], 1),
            queue_write(&mut arena, 8, &[0x22; 4], 2),
        ];

        let (_, _, ctx) = run_read(&arena, &ids, 0, 12);
        assert_eq!(ctx.section(), 2);
    }

    #[test]
    fn test_write_merge_contained_overwrites_in_place() {
        let mut arena = Slab::new();
        let ids = vec![queue_write(&mut arena, 0, &[0x11; 8], 0)];
        let mut ctx = Context::new();

        let data = [0x22; 4];
        let residual = write_merge_pass(
            &mut arena,
            &ids,
            &mut ctx,
            &data,
            vec![Span::new(2, 0, 4)],
        );
        assert!(residual.is_empty());

        let RequestKind::Write { buf, .. } = &arena[ids[0].0].kind else {
            unreachable!()
        };
        assert_eq!(&buf[..], &[0x11, 0x11, 0x22, 0x22, 0x22, 0x22, 0x11, 0x11]);
    }

    #[test]
    fn test_write_merge_respects_section_filter() {
        let mut arena = Slab::new();
        let ids = vec![queue_write(&mut arena, 0, &[0x11; 8], 0)];
        let mut ctx = Context::new();
        ctx.depend_on(1);

        let data = [0x22; 8];
        let residual = write_merge_pass(
            &mut arena,
            &ids,
            &mut ctx,
            &data,
            vec![Span::new(0, 0, 8)],
        );

        // The queued write sits in an earlier section; nothing merges.
        assert_eq!(residual, vec![Span::new(0, 0, 8)]);
        let RequestKind::Write { buf, .. } = &arena[ids[0].0].kind else {
            unreachable!()
        };
        assert_eq!(&buf[..], &[0x11; 8]);
    }

    #[test]
    fn test_write_merge_partial_leaves_residue() {
        let mut arena = Slab::new();
        let ids = vec![queue_write(&mut arena, 5, &[0x11; 5], 0)];
        let mut ctx = Context::new();

        // Incoming [0, 10): bytes 5..10 merge, 0..5 are a new request.
        let data = [0x22; 10];
        let residual = write_merge_pass(
            &mut arena,
            &ids,
            &mut ctx,
            &data,
            vec![Span::new(0, 0, 10)],
        );
        assert_eq!(residual, vec![Span::new(0, 0, 5)]);

        let RequestKind::Write { buf, .. } = &arena[ids[0].0].kind else {
            unreachable!()
        };
        assert_eq!(&buf[..], &[0x22; 5]);
    }

    #[test]
    fn test_write_merge_container_splits() {
        let mut arena = Slab::new();
        let ids = vec![queue_write(&mut arena, 4, &[0x11; 4], 2)];
        let mut ctx = Context::new();

        // Incoming [0, 12) swallows the queued write whole.
        let data = [0x22; 12];
        let mut residual = write_merge_pass(
            &mut arena,
            &ids,
            &mut ctx,
            &data,
            vec![Span::new(0, 0, 12)],
        );
        residual.sort_by_key(|s| s.offset);
        assert_eq!(residual, vec![Span::new(0, 0, 4), Span::new(8, 8, 4)]);
        assert_eq!(ctx.section(), 2);

        let RequestKind::Write { buf, .. } = &arena[ids[0].0].kind else {
            unreachable!()
        };
        assert_eq!(&buf[..], &[0x22; 4]);
    }

    #[test]
    fn test_depend_pass_raises_on_overlap_only() {
        let mut arena = Slab::new();
        let ids = vec![
            queue_write(&mut arena, 0, &[0x11; 4], 2),
            queue_write(&mut arena, 16, &[0x22; 4], 3),
        ];
        let mut ctx = Context::new();

        depend_pass(&arena, &ids, &mut ctx, 2, 4);
        assert_eq!(ctx.section(), 2);

        depend_pass(&arena, &ids, &mut ctx, 4, 12);
        // Touches both ends without overlapping either write.
        assert_eq!(ctx.section(), 2);
    }
}
