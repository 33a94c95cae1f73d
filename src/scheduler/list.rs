//! Cursor over NULL-terminated intrusive singly linked lists

use crate::error::{InspectError, Result};
use crate::host::{field_addr, InspectionHost};

/// Yields node addresses in `next` order until a NULL link
///
/// A list longer than `limit` nodes yields a `TraversalLimit` error, which
/// is how a cycle in a corrupted list shows up.
pub struct ListCursor<'a, H: InspectionHost + ?Sized> {
    host: &'a H,
    next: u64,
    next_offset: u64,
    visited: usize,
    limit: usize,
    what: &'a str,
    done: bool,
}

impl<'a, H: InspectionHost + ?Sized> ListCursor<'a, H> {
    pub fn new(host: &'a H, first: u64, next_offset: u64, limit: usize, what: &'a str) -> Self {
        Self {
            host,
            next: first,
            next_offset,
            visited: 0,
            limit,
            what,
            done: false,
        }
    }
}

impl<H: InspectionHost + ?Sized> Iterator for ListCursor<'_, H> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next == 0 {
            return None;
        }
        if self.visited == self.limit {
            self.done = true;
            return Some(Err(InspectError::TraversalLimit {
                what: self.what.to_string(),
                limit: self.limit,
            }));
        }
        let node = self.next;
        match field_addr(node, self.next_offset).and_then(|at| self.host.read_u64(at)) {
            Ok(next) => {
                self.next = next;
                self.visited += 1;
                Some(Ok(node))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
