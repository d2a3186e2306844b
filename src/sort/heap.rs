use std::cmp::Ordering;

/// The head record of one merge source.
#[derive(Debug)]
pub struct Head {
    pub record: Vec<u8>,
    pub source: usize,
}

/// Binary min-heap over the current head of each merge source.
///
/// `std::collections::BinaryHeap` needs a static `Ord`, but the order here is
/// a runtime comparator, so the sifting is done by hand. Equal records are
/// ordered by source index, which keeps a merge deterministic without making
/// it stable across sources.
#[derive(Debug)]
pub struct MergeHeap<C> {
    heads: Vec<Head>,
    cmp: C,
}

impl<C> MergeHeap<C>
where
    C: Fn(&[u8], &[u8]) -> Ordering,
{
    pub fn new(cmp: C) -> Self {
        MergeHeap {
            heads: Vec::new(),
            cmp,
        }
    }

    pub fn with_capacity(cap: usize, cmp: C) -> Self {
        MergeHeap {
            heads: Vec::with_capacity(cap),
            cmp,
        }
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    pub fn clear(&mut self) {
        self.heads.clear();
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.cmp)(a, b)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (a, b) = (&self.heads[a], &self.heads[b]);
        match (self.cmp)(&a.record, &b.record) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a.source < b.source,
        }
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.less(idx, parent) {
                break;
            }
            self.heads.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < self.heads.len() && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.heads.len() && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == idx {
                return;
            }
            self.heads.swap(idx, smallest);
            idx = smallest;
        }
    }

    pub fn push(&mut self, record: Vec<u8>, source: usize) {
        self.heads.push(Head { record, source });
        self.sift_up(self.heads.len() - 1);
    }

    pub fn peek(&self) -> Option<&Head> {
        self.heads.first()
    }

    pub fn pop(&mut self) -> Option<Head> {
        if self.heads.is_empty() {
            return None;
        }
        let last = self.heads.len() - 1;
        self.heads.swap(0, last);
        let head = self.heads.pop();
        self.sift_down(0);
        head
    }

    /// Replaces the minimum with the next record from the same source and
    /// returns the old minimum. Cheaper than a pop followed by a push.
    pub fn replace_top(&mut self, record: Vec<u8>) -> Option<Vec<u8>> {
        let top = self.heads.first_mut()?;
        let old = std::mem::replace(&mut top.record, record);
        self.sift_down(0);
        Some(old)
    }
}
