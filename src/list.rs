/*
 * Index-Linked Queues
 *
 * This is the one audited module behind every queue in the kernel: the
 * per-priority ready lists, the blocked list, the timer list, the IPC wait
 * queues and the deferred interrupt request list.
 *
 * Kernel objects never move and are never heap-allocated, so the classic
 * intrusive-list pattern is expressed with arena indices instead of raw
 * pointers: each object owns a `Link` record in a side array, and a list is
 * a `ListHead` naming the index of its first element. A link's neighbors
 * are always valid indices while `attached` is set.
 *
 * Lists are circular and doubly linked. `head.prev` is the tail, which
 * gives O(1) insertion at either end without a separate tail field.
 *
 * Ordered insertion takes the ordering key as a lookup function instead of
 * a stored value, so a key change (a priority boost, for example) is
 * observed by the very next insertion without touching nodes already in
 * place; re-sorting a single node is remove + insert.
 */

/// Link record embedded (by index) in every queueable kernel object.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Link {
    prev: usize,
    next: usize,
    attached: bool,
}

impl Link {
    pub const DETACHED: Link = Link {
        prev: 0,
        next: 0,
        attached: false,
    };

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

/// A queue over an arena of `Link` records.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ListHead {
    head: Option<usize>,
}

impl ListHead {
    pub const EMPTY: ListHead = ListHead { head: None };

    pub fn front(&self) -> Option<usize> {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append `id` at the tail.
    pub fn push_tail(&mut self, links: &mut [Link], id: usize) {
        debug_assert!(!links[id].attached, "node {} already queued", id);
        match self.head {
            None => {
                links[id].prev = id;
                links[id].next = id;
                self.head = Some(id);
            }
            Some(h) => {
                let t = links[h].prev;
                links[id].prev = t;
                links[id].next = h;
                links[t].next = id;
                links[h].prev = id;
            }
        }
        links[id].attached = true;
    }

    /// Insert `id` at the head.
    pub fn push_head(&mut self, links: &mut [Link], id: usize) {
        self.push_tail(links, id);
        self.head = Some(id);
    }

    /// Insert `id` in ascending key order, after any nodes of equal key.
    /// Equal keys therefore queue first-come-first-served.
    pub fn push_sorted(&mut self, links: &mut [Link], id: usize, key: impl Fn(usize) -> u8) {
        let Some(h) = self.head else {
            self.push_tail(links, id);
            return;
        };
        let own = key(id);
        let mut cur = h;
        loop {
            if key(cur) > own {
                debug_assert!(!links[id].attached, "node {} already queued", id);
                let p = links[cur].prev;
                links[id].prev = p;
                links[id].next = cur;
                links[p].next = id;
                links[cur].prev = id;
                links[id].attached = true;
                if cur == h {
                    self.head = Some(id);
                }
                return;
            }
            cur = links[cur].next;
            if cur == h {
                break;
            }
        }
        self.push_tail(links, id);
    }

    /// Insert `id` immediately before `before`, which must be queued here.
    pub fn insert_before(&mut self, links: &mut [Link], id: usize, before: usize) {
        debug_assert!(!links[id].attached, "node {} already queued", id);
        debug_assert!(links[before].attached, "anchor {} not queued", before);
        let p = links[before].prev;
        links[id].prev = p;
        links[id].next = before;
        links[p].next = id;
        links[before].prev = id;
        links[id].attached = true;
        if self.head == Some(before) {
            self.head = Some(id);
        }
    }

    /// Unlink `id` from this list.
    pub fn remove(&mut self, links: &mut [Link], id: usize) {
        debug_assert!(links[id].attached, "node {} not queued", id);
        let next = links[id].next;
        if next == id {
            self.head = None;
        } else {
            let prev = links[id].prev;
            links[prev].next = next;
            links[next].prev = prev;
            if self.head == Some(id) {
                self.head = Some(next);
            }
        }
        links[id] = Link::DETACHED;
    }

    /// Remove and return the head element.
    pub fn pop_front(&mut self, links: &mut [Link]) -> Option<usize> {
        let h = self.head?;
        self.remove(links, h);
        Some(h)
    }

    /// Successor of `id` within this list, None when `id` is the tail.
    pub fn next_of(&self, links: &[Link], id: usize) -> Option<usize> {
        let n = links[id].next;
        if Some(n) == self.head { None } else { Some(n) }
    }

    /// Iterate the list front to back.
    pub fn iter<'a>(&self, links: &'a [Link]) -> ListIter<'a> {
        ListIter {
            links,
            head: self.head,
            cur: self.head,
        }
    }

    pub fn len(&self, links: &[Link]) -> usize {
        self.iter(links).count()
    }
}

pub(crate) struct ListIter<'a> {
    links: &'a [Link],
    head: Option<usize>,
    cur: Option<usize>,
}

impl Iterator for ListIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let c = self.cur?;
        let n = self.links[c].next;
        self.cur = if Some(n) == self.head { None } else { Some(n) };
        Some(c)
    }
}
