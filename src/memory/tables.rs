use crate::Pid;
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    /// State bits of one page-table entry. `VALID` means the entry has been
    /// materialized at least once; `PRESENT` means the page is in RAM right
    /// now (a valid, non-present leaf lives in swap).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        const VALID = 1 << 0;
        const PRESENT = 1 << 1;
    }
}

/// Opaque handle into the table store. Non-leaf entries link tables by id,
/// never by reference, so ownership stays a pure tree.
pub type TableId = usize;

#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub flags: EntryFlags,
    /// Frame number; meaningful on leaf entries only.
    pub frame: usize,
    /// Child table id; meaningful on non-leaf entries only.
    pub child: TableId,
}

impl Default for Entry {
    fn default() -> Self {
        Entry {
            flags: EntryFlags::empty(),
            frame: 0,
            child: 0,
        }
    }
}

#[derive(Debug)]
pub struct Table {
    pub entries: Vec<Entry>,
    pub level: usize,
}

/// Paging geometry shared by Memory and the CPU workers.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub page_size: usize,
    pub entries_per_table: usize,
    pub levels: usize,
}

impl Geometry {
    /// Split a logical address into page number and in-page offset.
    pub fn split(&self, logical: usize) -> (u64, usize) {
        ((logical / self.page_size) as u64, logical % self.page_size)
    }

    /// Index into the table at `level` (1-based, root = 1) for a page.
    pub fn index_at(&self, page: u64, level: usize) -> usize {
        let span = self.span_of(level);
        ((page / span) % self.entries_per_table as u64) as usize
    }

    /// Pages covered by one entry at `level`.
    fn span_of(&self, level: usize) -> u64 {
        (self.entries_per_table as u64).pow((self.levels - level) as u32)
    }

    /// Frames needed to back `size` bytes.
    pub fn pages_for(&self, size: usize) -> usize {
        size.div_ceil(self.page_size)
    }
}

/// Per-process multilevel page tables. Tables of every process live in one
/// side map keyed by `TableId`; each process owns a root id.
pub struct TableStore {
    geometry: Geometry,
    roots: HashMap<Pid, TableId>,
    tables: HashMap<TableId, Table>,
    next_id: TableId,
}

/// Location of a leaf entry, as returned by a walk.
#[derive(Debug, Clone, Copy)]
pub struct LeafSlot {
    pub table: TableId,
    pub index: usize,
    /// Levels visited to reach the leaf, for the access metrics.
    pub visits: u64,
}

impl TableStore {
    pub fn new(geometry: Geometry) -> Self {
        TableStore {
            geometry,
            roots: HashMap::new(),
            tables: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn has_root(&self, pid: Pid) -> bool {
        self.roots.contains_key(&pid)
    }

    /// Allocate the level-1 table for a new process.
    pub fn create_root(&mut self, pid: Pid) -> bool {
        if self.roots.contains_key(&pid) {
            return false;
        }
        let root = self.store_table(1);
        self.roots.insert(pid, root);
        true
    }

    fn store_table(&mut self, level: usize) -> TableId {
        let id = self.next_id;
        self.next_id += 1;
        self.tables.insert(
            id,
            Table {
                entries: vec![Entry::default(); self.geometry.entries_per_table],
                level,
            },
        );
        id
    }

    /// Walk from the root to the leaf entry covering `page`, materializing
    /// missing intermediate tables on the way. The leaf entry itself is not
    /// touched; the caller inspects and updates it through the slot.
    pub fn leaf_slot(&mut self, pid: Pid, page: u64) -> Option<LeafSlot> {
        let mut current = *self.roots.get(&pid)?;
        let mut visits = 0u64;
        for level in 1..=self.geometry.levels {
            visits += 1;
            let index = self.geometry.index_at(page, level);
            if level == self.geometry.levels {
                return Some(LeafSlot {
                    table: current,
                    index,
                    visits,
                });
            }
            let child = {
                let entry = self.tables[&current].entries[index];
                if entry.flags.contains(EntryFlags::VALID) {
                    entry.child
                } else {
                    let new_child = self.store_table(level + 1);
                    let table = self.tables.get_mut(&current).expect("table in store");
                    table.entries[index] = Entry {
                        flags: EntryFlags::VALID | EntryFlags::PRESENT,
                        frame: 0,
                        child: new_child,
                    };
                    new_child
                }
            };
            current = child;
        }
        None
    }

    pub fn entry(&self, slot: LeafSlot) -> Entry {
        self.tables[&slot.table].entries[slot.index]
    }

    /// Point a leaf at a frame and mark it resident.
    pub fn set_leaf(&mut self, slot: LeafSlot, frame: usize) {
        let table = self.tables.get_mut(&slot.table).expect("table in store");
        table.entries[slot.index] = Entry {
            flags: EntryFlags::VALID | EntryFlags::PRESENT,
            frame,
            child: 0,
        };
    }

    /// Mark the leaf covering `page` as swapped out. Missing paths are a
    /// no-op: an entry that was never materialized has nothing to clear.
    pub fn clear_present(&mut self, pid: Pid, page: u64) {
        let Some(&root) = self.roots.get(&pid) else {
            return;
        };
        let mut current = root;
        for level in 1..=self.geometry.levels {
            let index = self.geometry.index_at(page, level);
            let entry = self.tables[&current].entries[index];
            if !entry.flags.contains(EntryFlags::VALID) {
                return;
            }
            if level == self.geometry.levels {
                let table = self.tables.get_mut(&current).expect("table in store");
                table.entries[index].flags.remove(EntryFlags::PRESENT);
                return;
            }
            current = entry.child;
        }
    }

    /// Inverse walk: which page does `frame` back for this pid. Sums the
    /// per-level index contributions along the path.
    pub fn page_of_frame(&self, pid: Pid, frame: usize) -> Option<u64> {
        let &root = self.roots.get(&pid)?;
        self.find_frame(root, 1, 0, frame)
    }

    fn find_frame(&self, table: TableId, level: usize, base: u64, frame: usize) -> Option<u64> {
        let span = self.geometry.span_of(level);
        let entries = &self.tables.get(&table)?.entries;
        for (i, entry) in entries.iter().enumerate() {
            if !entry.flags.contains(EntryFlags::VALID) {
                continue;
            }
            if level == self.geometry.levels {
                if entry.flags.contains(EntryFlags::PRESENT) && entry.frame == frame {
                    return Some(base + i as u64);
                }
            } else if let Some(page) =
                self.find_frame(entry.child, level + 1, base + i as u64 * span, frame)
            {
                return Some(page);
            }
        }
        None
    }

    /// Every resident leaf of the pid as `(page, frame)` pairs.
    pub fn resident_pages(&self, pid: Pid) -> Vec<(u64, usize)> {
        let mut out = Vec::new();
        if let Some(&root) = self.roots.get(&pid) {
            self.collect_resident(root, 1, 0, &mut out);
        }
        out
    }

    fn collect_resident(&self, table: TableId, level: usize, base: u64, out: &mut Vec<(u64, usize)>) {
        let span = self.geometry.span_of(level);
        let Some(t) = self.tables.get(&table) else {
            return;
        };
        for (i, entry) in t.entries.iter().enumerate() {
            if !entry.flags.contains(EntryFlags::VALID) {
                continue;
            }
            if level == self.geometry.levels {
                if entry.flags.contains(EntryFlags::PRESENT) {
                    out.push((base + i as u64, entry.frame));
                }
            } else {
                self.collect_resident(entry.child, level + 1, base + i as u64 * span, out);
            }
        }
    }

    /// Tear down the whole tree of a pid. Returns false for unknown pids.
    pub fn drop_tables(&mut self, pid: Pid) -> bool {
        let Some(root) = self.roots.remove(&pid) else {
            return false;
        };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(table) = self.tables.remove(&id) {
                if table.level < self.geometry.levels {
                    for entry in &table.entries {
                        if entry.flags.contains(EntryFlags::VALID) {
                            stack.push(entry.child);
                        }
                    }
                }
            }
        }
        true
    }
}
