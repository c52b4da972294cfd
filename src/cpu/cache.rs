use crate::Pid;

/// Page-cache replacement policy, chosen once from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Clock,
    ClockM,
}

impl CachePolicy {
    /// Unrecognized names fall back to CLOCK with a warning.
    pub fn parse(name: &str) -> Self {
        match name {
            "CLOCK" => CachePolicy::Clock,
            "CLOCK-M" => CachePolicy::ClockM,
            other => {
                log::warn!("unknown cache replacement '{}', using CLOCK", other);
                CachePolicy::Clock
            }
        }
    }
}

/// One cached page: its bytes plus the reference/modified bits the CLOCK
/// variants work on.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub pid: Pid,
    pub page: u64,
    pub frame: usize,
    pub content: Vec<u8>,
    pub modified: bool,
    pub referenced: bool,
}

/// Per-CPU page-content cache, independent of the TLB, with a circular
/// clock pointer. Capacity 0 disables it.
pub struct PageCache {
    entries: Vec<Option<CacheEntry>>,
    pointer: usize,
    policy: CachePolicy,
}

impl PageCache {
    pub fn new(capacity: usize, policy: CachePolicy) -> Self {
        PageCache {
            entries: vec![None; capacity],
            pointer: 0,
            policy,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.entries.is_empty()
    }

    fn position(&self, pid: Pid, page: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.as_ref().map(|e| e.pid == pid && e.page == page) == Some(true))
    }

    /// Frame of a cached page, marking the reference bit. Used by the
    /// translation path so a cache hit avoids the Memory round-trip.
    pub fn frame_of(&mut self, pid: Pid, page: u64) -> Option<usize> {
        let i = self.position(pid, page)?;
        let entry = self.entries[i].as_mut().expect("occupied slot");
        entry.referenced = true;
        Some(entry.frame)
    }

    /// Serve a read from the cached bytes. The range must fall inside the
    /// page.
    pub fn read(&mut self, pid: Pid, page: u64, offset: usize, size: usize) -> Option<Vec<u8>> {
        let i = self.position(pid, page)?;
        let entry = self.entries[i].as_mut().expect("occupied slot");
        if offset + size > entry.content.len() {
            return None;
        }
        entry.referenced = true;
        Some(entry.content[offset..offset + size].to_vec())
    }

    /// Patch cached bytes in place, marking the line modified. Returns
    /// false on a miss or when the range does not fit the page.
    pub fn write(&mut self, pid: Pid, page: u64, offset: usize, bytes: &[u8]) -> bool {
        let Some(i) = self.position(pid, page) else {
            return false;
        };
        let entry = self.entries[i].as_mut().expect("occupied slot");
        if offset + bytes.len() > entry.content.len() {
            return false;
        }
        entry.content[offset..offset + bytes.len()].copy_from_slice(bytes);
        entry.referenced = true;
        entry.modified = true;
        true
    }

    /// Install a page. When the cache is full the configured CLOCK variant
    /// picks the victim; a modified victim is handed back so the caller can
    /// flush it to Memory.
    pub fn insert(
        &mut self,
        pid: Pid,
        page: u64,
        frame: usize,
        content: Vec<u8>,
    ) -> Option<CacheEntry> {
        if !self.enabled() {
            return None;
        }
        let entry = CacheEntry {
            pid,
            page,
            frame,
            content,
            modified: false,
            referenced: true,
        };

        if let Some(free) = self.entries.iter().position(Option::is_none) {
            self.entries[free] = Some(entry);
            return None;
        }

        let victim = match self.policy {
            CachePolicy::Clock => self.clock_victim(),
            CachePolicy::ClockM => self.clock_m_victim(),
        };
        let evicted = self.entries[victim].replace(entry);
        self.pointer = (victim + 1) % self.entries.len();
        evicted.filter(|e| e.modified)
    }

    /// CLOCK: first entry with `referenced == false`, clearing reference
    /// bits as the pointer passes.
    fn clock_victim(&mut self) -> usize {
        loop {
            let i = self.pointer;
            let entry = self.entries[i].as_mut().expect("full cache");
            if !entry.referenced {
                return i;
            }
            entry.referenced = false;
            self.pointer = (self.pointer + 1) % self.entries.len();
        }
    }

    /// CLOCK-M: first sweep wants (referenced=0, modified=0) untouched;
    /// second sweep wants (0,1) while clearing reference bits it passes;
    /// after that every bit is clear, so a last sweep always finds a
    /// victim.
    fn clock_m_victim(&mut self) -> usize {
        let n = self.entries.len();
        let start = self.pointer;

        loop {
            let entry = self.entries[self.pointer].as_ref().expect("full cache");
            if !entry.referenced && !entry.modified {
                return self.pointer;
            }
            self.pointer = (self.pointer + 1) % n;
            if self.pointer == start {
                break;
            }
        }

        loop {
            let entry = self.entries[self.pointer].as_mut().expect("full cache");
            if !entry.referenced && entry.modified {
                return self.pointer;
            }
            entry.referenced = false;
            self.pointer = (self.pointer + 1) % n;
            if self.pointer == start {
                break;
            }
        }

        loop {
            let entry = self.entries[self.pointer].as_ref().expect("full cache");
            if !entry.referenced {
                return self.pointer;
            }
            self.pointer = (self.pointer + 1) % n;
        }
    }

    /// Remove every line of a pid, returning the modified ones for
    /// write-back.
    pub fn purge(&mut self, pid: Pid) -> Vec<CacheEntry> {
        let mut dirty = Vec::new();
        for slot in self.entries.iter_mut() {
            if slot.as_ref().map(|e| e.pid == pid) == Some(true) {
                let entry = slot.take().expect("occupied slot");
                if entry.modified {
                    dirty.push(entry);
                }
            }
        }
        dirty
    }

    #[cfg(test)]
    fn occupant(&self, slot: usize) -> Option<(Pid, u64)> {
        self.entries[slot].as_ref().map(|e| (e.pid, e.page))
    }
}
