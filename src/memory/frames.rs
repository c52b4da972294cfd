use crate::Pid;
use std::collections::HashMap;

/// Physical frame bookkeeping: a free bitmap over every frame plus the
/// per-process ownership lists. Held behind a short spin lock; nothing
/// blocking ever happens while it is taken.
pub struct FrameTable {
    free: Vec<bool>,
    owned: HashMap<Pid, Vec<usize>>,
}

impl FrameTable {
    pub fn new(total_frames: usize) -> Self {
        FrameTable {
            free: vec![true; total_frames],
            owned: HashMap::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.free.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.iter().filter(|f| **f).count()
    }

    /// Register a process with no frames yet. Idempotent.
    pub fn register(&mut self, pid: Pid) {
        self.owned.entry(pid).or_default();
    }

    pub fn is_registered(&self, pid: Pid) -> bool {
        self.owned.contains_key(&pid)
    }

    /// First-free scan. The frame is marked busy and appended to the pid's
    /// ownership list.
    pub fn allocate(&mut self, pid: Pid) -> Option<usize> {
        let frame = self.free.iter().position(|f| *f)?;
        self.free[frame] = false;
        self.owned.entry(pid).or_default().push(frame);
        log::debug!("frame {} assigned to pid {}", frame, pid);
        Some(frame)
    }

    pub fn frames_of(&self, pid: Pid) -> Option<&[usize]> {
        self.owned.get(&pid).map(|v| v.as_slice())
    }

    /// Return one frame to the free pool and drop it from the pid's list.
    pub fn release_frame(&mut self, pid: Pid, frame: usize) {
        if let Some(list) = self.owned.get_mut(&pid) {
            list.retain(|f| *f != frame);
        }
        if frame < self.free.len() {
            self.free[frame] = true;
        }
    }

    /// Free every frame of the pid, keeping it registered with an empty
    /// list (a suspended process still exists). Returns the freed frames.
    pub fn release_all_keep(&mut self, pid: Pid) -> Vec<usize> {
        let frames = self.owned.insert(pid, Vec::new()).unwrap_or_default();
        for &frame in &frames {
            self.free[frame] = true;
        }
        frames
    }

    /// Free every frame of the pid and forget it entirely.
    pub fn remove(&mut self, pid: Pid) -> Vec<usize> {
        let frames = self.owned.remove(&pid).unwrap_or_default();
        for &frame in &frames {
            self.free[frame] = true;
        }
        frames
    }

    pub fn is_free(&self, frame: usize) -> bool {
        self.free.get(frame).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_marks_busy_and_records_owner() {
        let mut frames = FrameTable::new(4);
        let f0 = frames.allocate(1).unwrap();
        let f1 = frames.allocate(1).unwrap();
        assert_eq!((f0, f1), (0, 1));
        assert!(!frames.is_free(0));
        assert_eq!(frames.frames_of(1).unwrap(), &[0, 1]);
        assert_eq!(frames.free_count(), 2);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut frames = FrameTable::new(1);
        assert!(frames.allocate(1).is_some());
        assert!(frames.allocate(2).is_none());
    }

    #[test]
    fn no_frame_is_shared_between_pids() {
        let mut frames = FrameTable::new(8);
        for pid in 0..4 {
            frames.allocate(pid);
            frames.allocate(pid);
        }
        let mut seen = std::collections::HashSet::new();
        for pid in 0..4 {
            for &f in frames.frames_of(pid).unwrap() {
                assert!(seen.insert(f), "frame {} owned twice", f);
                assert!(!frames.is_free(f));
            }
        }
    }

    #[test]
    fn release_all_keep_leaves_pid_registered() {
        let mut frames = FrameTable::new(4);
        frames.allocate(7);
        frames.allocate(7);
        let freed = frames.release_all_keep(7);
        assert_eq!(freed.len(), 2);
        assert_eq!(frames.free_count(), 4);
        assert!(frames.is_registered(7));
        assert!(frames.frames_of(7).unwrap().is_empty());
    }

    #[test]
    fn remove_forgets_the_pid() {
        let mut frames = FrameTable::new(2);
        frames.allocate(3);
        frames.remove(3);
        assert!(!frames.is_registered(3));
        assert_eq!(frames.free_count(), 2);
    }
}
