pub mod dump;
pub mod frames;
pub mod handlers;
pub mod metrics;
pub mod scripts;
pub mod swap;
pub mod tables;

use crate::config::MemoryConfig;
use crate::{simulated_delay, Pid};
use frames::FrameTable;
use metrics::MetricsBoard;
use scripts::ScriptStore;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use swap::SwapFile;
use tables::{EntryFlags, Geometry, TableStore};

/// Memory service errors.
#[derive(Debug)]
pub enum MemError {
    /// Not enough free frames to back the request.
    NoFreeFrames { needed: usize, available: usize },
    UnknownPid(Pid),
    DuplicatePid(Pid),
    /// Physical access outside the RAM buffer.
    OutOfRange { address: usize, size: usize },
    /// Program counter beyond the last instruction.
    PcOutOfRange { pid: Pid, pc: u64, max: usize },
    Io(std::io::Error),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemError::NoFreeFrames { needed, available } => {
                write!(f, "insufficient free frames: need {}, have {}", needed, available)
            }
            MemError::UnknownPid(pid) => write!(f, "unknown pid {}", pid),
            MemError::DuplicatePid(pid) => write!(f, "pid {} already initialized", pid),
            MemError::OutOfRange { address, size } => {
                write!(f, "physical access out of range: address {} size {}", address, size)
            }
            MemError::PcOutOfRange { pid, pc, max } => {
                write!(f, "pc {} out of range for pid {} (max {})", pc, pid, max)
            }
            MemError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl From<std::io::Error> for MemError {
    fn from(e: std::io::Error) -> Self {
        MemError::Io(e)
    }
}

pub type MemResult<T> = Result<T, MemError>;

/// PCs at which an automatic intermediate dump is emitted during fetch.
const AUTO_DUMP_PCS: [u64; 3] = [5, 10, 15];

/// The Memory world: physical RAM, page tables, swap, scripts, metrics.
///
/// `gate` is the memory-wide lock demanded by the suspend/resume contract:
/// suspend, resume, init and destroy take the write side; every data
/// operation takes the read side, so data ops run concurrently among
/// themselves but never interleave with a whole-process move.
pub struct MemoryState {
    cfg: MemoryConfig,
    gate: RwLock<()>,
    ram: Mutex<Vec<u8>>,
    frames: spin::Mutex<FrameTable>,
    tables: Mutex<TableStore>,
    swap: Mutex<SwapFile>,
    scripts: Mutex<ScriptStore>,
    metrics: MetricsBoard,
}

impl MemoryState {
    pub fn new(cfg: MemoryConfig) -> MemResult<Self> {
        let geometry = Geometry {
            page_size: cfg.page_size,
            entries_per_table: cfg.entries_per_table,
            levels: cfg.levels,
        };
        let total_frames = cfg.memory_size / cfg.page_size;
        let swapfile = SwapFile::create(Path::new(&cfg.swapfile_path))?;
        let scripts = ScriptStore::new(Path::new(&cfg.scripts_path))?;
        log::info!(
            "memory initialized: {} bytes, {} frames of {} bytes, {} levels x {} entries",
            cfg.memory_size,
            total_frames,
            cfg.page_size,
            cfg.levels,
            cfg.entries_per_table
        );
        Ok(MemoryState {
            ram: Mutex::new(vec![0u8; cfg.memory_size]),
            frames: spin::Mutex::new(FrameTable::new(total_frames)),
            tables: Mutex::new(TableStore::new(geometry)),
            swap: Mutex::new(swapfile),
            scripts: Mutex::new(scripts),
            metrics: MetricsBoard::new(),
            gate: RwLock::new(()),
            cfg,
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.tables.lock().unwrap().geometry()
    }

    pub fn free_bytes(&self) -> usize {
        let _g = self.gate.read().unwrap();
        self.frames.lock().free_count() * self.cfg.page_size
    }

    /// Register a process: copy its script, build the root table and make
    /// sure enough frames are free to back its size. Frames themselves are
    /// bound lazily on the first walk.
    pub fn init_process(&self, pid: Pid, size: usize, script_name: &str) -> MemResult<()> {
        let _g = self.gate.write().unwrap();
        let mut tables = self.tables.lock().unwrap();
        if tables.has_root(pid) {
            return Err(MemError::DuplicatePid(pid));
        }

        let needed = tables.geometry().pages_for(size);
        let available = self.frames.lock().free_count();
        if available < needed {
            return Err(MemError::NoFreeFrames { needed, available });
        }

        self.scripts.lock().unwrap().install(pid, script_name)?;
        tables.create_root(pid);
        self.frames.lock().register(pid);
        log::info!(
            "pid {} created: size {} bytes ({} pages), script '{}'",
            pid,
            size,
            needed,
            script_name
        );
        Ok(())
    }

    /// Tear a process down: final dump, zeroed and freed frames, dropped
    /// tables, swap entries and instructions. Logs the metrics summary.
    pub fn destroy_process(&self, pid: Pid) -> MemResult<()> {
        let _g = self.gate.write().unwrap();
        let mut tables = self.tables.lock().unwrap();
        if !tables.has_root(pid) {
            return Err(MemError::UnknownPid(pid));
        }

        if let Err(e) = self.dump_locked(pid) {
            log::warn!("pid {} final dump failed: {}", pid, e);
        }

        let freed = self.frames.lock().remove(pid);
        {
            let mut ram = self.ram.lock().unwrap();
            for &frame in &freed {
                let start = frame * self.cfg.page_size;
                ram[start..start + self.cfg.page_size].fill(0);
            }
        }
        tables.drop_tables(pid);
        self.swap.lock().unwrap().drop_pid(pid);
        self.scripts.lock().unwrap().remove(pid);

        let m = self.metrics.take(pid);
        log::info!(
            "pid {} destroyed - metrics: table accesses {}, instructions {}, swap-outs {}, swap-ins {}, reads {}, writes {}",
            pid, m.table_accesses, m.instructions, m.swap_outs, m.swap_ins, m.reads, m.writes
        );
        Ok(())
    }

    /// Serve the `pc`-th instruction of a pid, with the automatic
    /// intermediate dumps at the fixed PCs.
    pub fn fetch_instruction(&self, pid: Pid, pc: u64) -> MemResult<String> {
        let _g = self.gate.read().unwrap();
        simulated_delay("memory", self.cfg.memory_delay);

        let line = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.line(pid, pc)? {
                Some(line) => line,
                None => {
                    let max = scripts.count(pid).unwrap_or(0);
                    return Err(MemError::PcOutOfRange { pid, pc, max });
                }
            }
        };
        self.metrics.instruction(pid);

        if AUTO_DUMP_PCS.contains(&pc) {
            if let Err(e) = self.dump_locked(pid) {
                log::warn!("pid {} automatic dump at pc {} failed: {}", pid, pc, e);
            }
        }
        log::debug!("pid {} fetch pc {} -> '{}'", pid, pc, line);
        Ok(line)
    }

    /// Walk (and lazily materialize) the page tables down to the leaf for
    /// `page`, allocating or swapping the frame in when it is not resident.
    pub fn obtain_frame(&self, pid: Pid, page: u64) -> MemResult<usize> {
        let _g = self.gate.read().unwrap();
        simulated_delay("memory", self.cfg.memory_delay);
        self.obtain_frame_locked(pid, page)
    }

    fn obtain_frame_locked(&self, pid: Pid, page: u64) -> MemResult<usize> {
        let mut tables = self.tables.lock().unwrap();
        let slot = tables.leaf_slot(pid, page).ok_or(MemError::UnknownPid(pid))?;
        self.metrics.table_accesses(pid, slot.visits);

        let entry = tables.entry(slot);
        if entry.flags.contains(EntryFlags::VALID | EntryFlags::PRESENT) {
            return Ok(entry.frame);
        }

        let frame = self
            .frames
            .lock()
            .allocate(pid)
            .ok_or(MemError::NoFreeFrames { needed: 1, available: 0 })?;

        let start = frame * self.cfg.page_size;
        let mut page_buf = vec![0u8; self.cfg.page_size];
        let swapped_in = {
            let mut swap = self.swap.lock().unwrap();
            if swap.contains(pid, page) {
                simulated_delay("swap", self.cfg.swap_delay);
                swap.load(pid, page, &mut page_buf)?
            } else {
                false
            }
        };
        {
            let mut ram = self.ram.lock().unwrap();
            ram[start..start + self.cfg.page_size].copy_from_slice(&page_buf);
        }
        if swapped_in {
            self.metrics.swap_in(pid);
            log::info!("pid {} page {} recovered from swap into frame {}", pid, page, frame);
        }

        tables.set_leaf(slot, frame);
        log::debug!("pid {} page {} -> frame {}", pid, page, frame);
        Ok(frame)
    }

    /// Read `size` bytes at a physical address.
    pub fn read(&self, pid: Pid, address: usize, size: usize) -> MemResult<Vec<u8>> {
        let _g = self.gate.read().unwrap();
        simulated_delay("memory", self.cfg.memory_delay);
        let ram = self.ram.lock().unwrap();
        if address + size > ram.len() {
            return Err(MemError::OutOfRange { address, size });
        }
        self.metrics.read(pid);
        log::debug!("pid {} read {} bytes at physical {}", pid, size, address);
        Ok(ram[address..address + size].to_vec())
    }

    /// Overwrite bytes at a physical address.
    pub fn write(&self, pid: Pid, address: usize, bytes: &[u8]) -> MemResult<()> {
        let _g = self.gate.read().unwrap();
        simulated_delay("memory", self.cfg.memory_delay);
        let mut ram = self.ram.lock().unwrap();
        if address + bytes.len() > ram.len() {
            return Err(MemError::OutOfRange { address, size: bytes.len() });
        }
        ram[address..address + bytes.len()].copy_from_slice(bytes);
        self.metrics.write(pid);
        log::debug!("pid {} wrote {} bytes at physical {}", pid, bytes.len(), address);
        Ok(())
    }

    /// Translate a logical address through the page tables, materializing
    /// the frame as needed.
    pub fn translate(&self, pid: Pid, logical: usize) -> MemResult<usize> {
        let _g = self.gate.read().unwrap();
        let (page, offset) = self.geometry_split(logical);
        let frame = self.obtain_frame_locked(pid, page)?;
        Ok(frame * self.cfg.page_size + offset)
    }

    fn geometry_split(&self, logical: usize) -> (u64, usize) {
        (
            (logical / self.cfg.page_size) as u64,
            logical % self.cfg.page_size,
        )
    }

    /// Swap a whole process out: every assigned frame is written to the
    /// swap file (at its old offset when it has one), its leaf marked
    /// non-present, and the frame returned to the pool. A dump is emitted
    /// first.
    pub fn suspend(&self, pid: Pid) -> MemResult<()> {
        let _g = self.gate.write().unwrap();
        if !self.frames.lock().is_registered(pid) {
            return Err(MemError::UnknownPid(pid));
        }

        if let Err(e) = self.dump_locked(pid) {
            log::warn!("pid {} pre-suspension dump failed: {}", pid, e);
        }

        let owned: Vec<usize> = self
            .frames
            .lock()
            .frames_of(pid)
            .map(|f| f.to_vec())
            .unwrap_or_default();

        let mut tables = self.tables.lock().unwrap();
        for frame in owned {
            let Some(page) = tables.page_of_frame(pid, frame) else {
                log::warn!("pid {} frame {} has no mapped page, skipping", pid, frame);
                continue;
            };
            simulated_delay("swap", self.cfg.swap_delay);
            let bytes = {
                let ram = self.ram.lock().unwrap();
                let start = frame * self.cfg.page_size;
                ram[start..start + self.cfg.page_size].to_vec()
            };
            self.swap.lock().unwrap().store(pid, page, &bytes)?;
            self.metrics.swap_out(pid);
            tables.clear_present(pid, page);
            self.frames.lock().release_frame(pid, frame);
            log::info!("pid {} page {} moved to swap (frame {} freed)", pid, page, frame);
        }
        log::info!("pid {} suspended to swap", pid);
        Ok(())
    }

    /// Bring every swapped page of a pid back into fresh frames. Atomic on
    /// failure: frames allocated before the error are returned to the pool.
    pub fn resume(&self, pid: Pid) -> MemResult<()> {
        let _g = self.gate.write().unwrap();
        let mut tables = self.tables.lock().unwrap();
        if !tables.has_root(pid) {
            return Err(MemError::UnknownPid(pid));
        }

        let pages = self.swap.lock().unwrap().pages_of(pid);
        if pages.is_empty() {
            log::info!("pid {} has no pages in swap, resume is a no-op", pid);
            return Ok(());
        }

        let available = self.frames.lock().free_count();
        if available < pages.len() {
            return Err(MemError::NoFreeFrames { needed: pages.len(), available });
        }

        let mut allocated: Vec<usize> = Vec::with_capacity(pages.len());
        let result = (|| -> MemResult<()> {
            for &page in &pages {
                let frame = self
                    .frames
                    .lock()
                    .allocate(pid)
                    .ok_or(MemError::NoFreeFrames { needed: 1, available: 0 })?;
                allocated.push(frame);

                simulated_delay("swap", self.cfg.swap_delay);
                let mut buf = vec![0u8; self.cfg.page_size];
                self.swap.lock().unwrap().load(pid, page, &mut buf)?;
                {
                    let mut ram = self.ram.lock().unwrap();
                    let start = frame * self.cfg.page_size;
                    ram[start..start + self.cfg.page_size].copy_from_slice(&buf);
                }
                self.metrics.swap_in(pid);

                let slot = tables.leaf_slot(pid, page).ok_or(MemError::UnknownPid(pid))?;
                tables.set_leaf(slot, frame);
                log::info!("pid {} page {} recovered from swap into frame {}", pid, page, frame);
            }
            Ok(())
        })();

        if let Err(e) = result {
            let mut frames = self.frames.lock();
            for frame in allocated {
                frames.release_frame(pid, frame);
            }
            return Err(e);
        }
        log::info!("pid {} resumed from swap ({} pages)", pid, pages.len());
        Ok(())
    }

    /// Syscall-driven memory dump.
    pub fn dump(&self, pid: Pid) -> MemResult<PathBuf> {
        let _g = self.gate.read().unwrap();
        simulated_delay("memory", self.cfg.memory_delay);
        self.dump_locked(pid)
    }

    fn dump_locked(&self, pid: Pid) -> MemResult<PathBuf> {
        let frames: Vec<usize> = self
            .frames
            .lock()
            .frames_of(pid)
            .map(|f| f.to_vec())
            .ok_or(MemError::UnknownPid(pid))?;
        let ram = self.ram.lock().unwrap();
        let path = dump::write_dump(
            Path::new(&self.cfg.dump_path),
            pid,
            &frames,
            &ram,
            self.cfg.page_size,
        )?;
        Ok(path)
    }

    pub fn metrics(&self) -> &MetricsBoard {
        &self.metrics
    }

    #[cfg(test)]
    pub(crate) fn frames_of(&self, pid: Pid) -> Vec<usize> {
        self.frames
            .lock()
            .frames_of(pid)
            .map(|f| f.to_vec())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn resident_pages(&self, pid: Pid) -> Vec<(u64, usize)> {
        self.tables.lock().unwrap().resident_pages(pid)
    }

    #[cfg(test)]
    pub(crate) fn frame_is_free(&self, frame: usize) -> bool {
        self.frames.lock().is_free(frame)
    }
}
