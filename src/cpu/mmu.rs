use super::cache::PageCache;
use super::tlb::Tlb;
use crate::memory::tables::Geometry;
use crate::proto::{MessageKind, RpcClient};
use crate::{simulated_delay, Pid};
use serde_json::json;
use std::fmt;

/// CPU-side errors. Every failure ultimately turns into an `ERROR` return
/// reason toward the Kernel.
#[derive(Debug)]
pub enum CpuError {
    Memory(String),
}

impl fmt::Display for CpuError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CpuError::Memory(m) => write!(f, "memory access failed: {}", m),
        }
    }
}

pub type CpuResult<T> = Result<T, CpuError>;

/// The Memory operations a CPU worker needs. Kept behind a trait so the
/// data-path is exercisable against an in-process memory in tests.
pub trait MemoryPort: Send + Sync {
    fn fetch(&self, pid: Pid, pc: u64) -> CpuResult<String>;
    fn obtain_frame(&self, pid: Pid, page: u64) -> CpuResult<usize>;
    fn read(&self, pid: Pid, physical: usize, size: usize) -> CpuResult<Vec<u8>>;
    fn write(&self, pid: Pid, physical: usize, bytes: &[u8]) -> CpuResult<()>;
}

/// RPC-backed port used by the real worker.
pub struct RpcMemoryPort {
    client: RpcClient,
}

impl RpcMemoryPort {
    pub fn new(client: RpcClient) -> Self {
        RpcMemoryPort { client }
    }
}

fn remote(e: crate::proto::ProtoError) -> CpuError {
    CpuError::Memory(e.to_string())
}

impl MemoryPort for RpcMemoryPort {
    fn fetch(&self, pid: Pid, pc: u64) -> CpuResult<String> {
        let reply = self
            .client
            .call(MessageKind::FetchInstruction, "FETCH", json!({"pid": pid, "pc": pc}))
            .map_err(remote)?;
        reply["instruction"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CpuError::Memory("fetch reply without instruction".to_string()))
    }

    fn obtain_frame(&self, pid: Pid, page: u64) -> CpuResult<usize> {
        let reply = self
            .client
            .call(
                MessageKind::ObtainFrame,
                "OBTAIN_FRAME",
                json!({"pid": pid, "page": page}),
            )
            .map_err(remote)?;
        reply["frame"]
            .as_u64()
            .map(|f| f as usize)
            .ok_or_else(|| CpuError::Memory("frame reply without frame".to_string()))
    }

    fn read(&self, pid: Pid, physical: usize, size: usize) -> CpuResult<Vec<u8>> {
        let reply = self
            .client
            .call(
                MessageKind::ReadMem,
                "READ",
                json!({"pid": pid, "physical_address": physical, "size": size}),
            )
            .map_err(remote)?;
        reply["value"]
            .as_str()
            .map(|s| s.as_bytes().to_vec())
            .ok_or_else(|| CpuError::Memory("read reply without value".to_string()))
    }

    fn write(&self, pid: Pid, physical: usize, bytes: &[u8]) -> CpuResult<()> {
        self.client
            .call(
                MessageKind::WriteMem,
                "WRITE",
                json!({
                    "pid": pid,
                    "physical_address": physical,
                    "value": String::from_utf8_lossy(bytes),
                }),
            )
            .map_err(remote)?;
        Ok(())
    }
}

/// The per-CPU data-path state: TLB plus page cache, both protected by the
/// single core lock of the worker that owns this value.
pub struct Mmu {
    geometry: Geometry,
    tlb: Tlb,
    cache: PageCache,
    cache_delay: u64,
}

impl Mmu {
    pub fn new(geometry: Geometry, tlb: Tlb, cache: PageCache, cache_delay: u64) -> Self {
        Mmu {
            geometry,
            tlb,
            cache,
            cache_delay,
        }
    }

    /// Translate `(pid, logical)` to a physical address. TLB first; then
    /// the cache (a cached page knows its frame); then Memory, installing
    /// into both structures on the way back.
    pub fn translate(
        &mut self,
        memory: &dyn MemoryPort,
        pid: Pid,
        logical: usize,
    ) -> CpuResult<usize> {
        let (page, offset) = self.geometry.split(logical);

        if let Some(frame) = self.tlb.lookup(pid, page) {
            log::info!("pid {} - TLB HIT - page {}", pid, page);
            return Ok(frame * self.geometry.page_size + offset);
        }
        if self.tlb.enabled() {
            log::info!("pid {} - TLB MISS - page {}", pid, page);
        }

        let frame = self.frame_for(memory, pid, page)?;
        self.tlb.insert(pid, page, frame);
        Ok(frame * self.geometry.page_size + offset)
    }

    fn frame_for(&mut self, memory: &dyn MemoryPort, pid: Pid, page: u64) -> CpuResult<usize> {
        if let Some(frame) = self.cache.frame_of(pid, page) {
            log::info!("pid {} - cache hit - page {}", pid, page);
            return Ok(frame);
        }
        if self.cache.enabled() {
            log::info!("pid {} - cache miss - page {}", pid, page);
            simulated_delay("cache", self.cache_delay);
        }

        let frame = memory.obtain_frame(pid, page)?;
        if self.cache.enabled() {
            let content = memory.read(pid, frame * self.geometry.page_size, self.geometry.page_size)?;
            if let Some(victim) = self.cache.insert(pid, page, frame, content) {
                self.flush_entry(memory, &victim)?;
            }
            log::info!("pid {} - cache add - page {}", pid, page);
        }
        Ok(frame)
    }

    /// READ: serve from the cache when the page is resident, otherwise
    /// straight from Memory at the translated address.
    pub fn read(
        &mut self,
        memory: &dyn MemoryPort,
        pid: Pid,
        logical: usize,
        size: usize,
    ) -> CpuResult<Vec<u8>> {
        let physical = self.translate(memory, pid, logical)?;
        let (page, offset) = self.geometry.split(logical);
        if offset + size <= self.geometry.page_size {
            if let Some(bytes) = self.cache.read(pid, page, offset, size) {
                log::info!("pid {} - read {} bytes at physical {} (cache)", pid, size, physical);
                return Ok(bytes);
            }
        }
        let bytes = memory.read(pid, physical, size)?;
        log::info!("pid {} - read {} bytes at physical {}", pid, size, physical);
        Ok(bytes)
    }

    /// WRITE: patch the cached page when resident (write-back on eviction),
    /// otherwise write through to Memory.
    pub fn write(
        &mut self,
        memory: &dyn MemoryPort,
        pid: Pid,
        logical: usize,
        bytes: &[u8],
    ) -> CpuResult<()> {
        let physical = self.translate(memory, pid, logical)?;
        let (page, offset) = self.geometry.split(logical);
        if offset + bytes.len() <= self.geometry.page_size && self.cache.write(pid, page, offset, bytes)
        {
            log::info!(
                "pid {} - wrote {} bytes at physical {} (cache)",
                pid,
                bytes.len(),
                physical
            );
            return Ok(());
        }
        memory.write(pid, physical, bytes)?;
        log::info!("pid {} - wrote {} bytes at physical {}", pid, bytes.len(), physical);
        Ok(())
    }

    fn flush_entry(
        &self,
        memory: &dyn MemoryPort,
        entry: &super::cache::CacheEntry,
    ) -> CpuResult<()> {
        log::info!(
            "pid {} - flushing page {} to frame {}",
            entry.pid,
            entry.page,
            entry.frame
        );
        memory.write(entry.pid, entry.frame * self.geometry.page_size, &entry.content)
    }

    /// Clear every TLB and cache entry of a departing pid, writing dirty
    /// lines back first.
    pub fn release(&mut self, memory: &dyn MemoryPort, pid: Pid) -> CpuResult<()> {
        for entry in self.cache.purge(pid) {
            self.flush_entry(memory, &entry)?;
        }
        self.tlb.purge(pid);
        log::info!("pid {} - TLB and cache entries cleared", pid);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeMemory;
    use super::*;
    use crate::cpu::cache::{CachePolicy, PageCache};
    use crate::cpu::tlb::{Tlb, TlbPolicy};

    fn geometry() -> Geometry {
        Geometry {
            page_size: 16,
            entries_per_table: 4,
            levels: 2,
        }
    }

    fn mmu(tlb_entries: usize, cache_entries: usize) -> Mmu {
        Mmu::new(
            geometry(),
            Tlb::new(tlb_entries, TlbPolicy::Lru),
            PageCache::new(cache_entries, CachePolicy::Clock),
            0,
        )
    }

    #[test]
    fn tlb_hit_skips_the_memory_round_trip() {
        let memory = FakeMemory::new(16, 8);
        let mut mmu = mmu(4, 0);
        let a = mmu.translate(&memory, 1, 20).unwrap();
        assert_eq!(memory.obtain_calls(), 1);
        let b = mmu.translate(&memory, 1, 25).unwrap();
        assert_eq!(memory.obtain_calls(), 1, "second access hits the TLB");
        assert_eq!(a - 20 % 16, b - 25 % 16);
    }

    #[test]
    fn write_then_read_round_trips_through_the_cache() {
        let memory = FakeMemory::new(16, 8);
        let mut mmu = mmu(4, 4);
        mmu.write(&memory, 1, 18, b"abc").unwrap();
        assert_eq!(mmu.read(&memory, 1, 18, 3).unwrap(), b"abc");
        // The write stayed in the cache; RAM still has the page's old bytes.
        assert_eq!(memory.write_calls(), 0);
    }

    #[test]
    fn write_then_read_round_trips_without_cache() {
        let memory = FakeMemory::new(16, 8);
        let mut mmu = mmu(4, 0);
        mmu.write(&memory, 1, 18, b"abc").unwrap();
        assert_eq!(mmu.read(&memory, 1, 18, 3).unwrap(), b"abc");
        assert_eq!(memory.write_calls(), 1);
    }

    #[test]
    fn release_flushes_dirty_lines_back() {
        let memory = FakeMemory::new(16, 8);
        let mut mmu = mmu(4, 4);
        mmu.write(&memory, 1, 2, b"zz").unwrap();
        mmu.release(&memory, 1).unwrap();
        // Frame 0 backs page 0; the flush wrote the whole page.
        assert_eq!(memory.ram_at(2, 2), b"zz");

        // After the purge everything misses again.
        let calls = memory.obtain_calls();
        mmu.translate(&memory, 1, 2).unwrap();
        assert_eq!(memory.obtain_calls(), calls + 1);
    }

    #[test]
    fn cache_hit_supplies_the_frame_without_memory() {
        let memory = FakeMemory::new(16, 8);
        // TLB disabled: the cache is the only translation shortcut.
        let mut mmu = mmu(0, 4);
        mmu.read(&memory, 1, 0, 1).unwrap();
        let calls = memory.obtain_calls();
        mmu.read(&memory, 1, 1, 1).unwrap();
        assert_eq!(memory.obtain_calls(), calls, "frame came from the cache");
    }
}
