// Heap manager for SPOS
//
// A heap is laid out as a map area followed by a use area. The map area is a
// fixed number of slots, each describing one live chunk of the use area; the
// bytes of the use area live in a `MemDriver`. Free space is never recorded,
// it is whatever no map entry covers.
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::config::{HeapConfig, MAX_SHARED_READERS};
use crate::memory::driver::{MemDriver, RamDriver};
use crate::memory::strategies::{AllocStrategy, FreeRegion};
use crate::memory::{MemAddr, MemValue};
use crate::process::ProcessId;
use crate::{KernelError, KernelResult, Table};

/// Bytes one map entry takes in the heap layout: address, size and owner.
pub const MAP_ENTRY_SIZE: usize = 5;

/// Access state of a shared chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedState {
    Closed,
    /// Number of open readers, at most `MAX_SHARED_READERS`
    Reading(u8),
    Writing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Process(ProcessId),
    /// Owned by no process; survives the death of its users
    Shared(SharedState),
}

/// One live chunk of the use area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub addr: MemAddr,
    pub size: u16,
    pub owner: Owner,
}

impl MapEntry {
    /// First address after the chunk
    pub fn end(&self) -> u32 {
        u32::from(self.addr) + u32::from(self.size)
    }

    pub fn contains(&self, addr: MemAddr) -> bool {
        addr >= self.addr && u32::from(addr) < self.end()
    }
}

pub struct Heap {
    name: &'static str,
    driver: Box<dyn MemDriver>,
    map: Vec<Option<MapEntry>>,
    use_start: MemAddr,
    use_size: u16,
    strategy: AllocStrategy,
    /// Where the last allocation ended; next-fit resumes here.
    cursor: MemAddr,
}

impl Heap {
    /// Set up a heap on `driver`. The use area starts right after the map
    /// area, so the whole layout has to fit the address space and the driver
    /// has to hold the use area.
    pub fn new(config: &HeapConfig, mut driver: Box<dyn MemDriver>) -> KernelResult<Self> {
        let map_bytes = config.map_capacity * MAP_ENTRY_SIZE;
        if map_bytes + usize::from(config.use_size) > usize::from(MemAddr::MAX)
            || driver.size() < usize::from(config.use_size)
        {
            return Err(KernelError::OutOfMemory);
        }
        driver.init();

        let use_start = map_bytes as MemAddr;
        log::debug!(
            "heap {}: {} map entries, use area {:#06x}..{:#06x}",
            config.name,
            config.map_capacity,
            use_start,
            u32::from(use_start) + u32::from(config.use_size)
        );
        Ok(Self {
            name: config.name,
            driver,
            map: vec![None; config.map_capacity],
            use_start,
            use_size: config.use_size,
            strategy: config.strategy,
            cursor: use_start,
        })
    }

    /// Heap backed by a fresh `RamDriver`
    pub fn with_ram(config: &HeapConfig) -> KernelResult<Self> {
        Self::new(config, Box::new(RamDriver::new(usize::from(config.use_size))))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn map_capacity(&self) -> usize {
        self.map.len()
    }

    /// Number of live chunks
    pub fn map_entries(&self) -> usize {
        self.map.iter().flatten().count()
    }

    pub fn use_start(&self) -> MemAddr {
        self.use_start
    }

    pub fn use_size(&self) -> u16 {
        self.use_size
    }

    fn use_end(&self) -> u32 {
        u32::from(self.use_start) + u32::from(self.use_size)
    }

    pub fn used_bytes(&self) -> usize {
        self.map.iter().flatten().map(|entry| usize::from(entry.size)).sum()
    }

    pub fn free_bytes(&self) -> usize {
        usize::from(self.use_size) - self.used_bytes()
    }

    pub fn strategy(&self) -> AllocStrategy {
        self.strategy
    }

    /// Takes effect for the next allocation; no chunk moves.
    pub fn set_strategy(&mut self, strategy: AllocStrategy) {
        self.strategy = strategy;
    }

    /// Live chunks in address order
    pub fn chunks(&self) -> Vec<MapEntry> {
        let mut chunks: Vec<MapEntry> = self.map.iter().flatten().copied().collect();
        chunks.sort_unstable_by_key(|entry| entry.addr);
        chunks
    }

    /// Gaps between the chunks, in address order
    pub fn free_regions(&self) -> Vec<FreeRegion> {
        let mut regions = Vec::new();
        let mut next = u32::from(self.use_start);
        for chunk in self.chunks() {
            if u32::from(chunk.addr) > next {
                regions.push(FreeRegion {
                    addr: next as MemAddr,
                    size: (u32::from(chunk.addr) - next) as u16,
                });
            }
            next = next.max(chunk.end());
        }
        if self.use_end() > next {
            regions.push(FreeRegion {
                addr: next as MemAddr,
                size: (self.use_end() - next) as u16,
            });
        }
        regions
    }

    /// Bytes held by `pid`
    pub fn owned_bytes(&self, pid: ProcessId) -> usize {
        self.map
            .iter()
            .flatten()
            .filter(|entry| entry.owner == Owner::Process(pid))
            .map(|entry| usize::from(entry.size))
            .sum()
    }

    /// Size of the chunk containing `addr`
    pub fn chunk_size(&self, addr: MemAddr) -> Option<u16> {
        self.lookup(addr).ok().map(|(_, entry)| entry.size)
    }

    pub fn owner_of(&self, addr: MemAddr) -> Option<Owner> {
        self.lookup(addr).ok().map(|(_, entry)| entry.owner)
    }

    /// Map slot and entry of the chunk containing `addr`
    fn lookup(&self, addr: MemAddr) -> KernelResult<(usize, MapEntry)> {
        self.map
            .iter()
            .copied()
            .enumerate()
            .find_map(|(slot, entry)| entry.filter(|entry| entry.contains(addr)).map(|entry| (slot, entry)))
            .ok_or(KernelError::InvalidFree)
    }

    fn advance_cursor(&mut self, addr: MemAddr, size: u16) {
        let end = u32::from(addr) + u32::from(size);
        self.cursor = if end >= self.use_end() {
            self.use_start
        } else {
            end as MemAddr
        };
    }

    fn place(&mut self, size: u16, owner: Owner) -> KernelResult<MemAddr> {
        if size == 0 {
            return Err(KernelError::OutOfMemory);
        }
        let slot = self
            .map
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::TableFull(Table::HeapMap))?;
        let addr = self
            .strategy
            .select(&self.free_regions(), size, self.cursor)
            .ok_or(KernelError::OutOfMemory)?;

        self.map[slot] = Some(MapEntry { addr, size, owner });
        self.advance_cursor(addr, size);
        log::trace!("heap {}: {} bytes at {:#06x} for {:?}", self.name, size, addr, owner);
        Ok(addr)
    }

    /// Allocate `size` bytes owned by `owner`.
    pub fn allocate(&mut self, size: u16, owner: ProcessId) -> KernelResult<MemAddr> {
        self.place(size, Owner::Process(owner))
    }

    /// Free the chunk containing `addr`, whoever owns it. Shared chunks are
    /// released through `sh_free` only.
    pub fn free(&mut self, addr: MemAddr) -> KernelResult<()> {
        let (slot, entry) = self.lookup(addr)?;
        if let Owner::Shared(_) = entry.owner {
            return Err(KernelError::InvalidFree);
        }
        self.map[slot] = None;
        Ok(())
    }

    /// Free the chunk containing `addr` if it belongs to `requester`.
    pub fn free_owner_restricted(&mut self, addr: MemAddr, requester: ProcessId) -> KernelResult<()> {
        let (slot, entry) = self.lookup(addr)?;
        match entry.owner {
            Owner::Process(owner) if owner == requester => {
                self.map[slot] = None;
                Ok(())
            }
            Owner::Process(_) => Err(KernelError::NotOwner),
            Owner::Shared(_) => Err(KernelError::InvalidFree),
        }
    }

    /// Drop every chunk of `pid`. Returns the number of bytes reclaimed.
    pub fn free_process_memory(&mut self, pid: ProcessId) -> usize {
        let mut reclaimed = 0;
        for slot in self.map.iter_mut() {
            if let Some(entry) = slot.filter(|entry| entry.owner == Owner::Process(pid)) {
                reclaimed += usize::from(entry.size);
                *slot = None;
            }
        }
        if reclaimed > 0 {
            log::debug!("heap {}: reclaimed {} bytes of process {}", self.name, reclaimed, pid);
        }
        reclaimed
    }

    /// Resize the chunk containing `addr` and return its (possibly new)
    /// start. Tried in order: shrink, grow into the following gap, slide
    /// down into the preceding gap, move elsewhere. Contents up to the old
    /// size are preserved. On failure the chunk is left untouched.
    pub fn resize(&mut self, addr: MemAddr, new_size: u16, requester: ProcessId) -> KernelResult<MemAddr> {
        let (slot, entry) = self.lookup(addr)?;
        if entry.owner != Owner::Process(requester) {
            return Err(KernelError::NotOwner);
        }
        if new_size == 0 {
            return Err(KernelError::OutOfMemory);
        }

        let wanted = u32::from(new_size);
        let size = u32::from(entry.size);
        let regions = self.free_regions();
        let before = regions
            .iter()
            .find(|region| region.end() == u32::from(entry.addr))
            .map_or(0, |region| u32::from(region.size));
        let after = regions
            .iter()
            .find(|region| u32::from(region.addr) == entry.end())
            .map_or(0, |region| u32::from(region.size));

        let target = if wanted <= size + after {
            entry.addr
        } else if wanted <= before + size + after {
            let target = entry.addr - before as MemAddr;
            self.copy(entry.addr, target, entry.size);
            target
        } else {
            let target = self
                .strategy
                .select(&regions, new_size, self.cursor)
                .ok_or(KernelError::OutOfMemory)?;
            self.copy(entry.addr, target, entry.size);
            self.advance_cursor(target, new_size);
            target
        };

        self.map[slot] = Some(MapEntry {
            addr: target,
            size: new_size,
            owner: entry.owner,
        });
        Ok(target)
    }

    /// Overlap-safe byte move inside the use area
    fn copy(&mut self, from: MemAddr, to: MemAddr, len: u16) {
        if from == to {
            return;
        }
        if to < from {
            for i in 0..len {
                let value = self.load(from + i);
                self.store(to + i, value);
            }
        } else {
            for i in (0..len).rev() {
                let value = self.load(from + i);
                self.store(to + i, value);
            }
        }
    }

    fn load(&self, addr: MemAddr) -> MemValue {
        self.driver.read(addr - self.use_start)
    }

    fn store(&mut self, addr: MemAddr, value: MemValue) {
        self.driver.write(addr - self.use_start, value);
    }

    /// Chunk and start address of an access of `len` bytes at
    /// `addr + offset`, which has to stay inside the chunk containing `addr`.
    fn span(&self, addr: MemAddr, offset: u16, len: usize) -> KernelResult<(usize, MapEntry, MemAddr)> {
        let (slot, entry) = self.lookup(addr)?;
        let start = u32::from(addr) + u32::from(offset);
        if start + len as u32 > entry.end() {
            return Err(KernelError::OutOfBounds);
        }
        Ok((slot, entry, start as MemAddr))
    }

    pub fn read_bytes(&self, addr: MemAddr, offset: u16, buf: &mut [MemValue]) -> KernelResult<()> {
        let (_, _, start) = self.span(addr, offset, buf.len())?;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.load(start + i as MemAddr);
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, addr: MemAddr, offset: u16, data: &[MemValue]) -> KernelResult<()> {
        let (_, _, start) = self.span(addr, offset, data.len())?;
        for (i, byte) in data.iter().enumerate() {
            self.store(start + i as MemAddr, *byte);
        }
        Ok(())
    }

    /// Allocate a chunk owned by no process. It starts closed.
    pub fn sh_allocate(&mut self, size: u16) -> KernelResult<MemAddr> {
        self.place(size, Owner::Shared(SharedState::Closed))
    }

    /// Slot and state of the shared chunk containing `addr`. Private chunks
    /// are refused with `NotOwner`.
    fn shared(&self, addr: MemAddr) -> KernelResult<(usize, SharedState)> {
        match self.lookup(addr)? {
            (slot, MapEntry { owner: Owner::Shared(state), .. }) => Ok((slot, state)),
            _ => Err(KernelError::NotOwner),
        }
    }

    fn set_shared(&mut self, slot: usize, state: SharedState) {
        if let Some(entry) = self.map[slot].as_mut() {
            entry.owner = Owner::Shared(state);
        }
    }

    /// Open for reading. `WouldBlock` while a writer holds the chunk or all
    /// reader slots are taken.
    pub fn sh_read_open(&mut self, addr: MemAddr) -> KernelResult<()> {
        let (slot, state) = self.shared(addr)?;
        let next = match state {
            SharedState::Closed => SharedState::Reading(1),
            SharedState::Reading(readers) if readers < MAX_SHARED_READERS => SharedState::Reading(readers + 1),
            _ => return Err(KernelError::WouldBlock),
        };
        self.set_shared(slot, next);
        Ok(())
    }

    /// Open for exclusive writing. `WouldBlock` unless closed.
    pub fn sh_write_open(&mut self, addr: MemAddr) -> KernelResult<()> {
        let (slot, state) = self.shared(addr)?;
        if state != SharedState::Closed {
            return Err(KernelError::WouldBlock);
        }
        self.set_shared(slot, SharedState::Writing);
        Ok(())
    }

    pub fn sh_close(&mut self, addr: MemAddr) -> KernelResult<()> {
        let (slot, state) = self.shared(addr)?;
        let next = match state {
            SharedState::Closed => return Err(KernelError::NotOpen),
            SharedState::Reading(readers) if readers > 1 => SharedState::Reading(readers - 1),
            SharedState::Reading(_) | SharedState::Writing => SharedState::Closed,
        };
        self.set_shared(slot, next);
        Ok(())
    }

    /// Open, read and close in one step.
    pub fn sh_read(&mut self, addr: MemAddr, offset: u16, buf: &mut [MemValue]) -> KernelResult<()> {
        self.span(addr, offset, buf.len())?;
        self.sh_read_open(addr)?;
        let result = self.read_bytes(addr, offset, buf);
        self.sh_close(addr)?;
        result
    }

    /// Open, write and close in one step.
    pub fn sh_write(&mut self, addr: MemAddr, offset: u16, data: &[MemValue]) -> KernelResult<()> {
        self.span(addr, offset, data.len())?;
        self.sh_write_open(addr)?;
        let result = self.write_bytes(addr, offset, data);
        self.sh_close(addr)?;
        result
    }

    /// Release a closed shared chunk.
    pub fn sh_free(&mut self, addr: MemAddr) -> KernelResult<()> {
        let (slot, state) = self.shared(addr)?;
        if state != SharedState::Closed {
            return Err(KernelError::WouldBlock);
        }
        self.map[slot] = None;
        Ok(())
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Heap")
            .field("name", &self.name)
            .field("use_start", &self.use_start)
            .field("use_size", &self.use_size)
            .field("strategy", &self.strategy)
            .field("chunks", &self.chunks())
            .finish()
    }
}
