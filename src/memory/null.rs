//! Arena that never hands out memory

use once_cell::sync::Lazy;
use std::sync::Arc;

use super::arena::{Arena, ArenaHandle, ArenaKind};
use super::info::ArenaInfo;
use super::profiler::ArenaProfiler;
use crate::error::ArenaResult;

static NULL_ARENA: Lazy<ArenaHandle> = Lazy::new(|| Arc::new(NullArena::new()));

/// Process-wide sentinel returned for slots that were never constructed
pub fn null_arena() -> ArenaHandle {
    Arc::clone(&NULL_ARENA)
}

/// Every allocation yields null and every free is ignored
#[derive(Debug)]
pub struct NullArena {
    info: ArenaInfo,
    profiler: ArenaProfiler,
}

impl NullArena {
    pub fn new() -> Self {
        NullArena {
            info: ArenaInfo::default().set_cpu_memory(),
            profiler: ArenaProfiler::new(),
        }
    }
}

impl Default for NullArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena for NullArena {
    fn try_alloc(&self, nbytes: usize) -> ArenaResult<*mut u8> {
        tracing::trace!("NullArena: refusing {} bytes", nbytes);
        Ok(std::ptr::null_mut())
    }

    fn try_free(&self, _p: *mut u8) -> ArenaResult<()> {
        Ok(())
    }

    fn arena_info(&self) -> &ArenaInfo {
        &self.info
    }

    fn kind(&self) -> ArenaKind {
        ArenaKind::Null
    }

    fn profiler(&self) -> &ArenaProfiler {
        &self.profiler
    }
}
