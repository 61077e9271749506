//! Crash diagnostics: which blocks the partition layer touched last.
//!
//! Nothing in here feeds back into control flow. The partition layer reports each erase and
//! write to a [Diagnostics] sink; the default sink keeps only the most recent of each so they can
//! be dumped after a crash or hang.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use log::trace;

/// An event reported by the partition layer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DiagEvent {
    Erase {
        logical_block: u32,
    },
    Write {
        logical_block: u32,
        physical_block: u32,
        page: u32,
    },
}

/// Something that receives [DiagEvent]s
pub trait Diagnostics: Send + Sync {
    fn record(&self, event: DiagEvent);
}

/// The last write seen by [LastOps]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LastWrite {
    pub logical_block: u32,
    pub physical_block: u32,
    pub page: u32,
}

/// What [LastOps] has seen so far
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct LastOpsSnapshot {
    pub erased: Option<u32>,
    pub written: Option<LastWrite>,
}

/// Keeps the most recent erase and write, lock-free.
///
/// The write fields are stored individually, so a snapshot taken during a write may mix two
/// events; that is acceptable for post-mortem use.
///
/// Logical block `u32::MAX` means "nothing recorded": an erase or write of that block shows up
/// in [Self::snapshot] as `None`. No partition is that large.
#[derive(Debug)]
pub struct LastOps {
    erase_lb: AtomicU32,
    write_lb: AtomicU32,
    write_pb: AtomicU32,
    write_page: AtomicU32,
}

const NONE: u32 = u32::MAX;

impl LastOps {
    pub const fn new() -> Self {
        Self {
            erase_lb: AtomicU32::new(NONE),
            write_lb: AtomicU32::new(NONE),
            write_pb: AtomicU32::new(NONE),
            write_page: AtomicU32::new(NONE),
        }
    }

    pub fn snapshot(&self) -> LastOpsSnapshot {
        let erased = Some(self.erase_lb.load(Ordering::Relaxed)).filter(|&x| x != NONE);
        let written = match self.write_lb.load(Ordering::Relaxed) {
            NONE => None,
            logical_block => Some(LastWrite {
                logical_block,
                physical_block: self.write_pb.load(Ordering::Relaxed),
                page: self.write_page.load(Ordering::Relaxed),
            }),
        };

        LastOpsSnapshot { erased, written }
    }
}

impl Default for LastOps {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics for LastOps {
    fn record(&self, event: DiagEvent) {
        trace!("{event:?}");

        match event {
            DiagEvent::Erase { logical_block } => {
                self.erase_lb.store(logical_block, Ordering::Relaxed);
            }
            DiagEvent::Write {
                logical_block,
                physical_block,
                page,
            } => {
                self.write_pb.store(physical_block, Ordering::Relaxed);
                self.write_page.store(page, Ordering::Relaxed);
                self.write_lb.store(logical_block, Ordering::Relaxed);
            }
        }
    }
}

/// The sink shared by every partition that wasn't given one of its own
pub fn process_wide() -> Arc<LastOps> {
    static LAST_OPS: OnceLock<Arc<LastOps>> = OnceLock::new();
    LAST_OPS.get_or_init(Default::default).clone()
}

/// Keeps every event, so tests can look at them
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CaptureSink(std::sync::Mutex<Vec<DiagEvent>>);

#[cfg(test)]
impl CaptureSink {
    pub(crate) fn events(&self) -> Vec<DiagEvent> {
        use crate::util::LockExt;

        self.0.locked().clone()
    }
}

#[cfg(test)]
impl Diagnostics for CaptureSink {
    fn record(&self, event: DiagEvent) {
        use crate::util::LockExt;

        self.0.locked().push(event);
    }
}

#[test]
fn test_last_ops() {
    let ops = LastOps::new();
    assert_eq!(ops.snapshot(), LastOpsSnapshot::default());

    ops.record(DiagEvent::Erase { logical_block: 7 });
    ops.record(DiagEvent::Erase { logical_block: 9 });
    assert_eq!(ops.snapshot().erased, Some(9));
    assert_eq!(ops.snapshot().written, None);

    ops.record(DiagEvent::Write {
        logical_block: 9,
        physical_block: 1033,
        page: 12,
    });
    assert_eq!(
        ops.snapshot(),
        LastOpsSnapshot {
            erased: Some(9),
            written: Some(LastWrite {
                logical_block: 9,
                physical_block: 1033,
                page: 12,
            }),
        }
    );
}

#[test]
fn test_last_ops_sentinel() {
    let ops = LastOps::new();
    ops.record(DiagEvent::Erase { logical_block: 3 });
    ops.record(DiagEvent::Erase {
        logical_block: u32::MAX,
    });
    ops.record(DiagEvent::Write {
        logical_block: u32::MAX,
        physical_block: 0,
        page: 0,
    });
    assert_eq!(ops.snapshot(), LastOpsSnapshot::default());
}

#[test]
fn test_process_wide_is_shared() {
    assert!(Arc::ptr_eq(&process_wide(), &process_wide()));
}
