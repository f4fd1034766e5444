use std::fmt;

/// The interchangeable ways of holding a loaded volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// [`crate::volume::Volume`] backed by an ndarray
    ManagedArray,
    /// One block from the global allocator
    NativeUnmanaged,
    /// Decoded through a stack scratch buffer into a boxed slice
    TransientStack,
    /// One zero-initialised block from the OS heap binding
    OsHeap,
    /// Read-only mapping of the file
    MemoryMapped,
    /// One array per z-plane
    SlicedArray,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::ManagedArray,
        StrategyKind::NativeUnmanaged,
        StrategyKind::TransientStack,
        StrategyKind::OsHeap,
        StrategyKind::MemoryMapped,
        StrategyKind::SlicedArray,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::ManagedArray => "managed-array",
            StrategyKind::NativeUnmanaged => "native-unmanaged",
            StrategyKind::TransientStack => "transient-stack",
            StrategyKind::OsHeap => "os-heap",
            StrategyKind::MemoryMapped => "memory-mapped",
            StrategyKind::SlicedArray => "sliced-array",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
