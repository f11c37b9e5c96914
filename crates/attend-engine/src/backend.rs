//! Execution backends.
//!
//! Lowering only produces text. A [`KernelBackend`] turns that text into a
//! [`LoadedModule`]: one forward entry point plus, when the source carries
//! one, the block-mask artifact that must be passed as the trailing
//! argument of every launch.

use std::sync::Arc;

use crate::error::Result;
use crate::lower::BlockMask;
use crate::tensor::HostTensor;

/// One launch argument.
#[derive(Clone, Copy, Debug)]
pub enum KernelArg<'a> {
    Tensor(&'a HostTensor),
    BlockMask(&'a BlockMask),
}

/// A loaded forward entry point.
pub trait AttentionKernel: Send + Sync {
    /// Symbol name of the entry point.
    fn entry(&self) -> &str;

    /// Run the kernel. Arguments are the attention inputs, the custom
    /// tensors in declaration order and, last, the block mask if the
    /// module has one. Returns the attention output.
    fn launch(&self, args: &[KernelArg<'_>]) -> Result<HostTensor>;
}

/// Result of loading one generated source.
#[derive(Clone)]
pub struct LoadedModule {
    pub forward: Arc<dyn AttentionKernel>,
    pub block_mask: Option<BlockMask>,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("entry", &self.forward.entry())
            .field("block_mask", &self.block_mask.as_ref().map(|m| m.active_count()))
            .finish()
    }
}

/// Compiles or interprets generated kernel source.
pub trait KernelBackend: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, source: &str) -> Result<LoadedModule>;
}
