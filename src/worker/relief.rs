use crate::error::Result;
use tracing::debug;

/// A memory relief hook, run when a worker crosses its soft ceiling
pub trait MemoryRelief: Send {
    fn reclaim(&mut self) -> Result<()>;
}

/// Asks the system allocator to hand free pages back to the OS
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorTrim;

impl MemoryRelief for AllocatorTrim {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn reclaim(&mut self) -> Result<()> {
        // SAFETY: malloc_trim only inspects and shrinks glibc's own arenas.
        let released = unsafe { nix::libc::malloc_trim(0) };
        debug!("malloc_trim released memory: {}", released == 1);
        Ok(())
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn reclaim(&mut self) -> Result<()> {
        debug!("No allocator trim available on this platform");
        Ok(())
    }
}

/// Relief hook backed by a closure
pub struct ReliefFn<F>(F);

impl<F> ReliefFn<F>
where
    F: FnMut() -> Result<()> + Send,
{
    pub fn new(hook: F) -> Self {
        Self(hook)
    }
}

impl<F> MemoryRelief for ReliefFn<F>
where
    F: FnMut() -> Result<()> + Send,
{
    fn reclaim(&mut self) -> Result<()> {
        (self.0)()
    }
}

/// Runs several hooks in order, stopping at the first failure
#[derive(Default)]
pub struct ReliefChain {
    hooks: Vec<Box<dyn MemoryRelief>>,
}

impl ReliefChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: impl MemoryRelief + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn push(&mut self, hook: Box<dyn MemoryRelief>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl MemoryRelief for ReliefChain {
    fn reclaim(&mut self) -> Result<()> {
        for hook in &mut self.hooks {
            hook.reclaim()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VigilError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_allocator_trim_succeeds() {
        assert!(AllocatorTrim.reclaim().is_ok());
    }

    #[test]
    fn test_chain_runs_hooks_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let first = calls.clone();
        let second = calls.clone();

        let mut chain = ReliefChain::new()
            .with(ReliefFn::new(move || {
                assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
                Ok(())
            }))
            .with(ReliefFn::new(move || {
                assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
                Ok(())
            }));

        chain.reclaim().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_chain_stops_at_first_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut chain = ReliefChain::new()
            .with(ReliefFn::new(|| Err(VigilError::ReliefError("cache locked".to_string()))))
            .with(ReliefFn::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));

        assert!(matches!(chain.reclaim(), Err(VigilError::ReliefError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
