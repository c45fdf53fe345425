//! Signal masking around journal writes.

use nix::sys::signal::{SigSet, SigmaskHow, pthread_sigmask};

/// Blocks every signal on the current thread until dropped.
///
/// A handler interrupting a spool append could otherwise leave a record
/// half-written. The previous mask is restored on drop.
#[derive(Debug)]
pub(crate) struct SignalMask {
    previous: Option<SigSet>,
}

impl SignalMask {
    pub(crate) fn block_all() -> Self {
        let mut previous = SigSet::empty();
        match pthread_sigmask(
            SigmaskHow::SIG_SETMASK,
            Some(&SigSet::all()),
            Some(&mut previous),
        ) {
            Ok(()) => Self {
                previous: Some(previous),
            },
            Err(err) => {
                tracing::warn!(error = %err, "cannot mask signals around journal write");
                Self { previous: None }
            }
        }
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take()
            && let Err(err) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)
        {
            tracing::warn!(error = %err, "cannot restore signal mask");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn mask_is_restored_on_drop() {
        let before = SigSet::thread_get_mask().unwrap_or_else(|_| SigSet::empty());
        {
            let _mask = SignalMask::block_all();
            let during = SigSet::thread_get_mask().unwrap_or_else(|_| SigSet::empty());
            assert!(during.contains(Signal::SIGINT));
            assert!(during.contains(Signal::SIGTERM));
        }
        let after = SigSet::thread_get_mask().unwrap_or_else(|_| SigSet::empty());
        assert_eq!(
            before.contains(Signal::SIGINT),
            after.contains(Signal::SIGINT)
        );
    }
}
