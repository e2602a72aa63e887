//! LIFO stack of cleanup jobs.
//!
//! Every resource acquired by a lifecycle action (mounts, loop devices,
//! temporary files) pushes its release job here right after it is acquired.
//! The stack is drained exactly once, on success and on failure.

use crate::errors::{CairnError, ErrorKind, Result};

pub type CleanJob<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

#[derive(Default)]
pub struct CleanStack<'a> {
    jobs: Vec<CleanJob<'a>>,
}

impl<'a> CleanStack<'a> {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    pub fn push<F>(&mut self, job: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.jobs.push(Box::new(job));
    }

    pub fn pop(&mut self) -> Option<CleanJob<'a>> {
        self.jobs.pop()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every job, most recently pushed first.
    ///
    /// All jobs run even when some fail. A failed `result` is returned with
    /// the cleanup failures attached as context, so its kind is preserved.
    /// Cleanup failures after a successful run are reported as
    /// [`ErrorKind::Cleanup`].
    pub fn cleanup<T>(&mut self, result: Result<T>) -> Result<T> {
        let mut failures = Vec::new();
        while let Some(job) = self.jobs.pop() {
            if let Err(e) = job() {
                log::warn!("cleanup job failed: {:#}", e);
                failures.push(format!("{e:#}"));
            }
        }

        if failures.is_empty() {
            return result;
        }
        let summary = failures.join("; ");
        match result {
            Ok(_) => Err(anyhow::Error::new(CairnError::with_detail(
                ErrorKind::Cleanup,
                summary,
            ))),
            Err(e) => Err(e.context(format!("cleanup also failed: {summary}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{err, kind_of};
    use std::cell::RefCell;

    #[test]
    fn jobs_run_in_reverse_order() {
        let order = RefCell::new(Vec::new());
        let mut stack = CleanStack::new();
        for name in ["A", "B", "C"] {
            let order = &order;
            stack.push(move || {
                order.borrow_mut().push(name);
                Ok(())
            });
        }
        stack.cleanup(Ok(())).unwrap();
        assert_eq!(*order.borrow(), vec!["C", "B", "A"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn failing_job_does_not_stop_the_others() {
        let order = RefCell::new(Vec::new());
        let mut stack = CleanStack::new();
        stack.push(|| {
            order.borrow_mut().push("A");
            Ok(())
        });
        stack.push(|| {
            order.borrow_mut().push("B");
            Err(anyhow::anyhow!("B failed"))
        });
        stack.push(|| {
            order.borrow_mut().push("C");
            Ok(())
        });

        let e = stack.cleanup(Ok(())).unwrap_err();
        assert_eq!(*order.borrow(), vec!["C", "B", "A"]);
        assert_eq!(kind_of(&e), Some(ErrorKind::Cleanup));
        assert!(e.to_string().contains("B failed"));
    }

    #[test]
    fn original_error_is_preserved() {
        let mut stack = CleanStack::new();
        stack.push(|| Err(anyhow::anyhow!("umount failed")));
        let result: Result<()> = Err(err(ErrorKind::MountPartitions, "/run/cos/oem"));

        let e = stack.cleanup(result).unwrap_err();
        assert_eq!(kind_of(&e), Some(ErrorKind::MountPartitions));
        let chain = format!("{e:#}");
        assert!(chain.contains("umount failed"));
        assert!(chain.contains("/run/cos/oem"));
    }

    #[test]
    fn successful_cleanup_returns_value() {
        let mut stack = CleanStack::new();
        stack.push(|| Ok(()));
        assert_eq!(stack.cleanup(Ok(7)).unwrap(), 7);
    }

    #[test]
    fn pop_removes_latest_job() {
        let mut stack = CleanStack::new();
        stack.push(|| Ok(()));
        stack.push(|| Err(anyhow::anyhow!("never run")));
        assert_eq!(stack.len(), 2);
        assert!(stack.pop().is_some());
        assert!(stack.cleanup(Ok(())).is_ok());
    }
}
