use super::handle::Binding;

/// One binding undone by [`UnwindStack::unwind`].
#[derive(Debug)]
pub struct Unwound<T> {
    pub tag: T,
    pub binding: Binding,
    /// Error returned by the release, if it failed.
    pub error: Option<String>,
}

/// Ordered record of bindings established during one batch.
///
/// Entries are either drained in push order (to commit them) or unwound in
/// reverse order (to undo them after a failure).
#[derive(Debug)]
pub struct UnwindStack<T> {
    entries: Vec<(T, Binding)>,
}

impl<T> Default for UnwindStack<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> UnwindStack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tag: T, binding: Binding) {
        self.entries.push((tag, binding));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every entry in push order, leaving the stack empty.
    pub fn drain(&mut self) -> Vec<(T, Binding)> {
        std::mem::take(&mut self.entries)
    }

    /// Take the entries matching `keep`, in push order.
    pub fn drain_where(&mut self, mut keep: impl FnMut(&T) -> bool) -> Vec<(T, Binding)> {
        let (taken, rest): (Vec<_>, Vec<_>) = self.drain().into_iter().partition(|(tag, _)| keep(tag));
        self.entries = rest;
        taken
    }

    /// Close every binding, newest first. Every release is attempted even
    /// when an earlier one fails.
    pub async fn unwind(&mut self) -> Vec<Unwound<T>> {
        let mut undone = Vec::with_capacity(self.entries.len());
        while let Some((tag, binding)) = self.entries.pop() {
            let error = binding.close().await.err().map(|e| format!("{e:#}"));
            if let Some(err) = &error {
                tracing::warn!(request = %binding.request, error = %err, "unwind release failed");
            }
            undone.push(Unwound { tag, binding, error });
        }
        undone
    }
}

/// Collapse the failures of an unwind into a single error, if there were any.
pub fn aggregate<T>(undone: &[Unwound<T>]) -> Option<anyhow::Error> {
    let failures: Vec<String> = undone
        .iter()
        .filter_map(|u| u.error.as_ref().map(|e| format!("{}: {e}", u.binding.request)))
        .collect();
    if failures.is_empty() {
        None
    } else {
        Some(anyhow::anyhow!("{} release(s) failed: {}", failures.len(), failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::binding::{Address, HostRequest, ReleaseHandle};

    fn recording_binding(path: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Binding {
        let log = log.clone();
        let name = path.to_string();
        let request = HostRequest::new(Address::host_path(path).unwrap());
        Binding::new(
            request,
            ReleaseHandle::new(move || async move {
                log.lock().unwrap().push(name);
                if fail { Err(anyhow::anyhow!("busy")) } else { Ok(()) }
            }),
        )
    }

    #[tokio::test]
    async fn test_unwind_is_lifo_and_attempts_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = UnwindStack::new();
        stack.push(1, recording_binding("/a", &log, false));
        stack.push(2, recording_binding("/b", &log, true));
        stack.push(3, recording_binding("/c", &log, false));

        let undone = stack.unwind().await;
        assert!(stack.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["/c", "/b", "/a"]);
        assert_eq!(undone.iter().map(|u| u.tag).collect::<Vec<_>>(), vec![3, 2, 1]);
        assert!(undone[1].error.is_some());

        let err = aggregate(&undone).unwrap();
        assert!(err.to_string().contains("/host/b: busy"));
    }

    #[tokio::test]
    async fn test_drain_keeps_push_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = UnwindStack::new();
        stack.push("x", recording_binding("/a", &log, false));
        stack.push("y", recording_binding("/b", &log, false));
        stack.push("x", recording_binding("/c", &log, false));

        let xs = stack.drain_where(|tag| *tag == "x");
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[1].1.request.to_string(), "/host/c");
        assert_eq!(stack.len(), 1);
        assert!(log.lock().unwrap().is_empty());
        assert!(aggregate::<&str>(&[]).is_none());
    }
}
