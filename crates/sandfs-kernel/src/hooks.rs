//! Write and path hooks.
//!
//! Hooks are registered on a path prefix and called after a change has been
//! committed and every sandbox lock released. A hook cannot undo or block the
//! change: an error or a panic becomes a [`HookWarning`] on the write's
//! outcome and a `warn!` line, and the remaining hooks still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use sandfs_types::{HookWarning, PathEvent, VfsPath, WriteEvent};

/// Observer of committed writes and appends.
pub trait WriteHook: Send + Sync {
    fn on_write(&self, event: &WriteEvent) -> anyhow::Result<()>;
}

impl<F> WriteHook for F
where
    F: Fn(&WriteEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_write(&self, event: &WriteEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Observer of file creation, update and deletion.
pub trait PathHook: Send + Sync {
    fn on_event(&self, event: &PathEvent) -> anyhow::Result<()>;
}

impl<F> PathHook for F
where
    F: Fn(&PathEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &PathEvent) -> anyhow::Result<()> {
        self(event)
    }
}

type Registered<H> = Vec<(VfsPath, Arc<H>)>;

/// Hooks in registration order.
#[derive(Default)]
pub(crate) struct HookRegistry {
    write: RwLock<Registered<dyn WriteHook>>,
    path: RwLock<Registered<dyn PathHook>>,
}

impl HookRegistry {
    pub(crate) fn add_write(&self, prefix: VfsPath, hook: Arc<dyn WriteHook>) {
        match self.write.write() {
            Ok(mut hooks) => hooks.push((prefix, hook)),
            Err(poisoned) => poisoned.into_inner().push((prefix, hook)),
        }
    }

    pub(crate) fn add_path(&self, prefix: VfsPath, hook: Arc<dyn PathHook>) {
        match self.path.write() {
            Ok(mut hooks) => hooks.push((prefix, hook)),
            Err(poisoned) => poisoned.into_inner().push((prefix, hook)),
        }
    }

    /// Run every matching write hook, collecting failures.
    pub(crate) fn dispatch_write(&self, event: &WriteEvent) -> Vec<HookWarning> {
        let matching = matching(&self.write, &event.path);
        let mut warnings = Vec::new();
        for (prefix, hook) in matching {
            let result = catch_unwind(AssertUnwindSafe(|| hook.on_write(event)));
            if let Some(message) = failure_message(result) {
                tracing::warn!(hook = %prefix, path = %event.path, "write hook failed: {}", message);
                warnings.push(HookWarning {
                    hook_prefix: prefix,
                    path: event.path.clone(),
                    message,
                });
            }
        }
        warnings
    }

    /// Run every matching path hook. Failures are logged only.
    pub(crate) fn dispatch_path(&self, event: &PathEvent) {
        for (prefix, hook) in matching(&self.path, &event.path) {
            let result = catch_unwind(AssertUnwindSafe(|| hook.on_event(event)));
            if let Some(message) = failure_message(result) {
                tracing::warn!(
                    hook = %prefix,
                    path = %event.path,
                    kind = %event.kind,
                    "path hook failed: {}",
                    message
                );
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let no_write = self.write.read().map(|h| h.is_empty()).unwrap_or(false);
        let no_path = self.path.read().map(|h| h.is_empty()).unwrap_or(false);
        no_write && no_path
    }
}

/// Snapshot of the hooks whose prefix covers `path`, taken so that the
/// registry lock is not held while hooks run.
fn matching<H: ?Sized>(hooks: &RwLock<Registered<H>>, path: &VfsPath) -> Registered<H> {
    let guard = match hooks.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard
        .iter()
        .filter(|(prefix, _)| path.starts_with(prefix))
        .map(|(prefix, hook)| (prefix.clone(), Arc::clone(hook)))
        .collect()
}

fn failure_message(result: std::thread::Result<anyhow::Result<()>>) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{err:#}")),
        Err(payload) => Some(match payload.downcast::<String>() {
            Ok(msg) => format!("panicked: {msg}"),
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(msg) => format!("panicked: {msg}"),
                Err(_) => "panicked".to_string(),
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::SystemTime;

    fn event(path: &str) -> WriteEvent {
        WriteEvent {
            path: VfsPath::parse(path).unwrap(),
            content: b"x".to_vec(),
            version: 1,
            timestamp: SystemTime::now(),
            append: false,
        }
    }

    #[test]
    fn only_matching_prefixes_fire() {
        let registry = HookRegistry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let hook = move |e: &WriteEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(e.path.to_string());
            Ok(())
        };
        registry.add_write(VfsPath::parse("/blue").unwrap(), Arc::new(hook));

        registry.dispatch_write(&event("/blue/a"));
        registry.dispatch_write(&event("/bluey/a"));
        registry.dispatch_write(&event("/red/a"));

        assert_eq!(*seen.lock().unwrap(), vec!["/blue/a".to_string()]);
    }

    #[test]
    fn errors_and_panics_become_warnings() {
        let registry = HookRegistry::default();
        let failing = |_: &WriteEvent| -> anyhow::Result<()> { anyhow::bail!("disk full") };
        let panicking = |_: &WriteEvent| -> anyhow::Result<()> { panic!("boom") };
        let fine = |_: &WriteEvent| -> anyhow::Result<()> { Ok(()) };
        registry.add_write(VfsPath::root(), Arc::new(failing));
        registry.add_write(VfsPath::root(), Arc::new(panicking));
        registry.add_write(VfsPath::root(), Arc::new(fine));

        let warnings = registry.dispatch_write(&event("/a.txt"));

        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].message, "disk full");
        assert!(warnings[1].message.contains("boom"));
    }
}
