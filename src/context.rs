use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Callback invoked around in-container command execution. Receives the
/// command line about to run (or just finished). Errors from hooks are
/// surfaced to the caller unchanged.
pub type ExecHook = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Destination for container output lines.
#[derive(Clone)]
pub enum OutputSink {
    Stdout,
    Null,
    Capture(Arc<Mutex<Vec<String>>>),
    Channel(mpsc::UnboundedSender<String>),
}

impl OutputSink {
    /// A sink that buffers lines, plus the shared handle to read them.
    pub fn capture() -> (Self, Arc<Mutex<Vec<String>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (Self::Capture(buffer.clone()), buffer)
    }

    pub fn write_line(&self, line: &str) {
        match self {
            Self::Stdout => println!("{line}"),
            Self::Null => {}
            Self::Capture(buffer) => {
                if let Ok(mut lines) = buffer.lock() {
                    lines.push(line.to_string());
                }
            }
            Self::Channel(tx) => {
                let _ = tx.send(line.to_string());
            }
        }
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stdout => "Stdout",
            Self::Null => "Null",
            Self::Capture(_) => "Capture",
            Self::Channel(_) => "Channel",
        };
        f.write_str(name)
    }
}

/// Ambient settings for one run: who runs commands, where, where output
/// goes and which hooks fire around each exec.
#[derive(Clone)]
pub struct RunContext {
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
    pub sink: OutputSink,
    pub before_exec: Option<ExecHook>,
    pub after_exec: Option<ExecHook>,
    pub debug: bool,
    pub silent: bool,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            user: None,
            working_dir: None,
            env: Vec::new(),
            sink: OutputSink::Stdout,
            before_exec: None,
            after_exec: None,
            debug: false,
            silent: false,
        }
    }
}

impl RunContext {
    /// Copy of this context with a different user and/or directory. The
    /// env list is copied so later mutation of one context never leaks
    /// into the other.
    pub fn derive(&self, user: Option<&str>, working_dir: Option<&str>) -> Self {
        let mut ctx = self.clone();
        if let Some(user) = user {
            ctx.user = Some(user.to_string());
        }
        if let Some(dir) = working_dir {
            ctx.working_dir = Some(dir.to_string());
        }
        ctx
    }

    /// Writes a line to the sink unless the context is silent.
    pub fn emit(&self, line: &str) {
        if !self.silent {
            self.sink.write_line(line);
        }
    }

    pub fn run_before_hook(&self, command: &str) -> anyhow::Result<()> {
        match &self.before_exec {
            Some(hook) => hook(command),
            None => Ok(()),
        }
    }

    pub fn run_after_hook(&self, command: &str) -> anyhow::Result<()> {
        match &self.after_exec {
            Some(hook) => hook(command),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("user", &self.user)
            .field("working_dir", &self.working_dir)
            .field("env", &self.env.len())
            .field("sink", &self.sink)
            .field("debug", &self.debug)
            .field("silent", &self.silent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_copies_env() {
        let mut base = RunContext {
            env: vec!["A=1".to_string()],
            ..Default::default()
        };
        let derived = base.derive(Some("builder"), Some("/work"));
        base.env.push("B=2".to_string());

        assert_eq!(derived.env, vec!["A=1".to_string()]);
        assert_eq!(derived.user.as_deref(), Some("builder"));
        assert_eq!(derived.working_dir.as_deref(), Some("/work"));
    }

    #[test]
    fn silent_context_drops_output() {
        let (sink, lines) = OutputSink::capture();
        let ctx = RunContext {
            sink,
            silent: true,
            ..Default::default()
        };
        ctx.emit("hidden");
        assert!(lines.lock().unwrap().is_empty());
    }

    #[test]
    fn capture_sink_records_lines() {
        let (sink, lines) = OutputSink::capture();
        sink.write_line("one");
        sink.write_line("two");
        assert_eq!(*lines.lock().unwrap(), vec!["one", "two"]);
    }
}
