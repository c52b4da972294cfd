use crate::Pid;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// Pseudocode store. On process init the named script is copied to
/// `<dir>/<pid>.txt`; the non-blank lines are the process's instructions.
pub struct ScriptStore {
    dir: PathBuf,
    lines: HashMap<Pid, Vec<String>>,
}

impl ScriptStore {
    pub fn new(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(ScriptStore {
            dir: dir.to_path_buf(),
            lines: HashMap::new(),
        })
    }

    fn pid_path(&self, pid: Pid) -> PathBuf {
        self.dir.join(format!("{}.txt", pid))
    }

    /// Copy the source script for a pid and load its instructions. Bare
    /// names resolve inside the store directory; names carrying a path
    /// separator are used as given.
    pub fn install(&mut self, pid: Pid, script_name: &str) -> io::Result<usize> {
        let source = if script_name.contains(std::path::MAIN_SEPARATOR) {
            PathBuf::from(script_name)
        } else {
            self.dir.join(script_name)
        };
        let content = std::fs::read_to_string(&source)?;
        std::fs::write(self.pid_path(pid), &content)?;
        let count = self.load_lines(pid, &content);
        log::info!(
            "pid {} script '{}' installed with {} instructions",
            pid,
            script_name,
            count
        );
        Ok(count)
    }

    fn load_lines(&mut self, pid: Pid, content: &str) -> usize {
        let lines: Vec<String> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect();
        let count = lines.len();
        self.lines.insert(pid, lines);
        count
    }

    /// Reload the pid's instructions from its copied file.
    fn reload(&mut self, pid: Pid) -> io::Result<usize> {
        let content = std::fs::read_to_string(self.pid_path(pid))?;
        Ok(self.load_lines(pid, &content))
    }

    /// The `pc`-th instruction. Lines are reloaded lazily if this pid has
    /// none cached (e.g. Memory restarted between init and first fetch).
    pub fn line(&mut self, pid: Pid, pc: u64) -> io::Result<Option<String>> {
        if !self.lines.contains_key(&pid) {
            self.reload(pid)?;
        }
        let lines = self.lines.get(&pid).expect("lines just loaded");
        Ok(lines.get(pc as usize).cloned())
    }

    pub fn count(&self, pid: Pid) -> Option<usize> {
        self.lines.get(&pid).map(|l| l.len())
    }

    pub fn remove(&mut self, pid: Pid) {
        self.lines.remove(&pid);
        let _ = std::fs::remove_file(self.pid_path(pid));
    }
}
