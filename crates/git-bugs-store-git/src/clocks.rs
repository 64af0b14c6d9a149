use anyhow::Context;
use git_bugs_core::{LamportClock, StoreError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const BUG_CREATE: &str = "bug-create";
const BUG_EDIT: &str = "bug-edit";

/// Lamport clocks persisted as decimal text files.
pub struct Clocks {
    dir: PathBuf,
    pub bug_create: LamportClock,
    pub bug_edit: LamportClock,
}

impl Clocks {
    pub fn load(dir: PathBuf) -> Result<Self, StoreError> {
        let bug_create = read_clock(&dir.join(BUG_CREATE))?;
        let bug_edit = read_clock(&dir.join(BUG_EDIT))?;
        Ok(Self {
            dir,
            bug_create,
            bug_edit,
        })
    }

    pub fn save(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        fs::write(self.dir.join(BUG_CREATE), self.bug_create.time().to_string())?;
        fs::write(self.dir.join(BUG_EDIT), self.bug_edit.time().to_string())?;
        Ok(())
    }
}

fn read_clock(path: &Path) -> Result<LamportClock, StoreError> {
    match fs::read_to_string(path) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(LamportClock::new)
            .map_err(|err| StoreError::Corrupt {
                reference: path.display().to_string(),
                reason: format!("invalid clock value: {err}"),
            }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(LamportClock::default()),
        Err(err) => Err(err.into()),
    }
}
