//! Post-deletion compaction

use crate::store::MemoryStores;
use crate::{Result, SenseError};
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

/// Reclaims the space of deleted rows. Called from the blocking pool.
pub trait Compactor: Send + Sync {
    fn compact(&self) -> Result<()>;

    fn name(&self) -> &str;
}

/// Runs a shell command, e.g. `nodetool garbagecollect <keyspace> <table>`
#[derive(Debug, Clone)]
pub struct CommandCompactor {
    command: String,
}

impl CommandCompactor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Compactor for CommandCompactor {
    fn compact(&self) -> Result<()> {
        info!("Running compaction command: {}", self.command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .output()
            .map_err(|e| SenseError::Persistence(format!("cannot run '{}': {}", self.command, e)))?;

        let code = output.status.code();
        if output.status.success() {
            info!("Compaction command exited with code {:?}", code);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "Compaction command exited with code {:?}: {}",
                code,
                stderr.trim()
            );
            Err(SenseError::Persistence(format!(
                "'{}' exited with code {:?}",
                self.command, code
            )))
        }
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Rewrites the snapshot file so deleted rows leave the disk
pub struct SnapshotCompactor {
    stores: MemoryStores,
    path: PathBuf,
}

impl SnapshotCompactor {
    pub fn new(stores: MemoryStores, path: impl Into<PathBuf>) -> Self {
        Self {
            stores,
            path: path.into(),
        }
    }
}

impl Compactor for SnapshotCompactor {
    fn compact(&self) -> Result<()> {
        self.stores.save(&self.path).map(|_| ())
    }

    fn name(&self) -> &str {
        "snapshot"
    }
}

/// Does nothing
#[derive(Debug, Default)]
pub struct NoopCompactor;

impl Compactor for NoopCompactor {
    fn compact(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}
