//! Local filesystem backend: a plain byte copy with no transaction phases.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing as log;

use crate::error::{Error, Result};
use crate::segment::Segment;
use crate::writer::{SegmentWriter, WriteOutcome};

pub struct FileWriter {
    dir: PathBuf,
}

impl FileWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "file writer target directory is empty".to_string(),
            ));
        }
        Ok(Self { dir })
    }

    fn segment_path(&self, segment: &Segment) -> PathBuf {
        self.dir
            .join(format!("{:08}-{:.6}.ts", segment.sequence, segment.start_ts))
    }
}

#[async_trait]
impl SegmentWriter for FileWriter {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::InvalidConfig(format!("create {}: {e}", self.dir.display())))
    }

    async fn write_segment(&self, segment: &Segment) -> Result<WriteOutcome> {
        let path = self.segment_path(segment);
        tokio::fs::write(&path, &segment.buffer)
            .await
            .map_err(|e| Error::Transport(format!("write {}: {e}", path.display())))?;
        log::debug!(
            sequence = segment.sequence,
            size = segment.size(),
            path = %path.display(),
            "segment written"
        );
        Ok(WriteOutcome::Committed)
    }

    async fn uninit(&self) -> Result<()> {
        Ok(())
    }
}
