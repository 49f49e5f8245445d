use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::{Result, RenderError};
use crate::subtitle::Word;

/// The persisted project record the pipeline reads from and reports into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    /// Source song or video reference
    pub media_url: String,
    /// Word-level transcript, once transcription has finished
    #[serde(default)]
    pub transcript: Option<Vec<Word>>,
    /// Reference to the rendered video
    #[serde(default)]
    pub final_video: Option<String>,
    #[serde(default)]
    pub render_failed: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProjectRecord {
    pub fn new<S1: Into<String>, S2: Into<String>>(id: S1, media_url: S2) -> Self {
        Self {
            id: id.into(),
            media_url: media_url.into(),
            transcript: None,
            final_video: None,
            render_failed: false,
            updated_at: None,
        }
    }

    pub fn with_transcript(mut self, words: Vec<Word>) -> Self {
        self.transcript = Some(words);
        self
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

/// Persistence collaborator. Last write wins per record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ProjectRecord>>;

    async fn save(&self, record: ProjectRecord) -> Result<()>;

    /// Record a finished render and clear any earlier failure
    async fn set_final_video(&self, id: &str, media_ref: &str) -> Result<()>;

    /// Flag the project's render as failed
    async fn set_render_failed(&self, id: &str) -> Result<()>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, ProjectRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ProjectRecord),
    {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RenderError::ProjectNotFound(id.to_string()))?;
        apply(&mut *record);
        record.touch();
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<ProjectRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn save(&self, mut record: ProjectRecord) -> Result<()> {
        record.touch();
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn set_final_video(&self, id: &str, media_ref: &str) -> Result<()> {
        self.update(id, |record| {
            record.final_video = Some(media_ref.to_string());
            record.render_failed = false;
        })
    }

    async fn set_render_failed(&self, id: &str) -> Result<()> {
        self.update(id, |record| record.render_failed = true)
    }
}

/// One `<id>.json` file per project
pub struct JsonFileStore {
    dir: PathBuf,
    write_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_locks: DashMap::new(),
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        let stem: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", stem))
    }

    fn write_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        self.write_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn write_record(&self, record: &ProjectRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(&record.id);
        let temp_path = path.with_extension("json.tmp");

        fs::write(&temp_path, serde_json::to_string_pretty(record)?).await?;
        fs::rename(&temp_path, &path).await?;

        debug!("Saved project record {}", path.display());
        Ok(())
    }

    async fn update<F>(&self, id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ProjectRecord) + Send,
    {
        let lock = self.write_lock(id);
        let _guard = lock.lock().await;

        let mut record = self
            .get(id)
            .await?
            .ok_or_else(|| RenderError::ProjectNotFound(id.to_string()))?;
        apply(&mut record);
        record.touch();
        self.write_record(&record).await
    }
}

#[async_trait]
impl ProjectStore for JsonFileStore {
    async fn get(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let path = self.record_path(id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn save(&self, mut record: ProjectRecord) -> Result<()> {
        let lock = self.write_lock(&record.id);
        let _guard = lock.lock().await;

        record.touch();
        self.write_record(&record).await?;
        info!("Stored project {}", record.id);
        Ok(())
    }

    async fn set_final_video(&self, id: &str, media_ref: &str) -> Result<()> {
        let media_ref = media_ref.to_string();
        self.update(id, move |record| {
            record.final_video = Some(media_ref);
            record.render_failed = false;
        })
        .await
    }

    async fn set_render_failed(&self, id: &str) -> Result<()> {
        self.update(id, |record| record.render_failed = true).await
    }
}
