//! 持久化协作者：项目、PROJECT.md 上下文与生成产物
//!
//! 核心循环本身从不做持久化，只通过 ArtifactStore 保存产物、读取项目上下文。
//! 提供两种实现：InMemoryStore（测试 / 试运行）与 SqliteStore（rusqlite，阻塞调用放入 spawn_blocking）。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;

/// 项目生命周期：pending → scanning → ready | error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Pending,
    Scanning,
    Ready,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Scanning => "scanning",
            ProjectStatus::Ready => "ready",
            ProjectStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProjectStatus::Pending),
            "scanning" => Some(ProjectStatus::Scanning),
            "ready" => Some(ProjectStatus::Ready),
            "error" => Some(ProjectStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub repo_url: String,
    pub repo_name: String,
    pub head_commit: Option<String>,
    pub status: ProjectStatus,
    /// 映射角色产出的 PROJECT.md
    pub project_md: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 已保存的产物（生成后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub id: String,
    pub project_id: String,
    /// 产出该产物的角色，如 doc:overview、qa、storyboard
    pub role: String,
    pub content: String,
    /// 分镜的旁白合并文本（仅分镜产物有）
    pub transcript: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn create_project(&self, repo_url: &str, repo_name: &str) -> Result<Project, AgentError>;

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, AgentError>;

    /// 最新创建的在前
    async fn list_projects(&self) -> Result<Vec<Project>, AgentError>;

    async fn set_project_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> Result<(), AgentError>;

    /// 写入 PROJECT.md 与克隆时的 head commit，并将项目置为 ready
    async fn save_project_context(
        &self,
        project_id: &str,
        project_md: &str,
        head_commit: Option<&str>,
    ) -> Result<(), AgentError>;

    async fn load_project_context(&self, project_id: &str) -> Result<Option<String>, AgentError>;

    /// 返回新产物 id
    async fn save_artifact(
        &self,
        project_id: &str,
        role: &str,
        content: &str,
        transcript: Option<&str>,
    ) -> Result<String, AgentError>;

    async fn get_artifact(&self, artifact_id: &str) -> Result<Option<StoredArtifact>, AgentError>;

    /// 按创建时间先后
    async fn list_artifacts(&self, project_id: &str) -> Result<Vec<StoredArtifact>, AgentError>;
}

fn new_project(repo_url: &str, repo_name: &str) -> Project {
    Project {
        id: uuid::Uuid::new_v4().to_string(),
        repo_url: repo_url.to_string(),
        repo_name: repo_name.to_string(),
        head_commit: None,
        status: ProjectStatus::Pending,
        project_md: None,
        error_message: None,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// 内存实现
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    projects: HashMap<String, Project>,
    /// 项目 id 的创建顺序
    order: Vec<String>,
    artifacts: Vec<StoredArtifact>,
}

/// 进程内存储，进程退出即丢失
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryStore {
    async fn create_project(&self, repo_url: &str, repo_name: &str) -> Result<Project, AgentError> {
        let project = new_project(repo_url, repo_name);
        let mut state = self.state.write().await;
        state.order.push(project.id.clone());
        state.projects.insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, AgentError> {
        Ok(self.state.read().await.projects.get(project_id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, AgentError> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.projects.get(id).cloned())
            .collect())
    }

    async fn set_project_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> Result<(), AgentError> {
        let mut state = self.state.write().await;
        let project = state
            .projects
            .get_mut(project_id)
            .ok_or_else(|| AgentError::UnknownProject(project_id.to_string()))?;
        project.status = status;
        project.error_message = error_message.map(String::from);
        Ok(())
    }

    async fn save_project_context(
        &self,
        project_id: &str,
        project_md: &str,
        head_commit: Option<&str>,
    ) -> Result<(), AgentError> {
        let mut state = self.state.write().await;
        let project = state
            .projects
            .get_mut(project_id)
            .ok_or_else(|| AgentError::UnknownProject(project_id.to_string()))?;
        project.project_md = Some(project_md.to_string());
        if let Some(head) = head_commit {
            project.head_commit = Some(head.to_string());
        }
        project.status = ProjectStatus::Ready;
        project.error_message = None;
        Ok(())
    }

    async fn load_project_context(&self, project_id: &str) -> Result<Option<String>, AgentError> {
        let state = self.state.read().await;
        let project = state
            .projects
            .get(project_id)
            .ok_or_else(|| AgentError::UnknownProject(project_id.to_string()))?;
        Ok(project.project_md.clone())
    }

    async fn save_artifact(
        &self,
        project_id: &str,
        role: &str,
        content: &str,
        transcript: Option<&str>,
    ) -> Result<String, AgentError> {
        let mut state = self.state.write().await;
        if !state.projects.contains_key(project_id) {
            return Err(AgentError::UnknownProject(project_id.to_string()));
        }
        let artifact = StoredArtifact {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            transcript: transcript.map(String::from),
            created_at: Utc::now(),
        };
        let id = artifact.id.clone();
        state.artifacts.push(artifact);
        Ok(id)
    }

    async fn get_artifact(&self, artifact_id: &str) -> Result<Option<StoredArtifact>, AgentError> {
        Ok(self
            .state
            .read()
            .await
            .artifacts
            .iter()
            .find(|a| a.id == artifact_id)
            .cloned())
    }

    async fn list_artifacts(&self, project_id: &str) -> Result<Vec<StoredArtifact>, AgentError> {
        Ok(self
            .state
            .read()
            .await
            .artifacts
            .iter()
            .filter(|a| a.project_id == project_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// SQLite 实现
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id            TEXT PRIMARY KEY,
    repo_url      TEXT NOT NULL,
    repo_name     TEXT NOT NULL,
    head_commit   TEXT,
    status        TEXT NOT NULL DEFAULT 'pending',
    project_md    TEXT,
    error_message TEXT,
    created_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS artifacts (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    transcript  TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_project ON artifacts(project_id, created_at);
";

/// rusqlite 存储；连接由 Mutex 保护，所有查询在阻塞线程池中执行
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::Storage(format!("{}: {e}", parent.display())))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, AgentError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| AgentError::Storage("database connection poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| AgentError::Storage(format!("database task failed: {e}")))?
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let status: String = row.get(4)?;
    Ok(Project {
        id: row.get(0)?,
        repo_url: row.get(1)?,
        repo_name: row.get(2)?,
        head_commit: row.get(3)?,
        status: ProjectStatus::parse(&status).unwrap_or(ProjectStatus::Error),
        project_md: row.get(5)?,
        error_message: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredArtifact> {
    Ok(StoredArtifact {
        id: row.get(0)?,
        project_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        transcript: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const PROJECT_COLUMNS: &str =
    "id, repo_url, repo_name, head_commit, status, project_md, error_message, created_at";
const ARTIFACT_COLUMNS: &str = "id, project_id, role, content, transcript, created_at";

fn ensure_updated(changed: usize, project_id: &str) -> Result<(), AgentError> {
    if changed == 0 {
        Err(AgentError::UnknownProject(project_id.to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn create_project(&self, repo_url: &str, repo_name: &str) -> Result<Project, AgentError> {
        let project = new_project(repo_url, repo_name);
        let p = project.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, repo_url, repo_name, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![p.id, p.repo_url, p.repo_name, p.status.as_str(), p.created_at],
            )?;
            Ok(())
        })
        .await?;
        Ok(project)
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, AgentError> {
        let id = project_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], row_to_project).optional()?)
        })
        .await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, AgentError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at DESC, rowid DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let projects = stmt
                .query_map([], row_to_project)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(projects)
        })
        .await
    }

    async fn set_project_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> Result<(), AgentError> {
        let id = project_id.to_string();
        let error_message = error_message.map(String::from);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE projects SET status = ?1, error_message = ?2 WHERE id = ?3",
                params![status.as_str(), error_message, id],
            )?;
            ensure_updated(changed, &id)
        })
        .await
    }

    async fn save_project_context(
        &self,
        project_id: &str,
        project_md: &str,
        head_commit: Option<&str>,
    ) -> Result<(), AgentError> {
        let id = project_id.to_string();
        let project_md = project_md.to_string();
        let head_commit = head_commit.map(String::from);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE projects
                 SET project_md = ?1, head_commit = COALESCE(?2, head_commit),
                     status = 'ready', error_message = NULL
                 WHERE id = ?3",
                params![project_md, head_commit, id],
            )?;
            ensure_updated(changed, &id)
        })
        .await
    }

    async fn load_project_context(&self, project_id: &str) -> Result<Option<String>, AgentError> {
        let id = project_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<Option<String>> = conn
                .query_row(
                    "SELECT project_md FROM projects WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()?;
            row.ok_or(AgentError::UnknownProject(id))
        })
        .await
    }

    async fn save_artifact(
        &self,
        project_id: &str,
        role: &str,
        content: &str,
        transcript: Option<&str>,
    ) -> Result<String, AgentError> {
        let artifact = StoredArtifact {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            transcript: transcript.map(String::from),
            created_at: Utc::now(),
        };
        self.with_conn(move |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM projects WHERE id = ?1",
                    params![artifact.project_id],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(AgentError::UnknownProject(artifact.project_id));
            }
            conn.execute(
                "INSERT INTO artifacts (id, project_id, role, content, transcript, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    artifact.id,
                    artifact.project_id,
                    artifact.role,
                    artifact.content,
                    artifact.transcript,
                    artifact.created_at
                ],
            )?;
            Ok(artifact.id)
        })
        .await
    }

    async fn get_artifact(&self, artifact_id: &str) -> Result<Option<StoredArtifact>, AgentError> {
        let id = artifact_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], row_to_artifact).optional()?)
        })
        .await
    }

    async fn list_artifacts(&self, project_id: &str) -> Result<Vec<StoredArtifact>, AgentError> {
        let id = project_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE project_id = ?1 ORDER BY created_at, rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let artifacts = stmt
                .query_map(params![id], row_to_artifact)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(artifacts)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_lifecycle(store: &dyn ArtifactStore) {
        let project = store
            .create_project("https://github.com/acme/widget", "widget")
            .await
            .unwrap();
        assert_eq!(project.status, ProjectStatus::Pending);
        assert_eq!(store.load_project_context(&project.id).await.unwrap(), None);

        store
            .set_project_status(&project.id, ProjectStatus::Scanning, None)
            .await
            .unwrap();
        store
            .save_project_context(&project.id, "# widget\n", Some("abc123"))
            .await
            .unwrap();

        let loaded = store.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ProjectStatus::Ready);
        assert_eq!(loaded.head_commit.as_deref(), Some("abc123"));
        assert_eq!(
            store.load_project_context(&project.id).await.unwrap().as_deref(),
            Some("# widget\n")
        );

        let first = store
            .save_artifact(&project.id, "doc:overview", "# Overview\n", None)
            .await
            .unwrap();
        let second = store
            .save_artifact(&project.id, "storyboard", "{\"slides\":[]}", Some("hello"))
            .await
            .unwrap();
        assert_ne!(first, second);

        let artifacts = store.list_artifacts(&project.id).await.unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].id, first);
        assert_eq!(artifacts[1].transcript.as_deref(), Some("hello"));

        let fetched = store.get_artifact(&first).await.unwrap().unwrap();
        assert_eq!(fetched.content, "# Overview\n");
        assert!(store.get_artifact("missing").await.unwrap().is_none());
    }

    async fn exercise_unknown_project(store: &dyn ArtifactStore) {
        let err = store
            .save_artifact("nope", "qa", "answer", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownProject(_)));
        let err = store
            .set_project_status("nope", ProjectStatus::Error, Some("boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownProject(_)));
    }

    #[tokio::test]
    async fn test_in_memory_lifecycle() {
        let store = InMemoryStore::new();
        exercise_lifecycle(&store).await;
        exercise_unknown_project(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_lifecycle() {
        let store = SqliteStore::open_in_memory().unwrap();
        exercise_lifecycle(&store).await;
        exercise_unknown_project(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("onboarder.db");
        let id = {
            let store = SqliteStore::open(&path).unwrap();
            let p = store.create_project("https://example.com/r.git", "r").await.unwrap();
            store
                .set_project_status(&p.id, ProjectStatus::Error, Some("clone failed"))
                .await
                .unwrap();
            p.id
        };
        let store = SqliteStore::open(&path).unwrap();
        let p = store.get_project(&id).await.unwrap().unwrap();
        assert_eq!(p.status, ProjectStatus::Error);
        assert_eq!(p.error_message.as_deref(), Some("clone failed"));
        assert_eq!(store.list_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_projects_newest_first() {
        let store = InMemoryStore::new();
        let a = store.create_project("u1", "a").await.unwrap();
        let b = store.create_project("u2", "b").await.unwrap();
        let listed = store.list_projects().await.unwrap();
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }

    #[tokio::test]
    async fn test_records_serialize_with_timestamps() {
        let store = InMemoryStore::new();
        let project = store.create_project("https://github.com/acme/widget", "widget").await.unwrap();
        let id = store
            .save_artifact(&project.id, "storyboard", "{}", Some("narration"))
            .await
            .unwrap();
        let artifact = store.get_artifact(&id).await.unwrap().unwrap();

        let json = serde_json::to_string(&project).unwrap();
        let back: Project = serde_json::from_str(&json).unwrap();
        assert_eq!(back, project);

        let json = serde_json::to_value(&artifact).unwrap();
        assert!(json["created_at"].is_string());
        let back: StoredArtifact = serde_json::from_value(json).unwrap();
        assert_eq!(back, artifact);
    }
}
