//! 仓库会话缓存：project_id → 本地克隆目录
//!
//! 每个 project_id 一把 tokio Mutex：同一项目的克隆 / 复用判断 / 重新同步互斥，
//! 并发请求者等待同一次克隆的结果；不同项目之间互不阻塞。
//! 克隆失败不会留下会话记录，半成品目录被删除。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::core::CloneError;
use crate::repo::RepoCloner;

/// 一个项目的克隆检出
#[derive(Debug, Clone, PartialEq)]
pub struct RepoSession {
    pub project_id: String,
    pub local_path: PathBuf,
    pub remote_url: String,
    pub head_commit: String,
    /// 最近一次克隆或同步的时间
    pub synced_at: Instant,
}

impl RepoSession {
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.map(|ttl| self.synced_at.elapsed() > ttl).unwrap_or(false)
    }
}

type Slot = Arc<Mutex<Option<RepoSession>>>;

/// 会话缓存
pub struct SessionCache {
    workspace_root: PathBuf,
    ttl: Option<Duration>,
    cloner: Arc<dyn RepoCloner>,
    slots: RwLock<HashMap<String, Slot>>,
}

impl SessionCache {
    /// ttl 为 None 时会话永不过期
    pub fn new(
        workspace_root: impl AsRef<Path>,
        cloner: Arc<dyn RepoCloner>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            ttl: ttl.filter(|t| !t.is_zero()),
            cloner,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// 项目的检出目录（由 project_id 派生）
    ///
    /// `[A-Za-z0-9-]` 原样保留，其余字节编码为 `_xx`（含 `_` 本身），不同 id 不会落到同一目录。
    pub fn session_dir(&self, project_id: &str) -> PathBuf {
        if project_id.is_empty() {
            return self.workspace_root.join("_");
        }
        let mut name = String::with_capacity(project_id.len());
        for b in project_id.bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' {
                name.push(char::from(b));
            } else {
                name.push_str(&format!("_{b:02x}"));
            }
        }
        self.workspace_root.join(name)
    }

    async fn slot(&self, project_id: &str) -> Slot {
        if let Some(slot) = self.slots.read().await.get(project_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(project_id.to_string()).or_default())
    }

    async fn is_valid(&self, session: &RepoSession, remote_url: &str) -> bool {
        session.remote_url == remote_url
            && session.local_path.is_dir()
            && !session.is_expired(self.ttl)
            && self.cloner.verify(&session.local_path, &session.head_commit).await
    }

    async fn clone_into_slot(
        &self,
        guard: &mut Option<RepoSession>,
        project_id: &str,
        remote_url: &str,
    ) -> Result<RepoSession, CloneError> {
        let dest = self.session_dir(project_id);
        let head_commit = match self.cloner.clone_repo(remote_url, &dest).await {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(project_id, url = remote_url, error = %e, "clone failed");
                if let Err(rm) = tokio::fs::remove_dir_all(&dest).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(dest = %dest.display(), error = %rm, "failed to clean up clone directory");
                    }
                }
                return Err(e);
            }
        };

        let session = RepoSession {
            project_id: project_id.to_string(),
            local_path: dest,
            remote_url: remote_url.to_string(),
            head_commit,
            synced_at: Instant::now(),
        };
        tracing::info!(
            project_id,
            head = %session.head_commit,
            path = %session.local_path.display(),
            "repository session created"
        );
        *guard = Some(session.clone());
        Ok(session)
    }

    /// 返回项目的有效检出；缺失或失效时克隆一次
    pub async fn get_or_create(
        &self,
        project_id: &str,
        remote_url: &str,
    ) -> Result<RepoSession, CloneError> {
        let slot = self.slot(project_id).await;
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.as_ref() {
            if self.is_valid(existing, remote_url).await {
                tracing::debug!(project_id, "reusing repository session");
                return Ok(existing.clone());
            }
            tracing::info!(project_id, "repository session is stale, recloning");
            *guard = None;
        }

        self.clone_into_slot(&mut guard, project_id, remote_url).await
    }

    /// 拉取远端最新提交；没有会话时等同于 get_or_create
    pub async fn resync(
        &self,
        project_id: &str,
        remote_url: &str,
    ) -> Result<RepoSession, CloneError> {
        let slot = self.slot(project_id).await;
        let mut guard = slot.lock().await;

        let current = guard
            .as_ref()
            .filter(|s| s.remote_url == remote_url && s.local_path.is_dir())
            .cloned();
        match current {
            Some(mut session) => match self.cloner.update(remote_url, &session.local_path).await {
                Ok(head) => {
                    tracing::info!(project_id, old = %session.head_commit, new = %head, "repository session resynced");
                    session.head_commit = head;
                    session.synced_at = Instant::now();
                    *guard = Some(session.clone());
                    Ok(session)
                }
                Err(e) => {
                    tracing::warn!(project_id, error = %e, "resync failed, recloning");
                    *guard = None;
                    self.clone_into_slot(&mut guard, project_id, remote_url).await
                }
            },
            None => {
                *guard = None;
                self.clone_into_slot(&mut guard, project_id, remote_url).await
            }
        }
    }

    /// 删除项目的检出；返回是否存在会话
    pub async fn remove(&self, project_id: &str) -> Result<bool, CloneError> {
        let slot = self.slot(project_id).await;
        let mut guard = slot.lock().await;
        let Some(session) = guard.take() else {
            return Ok(false);
        };
        match tokio::fs::remove_dir_all(&session.local_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CloneError::Io {
                    url: session.remote_url,
                    source: e,
                })
            }
        }
        tracing::info!(project_id, "repository session removed");
        Ok(true)
    }

    /// 删除所有过期会话的检出，返回删除数量
    pub async fn cleanup_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let slots: Vec<(String, Slot)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut removed = 0;
        for (project_id, slot) in slots {
            let mut guard = slot.lock().await;
            let expired = guard.as_ref().map(|s| s.is_expired(Some(ttl))).unwrap_or(false);
            if !expired {
                continue;
            }
            if let Some(session) = guard.take() {
                if let Err(e) = tokio::fs::remove_dir_all(&session.local_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(project_id = %project_id, error = %e, "failed to remove expired checkout");
                    }
                }
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "expired repository sessions cleaned up");
        }
        removed
    }

    /// 当前会话快照；正在克隆 / 同步的项目不计入
    pub async fn sessions(&self) -> Vec<RepoSession> {
        let slots = self.slots.read().await;
        let mut out: Vec<RepoSession> = slots
            .values()
            .filter_map(|slot| slot.try_lock().ok().and_then(|g| g.as_ref().cloned()))
            .collect();
        out.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        out
    }
}
