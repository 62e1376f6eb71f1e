//! 仓库克隆后端
//!
//! RepoCloner 抽象 clone / verify / update 三个动作，SessionCache 只依赖该 trait。
//! GitCliCloner 调用本机 git：浅克隆（--depth）、单分支、带超时；失败时清理半成品目录。

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::core::CloneError;

/// 解析后的仓库地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUrl {
    /// 交给 git clone 的地址
    pub clone_url: String,
    /// `/tree/<branch>` 指定的分支
    pub branch: Option<String>,
    /// 仓库名（用于展示）
    pub name: String,
}

/// 解析用户给出的仓库地址
///
/// GitHub 网页地址（可带 `.git` 或 `/tree/<branch>` 后缀）被规范化为 https 克隆地址；
/// 其它 git 地址（ssh、file、普通 https）原样使用。
pub fn parse_repo_url(url: &str) -> Result<RepoUrl, CloneError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(CloneError::InvalidUrl("empty url".to_string()));
    }
    if url.starts_with('-') || url.chars().any(char::is_whitespace) {
        return Err(CloneError::InvalidUrl(url.to_string()));
    }

    let github = Regex::new(
        r"^(?:https?://)?(?:www\.)?github\.com/([^/\s]+)/([^/\s#?]+?)(?:\.git)?(?:/tree/([^\s#?]+?))?/?(?:[#?].*)?$",
    )
    .map_err(|e| CloneError::InvalidUrl(e.to_string()))?;

    if let Some(caps) = github.captures(url) {
        let owner = &caps[1];
        let repo = &caps[2];
        return Ok(RepoUrl {
            clone_url: format!("https://github.com/{owner}/{repo}.git"),
            branch: caps.get(3).map(|m| m.as_str().to_string()),
            name: repo.to_string(),
        });
    }

    let name = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .map(|s| s.trim_end_matches(".git"))
        .filter(|s| !s.is_empty())
        .unwrap_or("repo")
        .to_string();

    Ok(RepoUrl {
        clone_url: url.to_string(),
        branch: None,
        name,
    })
}

/// 克隆后端
#[async_trait]
pub trait RepoCloner: Send + Sync {
    /// 将 url 克隆到 dest（dest 已存在时先删除），返回 head commit
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<String, CloneError>;

    /// dest 仍是有效的检出，且其 HEAD 等于 head_commit 或为其后代
    async fn verify(&self, dest: &Path, head_commit: &str) -> bool;

    /// 拉取远端最新提交并重置检出，返回新的 head commit
    async fn update(&self, url: &str, dest: &Path) -> Result<String, CloneError>;
}

/// 调用 git 命令行的克隆后端
#[derive(Debug, Clone)]
pub struct GitCliCloner {
    depth: u32,
    timeout: Duration,
}

impl Default for GitCliCloner {
    fn default() -> Self {
        Self::new(1, 300)
    }
}

impl GitCliCloner {
    pub fn new(depth: u32, timeout_secs: u64) -> Self {
        Self {
            depth: depth.max(1),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    async fn run_git(&self, url: &str, args: &[&str], cwd: Option<&Path>) -> Result<Output, CloneError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CloneError::Failed {
                url: url.to_string(),
                cause: format!("git {} timed out after {}s", args[0], self.timeout.as_secs()),
            })?
            .map_err(|e| CloneError::Io {
                url: url.to_string(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CloneError::Failed {
                url: url.to_string(),
                cause: format!("git {} exited with {}: {}", args[0], output.status, stderr.trim()),
            });
        }
        Ok(output)
    }

    async fn head_commit(&self, url: &str, dest: &Path) -> Result<String, CloneError> {
        let out = self.run_git(url, &["rev-parse", "HEAD"], Some(dest)).await?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

async fn remove_dir_if_exists(url: &str, dir: &Path) -> Result<(), CloneError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CloneError::Io {
            url: url.to_string(),
            source: e,
        }),
    }
}

#[async_trait]
impl RepoCloner for GitCliCloner {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<String, CloneError> {
        let target = parse_repo_url(url)?;
        remove_dir_if_exists(url, dest).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CloneError::Io {
                    url: url.to_string(),
                    source: e,
                })?;
        }

        let depth = self.depth.to_string();
        let dest_str = dest.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec!["clone", "--depth", &depth, "--single-branch"];
        if let Some(branch) = target.branch.as_deref() {
            args.push("--branch");
            args.push(branch);
        }
        args.push("--");
        args.push(&target.clone_url);
        args.push(&dest_str);

        tracing::info!(url = %target.clone_url, branch = ?target.branch, dest = %dest.display(), "cloning repository");
        let result = match self.run_git(url, &args, None).await {
            Ok(_) => self.head_commit(url, dest).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(e) = remove_dir_if_exists(url, dest).await {
                tracing::warn!(error = %e, dest = %dest.display(), "failed to remove partial clone");
            }
        }
        result
    }

    async fn verify(&self, dest: &Path, head_commit: &str) -> bool {
        if !dest.join(".git").exists() {
            return false;
        }
        let Ok(current) = self.head_commit("", dest).await else {
            return false;
        };
        if current == head_commit {
            return true;
        }
        self.run_git("", &["merge-base", "--is-ancestor", head_commit, "HEAD"], Some(dest))
            .await
            .is_ok()
    }

    async fn update(&self, url: &str, dest: &Path) -> Result<String, CloneError> {
        let depth = self.depth.to_string();
        self.run_git(url, &["fetch", "--depth", &depth, "origin"], Some(dest))
            .await?;
        self.run_git(url, &["reset", "--hard", "FETCH_HEAD"], Some(dest))
            .await?;
        self.head_commit(url, dest).await
    }
}
