//! 运行监管：取消与时间预算
//!
//! 每次顶层动作（分析、生成文档、问答、分镜）持有一个 RunSupervisor。
//! 取消只在循环步边界生效；超过 wall-clock 预算时由后台任务触发取消。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// 单次运行的生命周期：取消令牌 + 可选时间预算
#[derive(Debug)]
pub struct RunSupervisor {
    cancel_token: CancellationToken,
}

impl RunSupervisor {
    /// 以调用方令牌的子令牌创建，调用方取消时本次运行一并取消
    pub fn new(parent: Option<&CancellationToken>) -> Self {
        let cancel_token = match parent {
            Some(p) => p.child_token(),
            None => CancellationToken::new(),
        };
        Self { cancel_token }
    }

    /// 设定时间预算；预算耗尽后令牌被取消。须在 tokio 运行时内调用
    pub fn with_budget(self, budget: Option<Duration>) -> Self {
        if let Some(budget) = budget.filter(|b| !b.is_zero()) {
            let token = self.cancel_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(budget) => {
                        tracing::warn!(budget_secs = budget.as_secs(), "run exceeded wall-clock budget, cancelling");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for RunSupervisor {
    // 结束监管时释放预算计时任务
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
