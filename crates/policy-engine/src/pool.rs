//! 绑定执行工作池
//!
//! 每条绑定一个 tokio 任务，信号量限制同时执行的数量。结果按输入顺序返回，
//! 与完成顺序无关。任务崩溃或超出总时限时以 failure_result 代替结果，
//! 不影响其他绑定。

use crate::process::{BindingOutput, BindingProcess};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// 任务崩溃时使用的错误描述
pub const PANIC_MESSAGE: &str = "policy evaluation panicked";

/// 超出引擎总时限时使用的错误描述
pub const DEADLINE_MESSAGE: &str = "policy engine deadline exceeded";

/// 默认并发度：可用 CPU 数
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// 绑定执行工作池
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 并发执行全部绑定
    ///
    /// 超出 `deadline` 的绑定不会被中止，只是不再等待其结果。
    pub async fn run(
        &self,
        processes: Vec<BindingProcess>,
        deadline: Option<Instant>,
    ) -> Vec<BindingOutput> {
        debug!("工作池执行 {} 条绑定, 并发度 {}", processes.len(), self.size);

        let tasks = processes.into_iter().map(|process| {
            let binding_id = process.binding_id();
            let rule_id = process.rule_id();
            let kind = process.kind().to_string();
            let failure_result = process.failure_result();
            let negate = process.negate();
            let semaphore = Arc::clone(&self.semaphore);

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                process.execute().await
            });

            async move {
                let joined = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, handle).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            warn!(binding_id = %binding_id, "绑定执行超出引擎总时限");
                            return BindingProcess::fallback(
                                binding_id,
                                rule_id,
                                kind,
                                failure_result,
                                negate,
                                DEADLINE_MESSAGE,
                            );
                        }
                    },
                    None => handle.await,
                };

                match joined {
                    Ok(output) => output,
                    Err(e) => {
                        error!(binding_id = %binding_id, error = %e, "绑定执行任务崩溃");
                        BindingProcess::fallback(
                            binding_id,
                            rule_id,
                            kind,
                            failure_result,
                            negate,
                            PANIC_MESSAGE,
                        )
                    }
                }
            }
        });

        join_all(tasks).await
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(default_workers())
    }
}
