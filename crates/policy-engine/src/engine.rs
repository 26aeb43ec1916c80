//! 策略引擎
//!
//! 对单个目标与主体做一次访问决策：解析绑定 → 计算成员关系 →
//! 并发执行 → 按目标的模式聚合。
//!
//! 输入（缓存开关、调试、请求、附加上下文）只能在第一次 `build` 之前设置；
//! `build` 结果会被记住，重复调用不会重新评估，`reset` 后才会重新计算。

use crate::cache::ResultCache;
use crate::context::{EvaluationContext, RequestInfo};
use crate::error::{EngineError, Result};
use crate::models::{EngineMode, EngineResult, PolicyTarget, Principal};
use crate::pool::WorkerPool;
use crate::process::{BindingOutput, BindingProcess};
use crate::resolver::BindingResolver;
use policy_shared::config::EngineSettings;
use policy_shared::observability::metrics::record_engine_build;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// 引擎运行参数
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 结果缓存时长
    pub cache_ttl: Duration,
    /// 整体评估时限
    pub build_timeout: Option<Duration>,
    /// 单次规则测试使用的绑定超时
    pub default_binding_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            cache_ttl: Duration::from_secs(settings.cache_ttl_seconds),
            build_timeout: settings.build_timeout_seconds.map(Duration::from_secs),
            default_binding_timeout: Duration::from_secs(
                settings.default_binding_timeout_seconds.max(1),
            ),
        }
    }
}

/// 按模式聚合各绑定结果，消息按绑定顺序收集
pub fn aggregate(mode: EngineMode, outputs: &[BindingOutput]) -> EngineResult {
    let passing = match mode {
        EngineMode::All => outputs.iter().all(|o| o.outcome.passing),
        EngineMode::Any => outputs.iter().any(|o| o.outcome.passing),
    };
    let messages = outputs
        .iter()
        .filter_map(|o| o.outcome.message.clone())
        .collect();

    EngineResult { passing, messages }
}

struct Evaluated {
    result: EngineResult,
    outputs: Vec<BindingOutput>,
}

/// 策略引擎
pub struct PolicyEngine {
    target: PolicyTarget,
    principal: Principal,
    resolver: BindingResolver,
    cache: Option<ResultCache>,
    pool: WorkerPool,
    config: EngineConfig,

    use_cache: bool,
    debug: bool,
    request: Option<RequestInfo>,
    extra: Map<String, Value>,

    started: bool,
    evaluated: Option<Evaluated>,
}

impl PolicyEngine {
    pub fn new(
        target: PolicyTarget,
        principal: Principal,
        resolver: BindingResolver,
        cache: Option<ResultCache>,
        pool: WorkerPool,
        config: EngineConfig,
    ) -> Self {
        Self {
            target,
            principal,
            resolver,
            cache,
            pool,
            config,
            use_cache: true,
            debug: false,
            request: None,
            extra: Map::new(),
            started: false,
            evaluated: None,
        }
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.started {
            Err(EngineError::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    /// 是否读写结果缓存（默认开启）
    pub fn set_use_cache(&mut self, use_cache: bool) -> Result<()> {
        self.ensure_not_started()?;
        self.use_cache = use_cache;
        Ok(())
    }

    /// 调试模式：收集执行日志，并且不读写缓存
    pub fn set_debug(&mut self, debug: bool) -> Result<()> {
        self.ensure_not_started()?;
        self.debug = debug;
        Ok(())
    }

    pub fn set_request(&mut self, request: Option<RequestInfo>) -> Result<()> {
        self.ensure_not_started()?;
        self.request = request;
        Ok(())
    }

    /// 附加上下文，对规则以 `context` 可见
    pub fn set_context(&mut self, extra: Map<String, Value>) -> Result<()> {
        self.ensure_not_started()?;
        self.extra = extra;
        Ok(())
    }

    pub fn target(&self) -> &PolicyTarget {
        &self.target
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// 执行评估
    ///
    /// 解析阶段的错误（未知规则类型、无效绑定、数据读取失败）直接返回，
    /// 不产生部分结果。
    #[instrument(
        skip(self),
        fields(
            target_id = %self.target.id,
            principal_id = %self.principal.id,
            mode = %self.target.mode
        )
    )]
    pub async fn build(&mut self) -> Result<&EngineResult> {
        if self.evaluated.is_none() {
            self.started = true;
            let evaluated = self.evaluate().await?;
            self.evaluated = Some(evaluated);
        }

        self.evaluated
            .as_ref()
            .map(|e| &e.result)
            .ok_or_else(|| EngineError::Repository("evaluation produced no result".to_string()))
    }

    async fn evaluate(&self) -> Result<Evaluated> {
        let start = Instant::now();
        let resolved = self.resolver.resolve(&self.target).await?;

        if resolved.is_empty() {
            debug!("目标没有启用的绑定, 返回 empty_result");
            return Ok(Evaluated {
                result: EngineResult::new(self.target.empty_result),
                outputs: Vec::new(),
            });
        }

        let membership = self.resolver.load_membership(&self.principal).await?;
        let context = Arc::new(
            EvaluationContext::builder(self.principal.clone())
                .request(self.request.clone())
                .extra(self.extra.clone())
                .debug(self.debug)
                .membership(membership)
                .build(),
        );

        // 调试模式不读写缓存
        let cache = if self.use_cache && !self.debug {
            self.cache.clone()
        } else {
            None
        };
        let processes = resolved
            .into_iter()
            .map(|r| BindingProcess::new(r, Arc::clone(&context)).with_cache(cache.clone()))
            .collect();

        let deadline = self
            .config
            .build_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let outputs = self.pool.run(processes, deadline).await;

        let result = aggregate(self.target.mode, &outputs);
        let elapsed = start.elapsed();
        record_engine_build(
            &self.target.mode.to_string(),
            result.passing,
            elapsed.as_secs_f64(),
        );
        info!(
            passing = result.passing,
            bindings = outputs.len(),
            duration_ms = elapsed.as_millis() as u64,
            "策略评估完成"
        );

        Ok(Evaluated { result, outputs })
    }

    /// 上一次成功评估的结果
    pub fn result(&self) -> Option<&EngineResult> {
        self.evaluated.as_ref().map(|e| &e.result)
    }

    pub fn passing(&self) -> Option<bool> {
        self.result().map(|r| r.passing)
    }

    /// 各绑定的执行结果，按绑定顺序
    pub fn outputs(&self) -> &[BindingOutput] {
        self.evaluated
            .as_ref()
            .map(|e| e.outputs.as_slice())
            .unwrap_or(&[])
    }

    /// 清除记住的结果，允许修改输入并重新评估
    pub fn reset(&mut self) {
        self.started = false;
        self.evaluated = None;
    }
}
