use serde::{Deserialize, Serialize};

/// 调度器与优先级队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 每个队列的容量，0 表示不限
    pub pq_maxsize: usize,
    /// 同一任务两次运行之间的最短间隔
    pub pq_grace_period_seconds: u64,
    /// 每轮随机重扫的对象数量，0 关闭随机重扫
    pub pq_max_random_objects: usize,
    pub reschedule_interval_seconds: u64,
    pub new_plugins_interval_seconds: u64,
    pub monitor_organisations_interval_seconds: u64,
    pub metrics_interval_seconds: u64,
    /// 队列满时的最大重试次数，-1 表示无限重试
    pub push_max_tries: i64,
    pub push_poll_interval_ms: u64,
    /// 候选任务并发评估的上限
    pub worker_pool_size: usize,
    pub stop_timeout_seconds: u64,
    /// 插件未声明周期时的默认调度间隔
    pub default_schedule_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pq_maxsize: 1000,
            pq_grace_period_seconds: 86_400,
            pq_max_random_objects: 50,
            reschedule_interval_seconds: 60,
            new_plugins_interval_seconds: 60,
            monitor_organisations_interval_seconds: 60,
            metrics_interval_seconds: 10,
            push_max_tries: 5,
            push_poll_interval_ms: 1000,
            worker_pool_size: 10,
            stop_timeout_seconds: 5,
            default_schedule_interval_seconds: 86_400,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pq_grace_period_seconds == 0 {
            return Err(anyhow::anyhow!("宽限期必须大于0"));
        }

        if self.reschedule_interval_seconds == 0 {
            return Err(anyhow::anyhow!("重新调度间隔必须大于0"));
        }

        if self.new_plugins_interval_seconds == 0 || self.monitor_organisations_interval_seconds == 0
        {
            return Err(anyhow::anyhow!("监控循环间隔必须大于0"));
        }

        if self.worker_pool_size == 0 {
            return Err(anyhow::anyhow!("工作池大小必须大于0"));
        }

        if self.push_max_tries == 0 || self.push_max_tries < -1 {
            return Err(anyhow::anyhow!(
                "入队重试次数必须为正数或-1(无限): {}",
                self.push_max_tries
            ));
        }

        if self.default_schedule_interval_seconds == 0 {
            return Err(anyhow::anyhow!("默认调度间隔必须大于0"));
        }

        Ok(())
    }
}
