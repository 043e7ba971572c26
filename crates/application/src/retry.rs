use std::time::Duration;

/// 指数退避，带上限
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential {
            base,
            max: max.max(base),
        }
    }

    /// 第 `attempt` 次失败（从 1 开始）之后的等待时间
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                std::cmp::min(base.saturating_mul(factor), *max)
            }
        }
    }
}
