pub mod alert;
pub mod budget;
pub mod handoff;
pub mod projection;
pub mod status;
pub mod usage;
pub mod window;

pub use alert::{AlertPhase, AlertState, AlertTier, AlertTransition, Notification};
pub use budget::{
    BudgetLimits, LimitUnit, LimitUsage, ModelQuota, QuotaLimit, SafetyVerdict,
    DEFAULT_SAFETY_CEILING_PERCENT, DEFAULT_SHORT_BLOCK_TOKEN_LIMIT,
};
pub use handoff::{HandoffSnapshot, HandoffStore, SnapshotReason, StoreError};
pub use projection::{clamp_percent, Projection};
pub use status::{HealthSnapshot, LiveStatus, SourceHealth, UsageStatus, WindowStatus};
pub use usage::{
    model_matches_pattern, session_id_from_source, EventOrigin, SourceCursor, SourceFormat,
    TokenUsage, UsageEvent,
};
pub use window::{
    AggregatorState, BucketState, DropCounters, ModelUsage, RollingWindow, ShortBlockState,
    WindowKind,
};
