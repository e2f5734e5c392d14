//! The alerting pipeline: threshold checks with aggregation and
//! cooldown, channel dispatch with an SSRF guard, and secret masking for
//! channel configs surfaced through the API.

pub mod alerter;
pub mod masking;
pub mod notifier;
pub mod ssrf;

pub use alerter::{AlertError, AlertOutcome, Alerter};
pub use masking::mask_sensitive_config;
pub use notifier::{ChannelOutcome, NotifyError, Notifier, format_message};
pub use ssrf::is_safe_url;
