use chrono::TimeDelta;
use std::time::Duration;

/// Gap threshold for merging consecutive same-sender messages into one run.
/// Configurable per the host product; 5 minutes matches the default chat UI.
pub const DEFAULT_RUN_GAP_MINUTES: i64 = 5;

/// Typing entries expire if no heartbeat arrives within this window.
pub const DEFAULT_TYPING_TTL_SECS: i64 = 5;

/// One shared sweep timer per conversation view — not one per participant.
pub const DEFAULT_TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024; // 25 MB

#[derive(Debug, Clone)]
pub struct GroupingConfig {
    /// Maximum gap between consecutive same-sender messages that still merge
    /// into a single sender-run.
    pub run_gap: TimeDelta,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            run_gap: TimeDelta::minutes(DEFAULT_RUN_GAP_MINUTES),
        }
    }
}

/// Allow-list validation for staged files. A file passes when its MIME type
/// matches the list (exact, or `image/*`-style prefix) or its extension does.
#[derive(Debug, Clone)]
pub struct AttachmentPolicy {
    pub allowed_mime: Vec<String>,
    pub allowed_extensions: Vec<String>,
    pub max_size_bytes: u64,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            allowed_mime: vec![
                "image/*".to_string(),
                "audio/*".to_string(),
                "video/*".to_string(),
                "application/pdf".to_string(),
            ],
            allowed_extensions: vec![
                "pdf".to_string(),
                "png".to_string(),
                "jpg".to_string(),
                "jpeg".to_string(),
                "heic".to_string(),
            ],
            max_size_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}

impl AttachmentPolicy {
    pub fn permits(&self, mime: &str, file_name: &str) -> bool {
        let mime = mime.to_ascii_lowercase();
        for allowed in &self.allowed_mime {
            if let Some(prefix) = allowed.strip_suffix("/*") {
                if mime.starts_with(prefix) && mime.get(prefix.len()..prefix.len() + 1) == Some("/") {
                    return true;
                }
            } else if mime == allowed.to_ascii_lowercase() {
                return true;
            }
        }
        let extension = file_name.rsplit('.').next().map(str::to_ascii_lowercase);
        match extension {
            Some(ext) if file_name.contains('.') => {
                self.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// How long a `true` typing entry lives without a refreshing heartbeat.
    pub ttl: TimeDelta,
    /// Interval of the shared expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl: TimeDelta::seconds(DEFAULT_TYPING_TTL_SECS),
            sweep_interval: DEFAULT_TYPING_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessagingConfig {
    pub grouping: GroupingConfig,
    pub attachments: AttachmentPolicy,
    pub typing: TypingConfig,
    /// Client-side character limit. `None` disables the check.
    pub max_body_chars: Option<usize>,
}
