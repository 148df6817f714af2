use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Header label for a date group. Carries the raw date so hosts can localize;
/// `text()` is a reasonable default rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DateLabel {
    Today,
    Yesterday,
    Date(NaiveDate),
}

impl DateLabel {
    pub fn for_date(date: NaiveDate, today: NaiveDate) -> Self {
        if date == today {
            Self::Today
        } else if today.pred_opt() == Some(date) {
            Self::Yesterday
        } else {
            Self::Date(date)
        }
    }

    pub fn text(&self) -> String {
        match self {
            Self::Today => "Today".to_string(),
            Self::Yesterday => "Yesterday".to_string(),
            Self::Date(date) => date.format("%B %-d, %Y").to_string(),
        }
    }
}

/// Consecutive messages from one sender, visually merged (avatar and name
/// shown once).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderRun {
    pub sender_id: Uuid,
    pub messages: Vec<Message>,
}

/// One calendar date's worth of messages. Purely a rendering projection —
/// recomputed from the message list on every change, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageGroup {
    pub date: NaiveDate,
    pub label: DateLabel,
    pub runs: Vec<SenderRun>,
}
