/// Message grouping engine: partitions a flat message list into
/// date-separated, sender-grouped clusters for rendering.
///
/// Pure projection — identical input always yields identical output, so the
/// engine can be re-invoked on every list mutation without accumulating
/// drift. It reads the list and never mutates it; render order is owned by
/// the conversation store.
use chrono::NaiveDate;

use carelink_types::{DateLabel, Message, MessageGroup, SenderRun};

use crate::config::GroupingConfig;

/// Group `messages` (already in render order) into date buckets and
/// sender-runs. `today` anchors the Today/Yesterday labels so the projection
/// stays a pure function of its arguments.
pub fn group_messages(
    messages: &[Message],
    config: &GroupingConfig,
    today: NaiveDate,
) -> Vec<MessageGroup> {
    let mut groups: Vec<MessageGroup> = Vec::new();

    for message in messages {
        let timestamp = message.effective_timestamp();
        let date = timestamp.date_naive();

        if groups.last().map(|g| g.date) != Some(date) {
            groups.push(MessageGroup {
                date,
                label: DateLabel::for_date(date, today),
                runs: Vec::new(),
            });
        }
        let Some(group) = groups.last_mut() else {
            continue;
        };

        let merge_into_last = group.runs.last().is_some_and(|run| {
            run.sender_id == message.sender_id
                && run.messages.last().is_some_and(|prev| {
                    timestamp - prev.effective_timestamp() <= config.run_gap
                })
        });

        if merge_into_last {
            if let Some(run) = group.runs.last_mut() {
                run.messages.push(message.clone());
            }
        } else {
            group.runs.push(SenderRun {
                sender_id: message.sender_id,
                messages: vec![message.clone()],
            });
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{DateTime, TimeDelta, Utc};
    use uuid::Uuid;

    use carelink_types::MessageStatus;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn message(sender: Uuid, created: &str, server: Option<&str>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::nil(),
            sender_id: sender,
            body: Some("hello".to_string()),
            attachments: vec![],
            status: if server.is_some() {
                MessageStatus::Sent
            } else {
                MessageStatus::Pending
            },
            created_at: at(created),
            server_timestamp: server.map(at),
            read_by: BTreeMap::new(),
            failure_reason: None,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn empty_list_yields_no_groups() {
        let groups = group_messages(&[], &GroupingConfig::default(), today());
        assert!(groups.is_empty());
    }

    #[test]
    fn same_sender_within_gap_merges_into_one_run() {
        let a = Uuid::new_v4();
        let messages = vec![
            message(a, "2026-03-14T10:00:00Z", None),
            message(a, "2026-03-14T10:00:30Z", None),
            message(a, "2026-03-14T10:06:00Z", None),
        ];
        let groups = group_messages(&messages, &GroupingConfig::default(), today());

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].label, DateLabel::Today);
        assert_eq!(groups[0].runs.len(), 2);
        assert_eq!(groups[0].runs[0].messages.len(), 2);
        assert_eq!(groups[0].runs[1].messages.len(), 1);
    }

    #[test]
    fn sender_change_breaks_run_even_within_gap() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let messages = vec![
            message(a, "2026-03-14T10:00:00Z", None),
            message(b, "2026-03-14T10:00:10Z", None),
            message(a, "2026-03-14T10:00:20Z", None),
        ];
        let groups = group_messages(&messages, &GroupingConfig::default(), today());
        assert_eq!(groups[0].runs.len(), 3);
    }

    #[test]
    fn messages_split_by_calendar_date() {
        let a = Uuid::new_v4();
        let messages = vec![
            message(a, "2026-03-13T23:59:00Z", None),
            message(a, "2026-03-14T00:01:00Z", None),
        ];
        let groups = group_messages(&messages, &GroupingConfig::default(), today());

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].label, DateLabel::Yesterday);
        assert_eq!(groups[1].label, DateLabel::Today);
    }

    #[test]
    fn server_timestamp_wins_over_created_at_for_bucketing() {
        let a = Uuid::new_v4();
        let messages = vec![message(
            a,
            "2026-03-14T00:00:05Z",
            Some("2026-03-13T23:59:59Z"),
        )];
        let groups = group_messages(&messages, &GroupingConfig::default(), today());
        assert_eq!(groups[0].label, DateLabel::Yesterday);
    }

    #[test]
    fn pending_message_buckets_by_created_at() {
        let a = Uuid::new_v4();
        let messages = vec![message(a, "2026-03-14T09:00:00Z", None)];
        let groups = group_messages(&messages, &GroupingConfig::default(), today());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].runs[0].messages[0].status, MessageStatus::Pending);
    }

    #[test]
    fn grouping_is_deterministic() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let messages = vec![
            message(a, "2026-03-12T08:00:00Z", Some("2026-03-12T08:00:01Z")),
            message(a, "2026-03-12T08:02:00Z", None),
            message(b, "2026-03-14T11:00:00Z", None),
        ];
        let config = GroupingConfig::default();
        let first = group_messages(&messages, &config, today());
        let second = group_messages(&messages, &config, today());
        assert_eq!(first, second);
    }

    #[test]
    fn custom_gap_threshold_is_honored() {
        let a = Uuid::new_v4();
        let config = GroupingConfig {
            run_gap: TimeDelta::seconds(10),
        };
        let messages = vec![
            message(a, "2026-03-14T10:00:00Z", None),
            message(a, "2026-03-14T10:00:30Z", None),
        ];
        let groups = group_messages(&messages, &config, today());
        assert_eq!(groups[0].runs.len(), 2);
    }
}
