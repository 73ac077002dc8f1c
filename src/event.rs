//! Events arriving on the master's live event feed.
//!
//! Tags are decoded once into [`EventTag`]; nothing downstream looks at
//! the raw tag string again.

use serde::{Deserialize, Serialize};

use crate::model::{JobId, WorkerId};

const JOB_PREFIX: &str = "salt/job/";

/// An event as delivered by the feed: a tag plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub tag: String,
    pub data: serde_json::Value,
}

impl RawEvent {
    pub fn new(tag: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            tag: tag.into(),
            data,
        }
    }

    /// Build the return event a minion publishes when it finishes a job.
    pub fn job_return(
        job: &JobId,
        worker: &WorkerId,
        function: &str,
        value: serde_json::Value,
    ) -> Self {
        let data = ReturnData {
            id: Some(worker.clone()),
            jid: Some(job.clone()),
            fun: Some(function.to_string()),
            ret: value,
            retcode: Some(0),
            success: Some(true),
        };
        Self {
            tag: EventTag::Return {
                job: job.clone(),
                worker: worker.clone(),
            }
            .to_string(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Which kind of job event a tag announces, and for whom.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventTag {
    /// `salt/job/<jid>/new`: the master published a job.
    New { job: JobId },
    /// `salt/job/<jid>/ret/<minion>`: a minion finished.
    Return { job: JobId, worker: WorkerId },
    /// `salt/job/<jid>/prog/<minion>/<seq>`: intermediate progress.
    Progress {
        job: JobId,
        worker: WorkerId,
        seq: u64,
    },
}

impl EventTag {
    /// Decode a tag. Tags that are not job events yield `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        let rest = tag.strip_prefix(JOB_PREFIX)?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [jid, "new"] if !jid.is_empty() => Some(EventTag::New {
                job: JobId::from(*jid),
            }),
            [jid, "ret", minion] if !jid.is_empty() && !minion.is_empty() => {
                Some(EventTag::Return {
                    job: JobId::from(*jid),
                    worker: WorkerId::from(*minion),
                })
            }
            [jid, "prog", minion, seq] if !jid.is_empty() && !minion.is_empty() => {
                Some(EventTag::Progress {
                    job: JobId::from(*jid),
                    worker: WorkerId::from(*minion),
                    seq: seq.parse().ok()?,
                })
            }
            _ => None,
        }
    }

    pub fn job(&self) -> &JobId {
        match self {
            EventTag::New { job } | EventTag::Return { job, .. } | EventTag::Progress { job, .. } => {
                job
            }
        }
    }

    /// Short label for logs and metrics.
    pub fn class(&self) -> &'static str {
        match self {
            EventTag::New { .. } => "new",
            EventTag::Return { .. } => "ret",
            EventTag::Progress { .. } => "prog",
        }
    }
}

impl std::fmt::Display for EventTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventTag::New { job } => write!(f, "{JOB_PREFIX}{job}/new"),
            EventTag::Return { job, worker } => write!(f, "{JOB_PREFIX}{job}/ret/{worker}"),
            EventTag::Progress { job, worker, seq } => {
                write!(f, "{JOB_PREFIX}{job}/prog/{worker}/{seq}")
            }
        }
    }
}

/// Payload of a return event. Only `return` is interpreted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnData {
    #[serde(default)]
    pub id: Option<WorkerId>,
    #[serde(default)]
    pub jid: Option<JobId>,
    #[serde(default)]
    pub fun: Option<String>,
    #[serde(rename = "return", default)]
    pub ret: serde_json::Value,
    #[serde(default)]
    pub retcode: Option<i64>,
    #[serde(default)]
    pub success: Option<bool>,
}

impl ReturnData {
    /// Extract the return value from event data, `null` when absent.
    pub fn return_value(data: &serde_json::Value) -> serde_json::Value {
        data.get("return")
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_return_tag() {
        let tag = EventTag::parse("salt/job/20240101120000123456/ret/minion1").unwrap();
        assert_eq!(
            tag,
            EventTag::Return {
                job: JobId::from("20240101120000123456"),
                worker: WorkerId::from("minion1"),
            }
        );
        assert_eq!(tag.class(), "ret");
        assert_eq!(tag.job(), &JobId::from("20240101120000123456"));
    }

    #[test]
    fn parses_new_and_progress_tags() {
        assert!(matches!(
            EventTag::parse("salt/job/42/new"),
            Some(EventTag::New { .. })
        ));
        assert!(matches!(
            EventTag::parse("salt/job/42/prog/minion1/3"),
            Some(EventTag::Progress { seq: 3, .. })
        ));
    }

    #[test]
    fn foreign_tags_are_ignored() {
        assert_eq!(EventTag::parse("salt/auth"), None);
        assert_eq!(EventTag::parse("salt/minion/minion1/start"), None);
        assert_eq!(EventTag::parse("salt/job//ret/minion1"), None);
        assert_eq!(EventTag::parse("salt/job/42/ret/"), None);
        assert_eq!(EventTag::parse("salt/job/42/prog/minion1/x"), None);
    }

    #[test]
    fn tag_display_round_trips() {
        let tag = EventTag::Return {
            job: JobId::from("42"),
            worker: WorkerId::from("web1"),
        };
        assert_eq!(EventTag::parse(&tag.to_string()), Some(tag));
    }

    #[test]
    fn job_return_carries_value_under_return_key() {
        let event = RawEvent::job_return(
            &JobId::from("42"),
            &WorkerId::from("web1"),
            "test.ping",
            json!(true),
        );
        assert_eq!(event.tag, "salt/job/42/ret/web1");
        assert_eq!(ReturnData::return_value(&event.data), json!(true));
        assert_eq!(event.data["fun"], json!("test.ping"));
    }
}
