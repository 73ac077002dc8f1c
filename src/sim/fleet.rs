//! Fleet definitions loaded from TOML.
//!
//! ```toml
//! [[minion]]
//! id = "web1"
//! delay_ms = 1000
//! reply = true
//!
//! [[minion]]
//! id = "web2"
//! silent = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::{Reply, SimWorker};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct FleetFile {
    #[serde(default)]
    minion: Vec<MinionEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MinionEntry {
    id: String,
    #[serde(default)]
    delay_ms: u64,
    reply: Option<toml::Value>,
    #[serde(default)]
    silent: bool,
    #[serde(default)]
    not_available: bool,
    #[serde(default)]
    lookup_only: bool,
    #[serde(default)]
    offline: bool,
}

/// A simulated fleet, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSpec {
    pub workers: Vec<SimWorker>,
}

impl FleetSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("cannot read fleet file {}: {e}", path.display()),
            )
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad fleet file {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: FleetFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let workers = file
            .minion
            .into_iter()
            .map(MinionEntry::into_worker)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { workers })
    }
}

impl MinionEntry {
    fn into_worker(self) -> Result<SimWorker> {
        let reply = match (self.reply, self.silent, self.not_available) {
            (Some(value), false, false) => Reply::Value(
                serde_json::to_value(value)
                    .map_err(|e| Error::Config(format!("minion {}: {e}", self.id)))?,
            ),
            (None, true, false) => Reply::Silent,
            (None, false, true) => Reply::NotAvailable,
            (None, false, false) => {
                return Err(Error::Config(format!(
                    "minion {} needs one of reply, silent or not_available",
                    self.id
                )));
            }
            _ => {
                return Err(Error::Config(format!(
                    "minion {}: reply, silent and not_available are exclusive",
                    self.id
                )));
            }
        };
        let mut worker = SimWorker::new(self.id, Duration::from_millis(self.delay_ms), reply);
        worker.lookup_only = self.lookup_only;
        worker.offline = self.offline;
        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_each_reply_kind() {
        let spec = FleetSpec::parse(
            r#"
            [[minion]]
            id = "web1"
            delay_ms = 1500
            reply = { uptime = 42, ok = true }

            [[minion]]
            id = "web2"
            silent = true

            [[minion]]
            id = "web3"
            not_available = true
            lookup_only = true
            offline = true
            "#,
        )
        .unwrap();

        assert_eq!(spec.workers.len(), 3);
        assert_eq!(spec.workers[0].delay, Duration::from_millis(1500));
        assert_eq!(
            spec.workers[0].reply,
            Reply::Value(json!({"uptime": 42, "ok": true}))
        );
        assert_eq!(spec.workers[1].reply, Reply::Silent);
        assert_eq!(spec.workers[2].reply, Reply::NotAvailable);
        assert!(spec.workers[2].lookup_only);
        assert!(spec.workers[2].offline);
        assert!(!spec.workers[0].offline);
    }

    #[test]
    fn rejects_ambiguous_minion() {
        let err = FleetSpec::parse(
            r#"
            [[minion]]
            id = "web1"
            reply = true
            silent = true
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exclusive"));
    }

    #[test]
    fn missing_fleet_file_is_an_io_error() {
        let err = FleetSpec::load(Path::new("/nonexistent/fleet.toml")).unwrap_err();
        match err {
            Error::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
                assert!(e.to_string().contains("/nonexistent/fleet.toml"));
            }
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_minion_without_reply() {
        assert!(FleetSpec::parse("[[minion]]\nid = \"web1\"\n").is_err());
    }
}
