//! Job-control payloads carried inside envelopes.
//!
//! Requests the agent sends are the closed [`Command`] enum, tagged by
//! `type`. Replies from robots are classified by [`Response::classify`],
//! which only looks at the `type` / `response_type` discriminators and
//! passes anything else through untouched as [`Response::Unknown`].

use crate::types::{Job, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input priming a freshly opened terminal tunnel.
pub const TERMINAL_PRIME: &str = "\n\r";

/// Payloads sent from the operator to a robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Ask the robot to start a job.
    StartJob {
        /// Client-generated job id.
        id: String,
        /// PeerId of the robot that should run it.
        robot_id: String,
        /// Job kind.
        job_type: String,
        /// Always `pending` when issued.
        status: JobStatus,
        /// JSON-stringified job arguments.
        args: String,
    },
    /// Ask the robot for information; answered by a response message.
    MessageRequest(Request),
    /// Ask the robot to open a terminal tunnel for a job.
    StartTunnelReq {
        /// Job whose terminal should be attached.
        job_id: String,
        /// PeerId the robot should stream output to.
        peer_id: String,
    },
    /// Deliver input to a running job.
    JobMessage {
        /// Target job.
        job_id: String,
        /// Job input.
        content: JobInput,
    },
}

/// The `request_type` of a [`Command::MessageRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_type")]
pub enum Request {
    /// List all jobs on the robot.
    ListJobs,
    /// Fetch details of one job.
    JobInfo {
        /// Job to describe.
        job_id: String,
    },
}

/// Input for a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobInput {
    /// Bytes for the job's interactive terminal.
    Terminal {
        /// Text written to the remote shell's stdin.
        stdin: String,
    },
}

impl Command {
    /// Builds a `StartJob` command with `pending` status.
    ///
    /// # Errors
    ///
    /// Returns an error if `args` cannot be serialized.
    pub fn start_job(
        robot_id: &str,
        job_id: &str,
        job_type: &str,
        args: &Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::StartJob {
            id: job_id.to_string(),
            robot_id: robot_id.to_string(),
            job_type: job_type.to_string(),
            status: JobStatus::Pending,
            args: serde_json::to_string(args)?,
        })
    }

    /// Builds a terminal input command for `job_id`.
    #[must_use]
    pub fn terminal_input(job_id: &str, stdin: &str) -> Self {
        Self::JobMessage {
            job_id: job_id.to_string(),
            content: JobInput::Terminal {
                stdin: stdin.to_string(),
            },
        }
    }
}

/// A classified robot reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `response_type: "ListJobs"` with its job list (empty when absent).
    ListJobs(Vec<Job>),
    /// `type: "MessageResponse"`, `response_type: "JobInfo"`.
    JobInfo(Value),
    /// Anything else, passed through unexamined.
    Unknown(Value),
}

impl Response {
    /// Classifies a message `content` value by its discriminators.
    ///
    /// A `ListJobs` reply always classifies as [`Response::ListJobs`]:
    /// entries that do not decode as a [`Job`] are skipped, and a missing or
    /// non-array `jobs` field gives an empty list.
    ///
    /// # Examples
    ///
    /// ```
    /// use fleet_common::message::Response;
    /// use serde_json::json;
    ///
    /// let r = Response::classify(&json!({"response_type": "ListJobs"}));
    /// assert_eq!(r, Response::ListJobs(vec![]));
    /// ```
    #[must_use]
    pub fn classify(content: &Value) -> Self {
        let kind = content.get("type").and_then(Value::as_str);
        match content.get("response_type").and_then(Value::as_str) {
            Some("ListJobs") => Self::ListJobs(decode_jobs(content.get("jobs"))),
            Some("JobInfo") if kind == Some("MessageResponse") => {
                Self::JobInfo(content.get("job_info").cloned().unwrap_or(Value::Null))
            }
            _ => Self::Unknown(content.clone()),
        }
    }

    /// Classifies the `content` of an inbound message sent by `from`.
    ///
    /// Returns `None` when the message did not come from `from` or has no
    /// content.
    #[must_use]
    pub fn from_peer(message: &Value, from: &str) -> Option<Self> {
        if message.get("from").and_then(Value::as_str) != Some(from) {
            return None;
        }
        message.get("content").map(Self::classify)
    }
}

fn decode_jobs(jobs: Option<&Value>) -> Vec<Job> {
    let Some(Value::Array(entries)) = jobs else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| Job::deserialize(entry).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_job_wire_shape() {
        let cmd = Command::start_job("robotA", "job-1", "ping", &json!({"n": 3})).unwrap();
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({
                "type": "StartJob",
                "id": "job-1",
                "robot_id": "robotA",
                "job_type": "ping",
                "status": "pending",
                "args": "{\"n\":3}"
            })
        );
    }

    #[test]
    fn message_request_wire_shapes() {
        let list = Command::MessageRequest(Request::ListJobs);
        assert_eq!(
            serde_json::to_value(&list).unwrap(),
            json!({"type": "MessageRequest", "request_type": "ListJobs"})
        );
        let info = Command::MessageRequest(Request::JobInfo {
            job_id: "j1".into(),
        });
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({"type": "MessageRequest", "request_type": "JobInfo", "job_id": "j1"})
        );
    }

    #[test]
    fn terminal_input_wire_shape() {
        let cmd = Command::terminal_input("j1", "ls\n");
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({
                "type": "JobMessage",
                "job_id": "j1",
                "content": {"type": "Terminal", "stdin": "ls\n"}
            })
        );
    }

    #[test]
    fn tunnel_request_round_trips() {
        let cmd = Command::StartTunnelReq {
            job_id: "j1".into(),
            peer_id: "12D3KooWme".into(),
        };
        let text = serde_json::to_string(&cmd).unwrap();
        assert_eq!(serde_json::from_str::<Command>(&text).unwrap(), cmd);
    }

    #[test]
    fn classify_list_jobs() {
        let r = Response::classify(&json!({
            "response_type": "ListJobs",
            "jobs": [{"id": "j1", "status": "pending"}]
        }));
        let Response::ListJobs(jobs) = r else {
            panic!("expected ListJobs, got {r:?}");
        };
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "j1");
        assert_eq!(jobs[0].status, JobStatus::Pending);
    }

    #[test]
    fn classify_list_jobs_skips_entries_that_do_not_fit() {
        let r = Response::classify(&json!({
            "response_type": "ListJobs",
            "jobs": [
                {"id": "j1", "type": "ping", "status": "pending", "timestamp": 1_700_000_000},
                {"type": "orphan"},
                {"job_id": "j2", "status": "completed"}
            ]
        }));
        let Response::ListJobs(jobs) = r else {
            panic!("expected ListJobs, got {r:?}");
        };
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["j1", "j2"]);
        assert_eq!(jobs[0].timestamp, "1700000000");

        let odd = Response::classify(&json!({"response_type": "ListJobs", "jobs": {"j1": {}}}));
        assert_eq!(odd, Response::ListJobs(vec![]));
    }

    #[test]
    fn classify_job_info_requires_message_response_type() {
        let info = json!({
            "type": "MessageResponse",
            "response_type": "JobInfo",
            "job_info": {"id": "j1"}
        });
        assert_eq!(Response::classify(&info), Response::JobInfo(json!({"id": "j1"})));

        let untyped = json!({"response_type": "JobInfo", "job_info": {}});
        assert!(matches!(Response::classify(&untyped), Response::Unknown(_)));
    }

    #[test]
    fn classify_passes_unknown_through() {
        let raw = json!({"type": "Terminal", "stdout": "hi"});
        assert_eq!(Response::classify(&raw), Response::Unknown(raw.clone()));
    }

    #[test]
    fn from_peer_filters_on_sender() {
        let msg = json!({"from": "robotA", "content": {"response_type": "ListJobs", "jobs": []}});
        assert_eq!(
            Response::from_peer(&msg, "robotA"),
            Some(Response::ListJobs(vec![]))
        );
        assert_eq!(Response::from_peer(&msg, "robotB"), None);
        assert_eq!(Response::from_peer(&json!({"ok": true}), "robotA"), None);
    }
}
