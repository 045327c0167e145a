//! Messages exchanged on the key-provider channels.
//!
//! Every message is the `data` of a transport envelope and carries an
//! `event` tag. Unknown tags decode to [`RotationMessage::Unknown`] so newer
//! peers never break older ones.

use serde::{Deserialize, Serialize};

/// Key rotation protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RotationMessage {
    /// A process holds the rotation lock and is about to store a new key set.
    /// Receivers re-read the store at `end_of_lock_time` (epoch millis) if no
    /// outcome arrives first.
    #[serde(rename_all = "camelCase")]
    PendingJwksUpdate {
        /// Identifies this rotation attempt.
        process_id: String,
        /// When the announcing process's lock expires.
        end_of_lock_time: i64,
    },

    /// The announced rotation failed to store its key set.
    #[serde(rename_all = "camelCase")]
    CancelPendingJwksUpdate {
        /// Rotation attempt being cancelled.
        process_id: String,
    },

    /// A rotation stored a new key set.
    #[serde(rename_all = "camelCase")]
    NewJwksAvailable {
        /// Rotation attempt that produced the key set.
        process_id: String,
        /// The new key set, JSON-encoded.
        serialized_key_set: String,
    },

    /// Asks every process to run the rotation protocol and report progress
    /// on `listening_channel`.
    #[serde(rename_all = "camelCase")]
    RequestUpdateSystemJwks {
        /// Channel receiving [`RotationMessage::JobStatus`] replies.
        listening_channel: String,
        /// When the request was made (epoch millis).
        request_time: i64,
        /// Optional label echoed in replies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_name: Option<String>,
    },

    /// Asks every process to report a digest of its active public key.
    #[serde(rename_all = "camelCase")]
    RequestActiveKey {
        /// Channel receiving [`RotationMessage::ServerActiveKey`] replies.
        listening_channel: String,
    },

    /// Reply to [`RotationMessage::RequestActiveKey`].
    #[serde(rename_all = "camelCase")]
    ServerActiveKey {
        /// Hex MD5 of the active public JWK.
        public_key_md5: String,
    },

    /// Progress of a requested rotation job on one process.
    #[serde(rename_all = "camelCase")]
    JobStatus {
        /// Reporting process.
        process_id: String,
        /// Label from the request, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_name: Option<String>,
        /// Current state.
        status: JobStatus,
    },

    /// Any event this version does not understand.
    #[serde(other)]
    Unknown,
}

impl RotationMessage {
    /// The `event` tag, for logging.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::PendingJwksUpdate { .. } => "pending-jwks-update",
            Self::CancelPendingJwksUpdate { .. } => "cancel-pending-jwks-update",
            Self::NewJwksAvailable { .. } => "new-jwks-available",
            Self::RequestUpdateSystemJwks { .. } => "request-update-system-jwks",
            Self::RequestActiveKey { .. } => "request-active-key",
            Self::ServerActiveKey { .. } => "server-active-key",
            Self::JobStatus { .. } => "job-status",
            Self::Unknown => "unknown",
        }
    }
}

/// State of a requested rotation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum JobStatus {
    /// The process started the rotation protocol.
    Started,
    /// The rotation is still running.
    Heartbeat,
    /// The rotation finished; `rotated` is false when another process held
    /// the lock or the key set was not due for rotation.
    Finished {
        /// Whether this process stored a new key set.
        rotated: bool,
    },
    /// The rotation failed.
    Fatal {
        /// Failure description.
        reason: String,
    },
}

impl JobStatus {
    /// Whether no further status follows.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Fatal { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::pending(
        RotationMessage::PendingJwksUpdate { process_id: "p".into(), end_of_lock_time: 5 },
        json!({"event": "pending-jwks-update", "processId": "p", "endOfLockTime": 5})
    )]
    #[case::cancel(
        RotationMessage::CancelPendingJwksUpdate { process_id: "p".into() },
        json!({"event": "cancel-pending-jwks-update", "processId": "p"})
    )]
    #[case::request(
        RotationMessage::RequestUpdateSystemJwks {
            listening_channel: "c".into(),
            request_time: 9,
            job_name: None,
        },
        json!({"event": "request-update-system-jwks", "listeningChannel": "c", "requestTime": 9})
    )]
    #[case::active_key(
        RotationMessage::ServerActiveKey { public_key_md5: "ab".into() },
        json!({"event": "server-active-key", "publicKeyMd5": "ab"})
    )]
    #[case::job(
        RotationMessage::JobStatus {
            process_id: "p".into(),
            job_name: Some("nightly".into()),
            status: JobStatus::Finished { rotated: true },
        },
        json!({
            "event": "job-status",
            "processId": "p",
            "jobName": "nightly",
            "status": {"state": "finished", "rotated": true}
        })
    )]
    fn test_wire_format(#[case] message: RotationMessage, #[case] expected: serde_json::Value) {
        assert_eq!(serde_json::to_value(&message).unwrap(), expected);
        assert_eq!(serde_json::from_value::<RotationMessage>(expected).unwrap(), message);
    }

    #[test]
    fn test_unknown_event_decodes_to_unknown() {
        let message: RotationMessage =
            serde_json::from_value(json!({"event": "purge-everything", "force": true})).unwrap();
        assert_eq!(message, RotationMessage::Unknown);
    }

    #[test]
    fn test_malformed_known_event_is_an_error() {
        let result = serde_json::from_value::<RotationMessage>(json!({"event": "pending-jwks-update"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Started.is_terminal());
        assert!(!JobStatus::Heartbeat.is_terminal());
        assert!(JobStatus::Finished { rotated: false }.is_terminal());
        assert!(JobStatus::Fatal { reason: "x".into() }.is_terminal());
    }
}
