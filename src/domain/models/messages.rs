//! Messages exchanged over the notification bus.
//!
//! Workers report back on three result topics; the runner emits user-facing
//! notifications on a fourth, and warm-start workers consume one queue per
//! model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EvaluationId, ModelId};

/// Bus topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Classifier verdicts.
    ClassificationResults,
    /// Evaluation outcomes.
    EvaluationResults,
    /// Streamed worker log lines.
    EvaluationLogLines,
    /// Notifications for users.
    UserNotifications,
    /// Work queue consumed by a model's warm worker pool.
    WorkerQueue(ModelId),
}

impl Topic {
    /// Wire name of the topic.
    pub fn name(&self) -> String {
        match self {
            Self::ClassificationResults => "classifier_results".to_string(),
            Self::EvaluationResults => "eval_results".to_string(),
            Self::EvaluationLogLines => "log_results".to_string(),
            Self::UserNotifications => "notifications".to_string(),
            Self::WorkerQueue(model_id) => model_id.to_string(),
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Envelope delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Topic name.
    pub topic: String,
    /// Decoded JSON payload.
    pub payload: Value,
}

/// Identifier as sent by workers: either a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(i64),
    Text(String),
}

impl RawId {
    fn to_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Best-effort extraction of an evaluation id from an arbitrary payload.
///
/// Used when the full message does not parse, so the evaluation can still
/// be marked failed.
pub fn recover_evaluation_id(payload: &Value) -> Option<EvaluationId> {
    let raw: RawId = serde_json::from_value(payload.get("id")?.clone()).ok()?;
    raw.to_i64().map(EvaluationId)
}

/// Outcome tag of an evaluation result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultType {
    /// The model produced an output.
    #[default]
    Ok,
    /// The model failed on the study.
    Fail,
}

/// `{id, output, type}` from the evaluation results topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResultMessage {
    /// Evaluation the result is for.
    pub id: EvaluationId,
    /// Model output; an object on success, error details on failure.
    #[serde(default)]
    pub output: Value,
    /// Absent in older worker images, which only ever reported successes.
    #[serde(rename = "type", default)]
    pub result_type: ResultType,
}

impl EvaluationResultMessage {
    /// Lenient parse: ids may arrive as strings and `type` may be absent.
    pub fn parse(payload: &Value) -> Result<Self, String> {
        let id = recover_evaluation_id(payload).ok_or_else(|| "missing or invalid id".to_string())?;
        let output = payload.get("output").cloned().unwrap_or(Value::Null);
        let result_type = match payload.get("type") {
            None | Some(Value::Null) => ResultType::Ok,
            Some(t) => serde_json::from_value(t.clone()).map_err(|e| format!("invalid type: {e}"))?,
        };
        Ok(Self {
            id,
            output,
            result_type,
        })
    }

    /// Image artifact path reported inside a successful output.
    pub fn image_path(&self) -> Option<String> {
        self.output
            .get("image")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// `{id, output}` from the log line topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLineMessage {
    /// Evaluation that logged the line.
    pub id: EvaluationId,
    /// One line of worker output.
    pub output: String,
}

impl LogLineMessage {
    /// Parse a log message, accepting string ids.
    pub fn parse(payload: &Value) -> Result<Self, String> {
        let id = recover_evaluation_id(payload).ok_or_else(|| "missing or invalid id".to_string())?;
        let output = payload
            .get("output")
            .and_then(Value::as_str)
            .ok_or_else(|| "log line output must be a string".to_string())?;
        Ok(Self {
            id,
            output: output.to_string(),
        })
    }
}

/// Classifier verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationOutput {
    /// Study type assigned by the classifier.
    pub display: String,
}

/// `{id, output: {display}}` from the classification topic; `id` is the
/// archive identifier of the study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResultMessage {
    /// Archive id of the classified study.
    pub id: String,
    /// Verdict.
    pub output: ClassificationOutput,
}

/// Category of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// An evaluation started.
    EvalStarted,
    /// An evaluation failed.
    EvalFailed,
    /// A result was stored.
    NewResult,
    /// A study was classified.
    StudyReady,
    /// A classification batch failed.
    ClassificationFailed,
    /// An experiment completed.
    ExperimentFinished,
    /// An experiment was stopped.
    ExperimentFailed,
}

/// Notification published on the user notifications topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Text shown to the user.
    pub message: String,
    /// Category of the event.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Target user; `-1` broadcasts to everyone.
    #[serde(rename = "userId")]
    pub user_id: i64,
}

impl Notification {
    /// `user_id` value addressing every user.
    pub const BROADCAST: i64 = -1;

    /// Notification for every user.
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            user_id: Self::BROADCAST,
        }
    }

    /// Address one user; `None` keeps the broadcast.
    pub const fn for_user(mut self, user_id: Option<i64>) -> Self {
        if let Some(id) = user_id {
            self.user_id = id;
        }
        self
    }
}

/// Request published to a warm worker queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmStartRequest {
    /// Archive refs of the staged inputs.
    pub files: Vec<String>,
    /// Evaluation ids, parallel to `files`.
    pub ids: Vec<EvaluationId>,
    /// Always `EVAL` for evaluation requests.
    #[serde(rename = "type")]
    pub kind: String,
}

impl WarmStartRequest {
    /// Request evaluation of `files`.
    pub fn evaluate(files: Vec<String>, ids: Vec<EvaluationId>) -> Self {
        Self {
            files,
            ids,
            kind: "EVAL".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_eval_result_with_string_id() {
        let msg = EvaluationResultMessage::parse(&json!({
            "id": "12",
            "output": {"display": "normal", "image": "/opt/images/out.png"},
            "type": "OK"
        }))
        .unwrap();
        assert_eq!(msg.id, EvaluationId(12));
        assert_eq!(msg.result_type, ResultType::Ok);
        assert_eq!(msg.image_path().as_deref(), Some("/opt/images/out.png"));
    }

    #[test]
    fn test_parse_eval_result_defaults_to_ok() {
        let msg = EvaluationResultMessage::parse(&json!({"id": 3, "output": {}})).unwrap();
        assert_eq!(msg.result_type, ResultType::Ok);
        assert_eq!(msg.image_path(), None);
    }

    #[test]
    fn test_parse_eval_result_rejects_unknown_type() {
        let err = EvaluationResultMessage::parse(&json!({"id": 3, "type": "MAYBE"})).unwrap_err();
        assert!(err.contains("invalid type"));
        assert_eq!(recover_evaluation_id(&json!({"id": 3, "type": "MAYBE"})), Some(EvaluationId(3)));
    }

    #[test]
    fn test_recover_id_missing() {
        assert_eq!(recover_evaluation_id(&json!({"output": {}})), None);
        assert_eq!(recover_evaluation_id(&json!({"id": "abc"})), None);
    }

    #[test]
    fn test_log_line_requires_string_output() {
        assert!(LogLineMessage::parse(&json!({"id": 1, "output": "epoch 1"})).is_ok());
        assert!(LogLineMessage::parse(&json!({"id": 1, "output": 5})).is_err());
    }

    #[test]
    fn test_notification_wire_format() {
        let n = Notification::new(NotificationKind::EvalFailed, "boom").for_user(Some(4));
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v, json!({"message": "boom", "type": "eval_failed", "userId": 4}));
    }

    #[test]
    fn test_warm_start_request_wire_format() {
        let req = WarmStartRequest::evaluate(vec!["s1".into()], vec![EvaluationId(9)]);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v, json!({"files": ["s1"], "ids": [9], "type": "EVAL"}));
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::EvaluationResults.name(), "eval_results");
        assert_eq!(Topic::WorkerQueue(ModelId(5)).name(), "5");
    }
}
