//! 事件模型
//!
//! 定义进入中继系统的消息信封格式、封闭的消息类别枚举、
//! 外部查询结果的摘要结构，以及投递给下游的归一化事件记录。
//! 信封校验契约在这里集中实现，分类器假定拿到的信封已通过校验。

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};

// ---------------------------------------------------------------------------
// Envelope — 消息信封
// ---------------------------------------------------------------------------

/// 消息信封
///
/// 总线上所有消息的外层记录。五个字段缺一不可：
/// topic 非空字符串、originator 字符串、timestamp 可解析为时间、
/// mime-type 字符串、payload 为 JSON 对象（非数组、非 null）。
/// 入站适配器构造并校验一次，按值传给分类器，处理完即丢弃。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub originator: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "mime-type")]
    pub mime_type: String,
    pub payload: Value,
}

impl Envelope {
    /// 从解码后的 JSON 值构造信封，逐字段执行校验契约
    ///
    /// 校验失败返回 `Validation` 错误并指明违反的字段，
    /// 调用方记录日志后丢弃该消息（不重投）。
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| RelayError::Validation("消息必须是 JSON 对象".to_string()))?;

        let topic = obj
            .get("topic")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RelayError::Validation("topic 必须是非空字符串".to_string()))?;

        let originator = obj
            .get("originator")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Validation("originator 必须是字符串".to_string()))?;

        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .ok_or_else(|| RelayError::Validation("timestamp 必须可解析为时间".to_string()))?;

        let mime_type = obj
            .get("mime-type")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Validation("mime-type 必须是字符串".to_string()))?;

        let payload = obj
            .get("payload")
            .filter(|p| p.is_object())
            .ok_or_else(|| RelayError::Validation("payload 必须是 JSON 对象".to_string()))?;

        Ok(Self {
            topic: topic.to_string(),
            originator: originator.to_string(),
            timestamp,
            mime_type: mime_type.to_string(),
            payload: payload.clone(),
        })
    }
}

/// 宽松解析时间戳
///
/// 上游同时存在带时区（RFC 3339）和不带时区两种格式，
/// 无时区的按 UTC 处理。
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// MessageKind — 封闭的消息类别枚举
// ---------------------------------------------------------------------------

/// 消息类别
///
/// 六种可识别的消息各占一个变体，由 `MessageKind::of` 基于
/// topic + payload 判别字段做纯函数匹配。各 topic+type 组合互斥，
/// 匹配顺序仅为保持确定性而固定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    UserRegistration,
    AddResource,
    UpdateDraftOrActivateChallenge,
    CloseTask,
    ContestSubmission,
    AutoPilotEvent,
}

/// 挑战类通知 topic
pub const CHALLENGE_TOPIC: &str = "challenge.notification.events";
/// 自动导航事件 topic
pub const AUTOPILOT_TOPIC: &str = "notifications.autopilot.events";
/// 提交类通知 topic 集合
pub const SUBMISSION_TOPICS: [&str; 3] = [
    "submission.notification.create",
    "submission.notification.update",
    "submission.notification.delete",
];

impl MessageKind {
    /// 判定消息类别，无法识别时返回 None（调用方按"有意忽略"处理）
    ///
    /// type/resource 判别字段统一转大写后比较，大小写不敏感。
    pub fn of(topic: &str, payload: &Value) -> Option<Self> {
        let payload_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_uppercase();

        if topic == CHALLENGE_TOPIC {
            return match payload_type.as_str() {
                "USER_REGISTRATION" | "USER_UNREGISTRATION" => Some(Self::UserRegistration),
                "ADD_RESOURCE" => Some(Self::AddResource),
                "UPDATE_DRAFT_CHALLENGE" | "ACTIVATE_CHALLENGE" => {
                    Some(Self::UpdateDraftOrActivateChallenge)
                }
                "CLOSE_TASK" => Some(Self::CloseTask),
                _ => None,
            };
        }

        if SUBMISSION_TOPICS.contains(&topic) {
            let resource = payload
                .get("resource")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_uppercase();
            if payload_type == "CONTEST SUBMISSION" && resource == "SUBMISSION" {
                return Some(Self::ContestSubmission);
            }
            return None;
        }

        if topic == AUTOPILOT_TOPIC && is_truthy(payload.get("projectId")) {
            return Some(Self::AutoPilotEvent);
        }

        None
    }

    /// 类别标签，用于日志和归一化事件中没有 payload type 的场景
    pub fn tag(&self) -> &'static str {
        match self {
            Self::UserRegistration => "USER_REGISTRATION",
            Self::AddResource => "ADD_RESOURCE",
            Self::UpdateDraftOrActivateChallenge => "UPDATE_DRAFT_OR_ACTIVATE_CHALLENGE",
            Self::CloseTask => "CLOSE_TASK",
            Self::ContestSubmission => "CONTEST_SUBMISSION",
            Self::AutoPilotEvent => "AUTO_PILOT_EVENT",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// JS 语义的真值判断，autopilot 消息的 projectId 沿用上游的"truthy"约定
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None => false,
        Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

// ---------------------------------------------------------------------------
// ChallengeSummary / UserSummary — 查询结果摘要
// ---------------------------------------------------------------------------

/// 挑战摘要
///
/// 从挑战查询响应的 content 中抽取，路径缺失的字段取空值。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChallengeSummary {
    pub name: String,
    pub challenge_type: String,
    pub prizes: Vec<f64>,
    pub project_id: Option<i64>,
}

impl ChallengeSummary {
    /// 从挑战 API 响应的 content 抽取摘要
    pub fn from_content(content: &Value) -> Self {
        Self {
            name: str_at(content, "challengeName"),
            challenge_type: str_at(content, "challengeType"),
            prizes: prizes_at(content, "prize"),
            project_id: content.get("projectId").and_then(Value::as_i64),
        }
    }

    /// 从 UPDATE_DRAFT/ACTIVATE 消息 payload 内嵌的挑战字段抽取摘要
    pub fn from_payload_data(data: &Value) -> Self {
        Self {
            name: str_at(data, "name"),
            challenge_type: str_at(data, "finalDeliverableTypes"),
            prizes: prizes_at(data, "prizes"),
            project_id: data.get("projectId").and_then(Value::as_i64),
        }
    }

    /// 四个字段是否全部就绪（名称、交付物类型、非空奖金、projectId）
    ///
    /// 全部就绪时 UPDATE_DRAFT/ACTIVATE 处理可以跳过外部查询。
    pub fn is_complete(&self) -> bool {
        !self.name.is_empty()
            && !self.challenge_type.is_empty()
            && !self.prizes.is_empty()
            && self.project_id.is_some()
    }
}

/// 用户摘要
///
/// 由两次链式查询合成：按 id 查询得到姓名和 handle，
/// 再按 handle 查询公开资料得到头像和国家代码。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserSummary {
    pub first_name: String,
    pub last_name: String,
    pub photo_url: String,
    pub handle: String,
    pub home_country_code: String,
}

fn str_at(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn prizes_at(value: &Value, key: &str) -> Vec<f64> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// NormalizedEvent — 归一化事件记录
// ---------------------------------------------------------------------------

/// 归一化事件记录
///
/// 投递给下游的扁平结构。为了给消费方稳定的形状，
/// 可选字段保持"存在但为空"（空串/空数组/null），从不省略。
/// `created_at` 原样复制信封时间戳，因此同一消息的输出是确定的。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub topic: String,
    pub message_type: String,
    pub challenge_id: Option<i64>,
    pub project_id: Option<i64>,
    pub challenge_name: String,
    pub challenge_type: String,
    pub prizes: Vec<f64>,
    pub first_name: String,
    pub last_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: String,
    pub handle: String,
    pub home_country_code: String,
    pub phase_type_name: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

impl NormalizedEvent {
    /// 创建空白记录，所有可选字段取空值
    pub fn new(topic: impl Into<String>, message_type: impl Into<String>, envelope_timestamp: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            message_type: message_type.into(),
            challenge_id: None,
            project_id: None,
            challenge_name: String::new(),
            challenge_type: String::new(),
            prizes: Vec::new(),
            first_name: String::new(),
            last_name: String::new(),
            photo_url: String::new(),
            handle: String::new(),
            home_country_code: String::new(),
            phase_type_name: String::new(),
            state: String::new(),
            created_at: envelope_timestamp,
        }
    }

    /// 合并挑战摘要
    pub fn apply_challenge(&mut self, challenge: &ChallengeSummary) {
        self.challenge_name = challenge.name.clone();
        self.challenge_type = challenge.challenge_type.clone();
        self.prizes = challenge.prizes.clone();
        if challenge.project_id.is_some() {
            self.project_id = challenge.project_id;
        }
    }

    /// 合并用户摘要
    pub fn apply_user(&mut self, user: &UserSummary) {
        self.first_name = user.first_name.clone();
        self.last_name = user.last_name.clone();
        self.photo_url = user.photo_url.clone();
        self.handle = user.handle.clone();
        self.home_country_code = user.home_country_code.clone();
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
