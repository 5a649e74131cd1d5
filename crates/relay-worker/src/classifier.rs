//! 消息分类与补全管道
//!
//! 系统的核心：对一条已校验的信封判定消息类别，
//! 对匹配到的类别执行一串有依赖关系的外部查询，
//! 把结果归一化为扁平事件记录后交给 sink。
//! 要么一个 handler 完整跑完并恰好产出一条记录，
//! 要么无人认领、什么都不产出——没有部分成功。

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use corona_shared::error::Result;
use corona_shared::events::{ChallengeSummary, Envelope, MessageKind, NormalizedEvent, UserSummary};

use crate::api_client::LookupApi;
use crate::sink::EventSink;

/// 消息分类器
///
/// 持有外部查询接口和下游 sink，两者都走 trait 注入便于测试。
pub struct Classifier {
    api: Arc<dyn LookupApi>,
    sink: Arc<dyn EventSink>,
}

impl Classifier {
    pub fn new(api: Arc<dyn LookupApi>, sink: Arc<dyn EventSink>) -> Self {
        Self { api, sink }
    }

    /// 处理一条信封，返回消息是否被识别并完整处理
    ///
    /// 未识别返回 Ok(false)，是"有意忽略"而非错误；
    /// 补全过程中任一必需查询失败则整个 handler 中止、错误向上传播，
    /// 不产出部分事件、不重试。
    pub async fn classify(&self, envelope: &Envelope) -> Result<bool> {
        let Some(kind) = MessageKind::of(&envelope.topic, &envelope.payload) else {
            info!(topic = %envelope.topic, "没有处理器能识别该消息，将被忽略");
            return Ok(false);
        };

        info!(kind = %kind, topic = %envelope.topic, "消息已匹配");

        let event = match kind {
            MessageKind::UserRegistration | MessageKind::CloseTask => {
                self.enrich_challenge_and_user(envelope, &["data", "challengeId"], &["data", "userId"])
                    .await?
            }
            MessageKind::AddResource => {
                self.enrich_challenge_and_user(
                    envelope,
                    &["data", "challengeId"],
                    &["data", "request", "resourceUserId"],
                )
                .await?
            }
            MessageKind::UpdateDraftOrActivateChallenge => {
                self.enrich_challenge_update(envelope).await?
            }
            MessageKind::ContestSubmission => {
                self.enrich_challenge_and_user(envelope, &["challengeId"], &["memberId"])
                    .await?
            }
            MessageKind::AutoPilotEvent => self.enrich_autopilot(envelope).await?,
        };

        self.sink.deliver(&event).await?;
        Ok(true)
    }

    /// 挑战 + 用户双路补全（注册/注销、加资源、关任务、竞赛提交共用）
    ///
    /// token 在本次 handler 调用内获取一次，两个需认证的查询复用；
    /// 按 handle 的查询走公开 API。
    async fn enrich_challenge_and_user(
        &self,
        envelope: &Envelope,
        challenge_path: &[&str],
        user_path: &[&str],
    ) -> Result<NormalizedEvent> {
        let payload = &envelope.payload;
        let challenge_id = id_at(payload, challenge_path);
        let user_id = id_at(payload, user_path);

        let token = self.api.get_token().await?;

        let content = self.api.get_challenge(&challenge_id, Some(&token)).await?;
        let challenge = ChallengeSummary::from_content(&content);
        info!(
            name = %challenge.name,
            challenge_type = %challenge.challenge_type,
            prizes = ?challenge.prizes,
            "挑战详情已获取"
        );

        let user = self.lookup_user(&user_id, &token).await?;
        info!(
            first_name = %user.first_name,
            last_name = %user.last_name,
            photo_url = %user.photo_url,
            "用户详情已获取"
        );

        let mut event = NormalizedEvent::new(
            &envelope.topic,
            message_type_of(payload),
            envelope.timestamp,
        );
        event.challenge_id = challenge_id.parse().ok();
        event.apply_challenge(&challenge);
        event.apply_user(&user);
        Ok(event)
    }

    /// 两次链式用户查询：按 id 拿到姓名和 handle，再按 handle 拿公开资料
    async fn lookup_user(&self, user_id: &str, token: &str) -> Result<UserSummary> {
        let content = self.api.get_user(user_id, Some(token)).await?;
        let first = content.get(0).cloned().unwrap_or(Value::Null);

        let handle = first
            .get("handle")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let profile = self.api.get_user_by_handle(&handle).await?;

        Ok(UserSummary {
            first_name: str_field(&first, "firstName"),
            last_name: str_field(&first, "lastName"),
            photo_url: str_field(&profile, "photoURL"),
            handle,
            home_country_code: str_field(&profile, "homeCountryCode"),
        })
    }

    /// UPDATE_DRAFT/ACTIVATE：优先使用 payload 内嵌的挑战字段
    ///
    /// 四个字段（名称、交付物类型、奖金、projectId）任一缺失/为空时
    /// 才触发外部查询，并用响应整体替换这四个字段；
    /// 全部就绪时不发起任何外部调用。没有用户补全。
    async fn enrich_challenge_update(&self, envelope: &Envelope) -> Result<NormalizedEvent> {
        let data = envelope.payload.get("data").cloned().unwrap_or(Value::Null);

        let mut challenge = ChallengeSummary::from_payload_data(&data);
        if !challenge.is_complete() {
            let challenge_id = id_at(&envelope.payload, &["data", "id"]);
            let content = self.api.get_challenge(&challenge_id, None).await?;
            challenge = ChallengeSummary::from_content(&content);
            info!(name = %challenge.name, "挑战字段不全，已从远程重新获取");
        } else {
            info!(name = %challenge.name, "payload 已携带全部挑战字段，跳过外部查询");
        }

        let mut event = NormalizedEvent::new(
            &envelope.topic,
            message_type_of(&envelope.payload),
            envelope.timestamp,
        );
        event.challenge_id = id_at(&envelope.payload, &["data", "id"]).parse().ok();
        event.apply_challenge(&challenge);
        Ok(event)
    }

    /// 自动导航事件：仅按 projectId 查询挑战，不做用户补全
    ///
    /// phaseTypeName/state 从 payload 原样复制。
    async fn enrich_autopilot(&self, envelope: &Envelope) -> Result<NormalizedEvent> {
        let payload = &envelope.payload;
        let project_id = id_at(payload, &["projectId"]);

        let content = self.api.get_challenge(&project_id, None).await?;
        let challenge = ChallengeSummary::from_content(&content);
        info!(
            name = %challenge.name,
            challenge_type = %challenge.challenge_type,
            "挑战详情已获取"
        );

        let mut event = NormalizedEvent::new(
            &envelope.topic,
            MessageKind::AutoPilotEvent.tag(),
            envelope.timestamp,
        );
        event.apply_challenge(&challenge);
        event.project_id = project_id.parse().ok();
        event.phase_type_name = str_field(payload, "phaseTypeName");
        event.state = str_field(payload, "state");

        if event.phase_type_name.is_empty() {
            warn!("autopilot 消息缺少 phaseTypeName");
        }
        Ok(event)
    }
}

/// payload.type 统一转大写作为事件分类标签，缺失时为空串
fn message_type_of(payload: &Value) -> String {
    payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_uppercase()
}

/// 沿路径取值并转成 id 字符串；数字转十进制文本，缺失/其他类型返回空串
///
/// 空串交给查询客户端时会报 MissingId，与上游"缺 id 即中止"的行为一致。
fn id_at(payload: &Value, path: &[&str]) -> String {
    let mut cur = payload;
    for key in path {
        match cur.get(key) {
            Some(v) => cur = v,
            None => return String::new(),
        }
    }
    match cur {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use corona_shared::error::RelayError;
    use corona_shared::events::{AUTOPILOT_TOPIC, CHALLENGE_TOPIC};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录调用次数的 stub 查询实现，固定 fixture 数据
    #[derive(Default)]
    struct StubApi {
        token_calls: AtomicUsize,
        challenge_calls: AtomicUsize,
        user_calls: AtomicUsize,
        handle_calls: AtomicUsize,
    }

    #[async_trait]
    impl LookupApi for StubApi {
        async fn get_token(&self) -> Result<String> {
            self.token_calls.fetch_add(1, Ordering::SeqCst);
            Ok("FakeToken".to_string())
        }

        async fn get_challenge(&self, challenge_id: &str, _token: Option<&str>) -> Result<Value> {
            self.challenge_calls.fetch_add(1, Ordering::SeqCst);
            match challenge_id {
                "" => Err(RelayError::MissingId {
                    field: "challenge id",
                }),
                "30049360" => Ok(json!({
                    "challengeName": "Test Challenge",
                    "challengeType": "Code",
                    "prize": [500.0, 250.0],
                    "projectId": 123
                })),
                other => Err(RelayError::Remote {
                    api: "challenge details",
                    status: 404,
                    content: format!("Challenge with id {other} not found"),
                }),
            }
        }

        async fn get_user(&self, member_id: &str, _token: Option<&str>) -> Result<Value> {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            match member_id {
                "" => Err(RelayError::MissingId { field: "user id" }),
                "23124329" => Ok(json!([
                    { "handle": "tester", "firstName": "First", "lastName": "Last" }
                ])),
                other => Err(RelayError::Remote {
                    api: "user details",
                    status: 404,
                    content: format!("User with id {other} not found"),
                }),
            }
        }

        async fn get_user_by_handle(&self, handle: &str) -> Result<Value> {
            self.handle_calls.fetch_add(1, Ordering::SeqCst);
            match handle {
                "" => Err(RelayError::MissingId {
                    field: "user handle",
                }),
                "tester" => Ok(json!({
                    "handle": "tester",
                    "photoURL": "https://example.com/photo.png",
                    "homeCountryCode": "USA"
                })),
                other => Err(RelayError::Remote {
                    api: "user details by handle",
                    status: 404,
                    content: format!("User with handle {other} not found"),
                }),
            }
        }
    }

    fn make_classifier() -> (Arc<StubApi>, Arc<MemorySink>, Classifier) {
        let api = Arc::new(StubApi::default());
        let sink = Arc::new(MemorySink::new(100));
        let classifier = Classifier::new(api.clone(), sink.clone());
        (api, sink, classifier)
    }

    fn envelope(topic: &str, payload: Value) -> Envelope {
        Envelope::from_value(&json!({
            "topic": topic,
            "originator": "originator",
            "timestamp": "2018-01-02T00:00:00",
            "mime-type": "application/json",
            "payload": payload,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_user_registration_handled() {
        let (api, sink, classifier) = make_classifier();
        let env = envelope(
            CHALLENGE_TOPIC,
            json!({
                "type": "USER_REGISTRATION",
                "data": { "challengeId": 30049360, "userId": 23124329 }
            }),
        );

        let handled = classifier.classify(&env).await.unwrap();
        assert!(handled);

        let entries = sink.snapshot();
        assert_eq!(entries.len(), 1);
        let event = &entries[0];
        assert_eq!(event.message_type, "USER_REGISTRATION");
        assert_eq!(event.challenge_id, Some(30049360));
        assert_eq!(event.project_id, Some(123));
        assert_eq!(event.challenge_name, "Test Challenge");
        assert_eq!(event.challenge_type, "Code");
        assert_eq!(event.prizes, vec![500.0, 250.0]);
        assert_eq!(event.first_name, "First");
        assert_eq!(event.last_name, "Last");
        assert_eq!(event.handle, "tester");
        assert_eq!(event.photo_url, "https://example.com/photo.png");
        assert_eq!(event.home_country_code, "USA");
        // createdAt 原样复制信封时间戳
        assert_eq!(event.created_at, env.timestamp);

        // token 在一次 handler 调用内只获取一次
        assert_eq!(api.token_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.challenge_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.user_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.handle_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_user_unregistration_same_handler() {
        let (_api, sink, classifier) = make_classifier();
        let env = envelope(
            CHALLENGE_TOPIC,
            json!({
                "type": "user_unregistration",
                "data": { "challengeId": 30049360, "userId": 23124329 }
            }),
        );

        assert!(classifier.classify(&env).await.unwrap());
        assert_eq!(sink.snapshot()[0].message_type, "USER_UNREGISTRATION");
    }

    #[tokio::test]
    async fn test_unmatched_returns_false_without_writes() {
        let (api, sink, classifier) = make_classifier();
        let env = envelope(
            CHALLENGE_TOPIC,
            json!({
                "type": "other",
                "data": { "challengeId": 30049360, "userId": 23124329 }
            }),
        );

        let handled = classifier.classify(&env).await.unwrap();
        assert!(!handled);
        assert!(sink.is_empty());
        // 未匹配不触发任何外部调用
        assert_eq!(api.token_calls.load(Ordering::SeqCst), 0);
        assert_eq!(api.challenge_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_add_resource_uses_nested_user_id() {
        let (api, sink, classifier) = make_classifier();
        let env = envelope(
            CHALLENGE_TOPIC,
            json!({
                "type": "ADD_RESOURCE",
                "data": {
                    "challengeId": 30049360,
                    "request": {
                        "roleId": 14,
                        "resourceUserId": 23124329,
                        "phaseId": 0
                    }
                }
            }),
        );

        assert!(classifier.classify(&env).await.unwrap());
        let event = &sink.snapshot()[0];
        assert_eq!(event.message_type, "ADD_RESOURCE");
        assert_eq!(event.first_name, "First");
        assert_eq!(api.user_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_activate_challenge_short_circuit() {
        let (api, sink, classifier) = make_classifier();
        let env = envelope(
            CHALLENGE_TOPIC,
            json!({
                "type": "ACTIVATE_CHALLENGE",
                "data": {
                    "id": 30049360,
                    "name": "test name",
                    "finalDeliverableTypes": "test type",
                    "prizes": [10],
                    "projectId": 123
                }
            }),
        );

        assert!(classifier.classify(&env).await.unwrap());

        // 四个字段齐全：零外部调用
        assert_eq!(api.challenge_calls.load(Ordering::SeqCst), 0);
        assert_eq!(api.token_calls.load(Ordering::SeqCst), 0);

        let event = &sink.snapshot()[0];
        assert_eq!(event.message_type, "ACTIVATE_CHALLENGE");
        assert_eq!(event.challenge_id, Some(30049360));
        assert_eq!(event.challenge_name, "test name");
        assert_eq!(event.challenge_type, "test type");
        assert_eq!(event.prizes, vec![10.0]);
        assert_eq!(event.project_id, Some(123));
        // 该 handler 不做用户补全
        assert!(event.first_name.is_empty());
    }

    #[tokio::test]
    async fn test_activate_challenge_refetches_when_incomplete() {
        let (api, sink, classifier) = make_classifier();
        let env = envelope(
            CHALLENGE_TOPIC,
            json!({
                "type": "ACTIVATE_CHALLENGE",
                "data": {
                    "id": 30049360,
                    "name": null,
                    "finalDeliverableTypes": null,
                    "prizes": [10],
                    "projectId": 123
                }
            }),
        );

        assert!(classifier.classify(&env).await.unwrap());
        assert_eq!(api.challenge_calls.load(Ordering::SeqCst), 1);

        // 触发查询后四个字段整体来自远程响应
        let event = &sink.snapshot()[0];
        assert_eq!(event.challenge_name, "Test Challenge");
        assert_eq!(event.challenge_type, "Code");
        assert_eq!(event.prizes, vec![500.0, 250.0]);
    }

    #[tokio::test]
    async fn test_close_task_challenge_not_found() {
        let (_api, sink, classifier) = make_classifier();
        let env = envelope(
            CHALLENGE_TOPIC,
            json!({
                "type": "CLOSE_TASK",
                "data": { "challengeId": 912345111111_i64, "userId": 23124329, "winnerId": 123 }
            }),
        );

        let err = classifier.classify(&env).await.unwrap_err();
        assert!(err.to_string().contains("Failed to get challenge details"));
        // 失败时不产出部分事件
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_close_task_user_not_found() {
        let (_api, sink, classifier) = make_classifier();
        let env = envelope(
            CHALLENGE_TOPIC,
            json!({
                "type": "CLOSE_TASK",
                "data": { "challengeId": 30049360, "userId": 9923124329_i64, "winnerId": 123 }
            }),
        );

        let err = classifier.classify(&env).await.unwrap_err();
        assert!(err.to_string().contains("Failed to get user details"));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_missing_challenge_id_aborts_handler() {
        let (_api, sink, classifier) = make_classifier();
        let env = envelope(
            CHALLENGE_TOPIC,
            json!({
                "type": "USER_REGISTRATION",
                "data": { "userId": 23124329 }
            }),
        );

        let err = classifier.classify(&env).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing challenge id");
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_contest_submission() {
        let (_api, sink, classifier) = make_classifier();
        let env = envelope(
            "submission.notification.update",
            json!({
                "resource": "submission",
                "type": "Contest Submission",
                "memberId": 23124329,
                "challengeId": 30049360,
                "fileType": "zip"
            }),
        );

        assert!(classifier.classify(&env).await.unwrap());
        let event = &sink.snapshot()[0];
        assert_eq!(event.topic, "submission.notification.update");
        assert_eq!(event.message_type, "CONTEST SUBMISSION");
        assert_eq!(event.challenge_id, Some(30049360));
        assert_eq!(event.handle, "tester");
    }

    #[tokio::test]
    async fn test_autopilot_event() {
        let (api, sink, classifier) = make_classifier();
        let env = envelope(
            AUTOPILOT_TOPIC,
            json!({
                "date": "2018-03-04T11:22:33.111Z",
                "projectId": 30049360,
                "phaseId": 12,
                "phaseTypeName": "Submission",
                "state": "END",
                "operator": "123123"
            }),
        );

        assert!(classifier.classify(&env).await.unwrap());

        let event = &sink.snapshot()[0];
        assert_eq!(event.message_type, "AUTO_PILOT_EVENT");
        assert_eq!(event.project_id, Some(30049360));
        assert_eq!(event.phase_type_name, "Submission");
        assert_eq!(event.state, "END");
        assert_eq!(event.challenge_name, "Test Challenge");
        // 无用户补全
        assert_eq!(api.user_calls.load(Ordering::SeqCst), 0);
        assert_eq!(api.handle_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_classify_is_deterministic() {
        let (_api, sink, classifier) = make_classifier();
        let env = envelope(
            CHALLENGE_TOPIC,
            json!({
                "type": "USER_REGISTRATION",
                "data": { "challengeId": 30049360, "userId": 23124329 }
            }),
        );

        assert!(classifier.classify(&env).await.unwrap());
        assert!(classifier.classify(&env).await.unwrap());

        // 同一信封 + 同一批外部响应 => 两条记录逐字段相等
        let entries = sink.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], entries[1]);
    }
}
