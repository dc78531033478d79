use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Universal event envelope carried end to end through the pipeline.
///
/// Public surface is JSON (payload variant flattened under its snake-cased
/// name); the broker wire form is protobuf via the prost annotations.
///
/// Broker subject format: `events.{app_id}.{category}.{event_type}`
/// Example: `events.demo.navigation.screen_view`
#[derive(Clone, PartialEq, ::prost::Message, Serialize)]
pub struct Envelope {
    /// Time-sortable unique id (UUIDv7). Server-filled when empty.
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub id: String,

    /// Replay-protection key. Server-filled when empty; empty keys are
    /// never deduplicated.
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub idempotency_key: String,

    /// Tenant identifier. Required, non-empty.
    #[prost(string, tag = "3")]
    #[serde(default)]
    pub app_id: String,

    #[prost(string, optional, tag = "4")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[prost(string, optional, tag = "5")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Wall-clock milliseconds since epoch. Zero means "server, fill me in".
    #[prost(int64, tag = "6")]
    #[serde(default)]
    pub timestamp_ms: i64,

    #[prost(string, optional, tag = "7")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[prost(message, optional, tag = "8")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_context: Option<DeviceContext>,

    #[prost(
        oneof = "EventPayload",
        tags = "20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47"
    )]
    #[serde(flatten)]
    pub payload: Option<EventPayload>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct DeviceContext {
    #[prost(string, optional, tag = "1")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[prost(string, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[prost(string, optional, tag = "3")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[prost(string, optional, tag = "4")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[prost(string, optional, tag = "5")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    #[prost(string, optional, tag = "6")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[prost(string, optional, tag = "7")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Closed union of event payloads. Exactly one variant per envelope.
#[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    // Lifecycle
    #[prost(message, tag = "20")]
    AppOpen(AppOpen),
    #[prost(message, tag = "21")]
    AppBackground(AppBackground),
    #[prost(message, tag = "22")]
    AppForeground(AppForeground),
    #[prost(message, tag = "23")]
    AppCrash(AppCrash),
    #[prost(message, tag = "24")]
    SessionStart(SessionStart),
    #[prost(message, tag = "25")]
    SessionEnd(SessionEnd),
    // Navigation
    #[prost(message, tag = "26")]
    ScreenView(ScreenView),
    #[prost(message, tag = "27")]
    DeepLinkOpen(DeepLinkOpen),
    // Interaction
    #[prost(message, tag = "28")]
    ButtonTap(ButtonTap),
    #[prost(message, tag = "29")]
    FormSubmit(FormSubmit),
    #[prost(message, tag = "30")]
    Search(Search),
    #[prost(message, tag = "31")]
    Share(Share),
    // Revenue
    #[prost(message, tag = "32")]
    Purchase(Purchase),
    #[prost(message, tag = "33")]
    Refund(Refund),
    #[prost(message, tag = "34")]
    CartAdd(CartAdd),
    #[prost(message, tag = "35")]
    CheckoutStart(CheckoutStart),
    #[prost(message, tag = "36")]
    SubscriptionChange(SubscriptionChange),
    // Identity
    #[prost(message, tag = "37")]
    SignUp(SignUp),
    #[prost(message, tag = "38")]
    LogIn(LogIn),
    #[prost(message, tag = "39")]
    LogOut(LogOut),
    // Media
    #[prost(message, tag = "40")]
    VideoPlay(VideoPlay),
    #[prost(message, tag = "41")]
    VideoPause(VideoPause),
    #[prost(message, tag = "42")]
    VideoComplete(VideoComplete),
    // Messaging
    #[prost(message, tag = "43")]
    PushReceived(PushReceived),
    #[prost(message, tag = "44")]
    PushOpened(PushOpened),
    // Advertising
    #[prost(message, tag = "45")]
    AdImpression(AdImpression),
    #[prost(message, tag = "46")]
    AdClick(AdClick),
    // Free-form
    #[prost(message, tag = "47")]
    Custom(Custom),
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct AppOpen {
    #[prost(string, optional, tag = "1")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_source: Option<String>,
    #[prost(bool, tag = "2")]
    #[serde(default)]
    pub is_first_open: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct AppBackground {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct AppForeground {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct AppCrash {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub message: String,
    #[prost(string, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[prost(bool, tag = "3")]
    #[serde(default)]
    pub is_fatal: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct SessionStart {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub session_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct SessionEnd {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub session_id: String,
    #[prost(int64, tag = "2")]
    #[serde(default)]
    pub duration_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct ScreenView {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub screen_name: String,
    #[prost(string, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_screen: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct DeepLinkOpen {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub url: String,
    #[prost(string, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct ButtonTap {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub button_id: String,
    #[prost(string, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_name: Option<String>,
    #[prost(string, optional, tag = "3")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct FormSubmit {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub form_id: String,
    #[prost(string, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_name: Option<String>,
    #[prost(bool, tag = "3")]
    #[serde(default)]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Search {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub query: String,
    #[prost(int64, tag = "2")]
    #[serde(default)]
    pub results_count: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Share {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub content_id: String,
    #[prost(string, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Purchase {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub order_id: String,
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub product_id: String,
    #[prost(int64, tag = "3")]
    #[serde(default)]
    pub quantity: i64,
    #[prost(double, tag = "4")]
    #[serde(default)]
    pub amount: f64,
    #[prost(string, tag = "5")]
    #[serde(default)]
    pub currency: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Refund {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub order_id: String,
    #[prost(double, tag = "2")]
    #[serde(default)]
    pub amount: f64,
    #[prost(string, tag = "3")]
    #[serde(default)]
    pub currency: String,
    #[prost(string, optional, tag = "4")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct CartAdd {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub product_id: String,
    #[prost(int64, tag = "2")]
    #[serde(default)]
    pub quantity: i64,
    #[prost(double, tag = "3")]
    #[serde(default)]
    pub price: f64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct CheckoutStart {
    #[prost(double, tag = "1")]
    #[serde(default)]
    pub cart_value: f64,
    #[prost(int64, tag = "2")]
    #[serde(default)]
    pub item_count: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct SubscriptionChange {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub plan_id: String,
    #[prost(string, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_plan_id: Option<String>,
    #[prost(double, tag = "3")]
    #[serde(default)]
    pub mrr_delta: f64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct SignUp {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub method: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct LogIn {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub method: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct LogOut {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct VideoPlay {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub video_id: String,
    #[prost(int64, tag = "2")]
    #[serde(default)]
    pub position_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct VideoPause {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub video_id: String,
    #[prost(int64, tag = "2")]
    #[serde(default)]
    pub position_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct VideoComplete {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub video_id: String,
    #[prost(int64, tag = "2")]
    #[serde(default)]
    pub duration_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct PushReceived {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub campaign_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct PushOpened {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub campaign_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct AdImpression {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub ad_unit_id: String,
    #[prost(string, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct AdClick {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub ad_unit_id: String,
    #[prost(string, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// Free-form event: a name plus four typed parameter maps.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Custom {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub name: String,
    #[prost(map = "string, string", tag = "2")]
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub string_params: HashMap<String, String>,
    #[prost(map = "string, int64", tag = "3")]
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub int_params: HashMap<String, i64>,
    #[prost(map = "string, double", tag = "4")]
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub float_params: HashMap<String, f64>,
    #[prost(map = "string, bool", tag = "5")]
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub bool_params: HashMap<String, bool>,
}

impl EventPayload {
    /// Snake-cased JSON field names, in oneof tag order.
    pub const FIELD_NAMES: &'static [&'static str] = &[
        "app_open",
        "app_background",
        "app_foreground",
        "app_crash",
        "session_start",
        "session_end",
        "screen_view",
        "deep_link_open",
        "button_tap",
        "form_submit",
        "search",
        "share",
        "purchase",
        "refund",
        "cart_add",
        "checkout_start",
        "subscription_change",
        "sign_up",
        "log_in",
        "log_out",
        "video_play",
        "video_pause",
        "video_complete",
        "push_received",
        "push_opened",
        "ad_impression",
        "ad_click",
        "custom",
    ];

    /// Deserialize a payload variant from its flattened JSON field.
    /// Returns `Ok(None)` for field names that are not payload variants.
    pub fn from_json_field(
        key: &str,
        value: serde_json::Value,
    ) -> Result<Option<EventPayload>, serde_json::Error> {
        use serde_json::from_value as fv;
        let payload = match key {
            "app_open" => EventPayload::AppOpen(fv(value)?),
            "app_background" => EventPayload::AppBackground(fv(value)?),
            "app_foreground" => EventPayload::AppForeground(fv(value)?),
            "app_crash" => EventPayload::AppCrash(fv(value)?),
            "session_start" => EventPayload::SessionStart(fv(value)?),
            "session_end" => EventPayload::SessionEnd(fv(value)?),
            "screen_view" => EventPayload::ScreenView(fv(value)?),
            "deep_link_open" => EventPayload::DeepLinkOpen(fv(value)?),
            "button_tap" => EventPayload::ButtonTap(fv(value)?),
            "form_submit" => EventPayload::FormSubmit(fv(value)?),
            "search" => EventPayload::Search(fv(value)?),
            "share" => EventPayload::Share(fv(value)?),
            "purchase" => EventPayload::Purchase(fv(value)?),
            "refund" => EventPayload::Refund(fv(value)?),
            "cart_add" => EventPayload::CartAdd(fv(value)?),
            "checkout_start" => EventPayload::CheckoutStart(fv(value)?),
            "subscription_change" => EventPayload::SubscriptionChange(fv(value)?),
            "sign_up" => EventPayload::SignUp(fv(value)?),
            "log_in" => EventPayload::LogIn(fv(value)?),
            "log_out" => EventPayload::LogOut(fv(value)?),
            "video_play" => EventPayload::VideoPlay(fv(value)?),
            "video_pause" => EventPayload::VideoPause(fv(value)?),
            "video_complete" => EventPayload::VideoComplete(fv(value)?),
            "push_received" => EventPayload::PushReceived(fv(value)?),
            "push_opened" => EventPayload::PushOpened(fv(value)?),
            "ad_impression" => EventPayload::AdImpression(fv(value)?),
            "ad_click" => EventPayload::AdClick(fv(value)?),
            "custom" => EventPayload::Custom(fv(value)?),
            _ => return Ok(None),
        };
        Ok(Some(payload))
    }

    /// Event category used in broker subjects and rule filters.
    pub fn category(&self) -> &'static str {
        match self {
            EventPayload::AppOpen(_)
            | EventPayload::AppBackground(_)
            | EventPayload::AppForeground(_)
            | EventPayload::AppCrash(_)
            | EventPayload::SessionStart(_)
            | EventPayload::SessionEnd(_) => "lifecycle",
            EventPayload::ScreenView(_) | EventPayload::DeepLinkOpen(_) => "navigation",
            EventPayload::ButtonTap(_)
            | EventPayload::FormSubmit(_)
            | EventPayload::Search(_)
            | EventPayload::Share(_) => "interaction",
            EventPayload::Purchase(_)
            | EventPayload::Refund(_)
            | EventPayload::CartAdd(_)
            | EventPayload::CheckoutStart(_)
            | EventPayload::SubscriptionChange(_) => "revenue",
            EventPayload::SignUp(_) | EventPayload::LogIn(_) | EventPayload::LogOut(_) => {
                "identity"
            }
            EventPayload::VideoPlay(_)
            | EventPayload::VideoPause(_)
            | EventPayload::VideoComplete(_) => "media",
            EventPayload::PushReceived(_) | EventPayload::PushOpened(_) => "messaging",
            EventPayload::AdImpression(_) | EventPayload::AdClick(_) => "advertising",
            EventPayload::Custom(_) => "custom",
        }
    }

    /// Event type used in broker subjects and rule filters. For custom
    /// events this is the sanitized custom name, falling back to "custom".
    pub fn event_type(&self) -> String {
        match self {
            EventPayload::AppOpen(_) => "app_open".to_string(),
            EventPayload::AppBackground(_) => "app_background".to_string(),
            EventPayload::AppForeground(_) => "app_foreground".to_string(),
            EventPayload::AppCrash(_) => "app_crash".to_string(),
            EventPayload::SessionStart(_) => "session_start".to_string(),
            EventPayload::SessionEnd(_) => "session_end".to_string(),
            EventPayload::ScreenView(_) => "screen_view".to_string(),
            EventPayload::DeepLinkOpen(_) => "deep_link_open".to_string(),
            EventPayload::ButtonTap(_) => "button_tap".to_string(),
            EventPayload::FormSubmit(_) => "form_submit".to_string(),
            EventPayload::Search(_) => "search".to_string(),
            EventPayload::Share(_) => "share".to_string(),
            EventPayload::Purchase(_) => "purchase".to_string(),
            EventPayload::Refund(_) => "refund".to_string(),
            EventPayload::CartAdd(_) => "cart_add".to_string(),
            EventPayload::CheckoutStart(_) => "checkout_start".to_string(),
            EventPayload::SubscriptionChange(_) => "subscription_change".to_string(),
            EventPayload::SignUp(_) => "sign_up".to_string(),
            EventPayload::LogIn(_) => "log_in".to_string(),
            EventPayload::LogOut(_) => "log_out".to_string(),
            EventPayload::VideoPlay(_) => "video_play".to_string(),
            EventPayload::VideoPause(_) => "video_pause".to_string(),
            EventPayload::VideoComplete(_) => "video_complete".to_string(),
            EventPayload::PushReceived(_) => "push_received".to_string(),
            EventPayload::PushOpened(_) => "push_opened".to_string(),
            EventPayload::AdImpression(_) => "ad_impression".to_string(),
            EventPayload::AdClick(_) => "ad_click".to_string(),
            EventPayload::Custom(c) => {
                let name = sanitize_token(&c.name);
                if name.is_empty() {
                    "custom".to_string()
                } else {
                    name
                }
            }
        }
    }
}

// Payload is deserialized by scanning the leftover flattened fields, so a
// missing or unknown variant becomes `payload: None` (rejected later by
// validation) instead of failing the whole request body.
impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(default)]
            id: String,
            #[serde(default)]
            idempotency_key: String,
            #[serde(default)]
            app_id: String,
            #[serde(default)]
            device_id: Option<String>,
            #[serde(default)]
            user_id: Option<String>,
            #[serde(default)]
            timestamp_ms: i64,
            #[serde(default)]
            correlation_id: Option<String>,
            #[serde(default)]
            device_context: Option<DeviceContext>,
            #[serde(flatten)]
            rest: serde_json::Map<String, serde_json::Value>,
        }

        let wire = Wire::deserialize(deserializer)?;
        let mut payload = None;
        for (key, value) in wire.rest {
            if let Some(parsed) =
                EventPayload::from_json_field(&key, value).map_err(serde::de::Error::custom)?
            {
                payload = Some(parsed);
                break;
            }
        }

        Ok(Envelope {
            id: wire.id,
            idempotency_key: wire.idempotency_key,
            app_id: wire.app_id,
            device_id: wire.device_id,
            user_id: wire.user_id,
            timestamp_ms: wire.timestamp_ms,
            correlation_id: wire.correlation_id,
            device_context: wire.device_context,
            payload,
        })
    }
}

impl Envelope {
    /// Fill server-authoritative fields. Applied before dedup; after this an
    /// admitted envelope always carries non-empty `id` and
    /// `idempotency_key` and a positive timestamp.
    pub fn enrich(&mut self, now_ms: i64) {
        if self.id.is_empty() {
            self.id = Uuid::now_v7().to_string();
        }
        if self.timestamp_ms == 0 {
            self.timestamp_ms = now_ms;
        }
        if self.idempotency_key.is_empty() {
            self.idempotency_key = Uuid::new_v4().to_string();
        }
    }

    /// Broker subject: `events.{app_id}.{category}.{event_type}`.
    /// Panics never; falls back to the "custom" tokens when no payload is
    /// set (validation rejects such envelopes before publish).
    pub fn subject(&self) -> String {
        let (category, event_type) = match &self.payload {
            Some(p) => (p.category(), p.event_type()),
            None => ("custom", "custom".to_string()),
        };
        format!(
            "events.{}.{}.{}",
            sanitize_app_id(&self.app_id),
            category,
            event_type
        )
    }

    /// Storage partition derived from `timestamp_ms` as UTC.
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::from_timestamp_ms(&self.app_id, self.timestamp_ms)
    }

    /// Nested-mapping form used by rule evaluation (payload variant keyed by
    /// its snake-cased name).
    pub fn render(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// `(app_id, year, month, day, hour)` storage partition, UTC.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub app_id: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl PartitionKey {
    pub fn from_timestamp_ms(app_id: &str, timestamp_ms: i64) -> Self {
        let dt = Utc
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
        Self {
            app_id: app_id.to_string(),
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
        }
    }

    /// Object-store prefix: `app_id={a}/year={Y}/month={M}/day={D}/hour={H}/`.
    pub fn path_prefix(&self) -> String {
        format!(
            "app_id={}/year={}/month={}/day={}/hour={}/",
            self.app_id, self.year, self.month, self.day, self.hour
        )
    }

    /// True when this partition's wall-clock hour strictly precedes `now`.
    pub fn is_cold(&self, now: chrono::DateTime<Utc>) -> bool {
        let bucket = (self.year, self.month, self.day, self.hour);
        let current = (now.year(), now.month(), now.day(), now.hour());
        bucket < current
    }
}

/// Tenant ids appear inside dot-separated broker subjects; replace dots so
/// they occupy exactly one token.
pub fn sanitize_app_id(app_id: &str) -> String {
    app_id.replace('.', "_")
}

/// Lowercase and collapse anything non-alphanumeric to `_`.
pub fn sanitize_token(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn screen_view_json() -> &'static str {
        r#"{"app_id":"demo","device_id":"d1","timestamp_ms":1706918400000,"screen_view":{"screen_name":"home"}}"#
    }

    #[test]
    fn deserializes_flattened_payload() {
        let env: Envelope = serde_json::from_str(screen_view_json()).unwrap();
        assert_eq!(env.app_id, "demo");
        assert_eq!(env.device_id.as_deref(), Some("d1"));
        match env.payload {
            Some(EventPayload::ScreenView(ref sv)) => assert_eq!(sv.screen_name, "home"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn missing_payload_deserializes_to_none() {
        let env: Envelope =
            serde_json::from_str(r#"{"app_id":"demo","timestamp_ms":1}"#).unwrap();
        assert!(env.payload.is_none());
    }

    #[test]
    fn serializes_payload_under_snake_name() {
        let env: Envelope = serde_json::from_str(screen_view_json()).unwrap();
        let value = env.render();
        assert_eq!(value["screen_view"]["screen_name"], "home");
        assert_eq!(value["app_id"], "demo");
    }

    #[test]
    fn category_and_type_derivation() {
        let env: Envelope = serde_json::from_str(screen_view_json()).unwrap();
        let payload = env.payload.as_ref().unwrap();
        assert_eq!(payload.category(), "navigation");
        assert_eq!(payload.event_type(), "screen_view");
    }

    #[test]
    fn custom_event_type_is_sanitized() {
        let payload = EventPayload::Custom(Custom {
            name: "Level Complete!".to_string(),
            ..Default::default()
        });
        assert_eq!(payload.category(), "custom");
        assert_eq!(payload.event_type(), "level_complete_");
    }

    #[test]
    fn subject_sanitizes_app_id() {
        let mut env: Envelope = serde_json::from_str(screen_view_json()).unwrap();
        env.app_id = "com.acme.shop".to_string();
        assert_eq!(env.subject(), "events.com_acme_shop.navigation.screen_view");
    }

    #[test]
    fn partition_key_is_utc() {
        // 2024-02-03 00:00:00 UTC
        let key = PartitionKey::from_timestamp_ms("demo", 1_706_918_400_000);
        assert_eq!((key.year, key.month, key.day, key.hour), (2024, 2, 3, 0));
        assert_eq!(
            key.path_prefix(),
            "app_id=demo/year=2024/month=2/day=3/hour=0/"
        );
    }

    #[test]
    fn cold_partition_excludes_current_hour() {
        let now = Utc.with_ymd_and_hms(2024, 2, 3, 10, 30, 0).unwrap();
        let cold = PartitionKey::from_timestamp_ms("demo", 1_706_918_400_000);
        assert!(cold.is_cold(now));
        let current = PartitionKey {
            app_id: "demo".to_string(),
            year: 2024,
            month: 2,
            day: 3,
            hour: 10,
        };
        assert!(!current.is_cold(now));
    }

    #[test]
    fn enrich_fills_missing_fields_only() {
        let mut env: Envelope =
            serde_json::from_str(r#"{"app_id":"demo","screen_view":{"screen_name":"home"}}"#)
                .unwrap();
        env.enrich(42);
        assert!(!env.id.is_empty());
        assert!(!env.idempotency_key.is_empty());
        assert_eq!(env.timestamp_ms, 42);

        let id = env.id.clone();
        let key = env.idempotency_key.clone();
        env.enrich(99);
        assert_eq!(env.id, id);
        assert_eq!(env.idempotency_key, key);
        assert_eq!(env.timestamp_ms, 42);
    }

    #[test]
    fn wire_roundtrip() {
        let mut env: Envelope = serde_json::from_str(screen_view_json()).unwrap();
        env.enrich(1_706_918_400_000);
        let bytes = env.encode_to_vec();
        let decoded = Envelope::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn custom_params_roundtrip() {
        let json = r#"{"app_id":"demo","timestamp_ms":5,"custom":{"name":"level_up","int_params":{"level":7},"string_params":{"world":"ice"}}}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        let bytes = env.encode_to_vec();
        let decoded = Envelope::decode(bytes.as_slice()).unwrap();
        match decoded.payload {
            Some(EventPayload::Custom(ref c)) => {
                assert_eq!(c.int_params.get("level"), Some(&7));
                assert_eq!(c.string_params.get("world").map(String::as_str), Some("ice"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
