//! Audit events for authentication activity.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum AuthEventKind {
    #[serde(rename = "login.success")]
    LoginSuccess,
    #[serde(rename = "login.fail")]
    LoginFail,
    #[serde(rename = "refresh.success")]
    RefreshSuccess,
    #[serde(rename = "refresh.fail")]
    RefreshFail,
    #[serde(rename = "logout")]
    Logout,
    #[serde(rename = "logout_all")]
    LogoutAll,
}

impl AuthEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEventKind::LoginSuccess => "login.success",
            AuthEventKind::LoginFail => "login.fail",
            AuthEventKind::RefreshSuccess => "refresh.success",
            AuthEventKind::RefreshFail => "refresh.fail",
            AuthEventKind::Logout => "logout",
            AuthEventKind::LogoutAll => "logout_all",
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            AuthEventKind::LoginFail | AuthEventKind::RefreshFail => "failure",
            _ => "success",
        }
    }
}

impl std::str::FromStr for AuthEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login.success" => Ok(AuthEventKind::LoginSuccess),
            "login.fail" => Ok(AuthEventKind::LoginFail),
            "refresh.success" => Ok(AuthEventKind::RefreshSuccess),
            "refresh.fail" => Ok(AuthEventKind::RefreshFail),
            "logout" => Ok(AuthEventKind::Logout),
            "logout_all" => Ok(AuthEventKind::LogoutAll),
            _ => Err(format!("Unknown auth event: {}", s)),
        }
    }
}

/// A single entry of the auth event log.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthEvent {
    /// Position in the log, assigned on append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: AuthEventKind,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Error code of a failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind) -> Self {
        Self {
            id: None,
            kind,
            at: Utc::now(),
            user_id: None,
            email: None,
            device_id: None,
            ip: None,
            user_agent: None,
            reason: None,
        }
    }

    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn device(mut self, device_id: Option<&str>) -> Self {
        self.device_id = device_id.map(str::to_string);
        self
    }

    pub fn client(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }

    pub fn reason(mut self, code: impl Into<String>) -> Self {
        self.reason = Some(code.into());
        self
    }

    /// Flatten into field/value pairs for a stream entry. Absent fields are skipped.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("type", self.kind.as_str().to_string()),
            ("at", self.at.to_rfc3339()),
        ];
        if let Some(user_id) = self.user_id {
            fields.push(("user_id", user_id.to_string()));
        }
        let optional = [
            ("email", &self.email),
            ("device_id", &self.device_id),
            ("ip", &self.ip),
            ("user_agent", &self.user_agent),
            ("reason", &self.reason),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                fields.push((name, value.clone()));
            }
        }
        fields
    }

    /// Rebuild an event from stream fields. Returns `None` for unknown event types.
    pub fn from_fields(id: String, fields: &HashMap<String, String>) -> Option<Self> {
        let kind = fields.get("type")?.parse().ok()?;
        let at = fields
            .get("at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(Self {
            id: Some(id),
            kind,
            at,
            user_id: fields.get("user_id").and_then(|s| s.parse().ok()),
            email: fields.get("email").cloned(),
            device_id: fields.get("device_id").cloned(),
            ip: fields.get("ip").cloned(),
            user_agent: fields.get("user_agent").cloned(),
            reason: fields.get("reason").cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_survive_a_stream_round_trip() {
        let event = AuthEvent::new(AuthEventKind::RefreshFail)
            .user(9)
            .device(Some("d1"))
            .reason("JTI_MISMATCH");

        let fields: HashMap<String, String> = event
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert!(!fields.contains_key("email"));

        let parsed = AuthEvent::from_fields("1-0".to_string(), &fields).unwrap();
        assert_eq!(parsed.kind, AuthEventKind::RefreshFail);
        assert_eq!(parsed.user_id, Some(9));
        assert_eq!(parsed.reason.as_deref(), Some("JTI_MISMATCH"));
    }

    #[test]
    fn unknown_type_is_skipped() {
        let mut fields = HashMap::new();
        fields.insert("type".to_string(), "password.reset".to_string());
        assert!(AuthEvent::from_fields("1-0".to_string(), &fields).is_none());
    }

    #[test]
    fn serializes_with_dotted_type() {
        let json = serde_json::to_value(AuthEvent::new(AuthEventKind::LoginSuccess)).unwrap();
        assert_eq!(json["type"], "login.success");
    }
}
