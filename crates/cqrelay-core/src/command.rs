//! OneBot command model.
//!
//! Frames from the framework are JSON objects `{action, params, echo}`. Only
//! four actions are looked into; everything else stays [`Params::Opaque`] and
//! is forwarded as the original text.
//!
//! `params` and `echo` are kept as raw JSON so that a rewritten command
//! carries the exact `echo` bytes the framework sent.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

/// Actions the interceptor knows how to rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SendPrivateMsg,
    SendGroupMsg,
    UploadPrivateFile,
    UploadGroupFile,
}

impl Action {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "send_private_msg" => Some(Self::SendPrivateMsg),
            "send_group_msg" => Some(Self::SendGroupMsg),
            "upload_private_file" => Some(Self::UploadPrivateFile),
            "upload_group_file" => Some(Self::UploadGroupFile),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SendPrivateMsg => "send_private_msg",
            Self::SendGroupMsg => "send_group_msg",
            Self::UploadPrivateFile => "upload_private_file",
            Self::UploadGroupFile => "upload_group_file",
        }
    }

    /// Params key holding the recipient.
    pub fn target_key(self) -> &'static str {
        match self {
            Self::SendPrivateMsg | Self::UploadPrivateFile => "user_id",
            Self::SendGroupMsg | Self::UploadGroupFile => "group_id",
        }
    }

    /// The message action addressing the same kind of recipient.
    pub fn message_action(self) -> Self {
        match self {
            Self::SendPrivateMsg | Self::UploadPrivateFile => Self::SendPrivateMsg,
            Self::SendGroupMsg | Self::UploadGroupFile => Self::SendGroupMsg,
        }
    }

    pub fn is_upload(self) -> bool {
        matches!(self, Self::UploadPrivateFile | Self::UploadGroupFile)
    }
}

/// A user or group id. OneBot implementations accept both numbers and
/// numeric strings; the form is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatId {
    Number(i64),
    Text(String),
}

/// Parameters of `upload_private_file` / `upload_group_file`.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadParams {
    pub target: ChatId,
    pub file: String,
    pub name: Option<String>,
    /// Any other fields (e.g. `folder`), carried over unchanged.
    pub extra: Map<String, Value>,
}

impl UploadParams {
    fn from_fields(action: Action, mut fields: Map<String, Value>) -> Option<Self> {
        let target = serde_json::from_value(fields.remove(action.target_key())?).ok()?;
        let file = match fields.remove("file")? {
            Value::String(s) => s,
            _ => return None,
        };
        let name = match fields.remove("name") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return None,
        };
        Some(Self {
            target,
            file,
            name,
            extra: fields,
        })
    }

    /// Params object for the same upload action with a new file and name.
    pub fn to_upload_params(&self, action: Action, file: &str, name: &str) -> Value {
        let mut fields = self.extra.clone();
        fields.insert(action.target_key().into(), target_value(&self.target));
        fields.insert("file".into(), Value::String(file.to_string()));
        fields.insert("name".into(), Value::String(name.to_string()));
        Value::Object(fields)
    }

    /// Params object for a message to the upload's recipient.
    pub fn to_message_params(&self, action: Action, message: String) -> Value {
        let mut fields = Map::new();
        fields.insert(action.target_key().into(), target_value(&self.target));
        fields.insert("message".into(), Value::String(message));
        Value::Object(fields)
    }
}

fn target_value(id: &ChatId) -> Value {
    match id {
        ChatId::Number(n) => Value::from(*n),
        ChatId::Text(s) => Value::String(s.clone()),
    }
}

/// Decoded params of a recognized command.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    /// `send_*_msg`: every params field, `message` included.
    Message {
        action: Action,
        fields: Map<String, Value>,
    },
    /// `upload_*_file`.
    Upload { action: Action, upload: UploadParams },
    /// Anything else; the original frame is authoritative.
    Opaque,
}

/// A command frame with `params` and `echo` left undecoded.
#[derive(Debug, Deserialize)]
pub struct Command {
    pub action: String,
    #[serde(default, deserialize_with = "present_raw")]
    pub params: Option<Box<RawValue>>,
    #[serde(default, deserialize_with = "present_raw")]
    pub echo: Option<Box<RawValue>>,
}

/// Keeps an explicit `null` as `Some("null")` so it is written back as-is.
fn present_raw<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

#[derive(Serialize)]
struct OutgoingCommand<'a> {
    action: &'a str,
    params: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    echo: Option<&'a RawValue>,
}

impl Command {
    /// Parse a text frame; `None` for anything that is not a command.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Decode `params` according to the action.
    pub fn params(&self) -> Params {
        let Some(action) = Action::from_name(&self.action) else {
            return Params::Opaque;
        };
        let Some(fields) = self
            .params
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Map<String, Value>>(raw.get()).ok())
        else {
            return Params::Opaque;
        };

        if action.is_upload() {
            match UploadParams::from_fields(action, fields) {
                Some(upload) => Params::Upload { action, upload },
                None => Params::Opaque,
            }
        } else {
            Params::Message { action, fields }
        }
    }

    /// Serialize a new command carrying this command's `echo`.
    pub fn rebuild(&self, action: Action, params: &Value) -> serde_json::Result<String> {
        serde_json::to_string(&OutgoingCommand {
            action: action.name(),
            params,
            echo: self.echo.as_deref(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_commands_do_not_parse() {
        assert!(Command::parse("ping").is_none());
        assert!(Command::parse("[1,2]").is_none());
        assert!(Command::parse(r#"{"post_type":"meta_event"}"#).is_none());
    }

    #[test]
    fn unknown_actions_are_opaque() {
        let cmd = Command::parse(r#"{"action":"get_login_info","params":{}}"#).unwrap();
        assert_eq!(cmd.params(), Params::Opaque);
    }

    #[test]
    fn message_params_keep_all_fields() {
        let cmd = Command::parse(
            r#"{"action":"send_group_msg","params":{"group_id":1,"message":"m","auto_escape":false}}"#,
        )
        .unwrap();
        match cmd.params() {
            Params::Message { action, fields } => {
                assert_eq!(action, Action::SendGroupMsg);
                assert_eq!(fields.get("auto_escape"), Some(&json!(false)));
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[test]
    fn upload_params_decode() {
        let cmd = Command::parse(
            r#"{"action":"upload_group_file","params":{"group_id":"42","file":"/a","folder":"f"}}"#,
        )
        .unwrap();
        match cmd.params() {
            Params::Upload { action, upload } => {
                assert_eq!(action, Action::UploadGroupFile);
                assert_eq!(upload.target, ChatId::Text("42".into()));
                assert_eq!(upload.file, "/a");
                assert_eq!(upload.name, None);
                assert_eq!(upload.extra.get("folder"), Some(&json!("f")));
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[test]
    fn malformed_upload_params_are_opaque() {
        for raw in [
            r#"{"action":"upload_private_file","params":{"file":"/a"}}"#,
            r#"{"action":"upload_private_file","params":{"user_id":1,"file":3}}"#,
            r#"{"action":"upload_private_file","params":{"user_id":1,"file":"/a","name":7}}"#,
            r#"{"action":"upload_private_file","params":"nope"}"#,
            r#"{"action":"upload_private_file"}"#,
        ] {
            assert_eq!(Command::parse(raw).unwrap().params(), Params::Opaque, "{raw}");
        }
    }

    #[test]
    fn rebuild_preserves_echo_bytes() {
        let cmd = Command::parse(
            r#"{"action":"send_private_msg","params":{},"echo":{"seq": 7, "tag":"x"}}"#,
        )
        .unwrap();
        let out = cmd
            .rebuild(Action::SendPrivateMsg, &json!({"user_id": 1, "message": "m"}))
            .unwrap();
        assert!(out.ends_with(r#""echo":{"seq": 7, "tag":"x"}}"#), "{out}");

        let null_echo = Command::parse(r#"{"action":"a","echo":null}"#).unwrap();
        let out = null_echo.rebuild(Action::SendGroupMsg, &json!({})).unwrap();
        assert!(out.contains(r#""echo":null"#));

        let no_echo = Command::parse(r#"{"action":"a"}"#).unwrap();
        let out = no_echo.rebuild(Action::SendGroupMsg, &json!({})).unwrap();
        assert!(!out.contains("echo"));
    }
}
