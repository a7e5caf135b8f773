use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::api::auth::AuthUser;
use crate::relay::connector::{Attachment, QuestionRequest};
use crate::session_key::SessionKey;

/// Reasons a question is refused before anything goes upstream.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("question is required")]
    MissingQuestion,
    #[error("type is required")]
    MissingType,
    #[error("an AI model or agent model configuration is required")]
    MissingModel,
    #[error("agent model entries need both a role and a model")]
    InvalidAgentModels,
    #[error("file data is not valid base64")]
    InvalidAttachment,
    #[error("file is larger than {max} bytes")]
    AttachmentTooLarge { max: usize },
    #[error("invalid session id")]
    InvalidSessionKey,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionBody {
    pub question: Option<String>,
    #[serde(rename = "type")]
    pub request_type: Option<String>,
    pub ai_model: Option<String>,
    pub agent_models: Option<BTreeMap<String, String>>,
    #[serde(alias = "sessionKey")]
    pub session_id: Option<String>,
    pub file: Option<FileBody>,
    #[serde(default)]
    pub searching: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBody {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    #[serde(alias = "sessionKey")]
    pub session_id: Option<String>,
}

impl QuestionBody {
    /// Check the body and normalize it into a [`QuestionRequest`]. A missing
    /// session id is replaced with a freshly generated key.
    pub fn validate(self, user: &AuthUser, max_attachment_bytes: usize) -> Result<QuestionRequest, ValidationError> {
        let question = non_blank(self.question).ok_or(ValidationError::MissingQuestion)?;
        let request_type = non_blank(self.request_type).ok_or(ValidationError::MissingType)?;

        let ai_model = non_blank(self.ai_model);
        let agent_models = self.agent_models.filter(|m| !m.is_empty());
        if let Some(models) = &agent_models {
            if models
                .iter()
                .any(|(role, model)| role.trim().is_empty() || model.trim().is_empty())
            {
                return Err(ValidationError::InvalidAgentModels);
            }
        }
        if ai_model.is_none() && agent_models.is_none() {
            return Err(ValidationError::MissingModel);
        }

        let session_key = match self.session_id.as_deref().map(str::trim) {
            None | Some("") => SessionKey::generate(),
            Some(raw) => SessionKey::parse(raw).ok_or(ValidationError::InvalidSessionKey)?,
        };

        let attachment = self
            .file
            .map(|file| decode_attachment(file, max_attachment_bytes))
            .transpose()?;

        Ok(QuestionRequest {
            question,
            request_type,
            ai_model,
            agent_models,
            session_key,
            attachment,
            searching: self.searching,
            user_id: user.id.clone(),
        })
    }
}

/// Accepts bare base64 or a `data:<mime>;base64,` URL.
fn decode_attachment(file: FileBody, max_bytes: usize) -> Result<Attachment, ValidationError> {
    let data = match file.data.split_once("base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => file.data.as_str(),
    }
    .trim()
    .to_string();

    // Reject before decoding when the encoded form is already far too big.
    if data.len() / 4 * 3 > max_bytes + 3 {
        return Err(ValidationError::AttachmentTooLarge { max: max_bytes });
    }
    let decoded = STANDARD
        .decode(data.as_bytes())
        .map_err(|_| ValidationError::InvalidAttachment)?;
    if decoded.len() > max_bytes {
        return Err(ValidationError::AttachmentTooLarge { max: max_bytes });
    }

    Ok(Attachment {
        name: file.name,
        mime_type: file.mime_type,
        data,
        size: decoded.len(),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> AuthUser {
        AuthUser { id: "u-1".into() }
    }

    fn body(value: serde_json::Value) -> QuestionBody {
        serde_json::from_value(value).unwrap()
    }

    fn validate(value: serde_json::Value) -> Result<QuestionRequest, ValidationError> {
        body(value).validate(&user(), 16)
    }

    #[test]
    fn minimal_valid_body() {
        let req = validate(json!({"question": "hi", "type": "chat", "aiModel": "gpt-4o"})).unwrap();
        assert_eq!(req.question, "hi");
        assert_eq!(req.request_type, "chat");
        assert_eq!(req.ai_model.as_deref(), Some("gpt-4o"));
        assert_eq!(req.user_id, "u-1");
        assert!(!req.searching);
        assert!(req.session_key.as_str().contains('-'));
    }

    #[test]
    fn missing_question_or_type() {
        assert_eq!(
            validate(json!({"type": "chat", "aiModel": "m"})).unwrap_err(),
            ValidationError::MissingQuestion
        );
        assert_eq!(
            validate(json!({"question": "  ", "type": "chat", "aiModel": "m"})).unwrap_err(),
            ValidationError::MissingQuestion
        );
        assert_eq!(
            validate(json!({"question": "hi", "aiModel": "m"})).unwrap_err(),
            ValidationError::MissingType
        );
    }

    #[test]
    fn model_configuration_rules() {
        assert_eq!(
            validate(json!({"question": "hi", "type": "chat"})).unwrap_err(),
            ValidationError::MissingModel
        );
        assert_eq!(
            validate(json!({"question": "hi", "type": "chat", "agentModels": {}})).unwrap_err(),
            ValidationError::MissingModel
        );
        assert_eq!(
            validate(json!({"question": "hi", "type": "chat", "agentModels": {"planner": " "}})).unwrap_err(),
            ValidationError::InvalidAgentModels
        );
        let req = validate(json!({"question": "hi", "type": "agent", "agentModels": {"planner": "o3"}})).unwrap();
        assert!(req.ai_model.is_none());
        assert_eq!(req.agent_models.unwrap()["planner"], "o3");
    }

    #[test]
    fn session_id_is_sanitized() {
        let req = validate(json!({
            "question": "hi", "type": "chat", "aiModel": "m", "sessionId": "../abc/def"
        }))
        .unwrap();
        assert_eq!(req.session_key.as_str(), "abcdef");

        assert_eq!(
            validate(json!({"question": "hi", "type": "chat", "aiModel": "m", "sessionId": "../"})).unwrap_err(),
            ValidationError::InvalidSessionKey
        );
    }

    #[test]
    fn attachment_is_checked() {
        let ok = validate(json!({
            "question": "hi", "type": "chat", "aiModel": "m",
            "file": {"name": "a.txt", "mimeType": "text/plain", "data": "aGVsbG8="}
        }))
        .unwrap();
        let file = ok.attachment.unwrap();
        assert_eq!(file.size, 5);
        assert_eq!(file.data, "aGVsbG8=");

        let data_url = validate(json!({
            "question": "hi", "type": "chat", "aiModel": "m",
            "file": {"name": "a.txt", "mimeType": "text/plain", "data": "data:text/plain;base64,aGVsbG8="}
        }))
        .unwrap();
        assert_eq!(data_url.attachment.unwrap().data, "aGVsbG8=");

        assert_eq!(
            validate(json!({
                "question": "hi", "type": "chat", "aiModel": "m",
                "file": {"name": "a", "mimeType": "x", "data": "not base64!"}
            }))
            .unwrap_err(),
            ValidationError::InvalidAttachment
        );

        let big = STANDARD.encode([0u8; 64]);
        assert_eq!(
            validate(json!({
                "question": "hi", "type": "chat", "aiModel": "m",
                "file": {"name": "a", "mimeType": "x", "data": big}
            }))
            .unwrap_err(),
            ValidationError::AttachmentTooLarge { max: 16 }
        );
    }
}
